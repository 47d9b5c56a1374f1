//! Generated model cache.
//!
//! Entries are keyed by table id, schema version and model options. A field
//! change bumps the version in its own transaction, so a model compiled
//! before the change can never be served for the new version even if an
//! invalidation is missed. Concurrent requests for the same key share one
//! build.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::catalog;
use crate::model::GeneratedModel;
use crate::query::Executor;
use crate::registry::FieldTypeRegistry;
use crate::{FieldId, TableError, TableId};

const MAX_BUILD_ATTEMPTS: usize = 3;

/// Options a model is compiled with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ModelOptions {
    /// Use field names instead of `field_{id}` as row attributes.
    pub attribute_names: bool,
    /// Restrict the model to these fields. Restricted models do not
    /// recompute formulas.
    pub field_ids: Option<BTreeSet<FieldId>>,
}

impl ModelOptions {
    pub fn with_attribute_names() -> Self {
        Self {
            attribute_names: true,
            field_ids: None,
        }
    }

    pub fn only_fields(field_ids: impl IntoIterator<Item = FieldId>) -> Self {
        Self {
            attribute_names: false,
            field_ids: Some(field_ids.into_iter().collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub table_id: TableId,
    pub schema_version: i64,
    pub options: ModelOptions,
}

type Slot = Arc<AsyncMutex<Option<Arc<GeneratedModel>>>>;

pub struct ModelCache {
    registry: Arc<FieldTypeRegistry>,
    entries: Mutex<HashMap<ModelKey, Slot>>,
    builds: AtomicU64,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("entries", &self.len())
            .field("builds", &self.builds())
            .finish()
    }
}

impl ModelCache {
    pub fn new(registry: Arc<FieldTypeRegistry>) -> Self {
        Self {
            registry,
            entries: Mutex::new(HashMap::new()),
            builds: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<FieldTypeRegistry> {
        &self.registry
    }

    /// The model of a table at its current schema version, built on a miss.
    pub async fn get_model<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        table_id: TableId,
        options: &ModelOptions,
    ) -> Result<Arc<GeneratedModel>, TableError> {
        for _ in 0..MAX_BUILD_ATTEMPTS {
            let table = catalog::table(exec, table_id).await?;
            let key = ModelKey {
                table_id,
                schema_version: table.schema_version,
                options: options.clone(),
            };
            let slot = self.entries.lock().entry(key.clone()).or_default().clone();

            let mut guard = slot.lock().await;
            if let Some(model) = guard.as_ref() {
                return Ok(model.clone());
            }

            let model = GeneratedModel::compile(exec, &self.registry, &table, options).await?;
            self.builds.fetch_add(1, Ordering::SeqCst);
            // Re-read the version: a change committing mid-build makes the
            // compiled field set unreliable for this key.
            let current = catalog::table(exec, table_id).await?;
            if current.schema_version != key.schema_version {
                debug!(
                    table_id,
                    built = key.schema_version,
                    current = current.schema_version,
                    "Schema changed while building a model, retrying"
                );
                drop(guard);
                self.entries.lock().remove(&key);
                continue;
            }

            let model = Arc::new(model);
            *guard = Some(model.clone());
            debug!(
                table_id,
                schema_version = key.schema_version,
                fingerprint = model.fingerprint(),
                "Built generated model"
            );
            return Ok(model);
        }
        warn!(table_id, "Schema kept changing while building a model");
        Err(TableError::SchemaConflict(format!(
            "table {} changed during {} model builds",
            table_id, MAX_BUILD_ATTEMPTS
        )))
    }

    /// Drop every cached model of a table. Call after the transaction that
    /// changed it has committed.
    pub fn invalidate(&self, table_id: TableId) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.table_id != table_id);
        debug!(table_id, removed = before - entries.len(), "Invalidated models");
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of models compiled since startup.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableRecord;
    use crate::query::{QueryExecutor, TransactionExecutor, Update};
    use crate::storable::insert_record;
    use crate::{MemoryStore, schema};

    async fn setup() -> (MemoryStore, TableId) {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        catalog::install(&mut tx).await.unwrap();
        let table = insert_record(&mut tx, &TableRecord::new(1, "Tasks", 0))
            .await
            .unwrap();
        schema::create_table_relation(&mut tx, &table).await.unwrap();
        tx.commit().await.unwrap();
        (store, table.id)
    }

    #[tokio::test]
    async fn hits_are_served_without_rebuilding() {
        let (mut store, table_id) = setup().await;
        let cache = ModelCache::new(Arc::new(FieldTypeRegistry::with_builtin_types()));

        let first = cache
            .get_model(&mut store, table_id, &ModelOptions::default())
            .await
            .unwrap();
        let second = cache
            .get_model(&mut store, table_id, &ModelOptions::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.builds(), 1);
    }

    #[tokio::test]
    async fn version_bump_misses_even_without_invalidation() {
        let (mut store, table_id) = setup().await;
        let cache = ModelCache::new(Arc::new(FieldTypeRegistry::with_builtin_types()));
        let before = cache
            .get_model(&mut store, table_id, &ModelOptions::default())
            .await
            .unwrap();

        store
            .update(
                &Update::of::<TableRecord>()
                    .set("schema_version", 2i64)
                    .eq("id", table_id),
            )
            .await
            .unwrap();

        let after = cache
            .get_model(&mut store, table_id, &ModelOptions::default())
            .await
            .unwrap();
        assert_eq!(before.schema_version(), 1);
        assert_eq!(after.schema_version(), 2);
        assert_eq!(cache.builds(), 2);
    }

    #[tokio::test]
    async fn invalidate_only_touches_one_table() {
        let (mut store, table_id) = setup().await;
        let cache = ModelCache::new(Arc::new(FieldTypeRegistry::with_builtin_types()));
        cache
            .get_model(&mut store, table_id, &ModelOptions::default())
            .await
            .unwrap();
        cache
            .get_model(&mut store, table_id, &ModelOptions::with_attribute_names())
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        cache.invalidate(table_id + 1);
        assert_eq!(cache.len(), 2);
        cache.invalidate(table_id);
        assert!(cache.is_empty());
    }
}
