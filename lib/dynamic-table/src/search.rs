//! Full-text search columns.
//!
//! Every searchable field of a search-ready table owns a `tsv_field_{id}`
//! column with an inverted index. The column is derived from row content
//! and can be rebuilt at any time. Rows written since their vectors were
//! last computed carry `needs_background_update = true`, which lets the
//! incremental update resume after an interruption and converge.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{ModelCache, ModelOptions};
use crate::catalog::{self, FieldRecord, TableRecord};
use crate::query::{
    ColumnDef, ColumnType, Executor, IndexDef, Order, Query, QueryExecutor,
    TransactionExecutor, Update, Value,
};
use crate::registry::FieldTypeRegistry;
use crate::{EngineConfig, FieldId, TableError, TableId};

/// Per-row marker column set by every row write on a search-ready table.
pub const NEEDS_BACKGROUND_UPDATE_COLUMN: &str = "needs_background_update";

pub fn tsvector_column(field_id: FieldId) -> String {
    format!("tsv_field_{}", field_id)
}

/// Split text into the lowercase terms a search vector holds, sorted and
/// without duplicates.
pub fn to_tsvector(text: &str) -> Vec<String> {
    let terms: BTreeSet<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect();
    terms.into_iter().collect()
}

#[derive(Debug, Clone)]
pub struct SearchSynchronizer {
    registry: Arc<FieldTypeRegistry>,
    config: EngineConfig,
}

impl SearchSynchronizer {
    pub fn new(registry: Arc<FieldTypeRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.use_pg_fulltext_search
    }

    fn ensure_enabled(&self) -> Result<(), TableError> {
        if self.enabled() {
            Ok(())
        } else {
            Err(TableError::SearchDisabled)
        }
    }

    /// Add the row marker column. Existing rows start out marked. Returns
    /// whether the column was added by this call.
    pub async fn create_needs_background_update_column<T: TransactionExecutor + ?Sized>(
        &self,
        tx: &mut T,
        table: &mut TableRecord,
    ) -> Result<bool, TableError> {
        if table.needs_background_update_column_added {
            return Ok(false);
        }
        let relation = table.relation_name();
        let existing = tx.columns(&relation).await?;
        if !existing.iter().any(|c| c.name == NEEDS_BACKGROUND_UPDATE_COLUMN) {
            tx.add_column(
                &relation,
                &ColumnDef::new(NEEDS_BACKGROUND_UPDATE_COLUMN, ColumnType::Boolean)
                    .not_null()
                    .default_value(serde_json::Value::Bool(true)),
            )
            .await?;
            tx.create_index(&IndexDef::btree(
                format!("{}_{}_idx", relation, NEEDS_BACKGROUND_UPDATE_COLUMN),
                relation.as_str(),
                NEEDS_BACKGROUND_UPDATE_COLUMN,
            ))
            .await?;
        }
        tx.update(
            &Update::of::<TableRecord>()
                .set("needs_background_update_column_added", true)
                .eq("id", table.id),
        )
        .await?;
        table.schema_version = catalog::bump_schema_version(tx, table.id).await?;
        table.needs_background_update_column_added = true;
        debug!(table_id = table.id, "Added background update marker column");
        Ok(true)
    }

    /// Create the search column of every searchable field that lacks one.
    /// Returns the fields that got a column; re-running is a no-op.
    pub async fn sync_columns<T: TransactionExecutor + ?Sized>(
        &self,
        tx: &mut T,
        table: &mut TableRecord,
    ) -> Result<Vec<FieldId>, TableError> {
        self.ensure_enabled()?;
        let mut created = Vec::new();
        for field in catalog::fields_for_table(tx, table.id).await? {
            if self.ensure_field_column(tx, table, &field).await? {
                created.push(field.id);
            }
        }
        if !created.is_empty() {
            table.schema_version = catalog::bump_schema_version(tx, table.id).await?;
            info!(table_id = table.id, fields = ?created, "Created search columns");
        }
        Ok(created)
    }

    /// Create the search column of one field if it is searchable and has
    /// none yet. The caller bumps the schema version.
    pub async fn ensure_field_column<T: TransactionExecutor + ?Sized>(
        &self,
        tx: &mut T,
        table: &TableRecord,
        field: &FieldRecord,
    ) -> Result<bool, TableError> {
        if !self.enabled() || field.tsvector_column_created {
            return Ok(false);
        }
        let field_type = self.registry.type_of(field)?;
        if !field_type.is_searchable(field) {
            return Ok(false);
        }

        let relation = table.relation_name();
        let column = tsvector_column(field.id);
        let existing = tx.columns(&relation).await?;
        if !existing.iter().any(|c| c.name == column) {
            tx.add_column(&relation, &ColumnDef::new(column.as_str(), ColumnType::TsVector))
                .await?;
            tx.create_index(&IndexDef::gin(
                format!("{}_{}_idx", relation, column),
                relation.as_str(),
                column.as_str(),
            ))
            .await?;
        }
        tx.update(
            &Update::of::<FieldRecord>()
                .set("tsvector_column_created", true)
                .eq("id", field.id),
        )
        .await?;
        Ok(true)
    }

    /// Drop the search column of a field. The caller bumps the schema version.
    pub async fn drop_field_column<T: TransactionExecutor + ?Sized>(
        &self,
        tx: &mut T,
        table: &TableRecord,
        field: &FieldRecord,
    ) -> Result<(), TableError> {
        let relation = table.relation_name();
        let column = tsvector_column(field.id);
        if tx.table_exists(&relation).await?
            && tx.columns(&relation).await?.iter().any(|c| c.name == column)
        {
            tx.drop_column(&relation, &column).await?;
        }
        if field.tsvector_column_created {
            tx.update(
                &Update::of::<FieldRecord>()
                    .set("tsvector_column_created", false)
                    .eq("id", field.id),
            )
            .await?;
        }
        Ok(())
    }

    /// Recompute search vectors in batches of one transaction each. With
    /// `changed_rows_only`, only marked rows are visited and the marker is
    /// re-checked under the row lock. Returns the number of rows written.
    pub async fn update_columns<S: QueryExecutor>(
        &self,
        store: &S,
        cache: &ModelCache,
        table_id: TableId,
        changed_rows_only: bool,
    ) -> Result<u64, TableError> {
        self.ensure_enabled()?;
        let batch_size = self.config.tsvector_update_batch_size.max(1);
        let mut written = 0;
        let mut cursor: i64 = 0;
        loop {
            let mut tx = store.begin_transaction().await?;
            let model = cache
                .get_model(&mut tx, table_id, &ModelOptions::default())
                .await?;
            let search_fields: Vec<usize> = model.search_fields().map(|(index, _)| index).collect();
            if search_fields.is_empty() {
                tx.rollback().await?;
                break;
            }
            let marker = model.table().needs_background_update_column_added;

            let mut query = Query::for_table(model.relation_name())
                .gt("id", cursor)
                .order_by("id", Order::Asc)
                .limit(batch_size)
                .for_update();
            if changed_rows_only && marker {
                query = query.eq(NEEDS_BACKGROUND_UPDATE_COLUMN, true);
            }
            let rows = tx.fetch(&query).await?;
            let fetched = rows.len() as u64;
            let loaded = model.load_rows(&mut tx, rows, false).await?;

            for row in &loaded {
                let mut update = Update::for_table(model.relation_name()).eq("id", row.id);
                if changed_rows_only && marker {
                    update = update.eq(NEEDS_BACKGROUND_UPDATE_COLUMN, true);
                }
                for index in &search_fields {
                    let field_id = model.fields()[*index].field.id;
                    let value = match model.search_text(*index, &row.values[*index]) {
                        Some(text) => Value::SearchVector(text),
                        None => Value::Null(ColumnType::TsVector),
                    };
                    update = update.set(tsvector_column(field_id), value);
                }
                if marker {
                    update = update.set(NEEDS_BACKGROUND_UPDATE_COLUMN, false);
                }
                written += tx.update(&update).await?;
            }
            if let Some(last) = loaded.last() {
                cursor = last.id;
            }
            tx.commit().await?;
            if fetched < batch_size {
                break;
            }
        }
        debug!(table_id, written, changed_rows_only, "Updated search columns");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_are_lowercased_and_deduplicated() {
        assert_eq!(
            to_tsvector("The quick, QUICK fox-trot 42"),
            vec!["42", "fox", "quick", "the", "trot"]
        );
        assert!(to_tsvector(" ,. ").is_empty());
    }

    #[test]
    fn column_names_follow_field_ids() {
        assert_eq!(tsvector_column(12), "tsv_field_12");
    }
}
