//! The table engine.
//!
//! Every schema mutation runs in one transaction: catalog change, DDL,
//! dependency maintenance, recomputation and the schema version bump commit
//! together. Cached models of the touched tables are invalidated only after
//! that commit succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tracing::{debug, info};

use crate::cache::{ModelCache, ModelOptions};
use crate::catalog::{
    self, FieldDependencyRecord, FieldRecord, SelectOptionRecord, TableRecord, WorkspaceRecord,
};
use crate::dependency;
use crate::field_types::{LINK_ROW, MULTIPLE_SELECT, SINGLE_SELECT};
use crate::formula;
use crate::model::{self, GeneratedModel, RowData, RowQuery};
use crate::query::{
    Delete, Executor, Filter, Query, QueryExecutor, TransactionExecutor, Update, Value,
};
use crate::registry::{FieldTypeRegistry, Storage};
use crate::scheduler::{Job, JobQueue};
use crate::schema;
use crate::search::{NEEDS_BACKGROUND_UPDATE_COLUMN, SearchSynchronizer};
use crate::storable::{fetch_records, insert_record, save_record};
use crate::trash::{self, TrashEntryRequest, TrashItemType};
use crate::{EngineConfig, FieldId, RowId, StorageDatetime, TableError, TableId};

/// A field to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NewField {
    pub name: String,
    pub type_tag: String,
    pub options: JsonValue,
    /// `(value, color)` pairs for select fields, in display order.
    pub select_options: Vec<(String, String)>,
}

impl NewField {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            options: json!({}),
            select_options: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: JsonValue) -> Self {
        self.options = options;
        self
    }

    pub fn with_select_option(mut self, value: impl Into<String>, color: impl Into<String>) -> Self {
        self.select_options.push((value.into(), color.into()));
        self
    }
}

/// Changes to an existing field. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    pub name: Option<String>,
    pub type_tag: Option<String>,
    pub options: Option<JsonValue>,
}

impl FieldUpdate {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn change_type(type_tag: impl Into<String>, options: JsonValue) -> Self {
        Self {
            name: None,
            type_tag: Some(type_tag.into()),
            options: Some(options),
        }
    }

    pub fn options(options: JsonValue) -> Self {
        Self {
            options: Some(options),
            ..Self::default()
        }
    }
}

fn is_select(type_tag: &str) -> bool {
    type_tag == SINGLE_SELECT || type_tag == MULTIPLE_SELECT
}

#[derive(Clone)]
pub struct TableEngine<S: QueryExecutor> {
    store: S,
    registry: Arc<FieldTypeRegistry>,
    cache: Arc<ModelCache>,
    search: SearchSynchronizer,
    config: EngineConfig,
    jobs: Option<JobQueue>,
}

impl<S: QueryExecutor> std::fmt::Debug for TableEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableEngine")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: QueryExecutor> TableEngine<S> {
    pub fn new(store: S, registry: FieldTypeRegistry, config: EngineConfig) -> Self {
        let registry = Arc::new(registry);
        Self {
            cache: Arc::new(ModelCache::new(registry.clone())),
            search: SearchSynchronizer::new(registry.clone(), config.clone()),
            store,
            registry,
            config,
            jobs: None,
        }
    }

    /// Enqueue search updates on this queue after row and field writes.
    pub fn with_jobs(mut self, jobs: JobQueue) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<FieldTypeRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn search(&self) -> &SearchSynchronizer {
        &self.search
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> Option<&JobQueue> {
        self.jobs.as_ref()
    }

    /// Create the catalog relations if they do not exist.
    pub async fn install(&self) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        catalog::install(&mut tx).await?;
        tx.commit().await
    }

    pub async fn create_workspace(&self, name: &str) -> Result<WorkspaceRecord, TableError> {
        let mut store = self.store.clone();
        insert_record(
            &mut store,
            &WorkspaceRecord {
                id: 0,
                name: name.to_string(),
                now: None,
            },
        )
        .await
    }

    // ==================== Tables ====================

    /// Create a table with a text primary field called "Name".
    pub async fn create_table(
        &self,
        workspace_id: i64,
        name: &str,
    ) -> Result<TableRecord, TableError> {
        self.create_table_with_fields(
            workspace_id,
            name,
            vec![NewField::new("Name", crate::field_types::TEXT)],
        )
        .await
    }

    /// Create a table and its fields. The first field becomes the primary field.
    pub async fn create_table_with_fields(
        &self,
        workspace_id: i64,
        name: &str,
        fields: Vec<NewField>,
    ) -> Result<TableRecord, TableError> {
        if fields.is_empty() {
            return Err(TableError::invalid_value("fields", "a table needs a primary field"));
        }
        let mut tx = self.store.begin_transaction().await?;
        catalog::workspace(&mut tx, workspace_id).await?;
        let order = catalog::tables_in_workspace(&mut tx, workspace_id).await?.len() as i64;
        let mut table = insert_record(&mut tx, &TableRecord::new(workspace_id, name, order)).await?;
        schema::create_table_relation(&mut tx, &table).await?;
        self.search
            .create_needs_background_update_column(&mut tx, &mut table)
            .await?;

        let mut created = Vec::with_capacity(fields.len());
        for (index, new_field) in fields.into_iter().enumerate() {
            created.push(self.insert_field(&mut tx, &table, new_field, index == 0).await?);
        }
        // Formulas may reference fields declared after them.
        for field in &created {
            dependency::rebuild_field_dependencies(&mut tx, &self.registry, field).await?;
        }
        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        let ids: BTreeSet<FieldId> = created.iter().map(|f| f.id).collect();
        self.refresh_errors(&mut tx, &mut bumped, &ids).await?;

        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id = table.id, workspace_id, "Created table");

        let mut store = self.store.clone();
        catalog::table(&mut store, table.id).await
    }

    pub async fn trash_table(&self, table_id: TableId) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let table = catalog::lock_table(&mut tx, table_id).await?;
        let workspace = catalog::workspace(&mut tx, table.workspace_id).await?;
        trash::create_entry(
            &mut tx,
            TrashEntryRequest {
                item_type: TrashItemType::Table,
                item_id: table.id,
                parent_id: Some(workspace.id),
                name: table.name.clone(),
                parent_name: Some(workspace.name),
                related_items: json!({}),
            },
        )
        .await?;
        tx.update(&Update::of::<TableRecord>().set("trashed", true).eq("id", table.id))
            .await?;
        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id, "Trashed table");
        Ok(())
    }

    pub async fn restore_table(&self, table_id: TableId) -> Result<TableRecord, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let table = catalog::table_including_trashed(&mut tx, table_id).await?;
        if !table.trashed {
            return Err(TableError::NotFound(format!("trashed table {}", table_id)));
        }
        tx.update(&Update::of::<TableRecord>().set("trashed", false).eq("id", table.id))
            .await?;
        trash::remove_entries(&mut tx, TrashItemType::Table, table.id).await?;
        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id, "Restored table");

        let mut store = self.store.clone();
        catalog::table(&mut store, table_id).await
    }

    /// Drop a table, its storage, and link fields in other tables pointing
    /// at it. Irreversible.
    pub async fn permanently_delete_table(&self, table_id: TableId) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let table = catalog::table_including_trashed(&mut tx, table_id).await?;
        let fields = catalog::all_fields_for_table(&mut tx, table.id).await?;
        let own: BTreeSet<FieldId> = fields.iter().map(|f| f.id).collect();

        let mut bumped = BTreeSet::new();
        let mut broken = BTreeSet::new();
        let incoming: Vec<FieldRecord> = fetch_records(
            &mut tx,
            &Query::of::<FieldRecord>()
                .eq("link_row_table_id", table.id)
                .filter(Filter::Ne("table_id".to_string(), Value::Int(table.id))),
        )
        .await?;
        for field in incoming {
            let other = catalog::table_including_trashed(&mut tx, field.table_id).await?;
            broken.extend(self.purge_field(&mut tx, &other, &field, true).await?);
            self.bump(&mut tx, &mut bumped, other.id).await?;
        }

        for field in &fields {
            broken.extend(self.purge_field(&mut tx, &table, field, false).await?);
        }
        schema::drop_table_relation(&mut tx, &self.registry, &table, &fields).await?;
        tx.delete(&Delete::of::<TableRecord>().eq("id", table.id))
            .await?;
        trash::remove_entries(&mut tx, TrashItemType::Table, table.id).await?;

        let dependants: BTreeSet<FieldId> = broken.difference(&own).copied().collect();
        self.refresh_errors(&mut tx, &mut bumped, &dependants).await?;
        tx.commit().await?;
        self.cache.invalidate(table.id);
        self.after_commit(&bumped);
        info!(table_id, "Permanently deleted table");
        Ok(())
    }

    // ==================== Fields ====================

    pub async fn create_field(
        &self,
        table_id: TableId,
        new_field: NewField,
    ) -> Result<FieldRecord, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let table = catalog::lock_table(&mut tx, table_id).await?;
        let field = self.insert_field(&mut tx, &table, new_field, false).await?;

        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        dependency::rebuild_field_dependencies(&mut tx, &self.registry, &field).await?;
        let mut affected =
            dependency::fix_broken_references(&mut tx, &self.registry, &field.name).await?;
        affected.insert(field.id);
        self.refresh_errors(&mut tx, &mut bumped, &affected).await?;
        if field.tsvector_column_created {
            self.mark_rows(&mut tx, &table).await?;
        }
        self.recompute_after_change(&mut tx, &affected, true).await?;

        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id, field_id = field.id, field_type = %field.type_tag, "Created field");
        if field.tsvector_column_created {
            self.schedule_search_update(table.id);
        }

        let mut store = self.store.clone();
        catalog::field(&mut store, field.id).await
    }

    pub async fn update_field(
        &self,
        field_id: FieldId,
        update: FieldUpdate,
    ) -> Result<FieldRecord, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let old = catalog::field(&mut tx, field_id).await?;
        if old.trashed {
            return Err(TableError::FieldNotFound(field_id));
        }
        let table = catalog::lock_table(&mut tx, old.table_id).await?;

        let mut new = old.clone();
        if let Some(name) = update.name {
            if name != old.name {
                self.assert_name_available(&mut tx, table.id, &name, Some(old.id))
                    .await?;
            }
            new.name = name;
        }
        if let Some(type_tag) = update.type_tag {
            new.type_tag = type_tag;
        }
        if let Some(options) = update.options {
            new.options = options;
        }
        let new_type = self.registry.type_of(&new)?;
        new_type.validate_options(&new)?;
        self.resolve_link_target(&mut tx, &mut new).await?;
        new.needs_periodic_update = new_type.field_needs_periodic_update(&new).unwrap_or(false);

        if old.tsvector_column_created && !new_type.is_searchable(&new) {
            self.search.drop_field_column(&mut tx, &table, &old).await?;
            new.tsvector_column_created = false;
        }
        schema::alter_field(&mut tx, &self.registry, &table, &old, &new).await?;
        if is_select(&old.type_tag) && !is_select(&new.type_tag) {
            tx.delete(&Delete::of::<SelectOptionRecord>().eq("field_id", old.id))
                .await?;
        }
        save_record(&mut tx, &new).await?;
        if table.needs_background_update_column_added
            && self.search.ensure_field_column(&mut tx, &table, &new).await?
        {
            new.tsvector_column_created = true;
        }
        let content_changed = old.type_tag != new.type_tag || old.options != new.options;
        if new.tsvector_column_created && content_changed {
            self.mark_rows(&mut tx, &table).await?;
        }

        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        let mut affected = BTreeSet::from([new.id]);
        if old.name != new.name {
            affected.extend(self.rename_references(&mut tx, &mut bumped, &old, &new).await?);
        }
        dependency::rebuild_field_dependencies(&mut tx, &self.registry, &new).await?;
        if old.name != new.name {
            affected.extend(
                dependency::fix_broken_references(&mut tx, &self.registry, &new.name).await?,
            );
        }
        self.refresh_errors(&mut tx, &mut bumped, &affected).await?;
        self.recompute_after_change(&mut tx, &affected, true).await?;

        tx.commit().await?;
        self.after_commit(&bumped);
        info!(
            table_id = table.id,
            field_id,
            from = %old.type_tag,
            to = %new.type_tag,
            "Updated field"
        );
        if new.tsvector_column_created && content_changed {
            self.schedule_search_update(table.id);
        }

        let mut store = self.store.clone();
        catalog::field(&mut store, field_id).await
    }

    /// Hide a field. Its storage stays until the trash entry is permanently
    /// deleted; formulas reading it go into an error state.
    pub async fn trash_field(&self, field_id: FieldId) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let field = catalog::field(&mut tx, field_id).await?;
        if field.trashed {
            return Err(TableError::AlreadyTrashed(format!("field {}", field_id)));
        }
        if field.is_primary {
            return Err(TableError::CannotDeletePrimaryField);
        }
        let table = catalog::lock_table(&mut tx, field.table_id).await?;
        trash::create_entry(
            &mut tx,
            TrashEntryRequest {
                item_type: TrashItemType::Field,
                item_id: field.id,
                parent_id: Some(table.id),
                name: field.name.clone(),
                parent_name: Some(table.name.clone()),
                related_items: json!({}),
            },
        )
        .await?;
        tx.update(&Update::of::<FieldRecord>().set("trashed", true).eq("id", field.id))
            .await?;

        let dependants = dependency::break_dependants(&mut tx, &field).await?;
        dependency::delete_field_dependencies(&mut tx, field.id).await?;
        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        self.refresh_errors(&mut tx, &mut bumped, &dependants).await?;
        self.recompute_after_change(&mut tx, &dependants, false).await?;

        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id = table.id, field_id, "Trashed field");
        Ok(())
    }

    /// Bring a trashed field back. A name taken in the meantime gets a
    /// " (restored)" suffix.
    pub async fn restore_field(&self, field_id: FieldId) -> Result<FieldRecord, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let mut field = catalog::field(&mut tx, field_id).await?;
        if !field.trashed {
            return Err(TableError::NotFound(format!("trashed field {}", field_id)));
        }
        let table = catalog::lock_table(&mut tx, field.table_id).await?;

        let taken: BTreeSet<String> = catalog::fields_for_table(&mut tx, table.id)
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect();
        if taken.contains(&field.name) {
            let base = format!("{} (restored)", field.name);
            let mut candidate = base.clone();
            let mut n = 2;
            while taken.contains(&candidate) {
                candidate = format!("{} {}", base, n);
                n += 1;
            }
            field.name = candidate;
        }
        field.trashed = false;
        save_record(&mut tx, &field).await?;
        trash::remove_entries(&mut tx, TrashItemType::Field, field.id).await?;

        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        dependency::rebuild_field_dependencies(&mut tx, &self.registry, &field).await?;
        let mut affected =
            dependency::fix_broken_references(&mut tx, &self.registry, &field.name).await?;
        affected.insert(field.id);
        self.refresh_errors(&mut tx, &mut bumped, &affected).await?;
        self.recompute_after_change(&mut tx, &affected, true).await?;

        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id = table.id, field_id, "Restored field");

        let mut store = self.store.clone();
        catalog::field(&mut store, field_id).await
    }

    /// Drop a field and its storage. Irreversible.
    pub async fn permanently_delete_field(&self, field_id: FieldId) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let field = catalog::field(&mut tx, field_id).await?;
        let table = catalog::table_including_trashed(&mut tx, field.table_id).await?;
        let dependants = self.purge_field(&mut tx, &table, &field, true).await?;

        let mut bumped = BTreeSet::new();
        self.bump(&mut tx, &mut bumped, table.id).await?;
        self.refresh_errors(&mut tx, &mut bumped, &dependants).await?;
        tx.commit().await?;
        self.after_commit(&bumped);
        info!(table_id = table.id, field_id, "Permanently deleted field");
        Ok(())
    }

    /// Fields to recompute when `field_id` changes, dependencies first.
    /// Fails with [`TableError::CyclicDependency`] when a cycle is reachable.
    pub async fn field_update_order(&self, field_id: FieldId) -> Result<Vec<FieldId>, TableError> {
        let mut store = self.store.clone();
        let graph = dependency::load_graph(&mut store).await?;
        graph.topological_update_order(&[field_id])
    }

    pub async fn fields(&self, table_id: TableId) -> Result<Vec<FieldRecord>, TableError> {
        let mut store = self.store.clone();
        catalog::fields_for_table(&mut store, table_id).await
    }

    pub async fn field(&self, field_id: FieldId) -> Result<FieldRecord, TableError> {
        let mut store = self.store.clone();
        catalog::field(&mut store, field_id).await
    }

    // ==================== Select options ====================

    pub async fn create_select_option(
        &self,
        field_id: FieldId,
        value: &str,
        color: &str,
    ) -> Result<SelectOptionRecord, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let field = catalog::field(&mut tx, field_id).await?;
        if !is_select(&field.type_tag) {
            return Err(TableError::invalid_value(
                field.name.as_str(),
                "field has no select options",
            ));
        }
        let order = catalog::select_options_for_fields(&mut tx, &[field_id])
            .await?
            .len() as i64;
        let option = insert_record(
            &mut tx,
            &SelectOptionRecord {
                id: 0,
                field_id,
                value: value.to_string(),
                color: color.to_string(),
                order,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(option)
    }

    /// Delete a select option. Multiple select links to it are removed right
    /// away; single select references are cleared when the row is next read.
    pub async fn delete_select_option(&self, option_id: i64) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let option = catalog::select_options_by_ids(&mut tx, &[option_id])
            .await?
            .into_iter()
            .next()
            .ok_or(TableError::SelectOptionNotFound(option_id))?;
        tx.delete(&Delete::of::<SelectOptionRecord>().eq("id", option.id))
            .await?;

        let field = catalog::field(&mut tx, option.field_id).await?;
        if let Storage::Relation { relation, .. } = self.registry.type_of(&field)?.storage(&field) {
            if tx.table_exists(&relation).await? {
                tx.delete(&Delete::for_table(relation.as_str()).eq("target_id", option.id))
                    .await?;
            }
        }
        tx.commit().await?;
        debug!(field_id = field.id, option_id, "Deleted select option");
        Ok(())
    }

    pub async fn select_options(
        &self,
        field_id: FieldId,
    ) -> Result<Vec<SelectOptionRecord>, TableError> {
        let mut store = self.store.clone();
        catalog::select_options_for_fields(&mut store, &[field_id]).await
    }

    // ==================== Rows ====================

    pub async fn model(&self, table_id: TableId) -> Result<Arc<GeneratedModel>, TableError> {
        self.model_with(table_id, &ModelOptions::default()).await
    }

    pub async fn model_with(
        &self,
        table_id: TableId,
        options: &ModelOptions,
    ) -> Result<Arc<GeneratedModel>, TableError> {
        let mut store = self.store.clone();
        self.cache.get_model(&mut store, table_id, options).await
    }

    pub async fn create_row(
        &self,
        table_id: TableId,
        values: &JsonMap<String, JsonValue>,
    ) -> Result<RowData, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let model = self
            .cache
            .get_model(&mut tx, table_id, &ModelOptions::default())
            .await?;
        let row = model.insert_row(&mut tx, values).await?;
        let changed: Vec<FieldId> = model.fields().iter().map(|f| f.field.id).collect();
        self.recompute_other_tables(&mut tx, table_id, &changed).await?;
        tx.commit().await?;
        self.after_row_write(&model);
        Ok(row)
    }

    pub async fn update_row(
        &self,
        table_id: TableId,
        row_id: RowId,
        values: &JsonMap<String, JsonValue>,
    ) -> Result<RowData, TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let model = self
            .cache
            .get_model(&mut tx, table_id, &ModelOptions::default())
            .await?;
        let row = model.update_row(&mut tx, row_id, values).await?;
        let changed: Vec<FieldId> = model.fields().iter().map(|f| f.field.id).collect();
        self.recompute_other_tables(&mut tx, table_id, &changed).await?;
        tx.commit().await?;
        self.after_row_write(&model);
        Ok(row)
    }

    /// Delete a row together with the links other tables hold to it.
    pub async fn delete_row(&self, table_id: TableId, row_id: RowId) -> Result<(), TableError> {
        let mut tx = self.store.begin_transaction().await?;
        let model = self
            .cache
            .get_model(&mut tx, table_id, &ModelOptions::default())
            .await?;
        model.delete_row(&mut tx, row_id).await?;

        let incoming: Vec<FieldRecord> = fetch_records(
            &mut tx,
            &Query::of::<FieldRecord>().eq("link_row_table_id", table_id),
        )
        .await?;
        let mut changed: Vec<FieldId> = model.fields().iter().map(|f| f.field.id).collect();
        for field in incoming {
            if let Storage::Relation { relation, .. } = self.registry.type_of(&field)?.storage(&field) {
                if tx.table_exists(&relation).await? {
                    tx.delete(&Delete::for_table(relation.as_str()).eq("target_id", row_id))
                        .await?;
                }
            }
            changed.push(field.id);
        }
        self.recompute_other_tables(&mut tx, table_id, &changed).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_row(
        &self,
        table_id: TableId,
        row_id: RowId,
    ) -> Result<Option<RowData>, TableError> {
        let model = self.model(table_id).await?;
        let mut store = self.store.clone();
        model.get_row(&mut store, row_id).await
    }

    pub async fn list_rows(
        &self,
        table_id: TableId,
        query: &RowQuery,
    ) -> Result<Vec<RowData>, TableError> {
        let model = self.model(table_id).await?;
        let mut store = self.store.clone();
        model.list_rows(&mut store, query).await
    }

    /// Full-text search over the table's search columns.
    pub async fn search_rows(
        &self,
        table_id: TableId,
        text: &str,
        limit: Option<u64>,
    ) -> Result<Vec<RowData>, TableError> {
        if !self.search.enabled() {
            return Err(TableError::SearchDisabled);
        }
        let model = self.model(table_id).await?;
        let mut store = self.store.clone();
        model.search(&mut store, text, limit).await
    }

    // ==================== Internals ====================

    async fn insert_field(
        &self,
        tx: &mut S::Transaction,
        table: &TableRecord,
        new_field: NewField,
        is_primary: bool,
    ) -> Result<FieldRecord, TableError> {
        self.assert_name_available(tx, table.id, &new_field.name, None)
            .await?;
        let field_type = self.registry.get(&new_field.type_tag)?;
        let mut field = FieldRecord::new(
            table.id,
            new_field.name,
            new_field.type_tag,
            new_field.options,
        );
        field.is_primary = is_primary;
        field.order = catalog::all_fields_for_table(tx, table.id)
            .await?
            .iter()
            .map(|f| f.order + 1)
            .max()
            .unwrap_or(0);
        field_type.validate_options(&field)?;
        self.resolve_link_target(tx, &mut field).await?;
        field.needs_periodic_update = field_type.field_needs_periodic_update(&field).unwrap_or(false);

        let mut field = insert_record(tx, &field).await?;
        schema::add_field(tx, &self.registry, table, &field).await?;
        for (order, (value, color)) in new_field.select_options.into_iter().enumerate() {
            insert_record(
                tx,
                &SelectOptionRecord {
                    id: 0,
                    field_id: field.id,
                    value,
                    color,
                    order: order as i64,
                },
            )
            .await?;
        }
        if table.needs_background_update_column_added
            && self.search.ensure_field_column(tx, table, &field).await?
        {
            field.tsvector_column_created = true;
        }
        Ok(field)
    }

    async fn assert_name_available(
        &self,
        tx: &mut S::Transaction,
        table_id: TableId,
        name: &str,
        except: Option<FieldId>,
    ) -> Result<(), TableError> {
        if name.trim().is_empty() {
            return Err(TableError::invalid_value("name", "field names cannot be empty"));
        }
        let taken = catalog::fields_for_table(tx, table_id)
            .await?
            .iter()
            .any(|f| f.name == name && Some(f.id) != except);
        if taken {
            return Err(TableError::FieldNameNotUnique(name.to_string()));
        }
        Ok(())
    }

    /// Link fields remember their target table; it must exist.
    async fn resolve_link_target(
        &self,
        tx: &mut S::Transaction,
        field: &mut FieldRecord,
    ) -> Result<(), TableError> {
        if field.type_tag != LINK_ROW {
            field.link_row_table_id = None;
            return Ok(());
        }
        let target = field
            .option_i64("link_table_id")
            .ok_or_else(|| TableError::invalid_value(field.name.as_str(), "link_table_id is required"))?;
        catalog::table(tx, target).await?;
        field.link_row_table_id = Some(target);
        Ok(())
    }

    /// Remove everything a field owns. Returns the dependants whose
    /// references broke.
    async fn purge_field(
        &self,
        tx: &mut S::Transaction,
        table: &TableRecord,
        field: &FieldRecord,
        drop_storage: bool,
    ) -> Result<BTreeSet<FieldId>, TableError> {
        if drop_storage {
            self.search.drop_field_column(tx, table, field).await?;
            schema::remove_field(tx, &self.registry, table, field).await?;
        }
        tx.delete(&Delete::of::<SelectOptionRecord>().eq("field_id", field.id))
            .await?;
        let dependants = dependency::break_dependants(tx, field).await?;
        dependency::delete_field_dependencies(tx, field.id).await?;
        tx.delete(&Delete::of::<FieldRecord>().eq("id", field.id))
            .await?;
        trash::remove_entries(tx, TrashItemType::Field, field.id).await?;
        Ok(dependants)
    }

    /// Rewrite formulas that reference `old` by name. Returns the rewritten fields.
    async fn rename_references(
        &self,
        tx: &mut S::Transaction,
        bumped: &mut BTreeSet<TableId>,
        old: &FieldRecord,
        new: &FieldRecord,
    ) -> Result<BTreeSet<FieldId>, TableError> {
        let records: Vec<FieldDependencyRecord> = fetch_records(
            tx,
            &Query::of::<FieldDependencyRecord>().filter(Filter::Any(vec![
                Filter::Eq("dependency_id".to_string(), Value::Int(old.id)),
                Filter::Eq("via_id".to_string(), Value::Int(old.id)),
            ])),
        )
        .await?;
        let mut by_dependant: BTreeMap<FieldId, Vec<FieldDependencyRecord>> = BTreeMap::new();
        for record in records {
            by_dependant.entry(record.dependant_id).or_default().push(record);
        }

        let mut rewritten = BTreeSet::new();
        for (dependant_id, records) in by_dependant {
            let mut dependant = catalog::field(tx, dependant_id).await?;
            let Some(Ok(mut expr)) = dependant.option_str("formula").map(formula::parse) else {
                continue;
            };
            let mut changed = false;
            for record in records {
                match (record.dependency_id, record.via_id) {
                    (_, Some(via)) if via == old.id => {
                        changed |= expr.rename_field(&old.name, &new.name);
                    }
                    (Some(dependency), None) if dependency == old.id => {
                        changed |= expr.rename_field(&old.name, &new.name);
                    }
                    (Some(dependency), Some(via)) if dependency == old.id => {
                        let link = catalog::field(tx, via).await?;
                        changed |= expr.rename_lookup_target(&link.name, &old.name, &new.name);
                    }
                    _ => {}
                }
            }
            if !changed {
                continue;
            }
            if let Some(options) = dependant.options.as_object_mut() {
                options.insert("formula".to_string(), JsonValue::String(expr.to_string()));
            }
            save_record(tx, &dependant).await?;
            dependency::rebuild_field_dependencies(tx, &self.registry, &dependant).await?;
            self.bump(tx, bumped, dependant.table_id).await?;
            rewritten.insert(dependant.id);
        }
        Ok(rewritten)
    }

    async fn bump(
        &self,
        tx: &mut S::Transaction,
        bumped: &mut BTreeSet<TableId>,
        table_id: TableId,
    ) -> Result<(), TableError> {
        if bumped.insert(table_id) {
            catalog::bump_schema_version(tx, table_id).await?;
        }
        Ok(())
    }

    /// Re-derive error states for `affected` and everything reading them.
    async fn refresh_errors(
        &self,
        tx: &mut S::Transaction,
        bumped: &mut BTreeSet<TableId>,
        affected: &BTreeSet<FieldId>,
    ) -> Result<(), TableError> {
        if affected.is_empty() {
            return Ok(());
        }
        let graph = dependency::load_graph(tx).await?;
        let mut scope = affected.clone();
        scope.extend(graph.all_dependants(&affected.iter().copied().collect::<Vec<_>>()));
        for field in dependency::refresh_errors(tx, &self.registry, &graph, &scope).await? {
            self.bump(tx, bumped, field.table_id).await?;
        }
        Ok(())
    }

    /// Recompute the dependants of `changed` (and `changed` itself when
    /// `include_changed`) in dependency order. Cyclic fields are skipped.
    async fn recompute_after_change(
        &self,
        tx: &mut S::Transaction,
        changed: &BTreeSet<FieldId>,
        include_changed: bool,
    ) -> Result<u64, TableError> {
        let graph = dependency::load_graph(tx).await?;
        let changed: Vec<FieldId> = changed.iter().copied().collect();
        let plan = graph.update_plan(&changed);

        let mut order = Vec::new();
        if include_changed {
            order.extend(changed.iter().filter(|id| !plan.cyclic.contains(*id)));
        }
        order.extend(plan.order);
        self.run_recompute(tx, &order, None).await
    }

    /// Recompute fields of other tables that read the fields of `table_id`.
    async fn recompute_other_tables(
        &self,
        tx: &mut S::Transaction,
        table_id: TableId,
        changed: &[FieldId],
    ) -> Result<u64, TableError> {
        let graph = dependency::load_graph(tx).await?;
        let plan = graph.update_plan(changed);
        if plan.order.is_empty() {
            return Ok(0);
        }
        self.run_recompute(tx, &plan.order, Some(table_id)).await
    }

    /// Models are compiled inside the transaction so they see the
    /// uncommitted field set.
    async fn run_recompute(
        &self,
        tx: &mut S::Transaction,
        order: &[FieldId],
        skip_table: Option<TableId>,
    ) -> Result<u64, TableError> {
        model::recompute_fields(tx, &self.registry, order, skip_table, &StorageDatetime::now()).await
    }

    async fn mark_rows(&self, tx: &mut S::Transaction, table: &TableRecord) -> Result<(), TableError> {
        if table.needs_background_update_column_added {
            tx.update(
                &Update::for_table(table.relation_name()).set(NEEDS_BACKGROUND_UPDATE_COLUMN, true),
            )
            .await?;
        }
        Ok(())
    }

    fn after_commit(&self, bumped: &BTreeSet<TableId>) {
        for table_id in bumped {
            self.cache.invalidate(*table_id);
        }
    }

    fn after_row_write(&self, model: &GeneratedModel) {
        if model.table().needs_background_update_column_added && model.search_fields().next().is_some() {
            self.schedule_search_update(model.table_id());
        }
    }

    fn schedule_search_update(&self, table_id: TableId) {
        if !self.search.enabled() {
            return;
        }
        if let Some(jobs) = &self.jobs {
            jobs.enqueue(Job::UpdateSearchColumns {
                table_id,
                changed_rows_only: true,
            });
        }
    }
}
