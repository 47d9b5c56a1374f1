//! Catalog records and lookups.
//!
//! The catalog describes workspaces, tables, fields, select options, field
//! dependencies and trash entries. It lives in ordinary relations of the
//! store, so a field change, its DDL and the schema version bump all commit
//! or roll back together.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::query::{Executor, IndexDef, Order, Query, TransactionExecutor, Update};
use crate::storable::{fetch_record, fetch_records, get_record};
use crate::{FieldId, Storable, StorageDatetime, TableError, TableId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Storable)]
#[storable(table = "core_workspace")]
pub struct WorkspaceRecord {
    pub id: i64,
    pub name: String,
    /// Reference time used by `now()` formulas, refreshed by periodic updates.
    pub now: Option<StorageDatetime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Storable)]
#[storable(table = "database_table")]
pub struct TableRecord {
    pub id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub order: i64,
    pub trashed: bool,
    /// Bumped in the same transaction as every change to the field set.
    pub schema_version: i64,
    /// Whether the row-level background update marker column exists.
    pub needs_background_update_column_added: bool,
    pub row_count: Option<i64>,
    pub row_count_updated_at: Option<StorageDatetime>,
}

impl TableRecord {
    pub fn new(workspace_id: i64, name: impl Into<String>, order: i64) -> Self {
        Self {
            id: 0,
            workspace_id,
            name: name.into(),
            order,
            trashed: false,
            schema_version: 1,
            needs_background_update_column_added: false,
            row_count: None,
            row_count_updated_at: None,
        }
    }

    /// Name of the physical relation holding the rows.
    pub fn relation_name(&self) -> String {
        relation_name(self.id)
    }
}

pub fn relation_name(table_id: TableId) -> String {
    format!("database_table_{}", table_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Storable)]
#[storable(table = "database_field")]
pub struct FieldRecord {
    pub id: i64,
    pub table_id: i64,
    pub name: String,
    pub type_tag: String,
    pub options: JsonValue,
    pub order: i64,
    pub is_primary: bool,
    pub trashed: bool,
    /// User-visible error state, e.g. a broken or cyclic formula reference.
    pub error: Option<String>,
    pub needs_periodic_update: bool,
    pub link_row_table_id: Option<i64>,
    pub tsvector_column_created: bool,
}

impl FieldRecord {
    pub fn new(
        table_id: TableId,
        name: impl Into<String>,
        type_tag: impl Into<String>,
        options: JsonValue,
    ) -> Self {
        Self {
            id: 0,
            table_id,
            name: name.into(),
            type_tag: type_tag.into(),
            options,
            order: 0,
            is_primary: false,
            trashed: false,
            error: None,
            needs_periodic_update: false,
            link_row_table_id: None,
            tsvector_column_created: false,
        }
    }

    /// Name of the physical column backing this field.
    pub fn db_column(&self) -> String {
        format!("field_{}", self.id)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(JsonValue::as_str)
    }

    pub fn option_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(JsonValue::as_i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Storable)]
#[storable(table = "database_selectoption")]
pub struct SelectOptionRecord {
    pub id: i64,
    pub field_id: i64,
    pub value: String,
    pub color: String,
    pub order: i64,
}

impl SelectOptionRecord {
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({ "id": self.id, "value": self.value, "color": self.color })
    }
}

/// A directed edge: `dependant` reads `dependency`, optionally through the
/// link field `via`. An edge whose target could not be resolved keeps the
/// referenced name instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Storable)]
#[storable(table = "database_fielddependency")]
pub struct FieldDependencyRecord {
    pub id: i64,
    pub dependant_id: i64,
    pub dependency_id: Option<i64>,
    pub via_id: Option<i64>,
    pub broken_reference_field_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Storable)]
#[storable(table = "core_trashentry")]
pub struct TrashEntryRecord {
    pub id: i64,
    pub trash_item_type: String,
    pub trash_item_id: i64,
    pub parent_trash_item_id: Option<i64>,
    pub name: String,
    pub parent_name: Option<String>,
    pub trashed_at: StorageDatetime,
    pub should_be_permanently_deleted: bool,
    pub related_items: JsonValue,
}

/// Create the catalog relations if they do not exist yet.
pub async fn install<T: TransactionExecutor + ?Sized>(tx: &mut T) -> Result<(), TableError> {
    create_if_missing::<WorkspaceRecord, T>(tx).await?;
    create_if_missing::<TableRecord, T>(tx).await?;
    create_if_missing::<FieldRecord, T>(tx).await?;
    create_if_missing::<SelectOptionRecord, T>(tx).await?;
    create_if_missing::<FieldDependencyRecord, T>(tx).await?;
    create_if_missing::<TrashEntryRecord, T>(tx).await?;

    tx.create_index(&IndexDef::btree(
        "database_field_table_id_idx",
        FieldRecord::table_name(),
        "table_id",
    ))
    .await?;
    tx.create_index(&IndexDef::btree(
        "database_selectoption_field_id_idx",
        SelectOptionRecord::table_name(),
        "field_id",
    ))
    .await?;
    tx.create_index(&IndexDef::btree(
        "database_fielddependency_dependency_id_idx",
        FieldDependencyRecord::table_name(),
        "dependency_id",
    ))
    .await?;
    Ok(())
}

async fn create_if_missing<R: Storable, T: TransactionExecutor + ?Sized>(
    tx: &mut T,
) -> Result<(), TableError> {
    if !tx.table_exists(R::table_name()).await? {
        tx.create_table(R::table_name(), &R::column_defs()).await?;
    }
    Ok(())
}

/// Fetch a table that is not trashed.
pub async fn table<E: Executor + ?Sized>(
    exec: &mut E,
    table_id: TableId,
) -> Result<TableRecord, TableError> {
    match get_record::<TableRecord, E>(exec, table_id).await? {
        Some(table) if !table.trashed => Ok(table),
        _ => Err(TableError::TableNotFound(table_id)),
    }
}

/// Fetch a table, trashed or not.
pub async fn table_including_trashed<E: Executor + ?Sized>(
    exec: &mut E,
    table_id: TableId,
) -> Result<TableRecord, TableError> {
    get_record::<TableRecord, E>(exec, table_id)
        .await?
        .ok_or(TableError::TableNotFound(table_id))
}

/// Lock a table row for the rest of the transaction and return it.
pub async fn lock_table<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    table_id: TableId,
) -> Result<TableRecord, TableError> {
    let query = Query::of::<TableRecord>().eq("id", table_id).for_update();
    match fetch_record::<TableRecord, T>(tx, &query).await? {
        Some(table) if !table.trashed => Ok(table),
        _ => Err(TableError::TableNotFound(table_id)),
    }
}

pub async fn tables_in_workspace<E: Executor + ?Sized>(
    exec: &mut E,
    workspace_id: i64,
) -> Result<Vec<TableRecord>, TableError> {
    let query = Query::of::<TableRecord>()
        .eq("workspace_id", workspace_id)
        .eq("trashed", false)
        .order_by("order", Order::Asc)
        .order_by("id", Order::Asc);
    fetch_records(exec, &query).await
}

pub async fn workspace<E: Executor + ?Sized>(
    exec: &mut E,
    workspace_id: i64,
) -> Result<WorkspaceRecord, TableError> {
    get_record::<WorkspaceRecord, E>(exec, workspace_id)
        .await?
        .ok_or_else(|| TableError::NotFound(format!("workspace {}", workspace_id)))
}

/// Fetch a field, trashed or not.
pub async fn field<E: Executor + ?Sized>(
    exec: &mut E,
    field_id: FieldId,
) -> Result<FieldRecord, TableError> {
    get_record::<FieldRecord, E>(exec, field_id)
        .await?
        .ok_or(TableError::FieldNotFound(field_id))
}

/// Non-trashed fields of a table in display order.
pub async fn fields_for_table<E: Executor + ?Sized>(
    exec: &mut E,
    table_id: TableId,
) -> Result<Vec<FieldRecord>, TableError> {
    let query = Query::of::<FieldRecord>()
        .eq("table_id", table_id)
        .eq("trashed", false)
        .order_by("order", Order::Asc)
        .order_by("id", Order::Asc);
    fetch_records(exec, &query).await
}

/// Every field of a table, trashed ones included.
pub async fn all_fields_for_table<E: Executor + ?Sized>(
    exec: &mut E,
    table_id: TableId,
) -> Result<Vec<FieldRecord>, TableError> {
    let query = Query::of::<FieldRecord>()
        .eq("table_id", table_id)
        .order_by("id", Order::Asc);
    fetch_records(exec, &query).await
}

pub async fn fields_by_ids<E: Executor + ?Sized>(
    exec: &mut E,
    field_ids: &[FieldId],
) -> Result<Vec<FieldRecord>, TableError> {
    if field_ids.is_empty() {
        return Ok(Vec::new());
    }
    let query = Query::of::<FieldRecord>()
        .r#in("id", field_ids)
        .order_by("id", Order::Asc);
    fetch_records(exec, &query).await
}

/// Select options of the given fields, ordered by their `order`.
pub async fn select_options_for_fields<E: Executor + ?Sized>(
    exec: &mut E,
    field_ids: &[FieldId],
) -> Result<Vec<SelectOptionRecord>, TableError> {
    if field_ids.is_empty() {
        return Ok(Vec::new());
    }
    let query = Query::of::<SelectOptionRecord>()
        .r#in("field_id", field_ids)
        .order_by("order", Order::Asc)
        .order_by("id", Order::Asc);
    fetch_records(exec, &query).await
}

pub async fn select_options_by_ids<E: Executor + ?Sized>(
    exec: &mut E,
    option_ids: &[i64],
) -> Result<Vec<SelectOptionRecord>, TableError> {
    if option_ids.is_empty() {
        return Ok(Vec::new());
    }
    let query = Query::of::<SelectOptionRecord>().r#in("id", option_ids);
    fetch_records(exec, &query).await
}

/// Bump the schema version of a table. Must run in the transaction that
/// changes the table's field set.
pub async fn bump_schema_version<E: Executor + ?Sized>(
    exec: &mut E,
    table_id: TableId,
) -> Result<i64, TableError> {
    let table = table_including_trashed(exec, table_id).await?;
    let version = table.schema_version + 1;
    exec.update(
        &Update::of::<TableRecord>()
            .set("schema_version", version)
            .eq("id", table_id),
    )
    .await?;
    Ok(version)
}
