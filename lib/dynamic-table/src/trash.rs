//! Trash entries.
//!
//! Trashing a table or field only hides it: storage stays in place and an
//! entry records what was trashed and when. Entries older than the
//! configured retention are marked, and marked entries are permanently
//! deleted by calling back into the engine's irreversible drops.

use std::fmt;

use serde_json::Value as JsonValue;
use tracing::{error, info};

use crate::catalog::TrashEntryRecord;
use crate::handler::TableEngine;
use crate::query::{Delete, Executor, Filter, Order, Query, QueryExecutor, Update, Value};
use crate::storable::{fetch_record, fetch_records, insert_record};
use crate::{StorageDatetime, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrashItemType {
    Table,
    Field,
}

impl TrashItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            TrashItemType::Table => "table",
            TrashItemType::Field => "field",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "table" => Some(TrashItemType::Table),
            "field" => Some(TrashItemType::Field),
            _ => None,
        }
    }
}

impl fmt::Display for TrashItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine hands over when it trashes something.
#[derive(Debug, Clone, PartialEq)]
pub struct TrashEntryRequest {
    pub item_type: TrashItemType,
    pub item_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub parent_name: Option<String>,
    pub related_items: JsonValue,
}

fn entry_query(item_type: TrashItemType, item_id: i64, parent_id: Option<i64>) -> Query {
    let query = Query::of::<TrashEntryRecord>()
        .eq("trash_item_type", item_type.as_str())
        .eq("trash_item_id", item_id);
    match parent_id {
        Some(parent) => query.eq("parent_trash_item_id", parent),
        None => query.filter(Filter::IsNull("parent_trash_item_id".to_string())),
    }
}

/// Persist a trash entry. Entries are unique per type, parent and item.
pub async fn create_entry<E: Executor + ?Sized>(
    exec: &mut E,
    request: TrashEntryRequest,
) -> Result<TrashEntryRecord, TableError> {
    let existing = entry_query(request.item_type, request.item_id, request.parent_id);
    if exec.exists(&existing).await? {
        return Err(TableError::AlreadyTrashed(format!(
            "{} {}",
            request.item_type, request.item_id
        )));
    }
    let entry = TrashEntryRecord {
        id: 0,
        trash_item_type: request.item_type.as_str().to_string(),
        trash_item_id: request.item_id,
        parent_trash_item_id: request.parent_id,
        name: request.name,
        parent_name: request.parent_name,
        trashed_at: StorageDatetime::now(),
        should_be_permanently_deleted: false,
        related_items: request.related_items,
    };
    insert_record(exec, &entry).await
}

/// Remove the entries of an item, restored or permanently deleted.
pub async fn remove_entries<E: Executor + ?Sized>(
    exec: &mut E,
    item_type: TrashItemType,
    item_id: i64,
) -> Result<u64, TableError> {
    exec.delete(
        &Delete::of::<TrashEntryRecord>()
            .eq("trash_item_type", item_type.as_str())
            .eq("trash_item_id", item_id),
    )
    .await
}

pub async fn find_entry<E: Executor + ?Sized>(
    exec: &mut E,
    item_type: TrashItemType,
    item_id: i64,
) -> Result<Option<TrashEntryRecord>, TableError> {
    fetch_record(
        exec,
        &Query::of::<TrashEntryRecord>()
            .eq("trash_item_type", item_type.as_str())
            .eq("trash_item_id", item_id),
    )
    .await
}

/// Runs the trash lifecycle against an engine.
#[derive(Clone)]
pub struct TrashHandler<S: QueryExecutor> {
    engine: TableEngine<S>,
}

impl<S: QueryExecutor> TrashHandler<S> {
    pub fn new(engine: TableEngine<S>) -> Self {
        Self { engine }
    }

    /// Restore a trashed item.
    pub async fn restore(&self, item_type: TrashItemType, item_id: i64) -> Result<(), TableError> {
        match item_type {
            TrashItemType::Table => self.engine.restore_table(item_id).await.map(|_| ()),
            TrashItemType::Field => self.engine.restore_field(item_id).await.map(|_| ()),
        }
    }

    /// Flag entries trashed longer ago than the retention period. Returns
    /// the number of entries flagged.
    pub async fn mark_old_trash_for_permanent_deletion(&self) -> Result<u64, TableError> {
        let cutoff = StorageDatetime::now() - self.engine.config().trash_retention();
        let mut store = self.engine.store().clone();
        let marked = store
            .update(
                &Update::of::<TrashEntryRecord>()
                    .set("should_be_permanently_deleted", true)
                    .eq("should_be_permanently_deleted", false)
                    .filter(Filter::Lte("trashed_at".to_string(), Value::Datetime(cutoff))),
            )
            .await?;
        if marked > 0 {
            info!(marked, "Marked old trash for permanent deletion");
        }
        Ok(marked)
    }

    /// Permanently delete every flagged item. Failures are logged per entry
    /// and do not stop the sweep. Returns the number of items deleted.
    pub async fn permanently_delete_marked_trash(&self) -> Result<u64, TableError> {
        let mut store = self.engine.store().clone();
        let entries: Vec<TrashEntryRecord> = fetch_records(
            &mut store,
            &Query::of::<TrashEntryRecord>()
                .eq("should_be_permanently_deleted", true)
                .order_by("id", Order::Asc),
        )
        .await?;

        let mut deleted = 0;
        for entry in entries {
            let result = match TrashItemType::parse(&entry.trash_item_type) {
                Some(TrashItemType::Table) => {
                    self.engine.permanently_delete_table(entry.trash_item_id).await
                }
                Some(TrashItemType::Field) => {
                    self.engine.permanently_delete_field(entry.trash_item_id).await
                }
                None => Err(TableError::InvalidConfig(format!(
                    "unknown trash item type {:?}",
                    entry.trash_item_type
                ))),
            };
            match result {
                Ok(()) => deleted += 1,
                // Gone already, e.g. a field deleted together with its table.
                Err(TableError::TableNotFound(_) | TableError::FieldNotFound(_)) => {
                    store
                        .delete(&Delete::of::<TrashEntryRecord>().eq("id", entry.id))
                        .await?;
                }
                Err(e) => {
                    error!(
                        trash_entry_id = entry.id,
                        item_type = %entry.trash_item_type,
                        item_id = entry.trash_item_id,
                        error = %e,
                        "Failed to permanently delete trashed item"
                    );
                }
            }
        }
        Ok(deleted)
    }
}
