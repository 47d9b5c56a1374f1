//! Schema synchronization.
//!
//! Translates table and field lifecycle events into DDL on the relation
//! backing the table. Every function runs inside the caller's transaction;
//! the caller bumps the schema version in that same transaction.

use tracing::debug;

use crate::catalog::{FieldRecord, TableRecord};
use crate::query::{
    ColumnDef, ColumnDefault, ColumnType, Delete, Executor, IndexDef, TransactionExecutor,
};
use crate::registry::{FieldType, FieldTypeRegistry, RelationTarget, Storage};
use crate::TableError;

pub const CREATED_ON_COLUMN: &str = "created_on";
pub const UPDATED_ON_COLUMN: &str = "updated_on";

/// Columns every user table relation starts with.
pub fn base_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::primary_key("id"),
        ColumnDef::new(CREATED_ON_COLUMN, ColumnType::Timestamp),
        ColumnDef::new(UPDATED_ON_COLUMN, ColumnType::Timestamp),
    ]
}

fn join_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::primary_key("id"),
        ColumnDef::new("row_id", ColumnType::BigInt).not_null(),
        ColumnDef::new("target_id", ColumnType::BigInt).not_null(),
    ]
}

fn sequence_of(column: &ColumnDef) -> Option<&str> {
    match &column.default {
        ColumnDefault::Sequence(name) => Some(name),
        _ => None,
    }
}

/// Create the physical relation of a new table.
pub async fn create_table_relation<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    table: &TableRecord,
) -> Result<(), TableError> {
    let relation = table.relation_name();
    if tx.table_exists(&relation).await? {
        return Err(TableError::SchemaConflict(format!(
            "relation {} already exists",
            relation
        )));
    }
    tx.create_table(&relation, &base_columns()).await?;
    debug!(table_id = table.id, relation = %relation, "Created table relation");
    Ok(())
}

/// Drop a table relation together with the storage of its fields.
pub async fn drop_table_relation<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    registry: &FieldTypeRegistry,
    table: &TableRecord,
    fields: &[FieldRecord],
) -> Result<(), TableError> {
    for field in fields {
        let field_type = registry.type_of(field)?;
        match field_type.storage(field) {
            Storage::Relation { relation, .. } => {
                if tx.table_exists(&relation).await? {
                    tx.drop_table(&relation).await?;
                }
            }
            Storage::Column(column) | Storage::SelectOption(column) => {
                if let Some(sequence) = sequence_of(&column) {
                    tx.drop_sequence(sequence).await?;
                }
            }
        }
    }
    let relation = table.relation_name();
    if tx.table_exists(&relation).await? {
        tx.drop_table(&relation).await?;
    }
    Ok(())
}

/// Create the storage of a newly added field.
pub async fn add_field<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    registry: &FieldTypeRegistry,
    table: &TableRecord,
    field: &FieldRecord,
) -> Result<(), TableError> {
    let field_type = registry.type_of(field)?;
    create_storage(tx, table, &field_type.storage(field)).await?;
    debug!(
        table_id = table.id,
        field_id = field.id,
        field_type = %field.type_tag,
        "Created field storage"
    );
    Ok(())
}

async fn create_storage<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    table: &TableRecord,
    storage: &Storage,
) -> Result<(), TableError> {
    let relation = table.relation_name();
    match storage {
        Storage::Column(column) | Storage::SelectOption(column) => {
            let existing = tx.columns(&relation).await?;
            if existing.iter().any(|c| c.name == column.name) {
                return Err(TableError::SchemaConflict(format!(
                    "column {} already exists on {}",
                    column.name, relation
                )));
            }
            if let Some(sequence) = sequence_of(column) {
                tx.create_sequence(sequence).await?;
            }
            tx.add_column(&relation, column).await?;
            if matches!(storage, Storage::SelectOption(_)) {
                tx.create_index(&IndexDef::btree(
                    format!("{}_{}_idx", relation, column.name),
                    relation.as_str(),
                    column.name.as_str(),
                ))
                .await?;
            }
        }
        Storage::Relation { relation: join, .. } => {
            if tx.table_exists(join).await? {
                return Err(TableError::SchemaConflict(format!(
                    "relation {} already exists",
                    join
                )));
            }
            tx.create_table(join, &join_columns()).await?;
            tx.create_index(&IndexDef::btree(format!("{}_row_id_idx", join), join.as_str(), "row_id"))
                .await?;
            tx.create_index(&IndexDef::btree(
                format!("{}_target_id_idx", join),
                join.as_str(),
                "target_id",
            ))
            .await?;
        }
    }
    Ok(())
}

async fn drop_storage<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    table: &TableRecord,
    storage: &Storage,
) -> Result<(), TableError> {
    match storage {
        Storage::Column(column) | Storage::SelectOption(column) => {
            let relation = table.relation_name();
            let existing = tx.columns(&relation).await?;
            if existing.iter().any(|c| c.name == column.name) {
                tx.drop_column(&relation, &column.name).await?;
            }
            if let Some(sequence) = sequence_of(column) {
                tx.drop_sequence(sequence).await?;
            }
        }
        Storage::Relation { relation, .. } => {
            if tx.table_exists(relation).await? {
                tx.drop_table(relation).await?;
            }
        }
    }
    Ok(())
}

/// Bring the storage of a field in line with its new type and options.
pub async fn alter_field<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    registry: &FieldTypeRegistry,
    table: &TableRecord,
    old_field: &FieldRecord,
    new_field: &FieldRecord,
) -> Result<(), TableError> {
    let old_type = registry.type_of(old_field)?;
    let new_type = registry.type_of(new_field)?;
    let old_storage = old_type.storage(old_field);
    let new_storage = new_type.storage(new_field);
    if old_storage == new_storage {
        return Ok(());
    }

    match (&old_storage, &new_storage) {
        (
            Storage::Column(old) | Storage::SelectOption(old),
            Storage::Column(new) | Storage::SelectOption(new),
        ) => {
            let new_sequence = sequence_of(new);
            if new_sequence.is_some() && new_sequence != sequence_of(old) {
                // Existing rows draw fresh values from the new sequence.
                drop_storage(tx, table, &old_storage).await?;
                create_storage(tx, table, &new_storage).await?;
            } else {
                let conversion = new_type.alter_conversion(old_type.as_ref(), old_field, new_field);
                tx.alter_column(&table.relation_name(), new, conversion)
                    .await?;
                if let Some(sequence) = sequence_of(old) {
                    tx.drop_sequence(sequence).await?;
                }
                let index = format!("{}_{}_idx", table.relation_name(), new.name);
                match (&old_storage, &new_storage) {
                    (Storage::SelectOption(_), Storage::Column(_)) => {
                        tx.drop_index(&table.relation_name(), &index).await?;
                    }
                    (Storage::Column(_), Storage::SelectOption(_)) => {
                        tx.create_index(&IndexDef::btree(
                            index,
                            table.relation_name(),
                            new.name.as_str(),
                        ))
                        .await?;
                    }
                    _ => {}
                }
            }
        }
        (
            Storage::Relation {
                relation: old_relation,
                target: old_target,
            },
            Storage::Relation {
                relation: new_relation,
                target: new_target,
            },
        ) if old_relation == new_relation => {
            if old_target != new_target {
                tx.delete(&Delete::for_table(old_relation.as_str())).await?;
            }
        }
        _ => {
            drop_storage(tx, table, &old_storage).await?;
            create_storage(tx, table, &new_storage).await?;
        }
    }
    debug!(
        table_id = table.id,
        field_id = new_field.id,
        from = %old_field.type_tag,
        to = %new_field.type_tag,
        "Altered field storage"
    );
    Ok(())
}

/// Drop the storage of a field. Irreversible.
pub async fn remove_field<T: TransactionExecutor + ?Sized>(
    tx: &mut T,
    registry: &FieldTypeRegistry,
    table: &TableRecord,
    field: &FieldRecord,
) -> Result<(), TableError> {
    let field_type = registry.type_of(field)?;
    drop_storage(tx, table, &field_type.storage(field)).await?;
    debug!(table_id = table.id, field_id = field.id, "Dropped field storage");
    Ok(())
}

/// The target table of a link field, if it is one.
pub fn link_target(field_type: &dyn FieldType, field: &FieldRecord) -> Option<i64> {
    match field_type.storage(field) {
        Storage::Relation {
            target: RelationTarget::Table(table_id),
            ..
        } => Some(table_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_types::{AUTONUMBER, MULTIPLE_SELECT, NUMBER, TEXT};
    use crate::query::{Query, QueryExecutor, Value};
    use crate::MemoryStore;
    use serde_json::json;

    fn table() -> TableRecord {
        let mut table = TableRecord::new(1, "Projects", 0);
        table.id = 5;
        table
    }

    fn field(type_tag: &str) -> FieldRecord {
        let mut field = FieldRecord::new(5, "Name", type_tag, json!({}));
        field.id = 9;
        field
    }

    #[tokio::test]
    async fn add_field_twice_is_a_conflict() {
        let store = MemoryStore::new();
        let registry = FieldTypeRegistry::with_builtin_types();
        let mut tx = store.begin_transaction().await.unwrap();
        create_table_relation(&mut tx, &table()).await.unwrap();
        add_field(&mut tx, &registry, &table(), &field(TEXT)).await.unwrap();

        let err = add_field(&mut tx, &registry, &table(), &field(TEXT))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::SchemaConflict(_)));
    }

    #[tokio::test]
    async fn changing_storage_kind_replaces_storage() {
        let store = MemoryStore::new();
        let registry = FieldTypeRegistry::with_builtin_types();
        let mut tx = store.begin_transaction().await.unwrap();
        create_table_relation(&mut tx, &table()).await.unwrap();
        add_field(&mut tx, &registry, &table(), &field(TEXT)).await.unwrap();

        alter_field(&mut tx, &registry, &table(), &field(TEXT), &field(MULTIPLE_SELECT))
            .await
            .unwrap();
        let columns = tx.columns("database_table_5").await.unwrap();
        assert!(!columns.iter().any(|c| c.name == "field_9"));
        assert!(tx.table_exists("database_relation_9").await.unwrap());

        alter_field(&mut tx, &registry, &table(), &field(MULTIPLE_SELECT), &field(NUMBER))
            .await
            .unwrap();
        assert!(!tx.table_exists("database_relation_9").await.unwrap());
        let columns = tx.columns("database_table_5").await.unwrap();
        let column = columns.iter().find(|c| c.name == "field_9").unwrap();
        assert_eq!(column.column_type, ColumnType::Double);
    }

    #[tokio::test]
    async fn converting_to_autonumber_numbers_existing_rows() {
        let store = MemoryStore::new();
        let registry = FieldTypeRegistry::with_builtin_types();
        let mut tx = store.begin_transaction().await.unwrap();
        create_table_relation(&mut tx, &table()).await.unwrap();
        add_field(&mut tx, &registry, &table(), &field(TEXT)).await.unwrap();
        for name in ["a", "b"] {
            tx.insert("database_table_5", &[("field_9".to_string(), Value::from(name))])
                .await
                .unwrap();
        }

        alter_field(&mut tx, &registry, &table(), &field(TEXT), &field(AUTONUMBER))
            .await
            .unwrap();
        let rows = tx.fetch(&Query::for_table("database_table_5")).await.unwrap();
        let numbers: Vec<_> = rows.iter().map(|r| r["field_9"].clone()).collect();
        assert_eq!(numbers, vec![json!(1), json!(2)]);
    }
}
