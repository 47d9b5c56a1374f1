//! Storable trait for catalog records.
//!
//! Catalog records (tables, fields, select options, dependencies, trash
//! entries) live in the same store as user data, so every metadata change
//! commits in the same transaction as the DDL it describes. Add
//! `#[derive(Storable)]` with `#[storable(table = "...")]` to generate the
//! implementation.

use serde_json::Value as JsonValue;

use crate::query::{ColumnDef, ColumnType, Executor, Query, Row, Update, Value};
use crate::TableError;

/// Trait for types that can be stored in a database.
///
/// # Column Naming
///
/// Database columns use the Rust field names unless overridden with
/// `#[column(name = "custom_name")]`. Use `#[column(skip)]` to exclude a
/// field from database storage.
pub trait Storable: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync {
    /// The database table name for this type.
    fn table_name() -> &'static str;

    /// Column names in order.
    fn columns() -> &'static [&'static str];

    /// Column types in order.
    fn column_types() -> &'static [ColumnType];

    /// Column nullability in order.
    fn nullable() -> &'static [bool];

    /// JSON key names in order. Corresponds 1:1 with columns().
    fn json_keys() -> &'static [&'static str];

    /// The primary key.
    fn id(&self) -> i64;

    /// Physical column definitions used to bootstrap the table.
    fn column_defs() -> Vec<ColumnDef> {
        Self::columns()
            .iter()
            .zip(Self::column_types())
            .zip(Self::nullable())
            .map(|((name, column_type), nullable)| {
                if *column_type == ColumnType::Serial {
                    ColumnDef::primary_key(*name)
                } else {
                    let def = ColumnDef::new(*name, *column_type);
                    if *nullable { def } else { def.not_null() }
                }
            })
            .collect()
    }

    /// Column values in order, without the primary key.
    fn to_values(&self) -> Result<Vec<(String, Value)>, TableError> {
        let json = serde_json::to_value(self)?;
        let obj = json.as_object().ok_or_else(|| {
            TableError::StorageError("Expected JSON object for Storable type".to_string())
        })?;

        let mut values = Vec::with_capacity(Self::columns().len());
        for ((column, json_key), column_type) in Self::columns()
            .iter()
            .zip(Self::json_keys())
            .zip(Self::column_types())
        {
            if *column_type == ColumnType::Serial {
                continue;
            }
            let value = obj.get(*json_key).unwrap_or(&JsonValue::Null);
            values.push(((*column).to_string(), Value::from_json(value, *column_type)?));
        }
        Ok(values)
    }

    /// Deserialize a stored row.
    fn from_row(row: Row) -> Result<Self, TableError> {
        let mut obj = serde_json::Map::new();
        for (column, json_key) in Self::columns().iter().zip(Self::json_keys()) {
            if let Some(value) = row.get(*column) {
                obj.insert((*json_key).to_string(), value.clone());
            }
        }
        serde_json::from_value(JsonValue::Object(obj))
            .map_err(|e| TableError::StorageError(format!("Deserialization error: {}", e)))
    }
}

/// Fetch and deserialize every record matching `query`.
pub async fn fetch_records<T, E>(exec: &mut E, query: &Query) -> Result<Vec<T>, TableError>
where
    T: Storable,
    E: Executor + ?Sized,
{
    exec.fetch(query).await?.into_iter().map(T::from_row).collect()
}

/// Fetch and deserialize at most one record.
pub async fn fetch_record<T, E>(exec: &mut E, query: &Query) -> Result<Option<T>, TableError>
where
    T: Storable,
    E: Executor + ?Sized,
{
    exec.fetch_optional(query).await?.map(T::from_row).transpose()
}

/// Fetch a record by primary key.
pub async fn get_record<T, E>(exec: &mut E, id: i64) -> Result<Option<T>, TableError>
where
    T: Storable,
    E: Executor + ?Sized,
{
    fetch_record(exec, &Query::of::<T>().eq("id", id)).await
}

/// Insert a record and return it with its assigned id.
pub async fn insert_record<T, E>(exec: &mut E, item: &T) -> Result<T, TableError>
where
    T: Storable,
    E: Executor + ?Sized,
{
    let values = item.to_values()?;
    let row = exec.insert(T::table_name(), &values).await?;
    T::from_row(row)
}

/// Write every column of an existing record.
pub async fn save_record<T, E>(exec: &mut E, item: &T) -> Result<(), TableError>
where
    T: Storable,
    E: Executor + ?Sized,
{
    let mut update = Update::of::<T>().eq("id", item.id());
    update.assignments = item.to_values()?;
    let affected = exec.update(&update).await?;
    if affected == 0 {
        return Err(TableError::NotFound(format!(
            "{} {}",
            T::table_name(),
            item.id()
        )));
    }
    Ok(())
}
