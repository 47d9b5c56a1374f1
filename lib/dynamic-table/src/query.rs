//! Backend-agnostic query builder and executor traits.
//!
//! Rows travel as JSON objects keyed by physical column name. Values bound
//! to statements carry enough type information for a backend to bind them
//! (including typed nulls), and column definitions describe the physical
//! shape a backend must create.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{StorageDatetime, TableError};

/// A row as returned by a backend, keyed by physical column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// Physical column types understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Auto-incrementing primary key.
    Serial,
    BigInt,
    Double,
    Text,
    Boolean,
    Timestamp,
    /// Stored as seconds; rendered with the store's interval formatting.
    Interval,
    Json,
    /// Full-text search vector derived from other columns.
    TsVector,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Serial => "serial",
            ColumnType::BigInt => "bigint",
            ColumnType::Double => "double",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Interval => "interval",
            ColumnType::Json => "json",
            ColumnType::TsVector => "tsvector",
        }
    }
}

/// Default applied by the store when an insert omits the column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    None,
    Value(JsonValue),
    /// Next value of the named sequence, drawn outside the inserting transaction.
    Sequence(String),
}

/// A physical column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: ColumnDefault,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: ColumnDefault::None,
            primary_key: false,
        }
    }

    /// The `id` primary key every relation carries.
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Serial,
            nullable: false,
            default: ColumnDefault::None,
            primary_key: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = ColumnDefault::Value(value);
        self
    }

    pub fn sequence(mut self, sequence: impl Into<String>) -> Self {
        self.default = ColumnDefault::Sequence(sequence.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    /// Inverted index used for search vectors.
    Gin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

impl IndexDef {
    pub fn btree(name: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: vec![column.into()],
            kind: IndexKind::BTree,
        }
    }

    pub fn gin(name: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: vec![column.into()],
            kind: IndexKind::Gin,
        }
    }
}

/// How existing values survive a column type change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Same physical representation, values are kept untouched.
    Keep,
    /// Value-preserving cast; values that cannot be cast become null.
    Cast,
    /// All values are cleared.
    Clear,
}

/// A value that can be bound to a query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Strings(Vec<String>),
    Ints(Vec<i64>),
    Datetime(StorageDatetime),
    /// Seconds.
    Interval(f64),
    Json(JsonValue),
    /// Source text the backend turns into a search vector.
    SearchVector(String),
    Null(ColumnType),
}

impl Value {
    /// JSON representation as stored in a row.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Int(n) => JsonValue::from(*n),
            Value::UInt(n) => JsonValue::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Strings(v) => JsonValue::from(v.clone()),
            Value::Ints(v) => JsonValue::from(v.clone()),
            Value::Datetime(dt) => JsonValue::String(dt.to_rfc3339()),
            Value::Interval(secs) => serde_json::Number::from_f64(*secs)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Json(v) => v.clone(),
            Value::SearchVector(text) => JsonValue::from(crate::search::to_tsvector(text)),
            Value::Null(_) => JsonValue::Null,
        }
    }

    /// Convert a JSON value into a bindable value for a column of `column_type`.
    pub fn from_json(value: &JsonValue, column_type: ColumnType) -> Result<Value, TableError> {
        if value.is_null() {
            return Ok(Value::Null(column_type));
        }

        let mismatch = || {
            TableError::StorageError(format!(
                "cannot bind {} to a {} column",
                value,
                column_type.as_str()
            ))
        };

        Ok(match column_type {
            ColumnType::Serial | ColumnType::BigInt => {
                Value::Int(value.as_i64().ok_or_else(mismatch)?)
            }
            ColumnType::Double | ColumnType::Interval => {
                let n = value.as_f64().ok_or_else(mismatch)?;
                if column_type == ColumnType::Interval {
                    Value::Interval(n)
                } else {
                    Value::Float(n)
                }
            }
            ColumnType::Boolean => Value::Bool(value.as_bool().ok_or_else(mismatch)?),
            ColumnType::Timestamp => {
                let s = value.as_str().ok_or_else(mismatch)?;
                Value::Datetime(StorageDatetime::parse(s)?)
            }
            ColumnType::Text => Value::String(value.as_str().ok_or_else(mismatch)?.to_string()),
            ColumnType::Json => Value::Json(value.clone()),
            ColumnType::TsVector => {
                Value::SearchVector(value.as_str().ok_or_else(mismatch)?.to_string())
            }
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Strings(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::Ints(v)
    }
}

impl From<&[i64]> for Value {
    fn from(v: &[i64]) -> Self {
        Value::Ints(v.to_vec())
    }
}

impl From<StorageDatetime> for Value {
    fn from(dt: StorageDatetime) -> Self {
        Value::Datetime(dt)
    }
}

impl From<&StorageDatetime> for Value {
    fn from(dt: &StorageDatetime) -> Self {
        Value::Datetime(dt.clone())
    }
}

/// Filter conditions for queries.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// field = value
    Eq(String, Value),
    /// field != value
    Ne(String, Value),
    /// field > value
    Gt(String, Value),
    /// field >= value
    Gte(String, Value),
    /// field < value
    Lt(String, Value),
    /// field <= value
    Lte(String, Value),
    /// field IN (values) - for arrays
    In(String, Value),
    /// field IS NULL
    IsNull(String),
    /// field IS NOT NULL
    IsNotNull(String),
    /// search vector column matches every term of the query text
    Matches(String, String),
    /// any of the nested filters holds
    Any(Vec<Filter>),
}

/// Sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A SELECT query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// The table to query.
    pub table: String,
    /// Filter conditions, combined with AND.
    pub filters: Vec<Filter>,
    /// Order by clauses.
    pub order_by: Vec<(String, Order)>,
    /// Maximum number of results.
    pub limit: Option<u64>,
    /// Offset for pagination.
    pub offset: Option<u64>,
    /// Lock the selected rows until the surrounding transaction ends.
    pub for_update: bool,
}

impl Query {
    /// Create a new query for an explicit table name.
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            for_update: false,
        }
    }

    /// Create a new query for a catalog record's table.
    pub fn of<T: crate::Storable>() -> Self {
        Self::for_table(T::table_name())
    }

    /// Add a filter condition.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add an equality filter (shorthand for Filter::Eq).
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(field.into(), value.into()))
    }

    /// Add an IN filter (shorthand for Filter::In).
    pub fn r#in(self, field: impl Into<String>, values: impl Into<Value>) -> Self {
        self.filter(Filter::In(field.into(), values.into()))
    }

    /// Add a greater-than filter.
    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Gt(field.into(), value.into()))
    }

    /// Add a less-than-or-equal filter.
    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Lte(field.into(), value.into()))
    }

    /// Add an order-by clause.
    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by.push((field.into(), order));
        self
    }

    /// Set the maximum number of results.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the offset for pagination.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Lock matched rows (`SELECT ... FOR UPDATE`).
    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }
}

/// An UPDATE statement builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub filters: Vec<Filter>,
}

impl Update {
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn of<T: crate::Storable>() -> Self {
        Self::for_table(T::table_name())
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((column.into(), value.into()));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(field.into(), value.into()))
    }

    pub fn r#in(self, field: impl Into<String>, values: impl Into<Value>) -> Self {
        self.filter(Filter::In(field.into(), values.into()))
    }
}

/// A DELETE query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// The table to delete from.
    pub table: String,
    /// Filter conditions.
    pub filters: Vec<Filter>,
}

impl Delete {
    /// Create a new delete query with an explicit table name.
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
        }
    }

    pub fn of<T: crate::Storable>() -> Self {
        Self::for_table(T::table_name())
    }

    /// Add a filter condition.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add an equality filter (shorthand).
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(field.into(), value.into()))
    }

    /// Add an IN filter.
    pub fn r#in(self, field: impl Into<String>, values: impl Into<Value>) -> Self {
        self.filter(Filter::In(field.into(), values.into()))
    }
}

/// Row-level statements shared by pool handles (autocommit) and transactions.
///
/// The trait is object safe so field-type hooks and job handlers can work
/// against `&mut dyn Executor` regardless of backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a SELECT query and return results.
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, TableError>;

    /// Count the rows matching the query's filters.
    async fn count(&mut self, query: &Query) -> Result<u64, TableError>;

    /// Insert a row and return it as stored, defaults included.
    async fn insert(&mut self, table: &str, values: &[(String, Value)]) -> Result<Row, TableError>;

    /// Execute an UPDATE and return the number of rows affected.
    async fn update(&mut self, update: &Update) -> Result<u64, TableError>;

    /// Execute a DELETE query and return the number of rows affected.
    async fn delete(&mut self, delete: &Delete) -> Result<u64, TableError>;

    /// Execute a SELECT query and return at most one result.
    async fn fetch_optional(&mut self, query: &Query) -> Result<Option<Row>, TableError> {
        let mut q = query.clone();
        q.limit = Some(1);
        Ok(self.fetch(&q).await?.into_iter().next())
    }

    /// Check if any rows match the query.
    async fn exists(&mut self, query: &Query) -> Result<bool, TableError> {
        Ok(self.count(query).await? > 0)
    }
}

/// Trait for pool-level handles that can open transactions.
#[async_trait]
pub trait QueryExecutor: Executor + Clone + 'static {
    /// The transaction type for this executor.
    type Transaction: TransactionExecutor;

    /// Begin a transaction. The returned executor can be used for queries within the transaction.
    async fn begin_transaction(&self) -> Result<Self::Transaction, TableError>;
}

/// Trait for executing statements, including DDL, within a transaction.
#[async_trait]
pub trait TransactionExecutor: Executor {
    async fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), TableError>;

    async fn drop_table(&mut self, table: &str) -> Result<(), TableError>;

    async fn table_exists(&mut self, table: &str) -> Result<bool, TableError>;

    /// The columns currently present on a table, in creation order.
    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnDef>, TableError>;

    async fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), TableError>;

    /// Replace the definition of `column.name`, converting existing values.
    async fn alter_column(
        &mut self,
        table: &str,
        column: &ColumnDef,
        conversion: Conversion,
    ) -> Result<(), TableError>;

    async fn drop_column(&mut self, table: &str, column: &str) -> Result<(), TableError>;

    /// Create a sequence if it does not exist. Values drawn from it are never
    /// returned to the pool, even when the drawing transaction rolls back.
    async fn create_sequence(&mut self, name: &str) -> Result<(), TableError>;

    async fn drop_sequence(&mut self, name: &str) -> Result<(), TableError>;

    async fn create_index(&mut self, index: &IndexDef) -> Result<(), TableError>;

    async fn drop_index(&mut self, table: &str, name: &str) -> Result<(), TableError>;

    /// Acquire an advisory lock scoped to this transaction.
    /// The lock is automatically released on commit/rollback.
    async fn acquire_advisory_lock(&mut self, key: &str) -> Result<(), TableError>;

    /// Commit the transaction.
    async fn commit(self) -> Result<(), TableError>;

    /// Rollback the transaction.
    async fn rollback(self) -> Result<(), TableError>;
}

/// Read the `id` column of a row.
pub fn row_id(row: &Row) -> Result<i64, TableError> {
    row.get("id")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| TableError::StorageError("row without an integer id".to_string()))
}
