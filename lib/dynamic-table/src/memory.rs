//! In-process relational store.
//!
//! Committed state is an immutable snapshot. A transaction takes the writer
//! gate, works on a private copy and swaps it in on commit, so pool-level
//! reads never wait and never observe uncommitted writes. Sequence counters
//! live outside the snapshots: a value drawn by a transaction that later
//! rolls back is never handed out again.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::query::{
    ColumnDef, ColumnDefault, ColumnType, Conversion, Delete, Executor, Filter, IndexDef, Order,
    Query, QueryExecutor, Row, TransactionExecutor, Update, Value,
};
use crate::search::to_tsvector;
use crate::{StorageDatetime, TableError, format_interval};

#[derive(Debug, Clone)]
struct Relation {
    columns: Vec<ColumnDef>,
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

impl Relation {
    fn column(&self, name: &str) -> Result<&ColumnDef, TableError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TableError::StorageError(format!("column \"{}\" does not exist", name)))
    }

    fn matching_ids(&self, filters: &[Filter]) -> Result<Vec<i64>, TableError> {
        for filter in filters {
            self.check_filter_columns(filter)?;
        }
        Ok(self
            .rows
            .iter()
            .filter(|(_, row)| filters.iter().all(|f| eval_filter(row, f)))
            .map(|(id, _)| *id)
            .collect())
    }

    fn check_filter_columns(&self, filter: &Filter) -> Result<(), TableError> {
        match filter {
            Filter::Eq(c, _)
            | Filter::Ne(c, _)
            | Filter::Gt(c, _)
            | Filter::Gte(c, _)
            | Filter::Lt(c, _)
            | Filter::Lte(c, _)
            | Filter::In(c, _)
            | Filter::IsNull(c)
            | Filter::IsNotNull(c)
            | Filter::Matches(c, _) => self.column(c).map(|_| ()),
            Filter::Any(filters) => filters.iter().try_for_each(|f| self.check_filter_columns(f)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    relations: BTreeMap<String, Relation>,
    sequences: BTreeSet<String>,
    indexes: BTreeMap<String, IndexDef>,
}

impl State {
    fn relation(&self, name: &str) -> Result<&Relation, TableError> {
        self.relations
            .get(name)
            .ok_or_else(|| TableError::StorageError(format!("relation \"{}\" does not exist", name)))
    }

    fn relation_mut(&mut self, name: &str) -> Result<&mut Relation, TableError> {
        self.relations
            .get_mut(name)
            .ok_or_else(|| TableError::StorageError(format!("relation \"{}\" does not exist", name)))
    }

    fn select(&self, query: &Query) -> Result<Vec<Row>, TableError> {
        let relation = self.relation(&query.table)?;
        for (column, _) in &query.order_by {
            relation.column(column)?;
        }
        let mut rows: Vec<Row> = relation
            .matching_ids(&query.filters)?
            .into_iter()
            .filter_map(|id| relation.rows.get(&id).cloned())
            .collect();
        rows.sort_by(|a, b| compare_rows(a, b, &query.order_by));

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

struct Shared {
    committed: RwLock<Arc<State>>,
    gate: Arc<AsyncMutex<()>>,
    sequence_values: Mutex<HashMap<String, i64>>,
    writes: AtomicU64,
}

impl Shared {
    fn nextval(&self, sequence: &str) -> i64 {
        let mut values = self.sequence_values.lock();
        let value = values.entry(sequence.to_string()).or_insert(0);
        *value += 1;
        *value
    }
}

/// Pool-level handle. Writes issued directly on it run in their own
/// transaction (autocommit).
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("writes", &self.write_count())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: RwLock::new(Arc::new(State::default())),
                gate: Arc::new(AsyncMutex::new(())),
                sequence_values: Mutex::new(HashMap::new()),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Rows inserted, updated or deleted by committed transactions.
    pub fn write_count(&self) -> u64 {
        self.shared.writes.load(AtomicOrdering::SeqCst)
    }

    fn snapshot(&self) -> Arc<State> {
        self.shared.committed.read().clone()
    }

    async fn finish<R>(
        tx: MemoryTransaction,
        result: Result<R, TableError>,
    ) -> Result<R, TableError> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Executor for MemoryStore {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, TableError> {
        self.snapshot().select(query)
    }

    async fn count(&mut self, query: &Query) -> Result<u64, TableError> {
        let snapshot = self.snapshot();
        let relation = snapshot.relation(&query.table)?;
        Ok(relation.matching_ids(&query.filters)?.len() as u64)
    }

    async fn insert(&mut self, table: &str, values: &[(String, Value)]) -> Result<Row, TableError> {
        let mut tx = self.begin_transaction().await?;
        let result = tx.insert(table, values).await;
        Self::finish(tx, result).await
    }

    async fn update(&mut self, update: &Update) -> Result<u64, TableError> {
        let mut tx = self.begin_transaction().await?;
        let result = tx.update(update).await;
        Self::finish(tx, result).await
    }

    async fn delete(&mut self, delete: &Delete) -> Result<u64, TableError> {
        let mut tx = self.begin_transaction().await?;
        let result = tx.delete(delete).await;
        Self::finish(tx, result).await
    }
}

#[async_trait]
impl QueryExecutor for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin_transaction(&self) -> Result<MemoryTransaction, TableError> {
        let gate = self.shared.gate.clone().lock_owned().await;
        let state = self.snapshot().as_ref().clone();
        Ok(MemoryTransaction {
            shared: self.shared.clone(),
            state,
            writes: 0,
            created_sequences: Vec::new(),
            dropped_sequences: Vec::new(),
            _gate: gate,
        })
    }
}

/// An open transaction. Dropping it without committing rolls it back.
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    state: State,
    writes: u64,
    created_sequences: Vec<String>,
    dropped_sequences: Vec<String>,
    _gate: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn resolve_default(&self, column: &ColumnDef) -> Result<JsonValue, TableError> {
        match &column.default {
            ColumnDefault::None => Ok(JsonValue::Null),
            ColumnDefault::Value(value) => Ok(value.clone()),
            ColumnDefault::Sequence(sequence) => {
                if !self.state.sequences.contains(sequence) {
                    return Err(TableError::StorageError(format!(
                        "sequence \"{}\" does not exist",
                        sequence
                    )));
                }
                Ok(JsonValue::from(self.shared.nextval(sequence)))
            }
        }
    }
}

#[async_trait]
impl Executor for MemoryTransaction {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, TableError> {
        self.state.select(query)
    }

    async fn count(&mut self, query: &Query) -> Result<u64, TableError> {
        let relation = self.state.relation(&query.table)?;
        Ok(relation.matching_ids(&query.filters)?.len() as u64)
    }

    async fn insert(&mut self, table: &str, values: &[(String, Value)]) -> Result<Row, TableError> {
        let columns = self.state.relation(table)?.columns.clone();
        for (name, _) in values {
            if !columns.iter().any(|c| &c.name == name) {
                return Err(TableError::StorageError(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    name, table
                )));
            }
        }

        let mut row = Row::new();
        let mut id = None;
        for column in &columns {
            let provided = values.iter().find(|(name, _)| name == &column.name);
            let mut json = match provided {
                Some((_, value)) if !value.is_null() => check_type(column, value.to_json())?,
                Some(_) => JsonValue::Null,
                None => self.resolve_default(column)?,
            };
            if column.primary_key {
                let relation = self.state.relation_mut(table)?;
                let assigned = match json.as_i64() {
                    Some(existing) => existing,
                    None => relation.next_id + 1,
                };
                if relation.rows.contains_key(&assigned) {
                    return Err(TableError::StorageError(format!(
                        "duplicate key value violates unique constraint on \"{}\"",
                        table
                    )));
                }
                relation.next_id = relation.next_id.max(assigned);
                json = JsonValue::from(assigned);
                id = Some(assigned);
            }
            if json.is_null() && !column.nullable {
                return Err(TableError::StorageError(format!(
                    "null value in column \"{}\" violates not-null constraint",
                    column.name
                )));
            }
            row.insert(column.name.clone(), json);
        }

        let id = id.ok_or_else(|| {
            TableError::StorageError(format!("relation \"{}\" has no primary key", table))
        })?;
        self.state
            .relation_mut(table)?
            .rows
            .insert(id, row.clone());
        self.writes += 1;
        Ok(row)
    }

    async fn update(&mut self, update: &Update) -> Result<u64, TableError> {
        let relation = self.state.relation_mut(&update.table)?;
        let mut assignments = Vec::with_capacity(update.assignments.len());
        for (name, value) in &update.assignments {
            let column = relation.column(name)?;
            let json = if value.is_null() {
                if !column.nullable {
                    return Err(TableError::StorageError(format!(
                        "null value in column \"{}\" violates not-null constraint",
                        name
                    )));
                }
                JsonValue::Null
            } else {
                check_type(column, value.to_json())?
            };
            assignments.push((name.clone(), json));
        }

        let ids = relation.matching_ids(&update.filters)?;
        for id in &ids {
            if let Some(row) = relation.rows.get_mut(id) {
                for (name, json) in &assignments {
                    row.insert(name.clone(), json.clone());
                }
            }
        }
        self.writes += ids.len() as u64;
        Ok(ids.len() as u64)
    }

    async fn delete(&mut self, delete: &Delete) -> Result<u64, TableError> {
        let relation = self.state.relation_mut(&delete.table)?;
        let ids = relation.matching_ids(&delete.filters)?;
        for id in &ids {
            relation.rows.remove(id);
        }
        self.writes += ids.len() as u64;
        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl TransactionExecutor for MemoryTransaction {
    async fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), TableError> {
        if self.state.relations.contains_key(table) {
            return Err(TableError::StorageError(format!(
                "relation \"{}\" already exists",
                table
            )));
        }
        self.state.relations.insert(
            table.to_string(),
            Relation {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
                next_id: 0,
            },
        );
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), TableError> {
        if self.state.relations.remove(table).is_none() {
            return Err(TableError::StorageError(format!(
                "relation \"{}\" does not exist",
                table
            )));
        }
        self.state.indexes.retain(|_, index| index.table != table);
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, TableError> {
        Ok(self.state.relations.contains_key(table))
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnDef>, TableError> {
        Ok(self.state.relation(table)?.columns.clone())
    }

    async fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), TableError> {
        if self.state.relation(table)?.columns.iter().any(|c| c.name == column.name) {
            return Err(TableError::StorageError(format!(
                "column \"{}\" of relation \"{}\" already exists",
                column.name, table
            )));
        }

        let ids: Vec<i64> = self.state.relation(table)?.rows.keys().copied().collect();
        let mut filled = Vec::with_capacity(ids.len());
        for id in ids {
            let value = self.resolve_default(column)?;
            if value.is_null() && !column.nullable {
                return Err(TableError::StorageError(format!(
                    "column \"{}\" contains null values",
                    column.name
                )));
            }
            filled.push((id, value));
        }

        let relation = self.state.relation_mut(table)?;
        relation.columns.push(column.clone());
        for (id, value) in filled {
            if let Some(row) = relation.rows.get_mut(&id) {
                row.insert(column.name.clone(), value);
            }
        }
        Ok(())
    }

    async fn alter_column(
        &mut self,
        table: &str,
        column: &ColumnDef,
        conversion: Conversion,
    ) -> Result<(), TableError> {
        let relation = self.state.relation_mut(table)?;
        let position = relation
            .columns
            .iter()
            .position(|c| c.name == column.name)
            .ok_or_else(|| {
                TableError::StorageError(format!("column \"{}\" does not exist", column.name))
            })?;
        let from = relation.columns[position].column_type;
        relation.columns[position] = column.clone();

        for row in relation.rows.values_mut() {
            let current = row.get(&column.name).cloned().unwrap_or(JsonValue::Null);
            let converted = match conversion {
                Conversion::Keep => current,
                Conversion::Cast => cast_value(&current, from, column.column_type),
                Conversion::Clear => JsonValue::Null,
            };
            let converted = if converted.is_null() {
                match &column.default {
                    ColumnDefault::Value(value) if !column.nullable => value.clone(),
                    _ => converted,
                }
            } else {
                converted
            };
            row.insert(column.name.clone(), converted);
        }
        Ok(())
    }

    async fn drop_column(&mut self, table: &str, column: &str) -> Result<(), TableError> {
        let relation = self.state.relation_mut(table)?;
        let before = relation.columns.len();
        relation.columns.retain(|c| c.name != column);
        if relation.columns.len() == before {
            return Err(TableError::StorageError(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                column, table
            )));
        }
        for row in relation.rows.values_mut() {
            row.remove(column);
        }
        self.state
            .indexes
            .retain(|_, index| !(index.table == table && index.columns.iter().any(|c| c == column)));
        Ok(())
    }

    async fn create_sequence(&mut self, name: &str) -> Result<(), TableError> {
        if self.state.sequences.insert(name.to_string()) {
            self.created_sequences.push(name.to_string());
        }
        Ok(())
    }

    async fn drop_sequence(&mut self, name: &str) -> Result<(), TableError> {
        if self.state.sequences.remove(name) {
            self.dropped_sequences.push(name.to_string());
        }
        Ok(())
    }

    async fn create_index(&mut self, index: &IndexDef) -> Result<(), TableError> {
        let relation = self.state.relation(&index.table)?;
        for column in &index.columns {
            relation.column(column)?;
        }
        self.state
            .indexes
            .entry(index.name.clone())
            .or_insert_with(|| index.clone());
        Ok(())
    }

    async fn drop_index(&mut self, _table: &str, name: &str) -> Result<(), TableError> {
        self.state.indexes.remove(name);
        Ok(())
    }

    async fn acquire_advisory_lock(&mut self, _key: &str) -> Result<(), TableError> {
        // Transactions are already serialized by the writer gate.
        Ok(())
    }

    async fn commit(self) -> Result<(), TableError> {
        let MemoryTransaction {
            shared,
            state,
            writes,
            dropped_sequences,
            _gate,
            ..
        } = self;
        {
            let mut values = shared.sequence_values.lock();
            for name in &dropped_sequences {
                if !state.sequences.contains(name) {
                    values.remove(name);
                }
            }
        }
        *shared.committed.write() = Arc::new(state);
        shared.writes.fetch_add(writes, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<(), TableError> {
        let committed = self.shared.committed.read().clone();
        let mut values = self.shared.sequence_values.lock();
        for name in &self.created_sequences {
            if !committed.sequences.contains(name) {
                values.remove(name);
            }
        }
        Ok(())
    }
}

fn type_mismatch(column: &ColumnDef, value: &JsonValue) -> TableError {
    TableError::StorageError(format!(
        "invalid input for {} column \"{}\": {}",
        column.column_type.as_str(),
        column.name,
        value
    ))
}

fn check_type(column: &ColumnDef, value: JsonValue) -> Result<JsonValue, TableError> {
    let valid = match column.column_type {
        ColumnType::Serial | ColumnType::BigInt => value.is_i64(),
        ColumnType::Double | ColumnType::Interval => value.is_number(),
        ColumnType::Text => value.is_string(),
        ColumnType::Boolean => value.is_boolean(),
        ColumnType::Json => true,
        ColumnType::TsVector => value.is_array(),
        ColumnType::Timestamp => {
            let normalized = value
                .as_str()
                .and_then(|s| StorageDatetime::parse(s).ok())
                .map(|dt| JsonValue::String(dt.to_rfc3339()));
            return normalized.ok_or_else(|| type_mismatch(column, &value));
        }
    };
    if valid {
        Ok(value)
    } else {
        Err(type_mismatch(column, &value))
    }
}

/// Value-preserving conversion used by `Conversion::Cast`. Values without a
/// sensible counterpart become null. Intervals leave as their text, which
/// only converts back into an interval or text.
pub(crate) fn cast_value(value: &JsonValue, from: ColumnType, to: ColumnType) -> JsonValue {
    if from == ColumnType::Interval && from != to {
        return match (value.as_f64(), to) {
            (Some(seconds), ColumnType::Text | ColumnType::Json) => {
                JsonValue::String(format_interval(seconds))
            }
            _ => JsonValue::Null,
        };
    }
    match (value, to) {
        (JsonValue::Null, _) => JsonValue::Null,
        (_, ColumnType::Json) => value.clone(),
        (_, ColumnType::TsVector) => JsonValue::Null,
        (JsonValue::String(_), ColumnType::Text) => value.clone(),
        (JsonValue::Number(n), ColumnType::Text) => JsonValue::String(match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        }),
        (JsonValue::Bool(b), ColumnType::Text) => JsonValue::String(b.to_string()),
        (_, ColumnType::Text) => JsonValue::String(value.to_string()),
        (JsonValue::Number(n), ColumnType::BigInt | ColumnType::Serial) => n
            .as_i64()
            .map(JsonValue::from)
            .or_else(|| n.as_f64().map(|f| JsonValue::from(f.round() as i64)))
            .unwrap_or(JsonValue::Null),
        (JsonValue::String(s), ColumnType::BigInt | ColumnType::Serial) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| JsonValue::from(f.round() as i64))
            .unwrap_or(JsonValue::Null),
        (JsonValue::Number(_), ColumnType::Double | ColumnType::Interval) => value.clone(),
        (JsonValue::String(s), ColumnType::Double | ColumnType::Interval) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        (JsonValue::Bool(_), ColumnType::Boolean) => value.clone(),
        (JsonValue::String(s), ColumnType::Boolean) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" | "checked" => JsonValue::Bool(true),
                "f" | "false" | "n" | "no" | "off" | "0" | "" => JsonValue::Bool(false),
                _ => JsonValue::Null,
            }
        }
        (JsonValue::Number(n), ColumnType::Boolean) => {
            JsonValue::Bool(n.as_f64().is_some_and(|f| f != 0.0))
        }
        (JsonValue::String(s), ColumnType::Timestamp) => StorageDatetime::parse(s.trim())
            .map(|dt| JsonValue::String(dt.to_rfc3339()))
            .unwrap_or(JsonValue::Null),
        _ => JsonValue::Null,
    }
}

fn compare_json(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn column_value<'a>(row: &'a Row, column: &str) -> &'a JsonValue {
    row.get(column).unwrap_or(&JsonValue::Null)
}

fn compare_column(row: &Row, column: &str, value: &Value) -> Option<Ordering> {
    let current = column_value(row, column);
    let other = value.to_json();
    if current.is_null() || other.is_null() {
        return None;
    }
    compare_json(current, &other)
}

fn eval_filter(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(c, v) => compare_column(row, c, v) == Some(Ordering::Equal),
        Filter::Ne(c, v) => matches!(compare_column(row, c, v), Some(o) if o != Ordering::Equal),
        Filter::Gt(c, v) => compare_column(row, c, v) == Some(Ordering::Greater),
        Filter::Gte(c, v) => matches!(
            compare_column(row, c, v),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Filter::Lt(c, v) => compare_column(row, c, v) == Some(Ordering::Less),
        Filter::Lte(c, v) => matches!(
            compare_column(row, c, v),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Filter::In(c, v) => {
            let current = column_value(row, c);
            if current.is_null() {
                return false;
            }
            match v.to_json() {
                JsonValue::Array(items) => items
                    .iter()
                    .any(|item| compare_json(current, item) == Some(Ordering::Equal)),
                other => compare_json(current, &other) == Some(Ordering::Equal),
            }
        }
        Filter::IsNull(c) => column_value(row, c).is_null(),
        Filter::IsNotNull(c) => !column_value(row, c).is_null(),
        Filter::Matches(c, text) => {
            let terms = to_tsvector(text);
            let JsonValue::Array(tokens) = column_value(row, c) else {
                return false;
            };
            !terms.is_empty()
                && terms
                    .iter()
                    .all(|term| tokens.iter().any(|t| t.as_str() == Some(term.as_str())))
        }
        Filter::Any(filters) => filters.iter().any(|f| eval_filter(row, f)),
    }
}

fn compare_rows(a: &Row, b: &Row, order_by: &[(String, Order)]) -> Ordering {
    for (column, order) in order_by {
        let (x, y) = (column_value(a, column), column_value(b, column));
        // Nulls sort last ascending and first descending.
        let ordering = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare_json(x, y).unwrap_or(Ordering::Equal),
        };
        let ordering = match order {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Vec<ColumnDef> {
        vec![
            ColumnDef::primary_key("id"),
            ColumnDef::new("name", ColumnType::Text),
            ColumnDef::new("age", ColumnType::BigInt),
        ]
    }

    async fn store_with_people() -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        tx.create_table("people", &people()).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_to_pool_reads() {
        let mut store = store_with_people().await;
        let mut tx = store.begin_transaction().await.unwrap();
        tx.insert("people", &[("name".to_string(), Value::from("Ada"))])
            .await
            .unwrap();

        let visible = store.fetch(&Query::for_table("people")).await.unwrap();
        assert!(visible.is_empty());

        tx.rollback().await.unwrap();
        assert_eq!(store.count(&Query::for_table("people")).await.unwrap(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn sequence_values_are_not_reused_after_rollback() {
        let store = store_with_people().await;
        let mut tx = store.begin_transaction().await.unwrap();
        tx.create_sequence("people_number_seq").await.unwrap();
        tx.add_column(
            "people",
            &ColumnDef::new("number", ColumnType::BigInt).sequence("people_number_seq"),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        let first = tx.insert("people", &[]).await.unwrap();
        assert_eq!(first["number"], json!(1));
        tx.rollback().await.unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        let second = tx.insert("people", &[]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(second["number"], json!(2));
    }

    #[tokio::test]
    async fn filters_ordering_and_limits() {
        let mut store = store_with_people().await;
        for (name, age) in [("Ada", Some(36)), ("Grace", Some(85)), ("Linus", None)] {
            let age = age.map(Value::Int).unwrap_or(Value::Null(ColumnType::BigInt));
            store
                .insert(
                    "people",
                    &[("name".to_string(), Value::from(name)), ("age".to_string(), age)],
                )
                .await
                .unwrap();
        }

        let rows = store
            .fetch(&Query::for_table("people").order_by("age", Order::Desc).limit(2))
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], json!("Linus"));
        assert_eq!(rows[1]["name"], json!("Grace"));

        let older = store
            .count(&Query::for_table("people").gt("age", 40i64))
            .await
            .unwrap();
        assert_eq!(older, 1);

        let err = store
            .fetch(&Query::for_table("people").eq("missing", 1i64))
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::StorageError(_)));
    }

    #[tokio::test]
    async fn cast_conversion_keeps_parsable_values() {
        let mut store = store_with_people().await;
        store
            .insert("people", &[("name".to_string(), Value::from("42"))])
            .await
            .unwrap();
        store
            .insert("people", &[("name".to_string(), Value::from("forty"))])
            .await
            .unwrap();

        let mut tx = store.begin_transaction().await.unwrap();
        tx.alter_column(
            "people",
            &ColumnDef::new("name", ColumnType::Double),
            Conversion::Cast,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let rows = store
            .fetch(&Query::for_table("people").order_by("id", Order::Asc))
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], json!(42.0));
        assert_eq!(rows[1]["name"], JsonValue::Null);
    }

    #[test]
    fn intervals_cast_through_their_text() {
        assert_eq!(
            cast_value(&json!(93_784), ColumnType::Interval, ColumnType::Text),
            json!("26:03:04")
        );
        assert_eq!(
            cast_value(&json!(-1.5), ColumnType::Interval, ColumnType::Text),
            json!("-00:00:01.5")
        );
        assert_eq!(
            cast_value(&json!(60), ColumnType::Interval, ColumnType::Double),
            JsonValue::Null
        );
        assert_eq!(
            cast_value(&json!(60), ColumnType::Interval, ColumnType::Interval),
            json!(60)
        );
        assert_eq!(
            cast_value(&json!(60), ColumnType::Double, ColumnType::Text),
            json!("60")
        );
    }

    #[tokio::test]
    async fn matches_requires_every_term() {
        let store = MemoryStore::new();
        let mut tx = store.begin_transaction().await.unwrap();
        tx.create_table(
            "docs",
            &[
                ColumnDef::primary_key("id"),
                ColumnDef::new("tsv", ColumnType::TsVector),
            ],
        )
        .await
        .unwrap();
        tx.insert(
            "docs",
            &[("tsv".to_string(), Value::SearchVector("quick brown fox".to_string()))],
        )
        .await
        .unwrap();

        let hit = Query::for_table("docs").filter(Filter::Matches("tsv".into(), "Fox quick".into()));
        let miss = Query::for_table("docs").filter(Filter::Matches("tsv".into(), "fox dog".into()));
        assert_eq!(tx.count(&hit).await.unwrap(), 1);
        assert_eq!(tx.count(&miss).await.unwrap(), 0);
    }
}
