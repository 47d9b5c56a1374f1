#![allow(dead_code)]

use dynamic_table::{
    EngineConfig, FieldRecord, FieldTypeRegistry, MemoryStore, RowData, TableEngine, TableRecord,
};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub type Engine = TableEngine<MemoryStore>;

pub async fn engine() -> Engine {
    engine_with(EngineConfig::default()).await
}

pub async fn engine_with(config: EngineConfig) -> Engine {
    engine_on(MemoryStore::new(), config).await
}

pub async fn engine_on(store: MemoryStore, config: EngineConfig) -> Engine {
    let engine = TableEngine::new(store, FieldTypeRegistry::with_builtin_types(), config);
    engine.install().await.unwrap();
    engine
}

/// A workspace with one table holding the default primary field.
pub async fn table(engine: &Engine, name: &str) -> (TableRecord, FieldRecord) {
    let workspace = engine.create_workspace("Acme").await.unwrap();
    let table = engine.create_table(workspace.id, name).await.unwrap();
    let primary = engine.fields(table.id).await.unwrap().remove(0);
    (table, primary)
}

pub fn attr(field: &FieldRecord) -> String {
    format!("field_{}", field.id)
}

pub fn values(pairs: &[(&FieldRecord, JsonValue)]) -> JsonMap<String, JsonValue> {
    pairs
        .iter()
        .map(|(field, value)| (attr(field), value.clone()))
        .collect()
}

pub fn value<'a>(row: &'a RowData, field: &FieldRecord) -> &'a JsonValue {
    row.get(&attr(field)).unwrap_or(&JsonValue::Null)
}

/// The `value` labels of a rendered select or link list.
pub fn labels(row: &RowData, field: &FieldRecord) -> Vec<String> {
    value(row, field)
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("value")?.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
