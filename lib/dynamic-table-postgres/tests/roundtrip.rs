//! Round trips through a live PostgreSQL server. Ignored by default; run with
//! `DATABASE_URL=postgres://... cargo test -p dynamic-table-postgres -- --ignored`
//! against a throwaway database.

use dynamic_table::admin;
use dynamic_table::field_types::{DURATION, MULTIPLE_SELECT, TEXT};
use dynamic_table::{
    EngineConfig, FieldRecord, FieldTypeRegistry, FieldUpdate, NewField, RowData, TableEngine,
    TableRecord,
};
use dynamic_table_postgres::PgPool;
use serde_json::{Map as JsonMap, Value as JsonValue, json};

/// An engine on `DATABASE_URL`, or `None` when it is unset.
async fn engine() -> Option<TableEngine<PgPool>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let store = PgPool::connect(&url).await.unwrap();
    let engine = TableEngine::new(
        store,
        FieldTypeRegistry::with_builtin_types(),
        EngineConfig::default(),
    );
    engine.install().await.unwrap();
    Some(engine)
}

async fn table(engine: &TableEngine<PgPool>, name: &str) -> (TableRecord, FieldRecord) {
    let workspace = engine.create_workspace("Round trip").await.unwrap();
    let table = engine.create_table(workspace.id, name).await.unwrap();
    let primary = engine.fields(table.id).await.unwrap().remove(0);
    (table, primary)
}

fn values(pairs: &[(&FieldRecord, JsonValue)]) -> JsonMap<String, JsonValue> {
    pairs
        .iter()
        .map(|(field, value)| (format!("field_{}", field.id), value.clone()))
        .collect()
}

fn value<'a>(row: &'a RowData, field: &FieldRecord) -> &'a JsonValue {
    row.get(&format!("field_{}", field.id)).unwrap_or(&JsonValue::Null)
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn duration_text_matches_the_servers_interval_text() {
    let Some(engine) = engine().await else {
        return;
    };
    let (table, _) = table(&engine, "Durations").await;
    let length = engine
        .create_field(table.id, NewField::new("Length", DURATION))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for seconds in [json!(93_784), json!(-1), json!(3.5)] {
        let row = engine
            .create_row(table.id, &values(&[(&length, seconds)]))
            .await
            .unwrap();
        ids.push(row.id);
    }
    let expected = ["26:03:04", "-00:00:01", "00:00:03.5"];
    for (id, text) in ids.iter().zip(expected) {
        let row = engine.get_row(table.id, *id).await.unwrap().unwrap();
        assert_eq!(value(&row, &length), &json!(text));
    }

    // The server's own interval-to-text cast produces the same strings.
    engine
        .update_field(length.id, FieldUpdate::change_type(TEXT, json!({})))
        .await
        .unwrap();
    for (id, text) in ids.iter().zip(expected) {
        let row = engine.get_row(table.id, *id).await.unwrap().unwrap();
        assert_eq!(value(&row, &length), &json!(text));
    }
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn surviving_links_keep_their_position() {
    let Some(engine) = engine().await else {
        return;
    };
    let (table, _) = table(&engine, "Tagged").await;
    let tags = engine
        .create_field(
            table.id,
            NewField::new("Tags", MULTIPLE_SELECT)
                .with_select_option("C", "red")
                .with_select_option("A", "blue")
                .with_select_option("B", "green"),
        )
        .await
        .unwrap();
    let options = engine.select_options(tags.id).await.unwrap();
    let id_of = |name: &str| options.iter().find(|o| o.value == name).unwrap().id;
    let (a, b, c) = (id_of("A"), id_of("B"), id_of("C"));

    let row = engine
        .create_row(table.id, &values(&[(&tags, json!([c, a]))]))
        .await
        .unwrap();
    let row = engine
        .update_row(table.id, row.id, &values(&[(&tags, json!([b, c]))]))
        .await
        .unwrap();
    let labels: Vec<&str> = value(&row, &tags)
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|item| item.get("value")?.as_str())
        .collect();
    assert_eq!(labels, vec!["C", "B"]);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn clearing_the_model_cache_bumps_every_schema_version() {
    let Some(engine) = engine().await else {
        return;
    };
    let (table, _) = table(&engine, "Cached").await;
    let before = engine.model(table.id).await.unwrap();

    let output = admin::clear_model_cache(&engine).await.unwrap();
    assert!(output.is_success());

    let after = engine.model(table.id).await.unwrap();
    assert!(after.schema_version() > before.schema_version());
}
