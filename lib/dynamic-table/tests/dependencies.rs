mod common;

use common::{engine, table, value, values};
use dynamic_table::dependency::CYCLE_ERROR;
use dynamic_table::field_types::{FORMULA, TEXT};
use dynamic_table::{FieldRecord, FieldUpdate, NewField, TableError};
use serde_json::json;

fn formula(name: &str, source: &str) -> NewField {
    NewField::new(name, FORMULA).with_options(json!({ "formula": source }))
}

async fn reload(engine: &common::Engine, field: &FieldRecord) -> FieldRecord {
    engine.field(field.id).await.unwrap()
}

#[tokio::test]
async fn cycles_are_flagged_and_cleared_once_broken() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Graph").await;

    let a = engine.create_field(table.id, formula("A", "field('B')")).await.unwrap();
    assert!(a.error.as_deref().is_some_and(|e| e.contains("\"B\"")));
    let b = engine
        .create_field(table.id, formula("B", "concat(field('A'), 'x')"))
        .await
        .unwrap();
    let c = engine
        .create_field(table.id, formula("C", "concat(field('Name'), '!')"))
        .await
        .unwrap();

    assert_eq!(reload(&engine, &a).await.error.as_deref(), Some(CYCLE_ERROR));
    assert_eq!(b.error.as_deref(), Some(CYCLE_ERROR));
    assert_eq!(c.error, None);

    assert_eq!(engine.field_update_order(primary.id).await.unwrap(), vec![c.id]);
    let err = engine.field_update_order(a.id).await.unwrap_err();
    assert!(matches!(err, TableError::CyclicDependency(_)));

    // Rows still compute the healthy formulas.
    let row = engine
        .create_row(table.id, &values(&[(&primary, json!("n"))]))
        .await
        .unwrap();
    assert_eq!(value(&row, &c), &json!("n!"));

    let b = engine
        .update_field(b.id, FieldUpdate::options(json!({"formula": "concat(field('Name'), 'x')"})))
        .await
        .unwrap();
    assert_eq!(b.error, None);
    assert_eq!(reload(&engine, &a).await.error, None);

    let row = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&row, &b), &json!("nx"));
    assert_eq!(value(&row, &a), &json!("nx"));

    let order = engine.field_update_order(primary.id).await.unwrap();
    let position = |id| order.iter().position(|f| *f == id).unwrap();
    assert_eq!(order.len(), 3);
    assert!(position(b.id) < position(a.id));
}

#[tokio::test]
async fn edits_propagate_through_chains() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Chain").await;
    let loud = engine
        .create_field(table.id, formula("Loud", "upper(field('Name'))"))
        .await
        .unwrap();
    let louder = engine
        .create_field(table.id, formula("Louder", "concat(field('Loud'), '!!')"))
        .await
        .unwrap();

    let row = engine
        .create_row(table.id, &values(&[(&primary, json!("hey"))]))
        .await
        .unwrap();
    assert_eq!(value(&row, &louder), &json!("HEY!!"));

    let row = engine
        .update_row(table.id, row.id, &values(&[(&primary, json!("you"))]))
        .await
        .unwrap();
    assert_eq!(value(&row, &loud), &json!("YOU"));
    assert_eq!(value(&row, &louder), &json!("YOU!!"));

    // Changing a formula recomputes what reads it.
    engine
        .update_field(loud.id, FieldUpdate::options(json!({"formula": "lower(field('Name'))"})))
        .await
        .unwrap();
    let row = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&row, &louder), &json!("you!!"));
}

#[tokio::test]
async fn renaming_a_field_rewrites_formulas_reading_it() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Renames").await;
    let greeting = engine
        .create_field(table.id, formula("Greeting", "concat(field('Name'), '!')"))
        .await
        .unwrap();

    engine
        .update_field(primary.id, FieldUpdate::rename("Title"))
        .await
        .unwrap();
    let greeting = reload(&engine, &greeting).await;
    assert_eq!(greeting.option_str("formula"), Some("concat(field('Title'), '!')"));
    assert_eq!(greeting.error, None);

    let row = engine
        .create_row(table.id, &values(&[(&primary, json!("Ada"))]))
        .await
        .unwrap();
    assert_eq!(value(&row, &greeting), &json!("Ada!"));
}

#[tokio::test]
async fn trashing_a_dependency_breaks_and_restoring_repairs() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Notes").await;
    let notes = engine
        .create_field(table.id, NewField::new("Notes", TEXT))
        .await
        .unwrap();
    let shout = engine
        .create_field(table.id, formula("Shout", "upper(field('Notes'))"))
        .await
        .unwrap();
    let row = engine
        .create_row(table.id, &values(&[(&notes, json!("quiet"))]))
        .await
        .unwrap();
    assert_eq!(value(&row, &shout), &json!("QUIET"));

    engine.trash_field(notes.id).await.unwrap();
    let broken = reload(&engine, &shout).await;
    assert!(broken.error.as_deref().is_some_and(|e| e.contains("\"Notes\"")));

    engine.restore_field(notes.id).await.unwrap();
    assert_eq!(reload(&engine, &shout).await.error, None);
    let row = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&row, &shout), &json!("QUIET"));
}

#[tokio::test]
async fn a_new_field_repairs_formulas_waiting_for_its_name() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Later").await;
    let total = engine
        .create_field(table.id, formula("Total", "totext(field('Amount'))"))
        .await
        .unwrap();
    assert!(total.error.is_some());

    engine
        .create_field(table.id, NewField::new("Amount", TEXT))
        .await
        .unwrap();
    assert_eq!(reload(&engine, &total).await.error, None);
}
