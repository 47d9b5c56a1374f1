mod common;

use std::collections::BTreeSet;

use common::{attr, engine, labels, table, value, values};
use dynamic_table::field_types::{
    AUTONUMBER, DURATION, FORMULA, LINK_ROW, MULTIPLE_SELECT, SINGLE_SELECT, TEXT,
};
use dynamic_table::{
    Executor, FieldUpdate, ModelOptions, NewField, Query, QueryExecutor, RowQuery, TableError, TransactionExecutor,
};
use serde_json::{Map as JsonMap, Value as JsonValue, json};

#[tokio::test]
async fn multiple_select_keeps_link_order_in_direct_and_batch_reads() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Articles").await;
    // C is created first so it has the lowest id.
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
    assert!(c < a && c < b);

    let first = engine
        .create_row(table.id, &values(&[(&primary, json!("one")), (&tags, json!([a, b, c]))]))
        .await
        .unwrap();
    assert_eq!(labels(&first, &tags), vec!["A", "B", "C"]);
    let second = engine
        .create_row(table.id, &values(&[(&primary, json!("two")), (&tags, json!([c, a]))]))
        .await
        .unwrap();

    let direct = engine.get_row(table.id, first.id).await.unwrap().unwrap();
    assert_eq!(labels(&direct, &tags), vec!["A", "B", "C"]);

    let batch = engine.list_rows(table.id, &RowQuery::new()).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(labels(&batch[0], &tags), vec!["A", "B", "C"]);
    assert_eq!(labels(&batch[1], &tags), vec!["C", "A"]);

    // Links that survive a rewrite keep their place; new links go last.
    let updated = engine
        .update_row(table.id, second.id, &values(&[(&tags, json!([b, c]))]))
        .await
        .unwrap();
    assert_eq!(labels(&updated, &tags), vec!["C", "B"]);

    let resaved = engine
        .update_row(table.id, second.id, &values(&[(&tags, json!([b, c, b]))]))
        .await
        .unwrap();
    assert_eq!(labels(&resaved, &tags), vec!["C", "B"]);
    let batch = engine.list_rows(table.id, &RowQuery::new()).await.unwrap();
    assert_eq!(labels(&batch[1], &tags), vec!["C", "B"]);

    let emptied = engine
        .update_row(table.id, second.id, &values(&[(&tags, json!([]))]))
        .await
        .unwrap();
    assert!(labels(&emptied, &tags).is_empty());
}

#[tokio::test]
async fn deleted_single_select_option_reads_as_empty_and_is_repaired() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Tickets").await;
    let status = engine
        .create_field(
            table.id,
            NewField::new("Status", SINGLE_SELECT)
                .with_select_option("Open", "blue")
                .with_select_option("Done", "green"),
        )
        .await
        .unwrap();
    let open = engine.select_options(status.id).await.unwrap().remove(0);

    let row = engine
        .create_row(table.id, &values(&[(&status, json!(open.id))]))
        .await
        .unwrap();
    assert_eq!(value(&row, &status)["value"], json!("Open"));

    engine.delete_select_option(open.id).await.unwrap();

    let writes = engine.store().write_count();
    let first = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&first, &status), &JsonValue::Null);
    assert_eq!(engine.store().write_count(), writes + 1);

    let mut store = engine.store().clone();
    let stored = store
        .fetch(&Query::for_table(table.relation_name()).eq("id", row.id))
        .await
        .unwrap();
    assert_eq!(stored[0].get(&status.db_column()), Some(&JsonValue::Null));

    let second = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&second, &status), &JsonValue::Null);
    assert_eq!(engine.store().write_count(), writes + 1);
}

#[tokio::test]
async fn writing_an_unknown_option_fails() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Tickets").await;
    let status = engine
        .create_field(table.id, NewField::new("Status", SINGLE_SELECT))
        .await
        .unwrap();
    let err = engine
        .create_row(table.id, &values(&[(&status, json!(999))]))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::SelectOptionNotFound(999)));
    assert!(engine.list_rows(table.id, &RowQuery::new()).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn autonumber_values_are_never_reused_after_rollback() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Orders").await;
    let number = engine
        .create_field(table.id, NewField::new("No", AUTONUMBER))
        .await
        .unwrap();
    let key = attr(&number);

    let handles: Vec<_> = (0..10)
        .map(|attempt| {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let mut tx = engine.store().begin_transaction().await.unwrap();
                let model = engine
                    .cache()
                    .get_model(&mut tx, table.id, &ModelOptions::default())
                    .await
                    .unwrap();
                let row = model.insert_row(&mut tx, &JsonMap::new()).await.unwrap();
                let drawn = row.get(&key).and_then(JsonValue::as_i64).unwrap();
                let keep = attempt % 3 != 0;
                if keep {
                    tx.commit().await.unwrap();
                } else {
                    tx.rollback().await.unwrap();
                }
                (drawn, keep)
            })
        })
        .collect();

    let mut committed = BTreeSet::new();
    let mut rolled_back = BTreeSet::new();
    for handle in handles {
        let (drawn, keep) = handle.await.unwrap();
        let fresh = if keep {
            committed.insert(drawn)
        } else {
            rolled_back.insert(drawn)
        };
        assert!(fresh, "value {} drawn twice", drawn);
    }
    assert_eq!(committed.len(), 6);
    assert_eq!(rolled_back.len(), 4);
    assert!(committed.is_disjoint(&rolled_back));

    let rows = engine.list_rows(table.id, &RowQuery::new()).await.unwrap();
    let stored: BTreeSet<i64> = rows
        .iter()
        .filter_map(|r| r.get(&key).and_then(JsonValue::as_i64))
        .collect();
    assert_eq!(stored, committed);
}

#[tokio::test]
async fn lookups_follow_changes_in_the_linked_table() {
    let engine = engine().await;
    let workspace = engine.create_workspace("Acme").await.unwrap();
    let projects = engine.create_table(workspace.id, "Projects").await.unwrap();
    let project_name = engine.fields(projects.id).await.unwrap().remove(0);
    let tasks = engine
        .create_table_with_fields(
            workspace.id,
            "Tasks",
            vec![NewField::new("Title", TEXT)],
        )
        .await
        .unwrap();
    let link = engine
        .create_field(
            tasks.id,
            NewField::new("Project", LINK_ROW).with_options(json!({"link_table_id": projects.id})),
        )
        .await
        .unwrap();
    let summary = engine
        .create_field(
            tasks.id,
            NewField::new("Summary", FORMULA)
                .with_options(json!({"formula": "join(lookup('Project', 'Name'), ', ')"})),
        )
        .await
        .unwrap();
    assert_eq!(summary.error, None);

    let apollo = engine
        .create_row(projects.id, &values(&[(&project_name, json!("Apollo"))]))
        .await
        .unwrap();
    let task = engine
        .create_row(tasks.id, &values(&[(&link, json!([apollo.id]))]))
        .await
        .unwrap();
    assert_eq!(labels(&task, &link), vec!["Apollo"]);
    assert_eq!(value(&task, &summary), &json!("Apollo"));

    engine
        .update_row(projects.id, apollo.id, &values(&[(&project_name, json!("Artemis"))]))
        .await
        .unwrap();
    let task = engine.get_row(tasks.id, task.id).await.unwrap().unwrap();
    assert_eq!(labels(&task, &link), vec!["Artemis"]);
    assert_eq!(value(&task, &summary), &json!("Artemis"));

    // Deleting the project removes the link and empties the lookup.
    engine.delete_row(projects.id, apollo.id).await.unwrap();
    let task = engine.get_row(tasks.id, task.id).await.unwrap().unwrap();
    assert!(labels(&task, &link).is_empty());
    assert_eq!(value(&task, &summary), &json!(""));
}

#[tokio::test]
async fn duration_text_is_the_same_everywhere_it_is_read() {
    let engine = engine().await;
    let workspace = engine.create_workspace("Acme").await.unwrap();
    let projects = engine.create_table(workspace.id, "Projects").await.unwrap();
    let length = engine
        .create_field(projects.id, NewField::new("Length", DURATION))
        .await
        .unwrap();
    let tasks = engine
        .create_table_with_fields(workspace.id, "Tasks", vec![NewField::new("Title", TEXT)])
        .await
        .unwrap();
    let link = engine
        .create_field(
            tasks.id,
            NewField::new("Project", LINK_ROW).with_options(json!({"link_table_id": projects.id})),
        )
        .await
        .unwrap();
    let looked_up = engine
        .create_field(
            tasks.id,
            NewField::new("Project length", FORMULA)
                .with_options(json!({"formula": "join(lookup('Project', 'Length'), ', ')"})),
        )
        .await
        .unwrap();

    let long = engine
        .create_row(projects.id, &values(&[(&length, json!(93_784))]))
        .await
        .unwrap();
    let short = engine
        .create_row(projects.id, &values(&[(&length, json!("-0:00:01"))]))
        .await
        .unwrap();
    let task = engine
        .create_row(tasks.id, &values(&[(&link, json!([long.id]))]))
        .await
        .unwrap();

    // PostgreSQL prints seconds-built intervals without a day part.
    let direct = engine.get_row(projects.id, long.id).await.unwrap().unwrap();
    assert_eq!(value(&direct, &length), &json!("26:03:04"));
    let task = engine.get_row(tasks.id, task.id).await.unwrap().unwrap();
    assert_eq!(value(&task, &looked_up), &json!("26:03:04"));

    engine
        .update_field(length.id, FieldUpdate::change_type(TEXT, json!({})))
        .await
        .unwrap();
    let converted = engine.get_row(projects.id, long.id).await.unwrap().unwrap();
    assert_eq!(value(&converted, &length), &json!("26:03:04"));
    let converted = engine.get_row(projects.id, short.id).await.unwrap().unwrap();
    assert_eq!(value(&converted, &length), &json!("-00:00:01"));
}

#[tokio::test]
async fn read_only_fields_reject_writes() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Orders").await;
    let total = engine
        .create_field(
            table.id,
            NewField::new("Total", FORMULA).with_options(json!({"formula": "1 + 1"})),
        )
        .await
        .unwrap();
    let err = engine
        .create_row(table.id, &values(&[(&total, json!(3))]))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::InvalidValue { .. }));

    let row = engine.create_row(table.id, &JsonMap::new()).await.unwrap();
    assert_eq!(value(&row, &total), &json!(2));
}
