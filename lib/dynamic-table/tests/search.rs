mod common;

use common::{engine, engine_on, engine_with, table, values};
use dynamic_table::field_types::{BOOLEAN, NUMBER, TEXT};
use dynamic_table::scheduler::{self, Job, JobQueue, RecomputeFormulas};
use dynamic_table::search::{NEEDS_BACKGROUND_UPDATE_COLUMN, tsvector_column};
use dynamic_table::{
    EngineConfig, Executor, FieldUpdate, MemoryStore, NewField, Query, QueryExecutor, TableError,
    TransactionExecutor,
};
use serde_json::json;

#[tokio::test]
async fn incremental_update_converges_and_then_writes_nothing() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Notes").await;
    assert!(primary.tsvector_column_created);
    for text in ["Hello world", "Goodbye world", "Something else"] {
        engine
            .create_row(table.id, &values(&[(&primary, json!(text))]))
            .await
            .unwrap();
    }

    let search = engine.search();
    let written = search
        .update_columns(engine.store(), engine.cache(), table.id, true)
        .await
        .unwrap();
    assert_eq!(written, 3);

    let writes = engine.store().write_count();
    let again = search
        .update_columns(engine.store(), engine.cache(), table.id, true)
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(engine.store().write_count(), writes);

    let found = engine.search_rows(table.id, "WORLD", None).await.unwrap();
    assert_eq!(found.len(), 2);
    let found = engine.search_rows(table.id, "goodbye world", None).await.unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn only_rows_written_since_the_last_run_are_revisited() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Notes").await;
    let mut ids = Vec::new();
    for text in ["alpha", "beta", "gamma"] {
        let row = engine
            .create_row(table.id, &values(&[(&primary, json!(text))]))
            .await
            .unwrap();
        ids.push(row.id);
    }
    let search = engine.search();
    search
        .update_columns(engine.store(), engine.cache(), table.id, true)
        .await
        .unwrap();

    engine
        .update_row(table.id, ids[1], &values(&[(&primary, json!("delta"))]))
        .await
        .unwrap();
    let written = search
        .update_columns(engine.store(), engine.cache(), table.id, true)
        .await
        .unwrap();
    assert_eq!(written, 1);

    assert!(engine.search_rows(table.id, "beta", None).await.unwrap().is_empty());
    let found = engine.search_rows(table.id, "delta", None).await.unwrap();
    assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[1]]);

    // A full pass rewrites everything.
    let full = search
        .update_columns(engine.store(), engine.cache(), table.id, false)
        .await
        .unwrap();
    assert_eq!(full, 3);
}

#[tokio::test]
async fn batches_resume_across_transactions() {
    let engine = engine_with(EngineConfig {
        tsvector_update_batch_size: 2,
        ..EngineConfig::default()
    })
    .await;
    let (table, primary) = table(&engine, "Notes").await;
    for n in 0..5 {
        engine
            .create_row(table.id, &values(&[(&primary, json!(format!("note {}", n)))]))
            .await
            .unwrap();
    }
    let written = engine
        .search()
        .update_columns(engine.store(), engine.cache(), table.id, true)
        .await
        .unwrap();
    assert_eq!(written, 5);

    let mut store = engine.store().clone();
    let pending = store
        .count(&Query::for_table(table.relation_name()).eq(NEEDS_BACKGROUND_UPDATE_COLUMN, true))
        .await
        .unwrap();
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn setup_job_adds_columns_to_tables_created_without_search() {
    let store = MemoryStore::new();
    let without = engine_on(
        store.clone(),
        EngineConfig {
            use_pg_fulltext_search: false,
            ..EngineConfig::default()
        },
    )
    .await;
    let (table, primary) = table(&without, "Legacy").await;
    let amount = without
        .create_field(table.id, NewField::new("Amount", NUMBER))
        .await
        .unwrap();
    assert!(!primary.tsvector_column_created);
    without
        .create_row(table.id, &values(&[(&primary, json!("old text")), (&amount, json!(12))]))
        .await
        .unwrap();

    let err = without.search_rows(table.id, "old", None).await.unwrap_err();
    assert!(matches!(err, TableError::SearchDisabled));
    // Disabled search is a no-op for the setup job.
    assert_eq!(
        scheduler::setup_new_background_update_and_search_columns(&without, table.id)
            .await
            .unwrap(),
        0
    );

    let with = engine_on(store, EngineConfig::default()).await;
    let written = scheduler::setup_new_background_update_and_search_columns(&with, table.id)
        .await
        .unwrap();
    assert_eq!(written, 1);

    let fields = with.fields(table.id).await.unwrap();
    assert!(fields.iter().all(|f| f.tsvector_column_created));
    let found = with.search_rows(table.id, "old", None).await.unwrap();
    assert_eq!(found.len(), 1);
    let found = with.search_rows(table.id, "12", None).await.unwrap();
    assert_eq!(found.len(), 1);

    // Running it again changes nothing.
    let writes = with.store().write_count();
    assert_eq!(
        scheduler::setup_new_background_update_and_search_columns(&with, table.id)
            .await
            .unwrap(),
        0
    );
    assert_eq!(with.store().write_count(), writes);
}

#[tokio::test]
async fn row_writes_queue_a_search_update() {
    let (queue, mut receiver) = JobQueue::channel();
    let engine = engine().await.with_jobs(queue);
    let (table, primary) = table(&engine, "Notes").await;

    engine
        .create_row(table.id, &values(&[(&primary, json!("queued text"))]))
        .await
        .unwrap();
    let job = receiver.try_recv().unwrap();
    assert_eq!(
        job,
        Job::UpdateSearchColumns {
            table_id: table.id,
            changed_rows_only: true
        }
    );

    scheduler::run_job(&engine, &RecomputeFormulas, job).await.unwrap();
    assert_eq!(engine.search_rows(table.id, "queued", None).await.unwrap().len(), 1);
}

async fn column_names(engine: &common::Engine, table: &dynamic_table::TableRecord) -> Vec<String> {
    let mut tx = engine.store().begin_transaction().await.unwrap();
    let columns = tx.columns(&table.relation_name()).await.unwrap();
    tx.rollback().await.unwrap();
    columns.into_iter().map(|c| c.name).collect()
}

#[tokio::test]
async fn changing_a_field_type_drops_or_rebuilds_its_search_column() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Notes").await;
    let notes = engine
        .create_field(table.id, NewField::new("Notes", TEXT))
        .await
        .unwrap();
    assert!(notes.tsvector_column_created);
    let column = tsvector_column(notes.id);
    assert!(column_names(&engine, &table).await.contains(&column));

    let flag = engine
        .update_field(notes.id, FieldUpdate::change_type(BOOLEAN, json!({})))
        .await
        .unwrap();
    assert!(!flag.tsvector_column_created);
    assert!(!column_names(&engine, &table).await.contains(&column));

    let text = engine
        .update_field(notes.id, FieldUpdate::change_type(TEXT, json!({})))
        .await
        .unwrap();
    assert!(text.tsvector_column_created);
    assert!(column_names(&engine, &table).await.contains(&column));
}
