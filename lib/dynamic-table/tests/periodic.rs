mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{engine, table, value};
use dynamic_table::field_types::FORMULA;
use dynamic_table::scheduler::{self, Job, JobQueue, PeriodicFieldUpdate, RecomputeFormulas, WorkerPool};
use dynamic_table::{
    Executor, FieldId, FieldRecord, FieldTypeRegistry, NewField, StorageDatetime, TableError, Update,
    WorkspaceRecord, catalog,
};
use serde_json::{Map as JsonMap, json};

/// Fails on one field and recomputes the others.
struct FailOn(FieldId);

#[async_trait]
impl PeriodicFieldUpdate for FailOn {
    async fn update_field(
        &self,
        exec: &mut dyn Executor,
        registry: &FieldTypeRegistry,
        field: &FieldRecord,
        now: &StorageDatetime,
    ) -> Result<u64, TableError> {
        if field.id == self.0 {
            return Err(TableError::StorageError("connection reset".to_string()));
        }
        RecomputeFormulas.update_field(exec, registry, field, now).await
    }
}

async fn now_field(engine: &common::Engine, table_id: i64, name: &str) -> FieldRecord {
    let field = engine
        .create_field(
            table_id,
            NewField::new(name, FORMULA).with_options(json!({"formula": "now()"})),
        )
        .await
        .unwrap();
    assert!(field.needs_periodic_update);
    field
}

#[tokio::test]
async fn one_failing_field_does_not_stop_the_others() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Clock").await;
    let first = now_field(&engine, table.id, "First").await;
    let second = now_field(&engine, table.id, "Second").await;
    let third = now_field(&engine, table.id, "Third").await;
    let row = engine.create_row(table.id, &JsonMap::new()).await.unwrap();
    let created = value(&row, &second).clone();

    let reference = StorageDatetime::parse("2024-01-02T03:04:05Z").unwrap();
    let mut store = engine.store().clone();
    store
        .update(
            &Update::of::<WorkspaceRecord>()
                .set("now", &reference)
                .eq("id", table.workspace_id),
        )
        .await
        .unwrap();

    let report =
        scheduler::run_periodic_fields_updates(&engine, &FailOn(second.id), None, false)
            .await
            .unwrap();
    assert_eq!(report.updated, vec![first.id, third.id]);
    assert_eq!(report.failed, vec![second.id]);

    let row = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&row, &first), &json!(reference.to_rfc3339()));
    assert_eq!(value(&row, &third), &json!(reference.to_rfc3339()));
    assert_eq!(value(&row, &second), &created);
}

#[tokio::test]
async fn update_now_stamps_the_workspace_clock() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Clock").await;
    let clock = now_field(&engine, table.id, "Clock").await;
    let row = engine.create_row(table.id, &JsonMap::new()).await.unwrap();

    let report = scheduler::run_periodic_fields_updates(&engine, &RecomputeFormulas, None, true)
        .await
        .unwrap();
    assert_eq!(report.updated, vec![clock.id]);

    let mut store = engine.store().clone();
    let workspace = catalog::workspace(&mut store, table.workspace_id).await.unwrap();
    let stamped = workspace.now.unwrap();
    let row = engine.get_row(table.id, row.id).await.unwrap().unwrap();
    assert_eq!(value(&row, &clock), &json!(stamped.to_rfc3339()));
}

#[tokio::test]
async fn other_workspaces_and_trashed_tables_are_left_alone() {
    let engine = engine().await;
    let (kept, _) = table(&engine, "Kept").await;
    let kept_clock = now_field(&engine, kept.id, "Clock").await;
    let (other, _) = table(&engine, "Other").await;
    now_field(&engine, other.id, "Clock").await;
    let (trashed, _) = table(&engine, "Trashed").await;
    now_field(&engine, trashed.id, "Clock").await;
    engine.trash_table(trashed.id).await.unwrap();

    let report = scheduler::run_periodic_fields_updates(
        &engine,
        &RecomputeFormulas,
        Some(kept.workspace_id),
        true,
    )
    .await
    .unwrap();
    assert_eq!(report.updated, vec![kept_clock.id]);
    assert!(report.failed.is_empty());

    let report = scheduler::run_periodic_fields_updates(&engine, &RecomputeFormulas, None, true)
        .await
        .unwrap();
    assert_eq!(report.updated.len(), 2);
}

#[tokio::test]
async fn plain_formulas_are_not_refreshed() {
    let engine = engine().await;
    let (table, _) = table(&engine, "Static").await;
    let field = engine
        .create_field(
            table.id,
            NewField::new("Two", FORMULA).with_options(json!({"formula": "1 + 1"})),
        )
        .await
        .unwrap();
    assert!(!field.needs_periodic_update);

    let report = scheduler::run_periodic_fields_updates(&engine, &RecomputeFormulas, None, true)
        .await
        .unwrap();
    assert!(report.updated.is_empty());
}

#[tokio::test]
async fn worker_pool_drains_the_queue_then_exits() {
    let engine = engine().await;
    let (table, primary) = table(&engine, "Counted").await;
    for name in ["a", "b", "c"] {
        engine
            .create_row(table.id, &common::values(&[(&primary, json!(name))]))
            .await
            .unwrap();
    }

    let (queue, receiver) = JobQueue::channel();
    let pool = WorkerPool::spawn(engine.clone(), receiver, Arc::new(RecomputeFormulas));
    assert!(queue.enqueue(Job::CountRows));
    drop(queue);
    pool.join().await;

    let mut store = engine.store().clone();
    let counted = catalog::table(&mut store, table.id).await.unwrap();
    assert_eq!(counted.row_count, Some(3));
    assert!(counted.row_count_updated_at.is_some());
}
