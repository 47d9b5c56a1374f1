//! Background jobs.
//!
//! Work outside the request path flows through a [`JobQueue`] consumed by a
//! [`WorkerPool`]. A [`Scheduler`] enqueues the timed jobs. Every job runs
//! under a soft time limit; an abandoned job leaves nothing behind that
//! blocks the next run, since search backfill resumes from the row marker
//! and periodic refreshes commit per field.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::catalog::{self, FieldRecord, TableRecord, WorkspaceRecord};
use crate::dependency;
use crate::handler::TableEngine;
use crate::model::{self, GeneratedModel};
use crate::query::{Executor, QueryExecutor, TransactionExecutor, Update};
use crate::registry::FieldTypeRegistry;
use crate::search::NEEDS_BACKGROUND_UPDATE_COLUMN;
use crate::storable::{fetch_records, get_record};
use crate::trash::TrashHandler;
use crate::usage;
use crate::{FieldId, StorageDatetime, TableError, TableId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Refresh fields whose values depend on the current time. `None`
    /// covers every workspace.
    PeriodicFieldUpdate {
        workspace_id: Option<i64>,
        update_now: bool,
    },
    CountRows,
    /// Add the row marker and search columns to a table, then backfill.
    SetupSearchColumns { table_id: TableId },
    UpdateSearchColumns {
        table_id: TableId,
        changed_rows_only: bool,
    },
    MarkOldTrash,
    DeleteMarkedTrash,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::PeriodicFieldUpdate { .. } => "periodic_field_update",
            Job::CountRows => "count_rows",
            Job::SetupSearchColumns { .. } => "setup_search_columns",
            Job::UpdateSearchColumns { .. } => "update_search_columns",
            Job::MarkOldTrash => "mark_old_trash",
            Job::DeleteMarkedTrash => "delete_marked_trash",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
}

/// Receiving end of a [`JobQueue`], handed to a [`WorkerPool`].
#[derive(Debug)]
pub struct JobReceiver(mpsc::UnboundedReceiver<Job>);

impl JobQueue {
    pub fn channel() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, JobReceiver(receiver))
    }

    /// Queue a job. Returns false once the workers are gone.
    pub fn enqueue(&self, job: Job) -> bool {
        let name = job.name();
        if self.sender.send(job).is_err() {
            warn!(job = name, "Job queue is closed, dropping job");
            return false;
        }
        true
    }
}

impl JobReceiver {
    /// Next queued job, waiting if none is ready.
    pub async fn recv(&mut self) -> Option<Job> {
        self.0.recv().await
    }

    /// Next queued job if one is ready.
    pub fn try_recv(&mut self) -> Option<Job> {
        self.0.try_recv().ok()
    }
}

// ==================== Periodic field refresh ====================

/// Refreshes one field needing a periodic update. Called inside the
/// field's own transaction.
#[async_trait]
pub trait PeriodicFieldUpdate: Send + Sync {
    async fn update_field(
        &self,
        exec: &mut dyn Executor,
        registry: &FieldTypeRegistry,
        field: &FieldRecord,
        now: &StorageDatetime,
    ) -> Result<u64, TableError>;
}

/// Recomputes the field and every field depending on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecomputeFormulas;

#[async_trait]
impl PeriodicFieldUpdate for RecomputeFormulas {
    async fn update_field(
        &self,
        exec: &mut dyn Executor,
        registry: &FieldTypeRegistry,
        field: &FieldRecord,
        now: &StorageDatetime,
    ) -> Result<u64, TableError> {
        let table = catalog::table(exec, field.table_id).await?;
        let model =
            GeneratedModel::compile(exec, registry, &table, &crate::ModelOptions::default()).await?;
        let only = std::collections::BTreeSet::from([field.id]);
        let mut written = model.recompute(exec, Some(&only), None, now).await?;

        let graph = dependency::load_graph(exec).await?;
        let plan = graph.update_plan(&[field.id]);
        written += model::recompute_fields(exec, registry, &plan.order, None, now).await?;
        Ok(written)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodicUpdateReport {
    pub updated: Vec<FieldId>,
    pub failed: Vec<FieldId>,
}

/// Refresh every field needing a periodic update, one transaction per
/// field. A failing field is logged and skipped.
pub async fn run_periodic_fields_updates<S: QueryExecutor>(
    engine: &TableEngine<S>,
    updater: &dyn PeriodicFieldUpdate,
    workspace_id: Option<i64>,
    update_now: bool,
) -> Result<PeriodicUpdateReport, TableError> {
    let mut store = engine.store().clone();
    let mut fields: Vec<FieldRecord> = Vec::new();
    for field_type in engine.registry().get_all() {
        if !field_type.needs_periodic_update() {
            continue;
        }
        if let Some(query) = field_type.fields_needing_periodic_update() {
            fields.extend(fetch_records::<FieldRecord, _>(&mut store, &query).await?);
        }
    }

    let mut workspaces: BTreeMap<i64, Vec<FieldRecord>> = BTreeMap::new();
    let mut tables: BTreeMap<TableId, Option<TableRecord>> = BTreeMap::new();
    for field in fields {
        if !tables.contains_key(&field.table_id) {
            let table = get_record::<TableRecord, _>(&mut store, field.table_id).await?;
            tables.insert(field.table_id, table);
        }
        let Some(Some(table)) = tables.get(&field.table_id) else {
            continue;
        };
        if table.trashed || workspace_id.is_some_and(|id| id != table.workspace_id) {
            continue;
        }
        workspaces.entry(table.workspace_id).or_default().push(field);
    }

    let mut report = PeriodicUpdateReport::default();
    for (workspace_id, fields) in workspaces {
        let now = if update_now {
            let now = StorageDatetime::now();
            store
                .update(
                    &Update::of::<WorkspaceRecord>()
                        .set("now", &now)
                        .eq("id", workspace_id),
                )
                .await?;
            now
        } else {
            catalog::workspace(&mut store, workspace_id)
                .await?
                .now
                .unwrap_or_else(StorageDatetime::now)
        };

        for field in fields {
            match update_one_field(engine, updater, &field, &now).await {
                Ok(written) => {
                    debug!(field_id = field.id, written, "Periodically updated field");
                    report.updated.push(field.id);
                }
                Err(e) => {
                    error!(
                        field_id = field.id,
                        workspace_id,
                        error = %e,
                        "Failed to periodically update field"
                    );
                    report.failed.push(field.id);
                }
            }
        }
    }
    if !report.updated.is_empty() || !report.failed.is_empty() {
        info!(
            updated = report.updated.len(),
            failed = report.failed.len(),
            "Periodic field update finished"
        );
    }
    Ok(report)
}

async fn update_one_field<S: QueryExecutor>(
    engine: &TableEngine<S>,
    updater: &dyn PeriodicFieldUpdate,
    field: &FieldRecord,
    now: &StorageDatetime,
) -> Result<u64, TableError> {
    let mut tx = engine.store().begin_transaction().await?;
    match updater
        .update_field(&mut tx, engine.registry(), field, now)
        .await
    {
        Ok(written) => {
            tx.commit().await?;
            Ok(written)
        }
        Err(e) => {
            tx.rollback().await?;
            Err(e)
        }
    }
}

// ==================== Background search setup ====================

/// Add the row marker and search columns to a table, then backfill the
/// vectors. The table row is locked only while the columns are added; the
/// backfill runs afterwards in its own batches and only visits marked rows.
/// Returns the number of rows backfilled.
pub async fn setup_new_background_update_and_search_columns<S: QueryExecutor>(
    engine: &TableEngine<S>,
    table_id: TableId,
) -> Result<u64, TableError> {
    let mut tx = engine.store().begin_transaction().await?;
    let mut table = catalog::lock_table(&mut tx, table_id).await?;
    let version = table.schema_version;
    let marker_added = engine
        .search()
        .create_needs_background_update_column(&mut tx, &mut table)
        .await?;
    match engine.search().sync_columns(&mut tx, &mut table).await {
        // Rows already carrying the marker need it again to reach the
        // incremental backfill.
        Ok(created) if !created.is_empty() && !marker_added => {
            tx.update(
                &Update::for_table(table.relation_name()).set(NEEDS_BACKGROUND_UPDATE_COLUMN, true),
            )
            .await?;
        }
        Ok(_) => {}
        Err(e) if e.is_expected() => {
            debug!(table_id, "Full-text search is disabled");
        }
        Err(e) => return Err(e),
    }
    let changed = table.schema_version != version;
    tx.commit().await?;
    if changed {
        engine.cache().invalidate(table_id);
    }

    match engine
        .search()
        .update_columns(engine.store(), engine.cache(), table_id, true)
        .await
    {
        Ok(written) => Ok(written),
        Err(e) if e.is_expected() => {
            debug!(table_id, "Full-text search is disabled");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

// ==================== Workers ====================

/// Run one job to completion.
pub async fn run_job<S: QueryExecutor>(
    engine: &TableEngine<S>,
    updater: &dyn PeriodicFieldUpdate,
    job: Job,
) -> Result<(), TableError> {
    match job {
        Job::PeriodicFieldUpdate {
            workspace_id,
            update_now,
        } => {
            run_periodic_fields_updates(engine, updater, workspace_id, update_now).await?;
        }
        Job::CountRows => {
            let mut store = engine.store().clone();
            usage::count_rows(&mut store).await?;
        }
        Job::SetupSearchColumns { table_id } => {
            setup_new_background_update_and_search_columns(engine, table_id).await?;
        }
        Job::UpdateSearchColumns {
            table_id,
            changed_rows_only,
        } => {
            engine
                .search()
                .update_columns(engine.store(), engine.cache(), table_id, changed_rows_only)
                .await?;
        }
        Job::MarkOldTrash => {
            TrashHandler::new(engine.clone())
                .mark_old_trash_for_permanent_deletion()
                .await?;
        }
        Job::DeleteMarkedTrash => {
            TrashHandler::new(engine.clone())
                .permanently_delete_marked_trash()
                .await?;
        }
    }
    Ok(())
}

fn time_limit<S: QueryExecutor>(engine: &TableEngine<S>, job: &Job) -> Duration {
    match job {
        Job::PeriodicFieldUpdate { .. } => engine.config().periodic_field_update_timeout,
        _ => engine.config().job_soft_time_limit,
    }
}

/// A fixed set of workers draining a job queue.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `engine.config().worker_concurrency` workers.
    pub fn spawn<S: QueryExecutor>(
        engine: TableEngine<S>,
        receiver: JobReceiver,
        updater: Arc<dyn PeriodicFieldUpdate>,
    ) -> Self {
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let handles = (0..engine.config().worker_concurrency.max(1))
            .map(|worker| {
                let engine = engine.clone();
                let receiver = receiver.clone();
                let updater = updater.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            debug!(worker, "Job queue closed, worker exiting");
                            break;
                        };
                        let name = job.name();
                        let limit = time_limit(&engine, &job);
                        match tokio::time::timeout(limit, run_job(&engine, updater.as_ref(), job)).await {
                            Ok(Ok(())) => debug!(worker, job = name, "Job finished"),
                            Ok(Err(e)) if e.is_expected() => {
                                debug!(worker, job = name, reason = %e, "Job skipped")
                            }
                            Ok(Err(e)) => error!(worker, job = name, error = %e, "Job failed"),
                            Err(_) => warn!(
                                worker,
                                job = name,
                                limit_secs = limit.as_secs(),
                                "Job exceeded its time limit and was abandoned"
                            ),
                        }
                    }
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for the workers to exit. They exit once every queue handle is dropped.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker panicked");
            }
        }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Enqueues the timed jobs.
#[derive(Debug)]
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(queue: JobQueue, config: &crate::EngineConfig) -> Self {
        let mut schedules = vec![(
            config.periodic_field_update_interval,
            vec![Job::PeriodicFieldUpdate {
                workspace_id: None,
                update_now: true,
            }],
        )];
        if config.track_workspace_usage {
            schedules.push((config.row_count_job_interval, vec![Job::CountRows]));
        }
        schedules.push((
            config.old_trash_cleanup_check_interval,
            vec![Job::MarkOldTrash, Job::DeleteMarkedTrash],
        ));

        let handles = schedules
            .into_iter()
            .map(|(period, jobs)| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        interval.tick().await;
                        for job in &jobs {
                            if !queue.enqueue(job.clone()) {
                                return;
                            }
                        }
                    }
                })
            })
            .collect();
        Self { handles }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_delivers_in_order_and_reports_closure() {
        let (queue, mut receiver) = JobQueue::channel();
        assert!(queue.enqueue(Job::CountRows));
        assert!(queue.enqueue(Job::SetupSearchColumns { table_id: 4 }));
        assert_eq!(receiver.recv().await, Some(Job::CountRows));
        assert_eq!(
            receiver.try_recv(),
            Some(Job::SetupSearchColumns { table_id: 4 })
        );
        assert_eq!(receiver.try_recv(), None);

        drop(receiver);
        assert!(!queue.enqueue(Job::MarkOldTrash));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_enqueues_on_each_tick() {
        let (queue, mut receiver) = JobQueue::channel();
        let config = crate::EngineConfig {
            track_workspace_usage: false,
            periodic_field_update_interval: Duration::from_secs(60),
            old_trash_cleanup_check_interval: Duration::from_secs(3600),
            ..crate::EngineConfig::default()
        };
        let scheduler = Scheduler::spawn(queue, &config);

        // Intervals fire immediately, then once per period.
        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut jobs = Vec::new();
        while let Some(job) = receiver.try_recv() {
            jobs.push(job.name());
        }
        scheduler.abort();

        assert_eq!(
            jobs.iter().filter(|j| **j == "periodic_field_update").count(),
            2
        );
        assert_eq!(jobs.iter().filter(|j| **j == "mark_old_trash").count(), 1);
        assert!(!jobs.contains(&"count_rows"));
    }
}
