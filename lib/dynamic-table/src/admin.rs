//! Administrative operations behind the `dynamic-table-admin` binary.

use tracing::info;

use crate::catalog::{self, TableRecord};
use crate::handler::TableEngine;
use crate::query::{Executor, Order, Query, QueryExecutor, TransactionExecutor, Update};
use crate::storable::fetch_records;
use crate::search::NEEDS_BACKGROUND_UPDATE_COLUMN;
use crate::usage;
use crate::{TableError, TableId};

/// What a command reports back, and the process exit code it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub message: String,
}

impl CommandOutput {
    fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

fn search_disabled() -> CommandOutput {
    CommandOutput::failure(
        "Full-text search is disabled. Set DYNAMIC_TABLE_USE_PG_FULLTEXT_SEARCH=true to use it.",
    )
}

/// Invalidate every generated model in every process sharing the store.
/// Cached models are keyed by schema version, so bumping the version of
/// every table makes all of them miss; the local cache is emptied as well.
pub async fn clear_model_cache<S: QueryExecutor>(
    engine: &TableEngine<S>,
) -> Result<CommandOutput, TableError> {
    let mut tx = engine.store().begin_transaction().await?;
    let tables: Vec<TableRecord> = fetch_records(
        &mut tx,
        &Query::of::<TableRecord>()
            .order_by("id", Order::Asc)
            .for_update(),
    )
    .await?;
    for table in &tables {
        catalog::bump_schema_version(&mut tx, table.id).await?;
    }
    tx.commit().await?;

    let cleared = engine.cache().len();
    engine.cache().clear_all();
    info!(tables = tables.len(), cleared, "Cleared generated model cache");
    Ok(CommandOutput::success(format!(
        "Generated models of {} table(s) invalidated, {} local model(s) cleared.",
        tables.len(),
        cleared
    )))
}

/// Run the row count pass now.
pub async fn count_rows<S: QueryExecutor>(engine: &TableEngine<S>) -> Result<CommandOutput, TableError> {
    let mut store = engine.store().clone();
    let counted = usage::count_rows(&mut store).await?;
    Ok(CommandOutput::success(format!(
        "{} table(s) have been counted.",
        counted
    )))
}

/// Create the missing search columns of a table. Vectors are filled by
/// [`update_table_tsvectors`].
pub async fn sync_table_tsvectors<S: QueryExecutor>(
    engine: &TableEngine<S>,
    table_id: TableId,
) -> Result<CommandOutput, TableError> {
    let mut tx = engine.store().begin_transaction().await?;
    let mut table = match catalog::lock_table(&mut tx, table_id).await {
        Ok(table) => table,
        Err(TableError::TableNotFound(_)) => {
            tx.rollback().await?;
            return Ok(CommandOutput::failure(format!(
                "The table with id {} was not found.",
                table_id
            )));
        }
        Err(e) => return Err(e),
    };
    let created = match engine.search().sync_columns(&mut tx, &mut table).await {
        Ok(created) => created,
        Err(e) if e.is_expected() => {
            tx.rollback().await?;
            return Ok(search_disabled());
        }
        Err(e) => return Err(e),
    };
    if !created.is_empty() && table.needs_background_update_column_added {
        tx.update(
            &Update::for_table(table.relation_name()).set(NEEDS_BACKGROUND_UPDATE_COLUMN, true),
        )
        .await?;
    }
    tx.commit().await?;
    if !created.is_empty() {
        engine.cache().invalidate(table_id);
    }
    Ok(CommandOutput::success(format!(
        "{} search column(s) created for table {}. Fill them with: dynamic-table-admin update-table-tsvectors {}",
        created.len(),
        table_id,
        table_id
    )))
}

/// Recompute the search vectors of a table.
pub async fn update_table_tsvectors<S: QueryExecutor>(
    engine: &TableEngine<S>,
    table_id: TableId,
    changed_rows_only: bool,
) -> Result<CommandOutput, TableError> {
    let mut store = engine.store().clone();
    match catalog::table(&mut store, table_id).await {
        Ok(_) => {}
        Err(TableError::TableNotFound(_)) => {
            return Ok(CommandOutput::failure(format!(
                "The table with id {} was not found.",
                table_id
            )));
        }
        Err(e) => return Err(e),
    }
    match engine
        .search()
        .update_columns(engine.store(), engine.cache(), table_id, changed_rows_only)
        .await
    {
        Ok(written) => Ok(CommandOutput::success(format!(
            "{} row(s) of table {} updated.",
            written, table_id
        ))),
        Err(e) if e.is_expected() => Ok(search_disabled()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, FieldTypeRegistry, MemoryStore};

    async fn engine(config: EngineConfig) -> TableEngine<MemoryStore> {
        let engine = TableEngine::new(
            MemoryStore::new(),
            FieldTypeRegistry::with_builtin_types(),
            config,
        );
        engine.install().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn missing_table_exits_non_zero() {
        let engine = engine(EngineConfig::default()).await;
        let output = sync_table_tsvectors(&engine, 404).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.message.contains("404"));

        let output = update_table_tsvectors(&engine, 404, true).await.unwrap();
        assert!(!output.is_success());
    }

    #[tokio::test]
    async fn sync_is_a_no_op_on_a_synced_table() {
        let engine = engine(EngineConfig::default()).await;
        let workspace = engine.create_workspace("Acme").await.unwrap();
        let table = engine.create_table(workspace.id, "Projects").await.unwrap();

        let output = sync_table_tsvectors(&engine, table.id).await.unwrap();
        assert!(output.is_success());
        assert!(output.message.starts_with("0 search column(s)"));
    }

    #[tokio::test]
    async fn disabled_search_is_reported() {
        let engine = engine(EngineConfig {
            use_pg_fulltext_search: false,
            ..EngineConfig::default()
        })
        .await;
        let workspace = engine.create_workspace("Acme").await.unwrap();
        let table = engine.create_table(workspace.id, "Projects").await.unwrap();

        let output = sync_table_tsvectors(&engine, table.id).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.message.contains("disabled"));
    }

    #[tokio::test]
    async fn clearing_the_cache_reaches_other_engines_on_the_store() {
        let store = MemoryStore::new();
        let serving = TableEngine::new(
            store.clone(),
            FieldTypeRegistry::with_builtin_types(),
            EngineConfig::default(),
        );
        serving.install().await.unwrap();
        let workspace = serving.create_workspace("Acme").await.unwrap();
        let projects = serving.create_table(workspace.id, "Projects").await.unwrap();
        let tasks = serving.create_table(workspace.id, "Tasks").await.unwrap();
        let before = serving.model(projects.id).await.unwrap();
        serving.model(tasks.id).await.unwrap();
        let builds = serving.cache().builds();
        serving.model(projects.id).await.unwrap();
        assert_eq!(serving.cache().builds(), builds);

        // A separate process: same store, its own empty cache.
        let admin = TableEngine::new(
            store,
            FieldTypeRegistry::with_builtin_types(),
            EngineConfig::default(),
        );
        let output = clear_model_cache(&admin).await.unwrap();
        assert!(output.is_success());
        assert!(output.message.starts_with("Generated models of 2 table(s)"));

        let after = serving.model(projects.id).await.unwrap();
        assert_eq!(serving.cache().builds(), builds + 1);
        assert!(after.schema_version() > before.schema_version());
    }

    #[tokio::test]
    async fn clearing_the_cache_empties_it() {
        let engine = engine(EngineConfig::default()).await;
        let workspace = engine.create_workspace("Acme").await.unwrap();
        let table = engine.create_table(workspace.id, "Projects").await.unwrap();
        engine.model(table.id).await.unwrap();
        assert_eq!(engine.cache().len(), 1);

        let output = clear_model_cache(&engine).await.unwrap();
        assert!(output.is_success());
        assert!(engine.cache().is_empty());
    }
}
