//! PostgreSQL implementation of the executor traits.

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

use async_trait::async_trait;
use dynamic_table::{
    ColumnDef, ColumnDefault, Conversion, Delete, Executor, IndexDef, Query, QueryExecutor, Row,
    TableError, TransactionExecutor, Update,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, Postgres, Row as _, Transaction};
use std::ops::Deref;
use tracing::debug;

use crate::bind::{arguments, decode_row};
use crate::sql::{self, Statement};

fn storage_error(e: sqlx::Error) -> TableError {
    TableError::StorageError(e.to_string())
}

/// Wrapper around sqlx::PgPool that implements the executor traits.
/// Statements run on it autocommit.
#[derive(Clone, Debug)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    /// Create a new PgPool from an sqlx PgPool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self(pool)
    }

    /// Connect to a PostgreSQL database.
    pub async fn connect(url: &str) -> Result<Self, TableError> {
        Self::connect_with(url, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self, TableError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(storage_error)?;
        Ok(Self(pool))
    }

    /// Get the inner sqlx::PgPool.
    pub fn inner(&self) -> &sqlx::PgPool {
        &self.0
    }
}

impl Deref for PgPool {
    type Target = sqlx::PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Row statements are written once against a connection and shared by the
// pool (through a pooled connection) and transactions.

async fn fetch_rows(conn: &mut PgConnection, query: &Query) -> Result<Vec<Row>, TableError> {
    let statement = sql::select(query);
    let rows = sqlx::query_with(&statement.sql, arguments(&statement.params)?)
        .fetch_all(conn)
        .await
        .map_err(storage_error)?;
    rows.iter().map(decode_row).collect()
}

async fn count_rows(conn: &mut PgConnection, query: &Query) -> Result<u64, TableError> {
    let statement = sql::count(query);
    let row = sqlx::query_with(&statement.sql, arguments(&statement.params)?)
        .fetch_one(conn)
        .await
        .map_err(storage_error)?;
    let count: i64 = row.try_get(0).map_err(storage_error)?;
    Ok(count.max(0) as u64)
}

async fn insert_row(
    conn: &mut PgConnection,
    table: &str,
    values: &[(String, dynamic_table::Value)],
) -> Result<Row, TableError> {
    let statement = sql::insert(table, values);
    let row = sqlx::query_with(&statement.sql, arguments(&statement.params)?)
        .fetch_one(conn)
        .await
        .map_err(storage_error)?;
    decode_row(&row)
}

async fn execute(conn: &mut PgConnection, statement: &Statement) -> Result<u64, TableError> {
    let result = sqlx::query_with(&statement.sql, arguments(&statement.params)?)
        .execute(conn)
        .await
        .map_err(storage_error)?;
    Ok(result.rows_affected())
}

async fn execute_ddl(conn: &mut PgConnection, sql: &str) -> Result<(), TableError> {
    debug!(sql, "Executing DDL");
    sqlx::query(sql).execute(conn).await.map_err(storage_error)?;
    Ok(())
}

#[async_trait]
impl Executor for PgPool {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, TableError> {
        let mut conn = self.0.acquire().await.map_err(storage_error)?;
        fetch_rows(&mut conn, query).await
    }

    async fn count(&mut self, query: &Query) -> Result<u64, TableError> {
        let mut conn = self.0.acquire().await.map_err(storage_error)?;
        count_rows(&mut conn, query).await
    }

    async fn insert(
        &mut self,
        table: &str,
        values: &[(String, dynamic_table::Value)],
    ) -> Result<Row, TableError> {
        let mut conn = self.0.acquire().await.map_err(storage_error)?;
        insert_row(&mut conn, table, values).await
    }

    async fn update(&mut self, update: &Update) -> Result<u64, TableError> {
        let Some(statement) = sql::update(update) else {
            return Ok(0);
        };
        let mut conn = self.0.acquire().await.map_err(storage_error)?;
        execute(&mut conn, &statement).await
    }

    async fn delete(&mut self, delete: &Delete) -> Result<u64, TableError> {
        let mut conn = self.0.acquire().await.map_err(storage_error)?;
        execute(&mut conn, &sql::delete(delete)).await
    }
}

#[async_trait]
impl QueryExecutor for PgPool {
    type Transaction = PgTransaction;

    async fn begin_transaction(&self) -> Result<Self::Transaction, TableError> {
        let tx = self.0.begin().await.map_err(storage_error)?;
        Ok(PgTransaction { tx })
    }
}

/// PostgreSQL transaction wrapper implementing TransactionExecutor.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl Executor for PgTransaction {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, TableError> {
        fetch_rows(self.conn(), query).await
    }

    async fn count(&mut self, query: &Query) -> Result<u64, TableError> {
        count_rows(self.conn(), query).await
    }

    async fn insert(
        &mut self,
        table: &str,
        values: &[(String, dynamic_table::Value)],
    ) -> Result<Row, TableError> {
        insert_row(self.conn(), table, values).await
    }

    async fn update(&mut self, update: &Update) -> Result<u64, TableError> {
        match sql::update(update) {
            Some(statement) => execute(self.conn(), &statement).await,
            None => Ok(0),
        }
    }

    async fn delete(&mut self, delete: &Delete) -> Result<u64, TableError> {
        execute(self.conn(), &sql::delete(delete)).await
    }
}

#[async_trait]
impl TransactionExecutor for PgTransaction {
    async fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::create_table(table, columns)).await
    }

    async fn drop_table(&mut self, table: &str) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::drop_table(table)).await
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, TableError> {
        let row = sqlx::query(sql::TABLE_EXISTS)
            .bind(table)
            .fetch_one(self.conn())
            .await
            .map_err(storage_error)?;
        row.try_get(0).map_err(storage_error)
    }

    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnDef>, TableError> {
        let rows = sqlx::query(sql::COLUMNS)
            .bind(table)
            .fetch_all(self.conn())
            .await
            .map_err(storage_error)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0).map_err(storage_error)?;
            let data_type: String = row.try_get(1).map_err(storage_error)?;
            let nullable: bool = row.try_get(2).map_err(storage_error)?;
            let default: Option<String> = row.try_get(3).map_err(storage_error)?;
            let primary_key: bool = row.try_get(4).map_err(storage_error)?;

            let default = sql::parse_column_default(default.as_deref());
            let is_serial = primary_key && matches!(default, ColumnDefault::Sequence(_));
            let column_type = sql::column_type_from_pg(&data_type, is_serial).ok_or_else(|| {
                TableError::StorageError(format!(
                    "column {} of {} has unsupported type {}",
                    name, table, data_type
                ))
            })?;
            columns.push(if is_serial {
                ColumnDef::primary_key(name)
            } else {
                ColumnDef {
                    name,
                    column_type,
                    nullable,
                    default,
                    primary_key,
                }
            });
        }
        Ok(columns)
    }

    async fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::add_column(table, column)).await
    }

    async fn alter_column(
        &mut self,
        table: &str,
        column: &ColumnDef,
        conversion: Conversion,
    ) -> Result<(), TableError> {
        for statement in sql::alter_column(table, column, conversion) {
            execute_ddl(self.conn(), &statement).await?;
        }
        Ok(())
    }

    async fn drop_column(&mut self, table: &str, column: &str) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::drop_column(table, column)).await
    }

    async fn create_sequence(&mut self, name: &str) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::create_sequence(name)).await
    }

    async fn drop_sequence(&mut self, name: &str) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::drop_sequence(name)).await
    }

    async fn create_index(&mut self, index: &IndexDef) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::create_index(index)).await
    }

    async fn drop_index(&mut self, _table: &str, name: &str) -> Result<(), TableError> {
        execute_ddl(self.conn(), &sql::drop_index(name)).await
    }

    async fn acquire_advisory_lock(&mut self, key: &str) -> Result<(), TableError> {
        sqlx::query(sql::ADVISORY_LOCK)
            .bind(key)
            .execute(self.conn())
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn commit(self) -> Result<(), TableError> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self) -> Result<(), TableError> {
        self.tx.rollback().await.map_err(storage_error)
    }
}
