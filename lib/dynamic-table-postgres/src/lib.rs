//! PostgreSQL backend for dynamic-table.
//!
//! [`PgPool`] runs statements autocommit and opens [`PgTransaction`]s,
//! which carry the DDL the schema synchronizer needs. User tables, catalog
//! relations, sequences and search vectors all live in the connection's
//! current schema.
//!
//! # Usage
//!
//! ```text
//! use dynamic_table::{EngineConfig, FieldTypeRegistry, TableEngine};
//! use dynamic_table_postgres::PgPool;
//!
//! let store = PgPool::connect(&database_url).await?;
//! let engine = TableEngine::new(store, FieldTypeRegistry::with_builtin_types(), EngineConfig::from_env()?);
//! engine.install().await?;
//! ```

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

mod bind;
mod executor;
pub mod sql;

pub use bind::decode_row;
pub use executor::{PgPool, PgTransaction};

// Re-export core types for convenience
pub use dynamic_table::{
    EngineConfig, Executor, FieldTypeRegistry, QueryExecutor, TableEngine, TableError,
    TransactionExecutor,
};
