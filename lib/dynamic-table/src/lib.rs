//! Dynamic Table - a storage engine for user-defined tables.
//!
//! End users create tables and fields at runtime; every field is backed by
//! real physical storage (a column, a select-option reference, or an ordered
//! join relation). The engine keeps that storage, the catalog describing it,
//! and the per-table row accessors compiled from it in agreement.
//!
//! # Core Concepts
//!
//! - **Field type registry**: immutable map from type tag to a [`FieldType`]
//!   descriptor, built once at startup and shared by `Arc`.
//! - **Schema synchronizer**: translates field create/alter/delete into DDL.
//! - **Generated model**: a compiled row accessor for one table and one
//!   schema version, cached in a [`ModelCache`] keyed by that version.
//! - **Field dependencies**: a persisted graph used to order recomputation of
//!   formula and lookup fields, with cycle detection.
//! - **Background work**: periodic field refreshes, search index
//!   maintenance, row counting and trash sweeps run on a worker pool.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process store used by tests and embedders.
//! - `dynamic-table-postgres`: the PostgreSQL backend.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

extern crate self as dynamic_table;

pub mod admin;
pub mod cache;
pub mod catalog;
mod config;
pub mod dependency;
mod error;
pub mod field_types;
pub mod formula;
mod handler;
mod memory;
pub mod model;
pub mod notify;
mod query;
mod registry;
pub mod scheduler;
pub mod schema;
pub mod search;
mod storable;
mod time;
pub mod trash;
pub mod usage;

/// Identifier of a user table.
pub type TableId = i64;
/// Identifier of a field.
pub type FieldId = i64;
/// Identifier of a row within a user table.
pub type RowId = i64;

pub use cache::{ModelCache, ModelKey, ModelOptions};
pub use catalog::{
    FieldDependencyRecord, FieldRecord, SelectOptionRecord, TableRecord, TrashEntryRecord,
    WorkspaceRecord,
};
pub use config::EngineConfig;
pub use dependency::{FieldDependencyGraph, UpdatePlan};
pub use error::TableError;
pub use handler::{FieldUpdate, NewField, TableEngine};
pub use memory::{MemoryStore, MemoryTransaction};
pub use model::{GeneratedModel, RowData, RowQuery};
pub use query::{
    ColumnDef, ColumnDefault, ColumnType, Conversion, Delete, Executor, Filter, IndexDef,
    IndexKind, Order, Query, QueryExecutor, Row, TransactionExecutor, Update, Value, row_id,
};
pub use registry::{FieldType, FieldTypeRegistry, RelationTarget, Storage};
pub use storable::{Storable, fetch_record, fetch_records, get_record, insert_record, save_record};
pub use time::{StorageDatetime, format_interval};

// Re-export derive macro
pub use dynamic_table_derive::Storable;
