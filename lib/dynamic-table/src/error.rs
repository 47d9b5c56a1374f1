use thiserror::Error;

use crate::{FieldId, TableId};

#[derive(Error, Debug)]
pub enum TableError {
    /// A physical column or relation already exists where none was expected.
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Unknown field type: {0}")]
    UnknownFieldType(String),

    #[error("Cyclic dependency between fields {0:?}")]
    CyclicDependency(Vec<FieldId>),

    #[error("Full-text search is disabled")]
    SearchDisabled,

    #[error("Table {0} not found")]
    TableNotFound(TableId),

    #[error("Field {0} not found")]
    FieldNotFound(FieldId),

    #[error("Select option {0} not found")]
    SelectOptionNotFound(i64),

    #[error("A field named {0:?} already exists in this table")]
    FieldNameNotUnique(String),

    #[error("The primary field of a table cannot be deleted")]
    CannotDeletePrimaryField,

    #[error("{0} is already in the trash")]
    AlreadyTrashed(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid formula: {0}")]
    InvalidFormula(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl TableError {
    /// Conditions callers handle as a no-op rather than a failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, TableError::SearchDisabled)
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TableError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
