//! Field type descriptors and their registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::catalog::FieldRecord;
use crate::formula::{self, Expr};
use crate::query::{ColumnDef, Conversion, Query};
use crate::{TableError, TableId};

/// Where a relation-backed field points.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationTarget {
    /// Select options of the field itself.
    SelectOptions,
    /// Rows of another user table.
    Table(TableId),
}

/// Physical storage of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    /// A plain column on the table relation.
    Column(ColumnDef),
    /// A bigint column holding the id of one of the field's select options.
    SelectOption(ColumnDef),
    /// A join relation `(row_id, target_id)`; iteration follows the join ids.
    Relation {
        relation: String,
        target: RelationTarget,
    },
}

impl Storage {
    pub fn column(&self) -> Option<&ColumnDef> {
        match self {
            Storage::Column(column) | Storage::SelectOption(column) => Some(column),
            Storage::Relation { .. } => None,
        }
    }
}

/// Name of the join relation backing a many-to-many field.
pub fn relation_name_for_field(field_id: i64) -> String {
    format!("database_relation_{}", field_id)
}

/// Behavior of one kind of field.
///
/// Descriptors are stateless and shared; everything specific to a field
/// comes from its [`FieldRecord`].
pub trait FieldType: Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn storage(&self, field: &FieldRecord) -> Storage;

    fn validate_options(&self, _field: &FieldRecord) -> Result<(), TableError> {
        Ok(())
    }

    /// Values are computed by the engine and cannot be written by callers.
    fn read_only(&self) -> bool {
        false
    }

    /// Turn a caller-supplied value into the stored representation. Select
    /// and relation fields receive ids; their existence is checked by the model.
    fn prepare_value(&self, _field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        Ok(value.clone())
    }

    /// Turn a stored scalar into its user-facing representation.
    fn render(&self, _field: &FieldRecord, stored: &JsonValue) -> JsonValue {
        stored.clone()
    }

    fn is_searchable(&self, _field: &FieldRecord) -> bool {
        true
    }

    /// Text indexed for search, derived from the rendered value.
    fn search_text(&self, _field: &FieldRecord, rendered: &JsonValue) -> Option<String> {
        let text = formula::to_text(rendered);
        if text.is_empty() { None } else { Some(text) }
    }

    /// How existing values survive changing `old_field` into `new_field`.
    fn alter_conversion(
        &self,
        old_type: &dyn FieldType,
        old_field: &FieldRecord,
        new_field: &FieldRecord,
    ) -> Conversion {
        match (old_type.storage(old_field), self.storage(new_field)) {
            (Storage::Column(a), Storage::Column(b)) if a.column_type == b.column_type => {
                Conversion::Keep
            }
            (Storage::Column(_), Storage::Column(_)) => Conversion::Cast,
            (Storage::SelectOption(_), Storage::SelectOption(_)) => Conversion::Keep,
            _ => Conversion::Clear,
        }
    }

    /// Stamp the field with the current time on every row write.
    fn touch_on_write(&self) -> bool {
        false
    }

    /// Some fields of this type must be refreshed on a timer.
    fn needs_periodic_update(&self) -> bool {
        false
    }

    /// Catalog query selecting the fields of this type that need a periodic
    /// refresh, or `None` when the type never does.
    fn fields_needing_periodic_update(&self) -> Option<Query> {
        None
    }

    /// Whether this particular field needs a periodic refresh.
    fn field_needs_periodic_update(&self, _field: &FieldRecord) -> Result<bool, TableError> {
        Ok(false)
    }

    /// Values of this field feed a search vector maintained in the background.
    fn needs_background_update(&self, field: &FieldRecord) -> bool {
        self.is_searchable(field)
    }

    /// The expression computing this field's value, for computed fields.
    fn expression(&self, _field: &FieldRecord) -> Result<Option<Expr>, TableError> {
        Ok(None)
    }
}

/// Registry of field types, keyed by type tag. Built once and shared by `Arc`.
#[derive(Clone, Default)]
pub struct FieldTypeRegistry {
    types: BTreeMap<&'static str, Arc<dyn FieldType>>,
}

impl std::fmt::Debug for FieldTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.types.keys()).finish()
    }
}

impl FieldTypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in field type.
    pub fn with_builtin_types() -> Self {
        let mut registry = Self::new();
        for field_type in crate::field_types::builtin_types() {
            registry.types.insert(field_type.type_tag(), field_type);
        }
        registry
    }

    /// Register a field type. Type tags are unique.
    pub fn register<T: FieldType + 'static>(&mut self, field_type: T) -> Result<(), TableError> {
        let tag = field_type.type_tag();
        if self.types.contains_key(tag) {
            return Err(TableError::InvalidConfig(format!(
                "field type {:?} is already registered",
                tag
            )));
        }
        self.types.insert(tag, Arc::new(field_type));
        Ok(())
    }

    pub fn get(&self, type_tag: &str) -> Result<Arc<dyn FieldType>, TableError> {
        self.types
            .get(type_tag)
            .cloned()
            .ok_or_else(|| TableError::UnknownFieldType(type_tag.to_string()))
    }

    pub fn type_of(&self, field: &FieldRecord) -> Result<Arc<dyn FieldType>, TableError> {
        self.get(&field.type_tag)
    }

    pub fn get_all(&self) -> impl Iterator<Item = &Arc<dyn FieldType>> {
        self.types.values()
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.types.contains_key(type_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ColumnType;

    struct Rating;

    impl FieldType for Rating {
        fn type_tag(&self) -> &'static str {
            "rating"
        }

        fn storage(&self, field: &FieldRecord) -> Storage {
            Storage::Column(ColumnDef::new(field.db_column(), ColumnType::BigInt))
        }
    }

    #[test]
    fn unknown_tags_fail() {
        let registry = FieldTypeRegistry::with_builtin_types();
        assert!(registry.get("text").is_ok());
        assert!(matches!(
            registry.get("hologram"),
            Err(TableError::UnknownFieldType(tag)) if tag == "hologram"
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = FieldTypeRegistry::new();
        registry.register(Rating).unwrap();
        assert!(registry.register(Rating).is_err());
        assert!(registry.contains("rating"));
    }

    #[test]
    fn conversion_follows_storage() {
        let registry = FieldTypeRegistry::with_builtin_types();
        let text = registry.get("text").unwrap();
        let long_text = registry.get("long_text").unwrap();
        let number = registry.get("number").unwrap();
        let multi = registry.get("multiple_select").unwrap();

        let mut field = FieldRecord::new(1, "f", "text", serde_json::json!({}));
        field.id = 7;
        assert_eq!(
            long_text.alter_conversion(text.as_ref(), &field, &field),
            Conversion::Keep
        );
        assert_eq!(
            number.alter_conversion(text.as_ref(), &field, &field),
            Conversion::Cast
        );
        assert_eq!(
            multi.alter_conversion(text.as_ref(), &field, &field),
            Conversion::Clear
        );
    }
}
