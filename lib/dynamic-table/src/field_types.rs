//! Built-in field types.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::catalog::FieldRecord;
use crate::formula::{self, Expr, number_json, to_number};
use crate::query::{ColumnDef, ColumnType, Conversion, Filter, Order, Query};
use crate::registry::{FieldType, RelationTarget, Storage, relation_name_for_field};
use crate::{StorageDatetime, TableError, format_interval};

pub const TEXT: &str = "text";
pub const LONG_TEXT: &str = "long_text";
pub const NUMBER: &str = "number";
pub const BOOLEAN: &str = "boolean";
pub const DATE: &str = "date";
pub const SINGLE_SELECT: &str = "single_select";
pub const MULTIPLE_SELECT: &str = "multiple_select";
pub const LINK_ROW: &str = "link_row";
pub const FORMULA: &str = "formula";
pub const LAST_MODIFIED: &str = "last_modified";
pub const AUTONUMBER: &str = "autonumber";
pub const DURATION: &str = "duration";

pub(crate) fn builtin_types() -> Vec<Arc<dyn FieldType>> {
    vec![
        Arc::new(TextFieldType { tag: TEXT }),
        Arc::new(TextFieldType { tag: LONG_TEXT }),
        Arc::new(NumberFieldType),
        Arc::new(BooleanFieldType),
        Arc::new(DateFieldType),
        Arc::new(SingleSelectFieldType),
        Arc::new(MultipleSelectFieldType),
        Arc::new(LinkRowFieldType),
        Arc::new(FormulaFieldType),
        Arc::new(LastModifiedFieldType),
        Arc::new(AutonumberFieldType),
        Arc::new(DurationFieldType),
    ]
}

fn invalid(field: &FieldRecord, reason: impl Into<String>) -> TableError {
    TableError::invalid_value(field.name.clone(), reason)
}

/// Ids given either bare or as `{"id": n}` objects.
fn parse_id(field: &FieldRecord, value: &JsonValue) -> Result<i64, TableError> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::Object(map) => map.get("id").and_then(JsonValue::as_i64),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(field, format!("{} is not a valid id", value)))
}

fn parse_id_list(field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
    let items = match value {
        JsonValue::Null => return Ok(JsonValue::Array(Vec::new())),
        JsonValue::Array(items) => items,
        _ => return Err(invalid(field, "expected a list of ids")),
    };
    let mut ids: Vec<i64> = Vec::with_capacity(items.len());
    for item in items {
        let id = parse_id(field, item)?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(JsonValue::from(ids))
}

struct TextFieldType {
    tag: &'static str,
}

impl FieldType for TextFieldType {
    fn type_tag(&self) -> &'static str {
        self.tag
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(ColumnDef::new(field.db_column(), ColumnType::Text))
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        match value {
            JsonValue::Null | JsonValue::String(_) => Ok(value.clone()),
            JsonValue::Number(_) | JsonValue::Bool(_) => Ok(JsonValue::String(formula::to_text(value))),
            _ => Err(invalid(field, "expected text")),
        }
    }
}

struct NumberFieldType;

impl NumberFieldType {
    fn decimal_places(field: &FieldRecord) -> i64 {
        field.option_i64("decimal_places").unwrap_or(0)
    }
}

impl FieldType for NumberFieldType {
    fn type_tag(&self) -> &'static str {
        NUMBER
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(ColumnDef::new(field.db_column(), ColumnType::Double))
    }

    fn validate_options(&self, field: &FieldRecord) -> Result<(), TableError> {
        match field.options.get("decimal_places") {
            None => Ok(()),
            Some(v) if v.as_i64().is_some_and(|n| (0..=10).contains(&n)) => Ok(()),
            Some(v) => Err(TableError::invalid_value(
                field.name.clone(),
                format!("decimal_places must be between 0 and 10, got {}", v),
            )),
        }
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        if value.is_null() || value.as_str().is_some_and(|s| s.trim().is_empty()) {
            return Ok(JsonValue::Null);
        }
        let n = to_number(value).ok_or_else(|| invalid(field, "expected a number"))?;
        let factor = 10f64.powi(Self::decimal_places(field) as i32);
        Ok(number_json((n * factor).round() / factor))
    }
}

struct BooleanFieldType;

impl FieldType for BooleanFieldType {
    fn type_tag(&self) -> &'static str {
        BOOLEAN
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(
            ColumnDef::new(field.db_column(), ColumnType::Boolean)
                .not_null()
                .default_value(JsonValue::Bool(false)),
        )
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        match value {
            JsonValue::Null => Ok(JsonValue::Bool(false)),
            JsonValue::Bool(_) => Ok(value.clone()),
            JsonValue::Number(n) => Ok(JsonValue::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" | "checked" => Ok(JsonValue::Bool(true)),
                "f" | "false" | "n" | "no" | "off" | "0" | "" => Ok(JsonValue::Bool(false)),
                _ => Err(invalid(field, "expected a boolean")),
            },
            _ => Err(invalid(field, "expected a boolean")),
        }
    }

    fn is_searchable(&self, _field: &FieldRecord) -> bool {
        false
    }
}

struct DateFieldType;

impl DateFieldType {
    fn include_time(field: &FieldRecord) -> bool {
        field
            .options
            .get("include_time")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}

impl FieldType for DateFieldType {
    fn type_tag(&self) -> &'static str {
        DATE
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(ColumnDef::new(field.db_column(), ColumnType::Timestamp))
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        let raw = match value {
            JsonValue::Null => return Ok(JsonValue::Null),
            JsonValue::String(s) if s.trim().is_empty() => return Ok(JsonValue::Null),
            JsonValue::String(s) => s.trim(),
            _ => return Err(invalid(field, "expected a date")),
        };
        let parsed = StorageDatetime::parse(raw).or_else(|_| {
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| StorageDatetime(dt.and_utc()))
                .ok_or_else(|| invalid(field, format!("{:?} is not a date", raw)))
        })?;
        let stored = if Self::include_time(field) {
            parsed
        } else {
            parsed.start_of_day()
        };
        Ok(JsonValue::String(stored.to_rfc3339()))
    }

    fn render(&self, field: &FieldRecord, stored: &JsonValue) -> JsonValue {
        if Self::include_time(field) {
            return stored.clone();
        }
        match stored.as_str().map(StorageDatetime::parse) {
            Some(Ok(dt)) => JsonValue::String(dt.inner().format("%Y-%m-%d").to_string()),
            _ => stored.clone(),
        }
    }
}

struct SingleSelectFieldType;

impl FieldType for SingleSelectFieldType {
    fn type_tag(&self) -> &'static str {
        SINGLE_SELECT
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::SelectOption(ColumnDef::new(field.db_column(), ColumnType::BigInt))
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        parse_id(field, value).map(JsonValue::from)
    }
}

struct MultipleSelectFieldType;

impl FieldType for MultipleSelectFieldType {
    fn type_tag(&self) -> &'static str {
        MULTIPLE_SELECT
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Relation {
            relation: relation_name_for_field(field.id),
            target: RelationTarget::SelectOptions,
        }
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        parse_id_list(field, value)
    }
}

struct LinkRowFieldType;

impl FieldType for LinkRowFieldType {
    fn type_tag(&self) -> &'static str {
        LINK_ROW
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        let target = field
            .link_row_table_id
            .or_else(|| field.option_i64("link_table_id"))
            .unwrap_or_default();
        Storage::Relation {
            relation: relation_name_for_field(field.id),
            target: RelationTarget::Table(target),
        }
    }

    fn validate_options(&self, field: &FieldRecord) -> Result<(), TableError> {
        match field.option_i64("link_table_id") {
            Some(_) => Ok(()),
            None => Err(TableError::invalid_value(
                field.name.clone(),
                "link_table_id is required",
            )),
        }
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        parse_id_list(field, value)
    }

    fn is_searchable(&self, _field: &FieldRecord) -> bool {
        false
    }
}

struct FormulaFieldType;

impl FieldType for FormulaFieldType {
    fn type_tag(&self) -> &'static str {
        FORMULA
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(ColumnDef::new(field.db_column(), ColumnType::Json))
    }

    fn validate_options(&self, field: &FieldRecord) -> Result<(), TableError> {
        self.expression(field).map(|_| ())
    }

    fn read_only(&self) -> bool {
        true
    }

    fn alter_conversion(
        &self,
        _old_type: &dyn FieldType,
        _old_field: &FieldRecord,
        _new_field: &FieldRecord,
    ) -> Conversion {
        // Recomputed right after the change.
        Conversion::Clear
    }

    fn needs_periodic_update(&self) -> bool {
        true
    }

    fn fields_needing_periodic_update(&self) -> Option<Query> {
        Some(
            Query::of::<FieldRecord>()
                .eq("type_tag", FORMULA)
                .eq("needs_periodic_update", true)
                .eq("trashed", false)
                .filter(Filter::IsNull("error".to_string()))
                .order_by("id", Order::Asc),
        )
    }

    fn field_needs_periodic_update(&self, field: &FieldRecord) -> Result<bool, TableError> {
        Ok(self.expression(field)?.is_some_and(|expr| expr.uses_now()))
    }

    fn expression(&self, field: &FieldRecord) -> Result<Option<Expr>, TableError> {
        let source = field
            .option_str("formula")
            .ok_or_else(|| TableError::InvalidFormula("the formula option is required".into()))?;
        formula::parse(source).map(Some)
    }
}

struct LastModifiedFieldType;

impl FieldType for LastModifiedFieldType {
    fn type_tag(&self) -> &'static str {
        LAST_MODIFIED
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(ColumnDef::new(field.db_column(), ColumnType::Timestamp))
    }

    fn read_only(&self) -> bool {
        true
    }

    fn touch_on_write(&self) -> bool {
        true
    }
}

struct AutonumberFieldType;

/// Sequence feeding an autonumber field.
pub fn autonumber_sequence_name(field: &FieldRecord) -> String {
    format!("database_table_{}_field_{}_seq", field.table_id, field.id)
}

impl FieldType for AutonumberFieldType {
    fn type_tag(&self) -> &'static str {
        AUTONUMBER
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(
            ColumnDef::new(field.db_column(), ColumnType::BigInt)
                .sequence(autonumber_sequence_name(field)),
        )
    }

    fn read_only(&self) -> bool {
        true
    }

    fn alter_conversion(
        &self,
        _old_type: &dyn FieldType,
        _old_field: &FieldRecord,
        _new_field: &FieldRecord,
    ) -> Conversion {
        // Rows are renumbered from the sequence.
        Conversion::Clear
    }
}

struct DurationFieldType;

impl FieldType for DurationFieldType {
    fn type_tag(&self) -> &'static str {
        DURATION
    }

    fn storage(&self, field: &FieldRecord) -> Storage {
        Storage::Column(ColumnDef::new(field.db_column(), ColumnType::Interval))
    }

    fn prepare_value(&self, field: &FieldRecord, value: &JsonValue) -> Result<JsonValue, TableError> {
        match value {
            JsonValue::Null => Ok(JsonValue::Null),
            JsonValue::Number(_) => Ok(value.clone()),
            JsonValue::String(s) if s.trim().is_empty() => Ok(JsonValue::Null),
            JsonValue::String(s) => parse_duration(s)
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .ok_or_else(|| invalid(field, format!("{:?} is not a duration", s))),
            _ => Err(invalid(field, "expected a duration")),
        }
    }

    fn render(&self, _field: &FieldRecord, stored: &JsonValue) -> JsonValue {
        match stored.as_f64() {
            Some(seconds) => JsonValue::String(format_interval(seconds)),
            None => stored.clone(),
        }
    }
}

/// Parse `[-]H:MM[:SS[.ffffff]]` or a plain number of seconds.
pub fn parse_duration(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(seconds) = text.parse::<f64>() {
        return Some(seconds);
    }
    let (sign, body) = match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, text),
    };
    let parts: Vec<&str> = body.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let hours = parts[0].parse::<u64>().ok()? as f64;
    let minutes = parts[1].parse::<u64>().ok()? as f64;
    let seconds = match parts.get(2) {
        Some(s) => s.parse::<f64>().ok()?,
        None => 0.0,
    };
    Some(sign * (hours * 3600.0 + minutes * 60.0 + seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldTypeRegistry;
    use serde_json::json;

    fn field(type_tag: &str, options: JsonValue) -> FieldRecord {
        let mut field = FieldRecord::new(1, "Field", type_tag, options);
        field.id = 3;
        field
    }

    #[test]
    fn duration_renders_as_interval_text() {
        let registry = FieldTypeRegistry::with_builtin_types();
        let duration = registry.get(DURATION).unwrap();
        let f = field(DURATION, json!({}));
        assert_eq!(duration.render(&f, &json!(93_784)), json!("26:03:04"));
        assert_eq!(duration.render(&f, &JsonValue::Null), JsonValue::Null);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("1:30"), Some(5400.0));
        assert_eq!(parse_duration("-0:00:01.5"), Some(-1.5));
        assert_eq!(parse_duration("90"), Some(90.0));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn number_values_are_rounded_to_decimal_places() {
        let registry = FieldTypeRegistry::with_builtin_types();
        let number = registry.get(NUMBER).unwrap();
        let f = field(NUMBER, json!({"decimal_places": 2}));
        assert_eq!(number.prepare_value(&f, &json!("3.14159")).unwrap(), json!(3.14));
        assert!(number.prepare_value(&f, &json!("pi")).is_err());
    }

    #[test]
    fn dates_without_time_are_truncated() {
        let registry = FieldTypeRegistry::with_builtin_types();
        let date = registry.get(DATE).unwrap();
        let f = field(DATE, json!({}));
        let stored = date.prepare_value(&f, &json!("2024-02-03T10:11:12Z")).unwrap();
        assert_eq!(stored, json!("2024-02-03T00:00:00.000000Z"));
        assert_eq!(date.render(&f, &stored), json!("2024-02-03"));
    }

    #[test]
    fn formula_capabilities_follow_the_expression() {
        let registry = FieldTypeRegistry::with_builtin_types();
        let formula = registry.get(FORMULA).unwrap();
        assert!(formula.needs_periodic_update());
        assert!(formula.fields_needing_periodic_update().is_some());
        assert!(formula
            .field_needs_periodic_update(&field(FORMULA, json!({"formula": "today()"})))
            .unwrap());
        assert!(!formula
            .field_needs_periodic_update(&field(FORMULA, json!({"formula": "1 + 1"})))
            .unwrap());
        assert!(registry.get(TEXT).unwrap().fields_needing_periodic_update().is_none());
    }

    #[test]
    fn id_lists_are_deduplicated_in_order() {
        let registry = FieldTypeRegistry::with_builtin_types();
        let multi = registry.get(MULTIPLE_SELECT).unwrap();
        let f = field(MULTIPLE_SELECT, json!({}));
        let prepared = multi
            .prepare_value(&f, &json!([3, {"id": 1}, 3, "2"]))
            .unwrap();
        assert_eq!(prepared, json!([3, 1, 2]));
    }
}
