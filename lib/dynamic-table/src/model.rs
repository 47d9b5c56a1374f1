//! Generated models.
//!
//! A [`GeneratedModel`] is compiled from one table's field set at one schema
//! version. It knows where each field is stored and how to read, write,
//! render and recompute it, and is immutable once built.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::info;

use crate::cache::ModelOptions;
use crate::catalog::{self, FieldRecord, SelectOptionRecord, TableRecord};
use crate::dependency::FieldDependencyGraph;
use crate::formula::{Expr, FormulaContext, FormulaReference};
use crate::query::{
    ColumnType, Delete, Executor, Filter, Order, Query, Row, Update, Value, row_id,
};
use crate::registry::{FieldType, FieldTypeRegistry, RelationTarget, Storage};
use crate::schema::{CREATED_ON_COLUMN, UPDATED_ON_COLUMN};
use crate::search::{NEEDS_BACKGROUND_UPDATE_COLUMN, tsvector_column};
use crate::{FieldId, RowId, StorageDatetime, TableError, TableId};

const RECOMPUTE_BATCH_SIZE: u64 = 500;

/// A rendered row keyed by model attribute names.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowData {
    pub id: RowId,
    pub values: JsonMap<String, JsonValue>,
}

impl RowData {
    pub fn get(&self, attribute: &str) -> Option<&JsonValue> {
        self.values.get(attribute)
    }
}

/// Filters and ordering over model attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowQuery {
    pub filters: Vec<Filter>,
    pub order_by: Vec<(String, Order)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl RowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Eq(attribute.into(), value.into()))
    }

    pub fn order_by(mut self, attribute: impl Into<String>, order: Order) -> Self {
        self.order_by.push((attribute.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// One field as seen by a model.
#[derive(Clone)]
pub struct ModelField {
    pub field: FieldRecord,
    pub attribute: String,
    pub storage: Storage,
    field_type: Arc<dyn FieldType>,
}

impl std::fmt::Debug for ModelField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelField")
            .field("field_id", &self.field.id)
            .field("attribute", &self.attribute)
            .field("storage", &self.storage)
            .finish()
    }
}

impl ModelField {
    pub fn field_type(&self) -> &dyn FieldType {
        self.field_type.as_ref()
    }

    fn column_name(&self) -> Option<&str> {
        self.storage.column().map(|c| c.name.as_str())
    }
}

/// How a linked row is labelled: the primary field of the target table.
#[derive(Clone)]
struct LinkDisplay {
    relation: String,
    column: String,
    field: FieldRecord,
    field_type: Arc<dyn FieldType>,
}

/// A resolved `lookup(via, target)` reference.
#[derive(Clone)]
struct LookupSpec {
    via: String,
    target: String,
    join: String,
    target_relation: String,
    target_column: String,
    target_field: FieldRecord,
    target_type: Arc<dyn FieldType>,
}

#[derive(Clone)]
struct FormulaPlan {
    index: usize,
    expr: Expr,
}

/// A stored row with every field of the model rendered.
pub(crate) struct LoadedRow {
    pub id: RowId,
    pub raw: Row,
    pub values: Vec<JsonValue>,
}

pub struct GeneratedModel {
    table: TableRecord,
    options: ModelOptions,
    fields: Vec<ModelField>,
    links: HashMap<FieldId, LinkDisplay>,
    lookups: Vec<LookupSpec>,
    formulas: Vec<FormulaPlan>,
    fingerprint: String,
}

impl std::fmt::Debug for GeneratedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedModel")
            .field("table_id", &self.table.id)
            .field("schema_version", &self.table.schema_version)
            .field("fields", &self.fields)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

struct RowContext<'a> {
    values: HashMap<&'a str, JsonValue>,
    lookups: Option<&'a HashMap<(String, String), JsonValue>>,
    now: &'a StorageDatetime,
}

impl FormulaContext for RowContext<'_> {
    fn field(&self, name: &str) -> JsonValue {
        self.values.get(name).cloned().unwrap_or(JsonValue::Null)
    }

    fn lookup(&self, via: &str, target: &str) -> JsonValue {
        self.lookups
            .and_then(|l| l.get(&(via.to_string(), target.to_string())))
            .cloned()
            .unwrap_or(JsonValue::Null)
    }

    fn now(&self) -> &StorageDatetime {
        self.now
    }
}

impl GeneratedModel {
    /// Compile a model for `table` as described by the catalog visible to `exec`.
    pub async fn compile<E: Executor + ?Sized>(
        exec: &mut E,
        registry: &FieldTypeRegistry,
        table: &TableRecord,
        options: &ModelOptions,
    ) -> Result<Self, TableError> {
        let mut records = catalog::fields_for_table(exec, table.id).await?;
        if let Some(ids) = &options.field_ids {
            records.retain(|f| ids.contains(&f.id));
        }

        let mut fields = Vec::with_capacity(records.len());
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("{}:{}", table.id, table.schema_version).as_bytes());
        for field in records {
            let field_type = registry.type_of(&field)?;
            hasher.update(
                format!(
                    "|{}:{}:{}:{}:{}",
                    field.id,
                    field.type_tag,
                    field.name,
                    field.options,
                    field.tsvector_column_created
                )
                .as_bytes(),
            );
            let attribute = if options.attribute_names {
                field.name.clone()
            } else {
                field.db_column()
            };
            fields.push(ModelField {
                storage: field_type.storage(&field),
                attribute,
                field,
                field_type,
            });
        }

        let mut links = HashMap::new();
        for model_field in &fields {
            if let Storage::Relation {
                target: RelationTarget::Table(target_id),
                ..
            } = &model_field.storage
            {
                if let Some(display) = link_display(exec, registry, *target_id).await? {
                    links.insert(model_field.field.id, display);
                }
            }
        }

        let mut model = GeneratedModel {
            table: table.clone(),
            options: options.clone(),
            fields,
            links,
            lookups: Vec::new(),
            formulas: Vec::new(),
            fingerprint: hasher.finalize().to_hex().to_string(),
        };
        if options.field_ids.is_none() {
            model.plan_formulas(exec, registry).await?;
        }
        Ok(model)
    }

    async fn plan_formulas<E: Executor + ?Sized>(
        &mut self,
        exec: &mut E,
        registry: &FieldTypeRegistry,
    ) -> Result<(), TableError> {
        let mut expressions: HashMap<FieldId, (usize, Expr)> = HashMap::new();
        for (index, model_field) in self.fields.iter().enumerate() {
            if model_field.field.error.is_some() {
                continue;
            }
            if let Ok(Some(expr)) = model_field.field_type.expression(&model_field.field) {
                expressions.insert(model_field.field.id, (index, expr));
            }
        }

        // Order formulas reading other formulas of this table.
        let mut local = FieldDependencyGraph::new();
        let mut wanted: BTreeSet<(String, String)> = BTreeSet::new();
        for (field_id, (_, expr)) in &expressions {
            for reference in expr.references() {
                match reference {
                    FormulaReference::Field(name) => {
                        if let Some(dep) = self.fields.iter().find(|f| f.field.name == name) {
                            if expressions.contains_key(&dep.field.id) {
                                local.add_edge(*field_id, dep.field.id);
                            }
                        }
                    }
                    FormulaReference::Lookup { via, target } => {
                        wanted.insert((via, target));
                    }
                }
            }
        }
        let plan = local.evaluation_order(&expressions.keys().copied().collect());
        self.formulas = plan
            .order
            .iter()
            .filter_map(|id| expressions.remove(id))
            .map(|(index, expr)| FormulaPlan { index, expr })
            .collect();

        for (via, target) in wanted {
            let Some(link) = self.fields.iter().find(|f| f.field.name == via) else {
                continue;
            };
            let Storage::Relation {
                relation: join,
                target: RelationTarget::Table(target_table),
            } = &link.storage
            else {
                continue;
            };
            let target_fields = catalog::fields_for_table(exec, *target_table).await?;
            let Some(target_field) = target_fields.into_iter().find(|f| f.name == target) else {
                continue;
            };
            let target_type = registry.type_of(&target_field)?;
            // Lookups read column-stored targets only.
            let Storage::Column(column) = target_type.storage(&target_field) else {
                continue;
            };
            self.lookups.push(LookupSpec {
                via,
                target,
                join: join.clone(),
                target_relation: catalog::relation_name(*target_table),
                target_column: column.name,
                target_field,
                target_type,
            });
        }
        Ok(())
    }

    pub fn table(&self) -> &TableRecord {
        &self.table
    }

    pub fn table_id(&self) -> TableId {
        self.table.id
    }

    pub fn schema_version(&self) -> i64 {
        self.table.schema_version
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Hash of the compiled field set.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn relation_name(&self) -> String {
        self.table.relation_name()
    }

    pub fn fields(&self) -> &[ModelField] {
        &self.fields
    }

    pub fn field_by_id(&self, field_id: FieldId) -> Option<&ModelField> {
        self.fields.iter().find(|f| f.field.id == field_id)
    }

    pub fn field_by_attribute(&self, attribute: &str) -> Option<&ModelField> {
        self.fields
            .iter()
            .find(|f| f.attribute == attribute)
            .or_else(|| self.fields.iter().find(|f| f.field.db_column() == attribute))
    }

    /// Formula fields this model recomputes, in evaluation order.
    pub fn formula_field_ids(&self) -> Vec<FieldId> {
        self.formulas
            .iter()
            .map(|p| self.fields[p.index].field.id)
            .collect()
    }

    fn has_marker(&self) -> bool {
        self.table.needs_background_update_column_added
    }

    /// Fields with a maintained search vector column.
    pub(crate) fn search_fields(&self) -> impl Iterator<Item = (usize, &ModelField)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.field.tsvector_column_created)
    }

    pub(crate) fn search_text(&self, index: usize, rendered: &JsonValue) -> Option<String> {
        let model_field = &self.fields[index];
        model_field
            .field_type
            .search_text(&model_field.field, rendered)
    }

    pub async fn count<E: Executor + ?Sized>(&self, exec: &mut E) -> Result<u64, TableError> {
        exec.count(&Query::for_table(self.relation_name())).await
    }

    pub async fn get_row<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        row_id: RowId,
    ) -> Result<Option<RowData>, TableError> {
        let query = Query::for_table(self.relation_name()).eq("id", row_id);
        let rows = exec.fetch(&query).await?;
        let loaded = self.load_rows(exec, rows, true).await?;
        Ok(loaded.into_iter().next().map(|row| self.to_row_data(row)))
    }

    pub async fn list_rows<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        query: &RowQuery,
    ) -> Result<Vec<RowData>, TableError> {
        let mut physical = Query::for_table(self.relation_name());
        for filter in &query.filters {
            physical = physical.filter(self.translate_filter(filter)?);
        }
        for (attribute, order) in &query.order_by {
            physical = physical.order_by(self.physical_column(attribute)?, *order);
        }
        physical = physical.order_by("id", Order::Asc);
        physical.limit = query.limit;
        physical.offset = query.offset;
        self.fetch_rows(exec, &physical).await
    }

    /// Rows whose search vectors match every term of `text`.
    pub async fn search<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        text: &str,
        limit: Option<u64>,
    ) -> Result<Vec<RowData>, TableError> {
        let matches: Vec<Filter> = self
            .search_fields()
            .map(|(_, f)| Filter::Matches(tsvector_column(f.field.id), text.to_string()))
            .collect();
        if matches.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = Query::for_table(self.relation_name())
            .filter(Filter::Any(matches))
            .order_by("id", Order::Asc);
        query.limit = limit;
        self.fetch_rows(exec, &query).await
    }

    async fn fetch_rows<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        query: &Query,
    ) -> Result<Vec<RowData>, TableError> {
        let rows = exec.fetch(query).await?;
        let loaded = self.load_rows(exec, rows, true).await?;
        Ok(loaded.into_iter().map(|row| self.to_row_data(row)).collect())
    }

    fn physical_column(&self, attribute: &str) -> Result<String, TableError> {
        if attribute == "id" || attribute == CREATED_ON_COLUMN || attribute == UPDATED_ON_COLUMN {
            return Ok(attribute.to_string());
        }
        let model_field = self
            .field_by_attribute(attribute)
            .ok_or_else(|| TableError::invalid_value(attribute, "unknown field"))?;
        model_field
            .column_name()
            .map(str::to_string)
            .ok_or_else(|| TableError::invalid_value(attribute, "field cannot be filtered or sorted"))
    }

    fn translate_filter(&self, filter: &Filter) -> Result<Filter, TableError> {
        Ok(match filter {
            Filter::Eq(a, v) => Filter::Eq(self.physical_column(a)?, v.clone()),
            Filter::Ne(a, v) => Filter::Ne(self.physical_column(a)?, v.clone()),
            Filter::Gt(a, v) => Filter::Gt(self.physical_column(a)?, v.clone()),
            Filter::Gte(a, v) => Filter::Gte(self.physical_column(a)?, v.clone()),
            Filter::Lt(a, v) => Filter::Lt(self.physical_column(a)?, v.clone()),
            Filter::Lte(a, v) => Filter::Lte(self.physical_column(a)?, v.clone()),
            Filter::In(a, v) => Filter::In(self.physical_column(a)?, v.clone()),
            Filter::IsNull(a) => Filter::IsNull(self.physical_column(a)?),
            Filter::IsNotNull(a) => Filter::IsNotNull(self.physical_column(a)?),
            Filter::Matches(a, text) => {
                let model_field = self
                    .field_by_attribute(a)
                    .filter(|f| f.field.tsvector_column_created)
                    .ok_or_else(|| TableError::invalid_value(a.as_str(), "field is not searchable"))?;
                Filter::Matches(tsvector_column(model_field.field.id), text.clone())
            }
            Filter::Any(filters) => Filter::Any(
                filters
                    .iter()
                    .map(|f| self.translate_filter(f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    fn to_row_data(&self, row: LoadedRow) -> RowData {
        let mut values = JsonMap::new();
        for (model_field, value) in self.fields.iter().zip(row.values) {
            values.insert(model_field.attribute.clone(), value);
        }
        RowData { id: row.id, values }
    }

    /// Render stored rows. Related data is fetched in one query per field
    /// for the whole batch; relation items keep the order of their join rows.
    /// With `repair`, single select references to deleted options are
    /// cleared in storage.
    pub(crate) async fn load_rows<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        rows: Vec<Row>,
        repair: bool,
    ) -> Result<Vec<LoadedRow>, TableError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<RowId> = rows.iter().map(row_id).collect::<Result<_, _>>()?;

        // Single select options referenced by the batch.
        let mut option_ids: BTreeSet<i64> = BTreeSet::new();
        for model_field in &self.fields {
            if let Storage::SelectOption(column) = &model_field.storage {
                option_ids.extend(rows.iter().filter_map(|r| r.get(&column.name)?.as_i64()));
            }
        }

        // Join rows per relation field, in join order.
        let mut joined: HashMap<FieldId, HashMap<RowId, Vec<i64>>> = HashMap::new();
        let mut linked_rows: HashMap<TableId, BTreeSet<i64>> = HashMap::new();
        for model_field in &self.fields {
            let Storage::Relation { relation, target } = &model_field.storage else {
                continue;
            };
            let join_rows = exec
                .fetch(
                    &Query::for_table(relation.as_str())
                        .r#in("row_id", ids.as_slice())
                        .order_by("id", Order::Asc),
                )
                .await?;
            let mut per_row: HashMap<RowId, Vec<i64>> = HashMap::new();
            for join in join_rows {
                let (Some(row), Some(target_id)) = (
                    join.get("row_id").and_then(JsonValue::as_i64),
                    join.get("target_id").and_then(JsonValue::as_i64),
                ) else {
                    continue;
                };
                per_row.entry(row).or_default().push(target_id);
                match target {
                    RelationTarget::SelectOptions => {
                        option_ids.insert(target_id);
                    }
                    RelationTarget::Table(table_id) => {
                        linked_rows.entry(*table_id).or_default().insert(target_id);
                    }
                }
            }
            joined.insert(model_field.field.id, per_row);
        }

        let options: HashMap<i64, SelectOptionRecord> = catalog::select_options_by_ids(
            exec,
            &option_ids.into_iter().collect::<Vec<_>>(),
        )
        .await?
        .into_iter()
        .map(|o| (o.id, o))
        .collect();

        // Labels of linked rows.
        let mut labels: HashMap<(FieldId, i64), JsonValue> = HashMap::new();
        for (field_id, display) in &self.links {
            let Some(Storage::Relation {
                target: RelationTarget::Table(table_id),
                ..
            }) = self.field_by_id(*field_id).map(|f| &f.storage)
            else {
                continue;
            };
            let Some(targets) = linked_rows.get(table_id) else {
                continue;
            };
            let targets: Vec<i64> = targets.iter().copied().collect();
            let target_rows = exec
                .fetch(&Query::for_table(display.relation.as_str()).r#in("id", targets))
                .await?;
            for target_row in target_rows {
                let id = row_id(&target_row)?;
                let stored = target_row.get(&display.column).unwrap_or(&JsonValue::Null);
                labels.insert(
                    (*field_id, id),
                    display.field_type.render(&display.field, stored),
                );
            }
        }

        let mut dangling: Vec<(RowId, usize, i64)> = Vec::new();
        let mut loaded = Vec::with_capacity(rows.len());
        for (row, id) in rows.into_iter().zip(ids) {
            let mut values = Vec::with_capacity(self.fields.len());
            for (index, model_field) in self.fields.iter().enumerate() {
                let field = &model_field.field;
                let value = match &model_field.storage {
                    Storage::Column(column) => {
                        let stored = row.get(&column.name).unwrap_or(&JsonValue::Null);
                        if stored.is_null() && model_field.field_type.touch_on_write() {
                            row.get(UPDATED_ON_COLUMN).cloned().unwrap_or(JsonValue::Null)
                        } else {
                            model_field.field_type.render(field, stored)
                        }
                    }
                    Storage::SelectOption(column) => {
                        match row.get(&column.name).and_then(JsonValue::as_i64) {
                            None => JsonValue::Null,
                            Some(option_id) => match options.get(&option_id) {
                                Some(option) if option.field_id == field.id => option.to_json(),
                                _ => {
                                    dangling.push((id, index, option_id));
                                    JsonValue::Null
                                }
                            },
                        }
                    }
                    Storage::Relation { target, .. } => {
                        let targets = joined
                            .get(&field.id)
                            .and_then(|per_row| per_row.get(&id))
                            .map(Vec::as_slice)
                            .unwrap_or_default();
                        let items = targets
                            .iter()
                            .filter_map(|target_id| match target {
                                RelationTarget::SelectOptions => options
                                    .get(target_id)
                                    .filter(|o| o.field_id == field.id)
                                    .map(SelectOptionRecord::to_json),
                                RelationTarget::Table(_) => Some(serde_json::json!({
                                    "id": target_id,
                                    "value": labels
                                        .get(&(field.id, *target_id))
                                        .cloned()
                                        .unwrap_or(JsonValue::Null),
                                })),
                            })
                            .collect();
                        JsonValue::Array(items)
                    }
                };
                values.push(value);
            }
            loaded.push(LoadedRow { id, raw: row, values });
        }

        if repair {
            for (row, index, option_id) in dangling {
                self.clear_dangling_option(exec, row, index, option_id).await?;
            }
        }
        Ok(loaded)
    }

    async fn clear_dangling_option<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        row: RowId,
        index: usize,
        option_id: i64,
    ) -> Result<(), TableError> {
        let model_field = &self.fields[index];
        let Some(column) = model_field.column_name() else {
            return Ok(());
        };
        // Re-check the stored value so a concurrent write is not clobbered.
        let cleared = exec
            .update(
                &Update::for_table(self.relation_name())
                    .set(column, Value::Null(ColumnType::BigInt))
                    .eq("id", row)
                    .eq(column, option_id),
            )
            .await?;
        if cleared > 0 {
            info!(
                table_id = self.table.id,
                field_id = model_field.field.id,
                row_id = row,
                option_id,
                "Cleared reference to a deleted select option"
            );
        }
        Ok(())
    }

    /// Validate and convert caller values into column assignments and
    /// relation writes.
    async fn prepare_write<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        values: &JsonMap<String, JsonValue>,
        now: &StorageDatetime,
    ) -> Result<(Vec<(String, Value)>, Vec<(usize, Vec<i64>)>), TableError> {
        let mut assignments = Vec::new();
        let mut relations = Vec::new();
        let mut select_checks: Vec<(usize, i64)> = Vec::new();

        for (key, raw) in values {
            let (index, model_field) = self
                .fields
                .iter()
                .enumerate()
                .find(|(_, f)| f.attribute == *key)
                .or_else(|| {
                    self.fields
                        .iter()
                        .enumerate()
                        .find(|(_, f)| f.field.db_column() == *key)
                })
                .ok_or_else(|| TableError::invalid_value(key.as_str(), "unknown field"))?;
            let field = &model_field.field;
            if model_field.field_type.read_only() {
                return Err(TableError::invalid_value(field.name.as_str(), "field is read only"));
            }
            let prepared = model_field.field_type.prepare_value(field, raw)?;
            match &model_field.storage {
                Storage::Column(column) => {
                    let value = Value::from_json(&prepared, column.column_type)
                        .map_err(|e| TableError::invalid_value(field.name.as_str(), e.to_string()))?;
                    assignments.push((column.name.clone(), value));
                }
                Storage::SelectOption(column) => {
                    if let Some(option_id) = prepared.as_i64() {
                        select_checks.push((index, option_id));
                    }
                    let value = Value::from_json(&prepared, ColumnType::BigInt)
                        .map_err(|e| TableError::invalid_value(field.name.as_str(), e.to_string()))?;
                    assignments.push((column.name.clone(), value));
                }
                Storage::Relation { target, .. } => {
                    let ids: Vec<i64> = prepared
                        .as_array()
                        .map(|items| items.iter().filter_map(JsonValue::as_i64).collect())
                        .unwrap_or_default();
                    match target {
                        RelationTarget::SelectOptions => {
                            select_checks.extend(ids.iter().map(|id| (index, *id)));
                        }
                        RelationTarget::Table(table_id) => {
                            let found = exec
                                .count(
                                    &Query::for_table(catalog::relation_name(*table_id))
                                        .r#in("id", ids.as_slice()),
                                )
                                .await?;
                            if !ids.is_empty() && found != ids.len() as u64 {
                                return Err(TableError::invalid_value(
                                    field.name.as_str(),
                                    "links to rows that do not exist",
                                ));
                            }
                        }
                    }
                    relations.push((index, ids));
                }
            }
        }

        if !select_checks.is_empty() {
            let wanted: Vec<i64> = select_checks.iter().map(|(_, id)| *id).collect();
            let options: HashMap<i64, i64> = catalog::select_options_by_ids(exec, &wanted)
                .await?
                .into_iter()
                .map(|o| (o.id, o.field_id))
                .collect();
            for (index, option_id) in select_checks {
                if options.get(&option_id) != Some(&self.fields[index].field.id) {
                    return Err(TableError::SelectOptionNotFound(option_id));
                }
            }
        }

        for model_field in &self.fields {
            if model_field.field_type.touch_on_write() {
                if let Some(column) = model_field.column_name() {
                    assignments.push((column.to_string(), Value::Datetime(now.clone())));
                }
            }
        }
        assignments.push((UPDATED_ON_COLUMN.to_string(), Value::Datetime(now.clone())));
        if self.has_marker() {
            assignments.push((NEEDS_BACKGROUND_UPDATE_COLUMN.to_string(), Value::Bool(true)));
        }
        Ok((assignments, relations))
    }

    async fn write_relations<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        row: RowId,
        relations: Vec<(usize, Vec<i64>)>,
    ) -> Result<(), TableError> {
        for (index, ids) in relations {
            let Storage::Relation { relation, .. } = &self.fields[index].storage else {
                continue;
            };
            // Surviving links keep their join row, and with it their position.
            let existing: BTreeSet<i64> = exec
                .fetch(&Query::for_table(relation.as_str()).eq("row_id", row))
                .await?
                .iter()
                .filter_map(|join| join.get("target_id").and_then(JsonValue::as_i64))
                .collect();
            let mut wanted = BTreeSet::new();
            let added: Vec<i64> = ids.into_iter().filter(|id| wanted.insert(*id)).collect();
            let removed: Vec<i64> = existing.difference(&wanted).copied().collect();
            if !removed.is_empty() {
                exec.delete(
                    &Delete::for_table(relation.as_str())
                        .eq("row_id", row)
                        .r#in("target_id", removed.as_slice()),
                )
                .await?;
            }
            for target in added.into_iter().filter(|id| !existing.contains(id)) {
                exec.insert(
                    relation,
                    &[
                        ("row_id".to_string(), Value::Int(row)),
                        ("target_id".to_string(), Value::Int(target)),
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Insert a row. Keys are model attributes (or `field_{id}` column names).
    pub async fn insert_row<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        values: &JsonMap<String, JsonValue>,
    ) -> Result<RowData, TableError> {
        let now = StorageDatetime::now();
        let (mut assignments, relations) = self.prepare_write(exec, values, &now).await?;
        assignments.push((CREATED_ON_COLUMN.to_string(), Value::Datetime(now.clone())));

        let row = exec.insert(&self.relation_name(), &assignments).await?;
        let id = row_id(&row)?;
        self.write_relations(exec, id, relations).await?;
        self.recompute(exec, None, Some(std::slice::from_ref(&id)), &now)
            .await?;
        self.get_row(exec, id)
            .await?
            .ok_or_else(|| TableError::NotFound(format!("row {}", id)))
    }

    pub async fn update_row<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        id: RowId,
        values: &JsonMap<String, JsonValue>,
    ) -> Result<RowData, TableError> {
        let now = StorageDatetime::now();
        let (assignments, relations) = self.prepare_write(exec, values, &now).await?;
        let updated = exec
            .update(&Update {
                table: self.relation_name(),
                assignments,
                filters: vec![Filter::Eq("id".to_string(), Value::Int(id))],
            })
            .await?;
        if updated == 0 {
            return Err(TableError::NotFound(format!("row {}", id)));
        }
        self.write_relations(exec, id, relations).await?;
        self.recompute(exec, None, Some(std::slice::from_ref(&id)), &now)
            .await?;
        self.get_row(exec, id)
            .await?
            .ok_or_else(|| TableError::NotFound(format!("row {}", id)))
    }

    /// Delete a row and its outgoing relation entries.
    pub async fn delete_row<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        id: RowId,
    ) -> Result<(), TableError> {
        for model_field in &self.fields {
            if let Storage::Relation { relation, .. } = &model_field.storage {
                exec.delete(&Delete::for_table(relation.as_str()).eq("row_id", id))
                    .await?;
            }
        }
        let deleted = exec
            .delete(&Delete::for_table(self.relation_name()).eq("id", id))
            .await?;
        if deleted == 0 {
            return Err(TableError::NotFound(format!("row {}", id)));
        }
        Ok(())
    }

    /// Recompute formula values and store the ones that changed. `only`
    /// restricts which formulas run; `rows` restricts which rows are
    /// visited. Returns the number of rows written.
    pub async fn recompute<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        only: Option<&BTreeSet<FieldId>>,
        rows: Option<&[RowId]>,
        now: &StorageDatetime,
    ) -> Result<u64, TableError> {
        let plans: Vec<&FormulaPlan> = self
            .formulas
            .iter()
            .filter(|p| only.is_none_or(|ids| ids.contains(&self.fields[p.index].field.id)))
            .collect();
        if plans.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut cursor: RowId = 0;
        loop {
            let mut query = Query::for_table(self.relation_name())
                .gt("id", cursor)
                .order_by("id", Order::Asc)
                .limit(RECOMPUTE_BATCH_SIZE);
            if let Some(ids) = rows {
                query = query.r#in("id", ids);
            }
            let batch = exec.fetch(&query).await?;
            let batch_len = batch.len() as u64;
            let loaded = self.load_rows(exec, batch, false).await?;
            let Some(last) = loaded.last() else {
                break;
            };
            cursor = last.id;

            let ids: Vec<RowId> = loaded.iter().map(|r| r.id).collect();
            let lookups = self.load_lookups(exec, &ids).await?;
            for row in &loaded {
                let mut ctx = RowContext {
                    values: self
                        .fields
                        .iter()
                        .zip(&row.values)
                        .map(|(f, v)| (f.field.name.as_str(), v.clone()))
                        .collect(),
                    lookups: lookups.get(&row.id),
                    now,
                };
                let mut assignments = Vec::new();
                for plan in &plans {
                    let model_field = &self.fields[plan.index];
                    let value = plan.expr.evaluate(&ctx);
                    let column = model_field.column_name().unwrap_or_default();
                    if row.raw.get(column).unwrap_or(&JsonValue::Null) != &value {
                        assignments.push((column.to_string(), Value::Json(value.clone())));
                    }
                    ctx.values.insert(model_field.field.name.as_str(), value);
                }
                if assignments.is_empty() {
                    continue;
                }
                if self.has_marker() {
                    assignments.push((NEEDS_BACKGROUND_UPDATE_COLUMN.to_string(), Value::Bool(true)));
                }
                exec.update(&Update {
                    table: self.relation_name(),
                    assignments,
                    filters: vec![Filter::Eq("id".to_string(), Value::Int(row.id))],
                })
                .await?;
                written += 1;
            }
            if batch_len < RECOMPUTE_BATCH_SIZE {
                break;
            }
        }
        Ok(written)
    }

    async fn load_lookups<E: Executor + ?Sized>(
        &self,
        exec: &mut E,
        ids: &[RowId],
    ) -> Result<HashMap<RowId, HashMap<(String, String), JsonValue>>, TableError> {
        let mut out: HashMap<RowId, HashMap<(String, String), JsonValue>> = HashMap::new();
        for spec in &self.lookups {
            let joins = exec
                .fetch(
                    &Query::for_table(spec.join.as_str())
                        .r#in("row_id", ids)
                        .order_by("id", Order::Asc),
                )
                .await?;
            let pairs: Vec<(RowId, i64)> = joins
                .iter()
                .filter_map(|j| {
                    Some((
                        j.get("row_id")?.as_i64()?,
                        j.get("target_id")?.as_i64()?,
                    ))
                })
                .collect();
            let targets: BTreeSet<i64> = pairs.iter().map(|(_, t)| *t).collect();
            let target_rows = exec
                .fetch(
                    &Query::for_table(spec.target_relation.as_str())
                        .r#in("id", targets.into_iter().collect::<Vec<_>>()),
                )
                .await?;
            let mut rendered: HashMap<i64, JsonValue> = HashMap::new();
            for target_row in target_rows {
                let stored = target_row
                    .get(&spec.target_column)
                    .unwrap_or(&JsonValue::Null);
                rendered.insert(
                    row_id(&target_row)?,
                    spec.target_type.render(&spec.target_field, stored),
                );
            }

            let mut per_row: HashMap<RowId, Vec<JsonValue>> = HashMap::new();
            for (row, target) in pairs {
                if let Some(value) = rendered.get(&target) {
                    per_row.entry(row).or_default().push(value.clone());
                }
            }
            for id in ids {
                let values = per_row.remove(id).unwrap_or_default();
                out.entry(*id)
                    .or_default()
                    .insert((spec.via.clone(), spec.target.clone()), JsonValue::Array(values));
            }
        }
        Ok(out)
    }
}

async fn link_display<E: Executor + ?Sized>(
    exec: &mut E,
    registry: &FieldTypeRegistry,
    target_table: TableId,
) -> Result<Option<LinkDisplay>, TableError> {
    let fields = catalog::fields_for_table(exec, target_table).await?;
    let Some(primary) = fields.into_iter().find(|f| f.is_primary) else {
        return Ok(None);
    };
    let field_type = registry.type_of(&primary)?;
    let Storage::Column(column) = field_type.storage(&primary) else {
        return Ok(None);
    };
    Ok(Some(LinkDisplay {
        relation: catalog::relation_name(target_table),
        column: column.name,
        field: primary,
        field_type,
    }))
}

/// Recompute `order` field by field, compiling each table's model once
/// against `exec`. Fields of `skip_table`, trashed fields and fields of
/// trashed tables are left alone. Returns the number of rows written.
pub async fn recompute_fields<E: Executor + ?Sized>(
    exec: &mut E,
    registry: &FieldTypeRegistry,
    order: &[FieldId],
    skip_table: Option<TableId>,
    now: &StorageDatetime,
) -> Result<u64, TableError> {
    if order.is_empty() {
        return Ok(0);
    }
    let fields: HashMap<FieldId, FieldRecord> = catalog::fields_by_ids(exec, order)
        .await?
        .into_iter()
        .map(|f| (f.id, f))
        .collect();

    let mut models: HashMap<TableId, Option<GeneratedModel>> = HashMap::new();
    let mut written = 0;
    for field_id in order {
        let Some(field) = fields.get(field_id) else {
            continue;
        };
        if field.trashed || Some(field.table_id) == skip_table {
            continue;
        }
        if !models.contains_key(&field.table_id) {
            let model = match catalog::table(exec, field.table_id).await {
                Ok(table) => {
                    Some(GeneratedModel::compile(exec, registry, &table, &ModelOptions::default()).await?)
                }
                Err(TableError::TableNotFound(_)) => None,
                Err(e) => return Err(e),
            };
            models.insert(field.table_id, model);
        }
        if let Some(Some(model)) = models.get(&field.table_id) {
            let only = BTreeSet::from([*field_id]);
            written += model.recompute(exec, Some(&only), None, now).await?;
        }
    }
    Ok(written)
}
