//! SQL text for the executor traits.
//!
//! Everything here is pure string building so it can be tested without a
//! server. Parameters are collected alongside the text and bound later by
//! [`crate::bind`].

use dynamic_table::{
    ColumnDef, ColumnDefault, ColumnType, Conversion, Delete, Filter, IndexDef, IndexKind, Order,
    Query, Update, Value,
};
use serde_json::Value as JsonValue;

/// Text search configuration used for every search vector and query.
pub const TEXT_SEARCH_CONFIG: &str = "simple";

/// SQL text with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Push a parameter and return the expression referring to it.
    fn bind(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        placeholder(value, self.params.len())
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Expression for parameter `$n` carrying `value`. Values whose storage
/// differs from their bound representation are converted in SQL.
fn placeholder(value: &Value, n: usize) -> String {
    match value {
        Value::Interval(_) | Value::Null(ColumnType::Interval) => {
            format!("(${}::double precision * interval '1 second')", n)
        }
        Value::SearchVector(_) => format!("to_tsvector('{}', ${})", TEXT_SEARCH_CONFIG, n),
        Value::Null(ColumnType::TsVector) => format!("${}::tsvector", n),
        _ => format!("${}", n),
    }
}

pub fn pg_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Serial => "BIGSERIAL",
        ColumnType::BigInt => "BIGINT",
        ColumnType::Double => "DOUBLE PRECISION",
        ColumnType::Text => "TEXT",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Interval => "INTERVAL",
        ColumnType::Json => "JSONB",
        ColumnType::TsVector => "TSVECTOR",
    }
}

/// Map an `information_schema.columns.data_type` back to a column type.
pub fn column_type_from_pg(data_type: &str, is_serial: bool) -> Option<ColumnType> {
    Some(match data_type {
        "bigint" | "integer" | "smallint" if is_serial => ColumnType::Serial,
        "bigint" | "integer" | "smallint" => ColumnType::BigInt,
        "double precision" | "real" | "numeric" => ColumnType::Double,
        "text" | "character varying" | "character" => ColumnType::Text,
        "boolean" => ColumnType::Boolean,
        "timestamp with time zone" | "timestamp without time zone" => ColumnType::Timestamp,
        "interval" => ColumnType::Interval,
        "jsonb" | "json" => ColumnType::Json,
        "tsvector" => ColumnType::TsVector,
        _ => return None,
    })
}

fn default_literal(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => quote_literal(s),
        other => format!("{}::jsonb", quote_literal(&other.to_string())),
    }
}

fn default_sql(default: &ColumnDefault) -> Option<String> {
    match default {
        ColumnDefault::None => None,
        ColumnDefault::Value(value) => Some(default_literal(value)),
        ColumnDefault::Sequence(name) => Some(format!("nextval({})", quote_literal(name))),
    }
}

/// Parse an `information_schema.columns.column_default` expression.
pub fn parse_column_default(expression: Option<&str>) -> ColumnDefault {
    let Some(expression) = expression.map(str::trim) else {
        return ColumnDefault::None;
    };
    if let Some(rest) = expression.strip_prefix("nextval('") {
        if let Some(end) = rest.find('\'') {
            return ColumnDefault::Sequence(rest[..end].replace("''", "'"));
        }
    }
    match expression {
        "true" => ColumnDefault::Value(JsonValue::Bool(true)),
        "false" => ColumnDefault::Value(JsonValue::Bool(false)),
        _ => match serde_json::from_str::<serde_json::Number>(expression) {
            Ok(n) => ColumnDefault::Value(JsonValue::Number(n)),
            Err(_) => ColumnDefault::None,
        },
    }
}

/// Column definition as it appears in CREATE TABLE and ADD COLUMN.
pub fn column_sql(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), pg_type(column.column_type));
    if column.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = default_sql(&column.default) {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default);
    }
    sql
}

pub fn create_table(table: &str, columns: &[ColumnDef]) -> String {
    let columns: Vec<String> = columns.iter().map(column_sql).collect();
    format!("CREATE TABLE {} ({})", quote_ident(table), columns.join(", "))
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE {}", quote_ident(table))
}

pub fn add_column(table: &str, column: &ColumnDef) -> String {
    format!("ALTER TABLE {} ADD COLUMN {}", quote_ident(table), column_sql(column))
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table),
        quote_ident(column)
    )
}

/// `USING` expression converting the current value of `column` to `to`.
/// Values that do not convert become null.
fn cast_expression(column: &str, to: ColumnType) -> String {
    let col = quote_ident(column);
    let text = format!("{}::text", col);
    let numeric = r"'^\s*[-+]?(\d+\.?\d*|\.\d+)([eE][-+]?\d+)?\s*$'";
    match to {
        ColumnType::Text => format!(
            "CASE WHEN jsonb_typeof(to_jsonb({col})) = 'string' THEN {text} ELSE to_jsonb({col})::text END"
        ),
        ColumnType::Serial | ColumnType::BigInt => format!(
            "CASE WHEN lower({text}) IN ('true', 'false') THEN NULL \
             WHEN {text} ~ {numeric} THEN round(trim({text})::numeric)::bigint END"
        ),
        ColumnType::Double => {
            format!("CASE WHEN {text} ~ {numeric} THEN trim({text})::double precision END")
        }
        ColumnType::Interval => format!(
            "CASE WHEN {text} ~ {numeric} THEN trim({text})::double precision * interval '1 second' END"
        ),
        ColumnType::Boolean => format!(
            "CASE WHEN lower(trim({text})) IN ('t', 'true', 'y', 'yes', 'on', '1', 'checked') THEN TRUE \
             WHEN lower(trim({text})) IN ('f', 'false', 'n', 'no', 'off', '0', '') THEN FALSE \
             WHEN {text} ~ {numeric} THEN trim({text})::double precision <> 0 END"
        ),
        ColumnType::Timestamp => format!(
            "CASE WHEN {text} ~ '^\\s*\\d{{4}}-\\d{{2}}-\\d{{2}}' THEN trim({text})::timestamptz END"
        ),
        ColumnType::Json => format!("to_jsonb({col})"),
        ColumnType::TsVector => "NULL".to_string(),
    }
}

/// Statements replacing the definition of `column.name`. The default is
/// dropped first so a sequence it references can be dropped afterwards.
pub fn alter_column(table: &str, column: &ColumnDef, conversion: Conversion) -> Vec<String> {
    let table = quote_ident(table);
    let name = quote_ident(&column.name);
    let mut statements = vec![format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, name)];
    let using = match conversion {
        Conversion::Keep => None,
        Conversion::Cast => Some(cast_expression(&column.name, column.column_type)),
        Conversion::Clear => Some("NULL".to_string()),
    };
    let data_type = match column.column_type {
        ColumnType::Serial => "BIGINT",
        other => pg_type(other),
    };
    statements.push(match using {
        Some(using) => format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
            table, name, data_type, using
        ),
        None => format!("ALTER TABLE {} ALTER COLUMN {} TYPE {}", table, name, data_type),
    });
    if let Some(default) = default_sql(&column.default) {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
            table, name, default
        ));
        if !column.nullable {
            statements.push(format!(
                "UPDATE {} SET {} = DEFAULT WHERE {} IS NULL",
                table, name, name
            ));
        }
    }
    statements.push(if column.nullable {
        format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL", table, name)
    } else {
        format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", table, name)
    });
    statements
}

pub fn create_sequence(name: &str) -> String {
    format!("CREATE SEQUENCE IF NOT EXISTS {}", quote_ident(name))
}

pub fn drop_sequence(name: &str) -> String {
    format!("DROP SEQUENCE IF EXISTS {}", quote_ident(name))
}

pub fn create_index(index: &IndexDef) -> String {
    let method = match index.kind {
        IndexKind::BTree => "btree",
        IndexKind::Gin => "gin",
    };
    let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING {} ({})",
        quote_ident(&index.name),
        quote_ident(&index.table),
        method,
        columns.join(", ")
    )
}

pub fn drop_index(name: &str) -> String {
    format!("DROP INDEX IF EXISTS {}", quote_ident(name))
}

// ==================== Row statements ====================

fn filter_sql(statement: &mut Statement, filter: &Filter) -> String {
    let compare = |statement: &mut Statement, field: &str, op: &str, value: &Value| {
        format!("{} {} {}", quote_ident(field), op, statement.bind(value))
    };
    match filter {
        Filter::Eq(field, value) => compare(statement, field, "=", value),
        Filter::Ne(field, value) => compare(statement, field, "<>", value),
        Filter::Gt(field, value) => compare(statement, field, ">", value),
        Filter::Gte(field, value) => compare(statement, field, ">=", value),
        Filter::Lt(field, value) => compare(statement, field, "<", value),
        Filter::Lte(field, value) => compare(statement, field, "<=", value),
        Filter::In(field, value) => {
            format!("{} = ANY({})", quote_ident(field), statement.bind(value))
        }
        Filter::IsNull(field) => format!("{} IS NULL", quote_ident(field)),
        Filter::IsNotNull(field) => format!("{} IS NOT NULL", quote_ident(field)),
        Filter::Matches(field, text) => {
            let param = statement.bind(&Value::String(text.clone()));
            format!(
                "{} @@ plainto_tsquery('{}', {})",
                quote_ident(field),
                TEXT_SEARCH_CONFIG,
                param
            )
        }
        Filter::Any(filters) if filters.is_empty() => "FALSE".to_string(),
        Filter::Any(filters) => {
            let clauses: Vec<String> = filters.iter().map(|f| filter_sql(statement, f)).collect();
            format!("({})", clauses.join(" OR "))
        }
    }
}

fn push_where(statement: &mut Statement, filters: &[Filter]) {
    if filters.is_empty() {
        return;
    }
    let clauses: Vec<String> = filters.iter().map(|f| filter_sql(statement, f)).collect();
    statement.sql.push_str(" WHERE ");
    statement.sql.push_str(&clauses.join(" AND "));
}

pub fn select(query: &Query) -> Statement {
    let mut statement = Statement::new();
    statement.sql = format!("SELECT * FROM {}", quote_ident(&query.table));
    push_where(&mut statement, &query.filters);
    if !query.order_by.is_empty() {
        let clauses: Vec<String> = query
            .order_by
            .iter()
            .map(|(field, order)| {
                let direction = match order {
                    Order::Asc => "ASC",
                    Order::Desc => "DESC",
                };
                format!("{} {}", quote_ident(field), direction)
            })
            .collect();
        statement.sql.push_str(" ORDER BY ");
        statement.sql.push_str(&clauses.join(", "));
    }
    if let Some(limit) = query.limit {
        statement.sql.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = query.offset {
        statement.sql.push_str(&format!(" OFFSET {}", offset));
    }
    if query.for_update {
        statement.sql.push_str(" FOR UPDATE");
    }
    statement
}

pub fn count(query: &Query) -> Statement {
    let mut statement = Statement::new();
    statement.sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&query.table));
    push_where(&mut statement, &query.filters);
    statement
}

pub fn insert(table: &str, values: &[(String, Value)]) -> Statement {
    let mut statement = Statement::new();
    if values.is_empty() {
        statement.sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING *", quote_ident(table));
        return statement;
    }
    let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
    let params: Vec<String> = values.iter().map(|(_, v)| statement.bind(v)).collect();
    statement.sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        quote_ident(table),
        columns.join(", "),
        params.join(", ")
    );
    statement
}

/// `None` when there is nothing to assign.
pub fn update(update: &Update) -> Option<Statement> {
    if update.assignments.is_empty() {
        return None;
    }
    let mut statement = Statement::new();
    let assignments: Vec<String> = update
        .assignments
        .iter()
        .map(|(column, value)| format!("{} = {}", quote_ident(column), statement.bind(value)))
        .collect();
    statement.sql = format!(
        "UPDATE {} SET {}",
        quote_ident(&update.table),
        assignments.join(", ")
    );
    push_where(&mut statement, &update.filters);
    Some(statement)
}

pub fn delete(delete: &Delete) -> Statement {
    let mut statement = Statement::new();
    statement.sql = format!("DELETE FROM {}", quote_ident(&delete.table));
    push_where(&mut statement, &delete.filters);
    statement
}

pub const TABLE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_name = $1)";

pub const COLUMNS: &str = "SELECT c.column_name::text, c.data_type::text, \
     (c.is_nullable = 'YES') AS nullable, c.column_default::text, \
     EXISTS (SELECT 1 FROM information_schema.table_constraints t \
         JOIN information_schema.key_column_usage k \
           ON k.constraint_name = t.constraint_name AND k.table_schema = t.table_schema \
         WHERE t.table_schema = current_schema() AND t.table_name = $1 \
           AND t.constraint_type = 'PRIMARY KEY' \
           AND k.column_name = c.column_name) AS primary_key \
     FROM information_schema.columns c \
     WHERE c.table_schema = current_schema() AND c.table_name = $1 \
     ORDER BY c.ordinal_position";

pub const ADVISORY_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn create_table_renders_keys_and_defaults() {
        let sql = create_table(
            "database_table_3",
            &[
                ColumnDef::primary_key("id"),
                ColumnDef::new("needs_background_update", ColumnType::Boolean)
                    .not_null()
                    .default_value(json!(true)),
                ColumnDef::new("field_9", ColumnType::BigInt).sequence("field_9_seq"),
            ],
        );
        assert_eq!(
            sql,
            "CREATE TABLE \"database_table_3\" (\"id\" BIGSERIAL PRIMARY KEY, \
             \"needs_background_update\" BOOLEAN NOT NULL DEFAULT TRUE, \
             \"field_9\" BIGINT DEFAULT nextval('field_9_seq'))"
        );
    }

    #[test]
    fn select_binds_filters_in_order() {
        let query = Query::for_table("database_table_3")
            .gt("id", 10i64)
            .eq("needs_background_update", true)
            .filter(Filter::Any(vec![
                Filter::IsNull("field_1".to_string()),
                Filter::In("field_2".to_string(), Value::Ints(vec![1, 2])),
            ]))
            .order_by("id", Order::Asc)
            .limit(50)
            .for_update();
        let statement = select(&query);
        assert_eq!(
            statement.sql,
            "SELECT * FROM \"database_table_3\" WHERE \"id\" > $1 \
             AND \"needs_background_update\" = $2 \
             AND (\"field_1\" IS NULL OR \"field_2\" = ANY($3)) \
             ORDER BY \"id\" ASC LIMIT 50 FOR UPDATE"
        );
        assert_eq!(
            statement.params,
            vec![Value::Int(10), Value::Bool(true), Value::Ints(vec![1, 2])]
        );
    }

    #[test]
    fn search_values_and_matches_use_text_search_functions() {
        let update = Update::for_table("database_table_3")
            .set("tsv_field_4", Value::SearchVector("hello".to_string()))
            .set("field_5", Value::Interval(90.0))
            .eq("id", 1i64);
        let statement = super::update(&update).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"database_table_3\" SET \"tsv_field_4\" = to_tsvector('simple', $1), \
             \"field_5\" = ($2::double precision * interval '1 second') WHERE \"id\" = $3"
        );

        let query = Query::for_table("database_table_3")
            .filter(Filter::Matches("tsv_field_4".to_string(), "hello world".to_string()));
        assert_eq!(
            select(&query).sql,
            "SELECT * FROM \"database_table_3\" WHERE \"tsv_field_4\" @@ plainto_tsquery('simple', $1)"
        );
    }

    #[test]
    fn empty_insert_and_update() {
        assert_eq!(
            insert("t", &[]).sql,
            "INSERT INTO \"t\" DEFAULT VALUES RETURNING *"
        );
        assert!(update(&Update::for_table("t").eq("id", 1i64)).is_none());
        let statement = insert("t", &[("name".to_string(), Value::from("a"))]);
        assert_eq!(statement.sql, "INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING *");
    }

    #[test]
    fn empty_disjunction_matches_nothing() {
        let statement = delete(&Delete::for_table("t").filter(Filter::Any(Vec::new())));
        assert_eq!(statement.sql, "DELETE FROM \"t\" WHERE FALSE");
        assert!(statement.params.is_empty());
    }

    #[test]
    fn alter_column_drops_default_before_converting() {
        let column = ColumnDef::new("field_7", ColumnType::Text);
        let statements = alter_column("database_table_1", &column, Conversion::Clear);
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"database_table_1\" ALTER COLUMN \"field_7\" DROP DEFAULT",
                "ALTER TABLE \"database_table_1\" ALTER COLUMN \"field_7\" TYPE TEXT USING NULL",
                "ALTER TABLE \"database_table_1\" ALTER COLUMN \"field_7\" DROP NOT NULL",
            ]
        );

        let statements = alter_column(
            "database_table_1",
            &ColumnDef::new("field_7", ColumnType::Double),
            Conversion::Cast,
        );
        assert!(statements[1].contains("TYPE DOUBLE PRECISION USING CASE WHEN"));
    }

    #[test]
    fn column_defaults_round_trip() {
        assert_eq!(
            parse_column_default(Some("nextval('field_9_seq'::regclass)")),
            ColumnDefault::Sequence("field_9_seq".to_string())
        );
        assert_eq!(
            parse_column_default(Some("true")),
            ColumnDefault::Value(json!(true))
        );
        assert_eq!(parse_column_default(None), ColumnDefault::None);
        assert_eq!(
            column_type_from_pg("bigint", true),
            Some(ColumnType::Serial)
        );
        assert_eq!(
            column_type_from_pg("timestamp with time zone", false),
            Some(ColumnType::Timestamp)
        );
        assert_eq!(column_type_from_pg("point", false), None);
    }

    #[test]
    fn gin_indexes() {
        let index = IndexDef::gin("t_tsv_idx", "t", "tsv_field_1");
        assert_eq!(
            create_index(&index),
            "CREATE INDEX IF NOT EXISTS \"t_tsv_idx\" ON \"t\" USING gin (\"tsv_field_1\")"
        );
    }
}
