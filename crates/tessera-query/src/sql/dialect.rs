//! Per-dialect hooks for the shared SQL translator.

use std::fmt;

use tessera_config::MySqlSettings;
use tessera_core::{LogicalType, Pattern, Property};

/// Everything that differs between SQL dialects.
///
/// The defaults describe a plain ANSI-ish engine: double-quoted identifiers,
/// `?` placeholders, `LIKE` and `REGEXP`.
pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn quote_char(&self) -> char {
        '"'
    }

    /// Quote an identifier, doubling embedded quote characters.
    fn quote(&self, ident: &str) -> String {
        let q = self.quote_char();
        let escaped = ident.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Placeholder for the parameter at 1-based `position`.
    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    fn like_operator(&self) -> &'static str {
        "LIKE"
    }

    /// Appended after a `LIKE` operand when backslash is not the default escape.
    fn like_escape(&self) -> &'static str {
        ""
    }

    /// `None` when the engine cannot evaluate regular expressions.
    fn regex_operator(&self) -> Option<&'static str> {
        Some("REGEXP")
    }

    fn regex_param(&self, pattern: &Pattern) -> String {
        pattern.source.clone()
    }

    fn false_literal(&self) -> &'static str {
        "FALSE"
    }

    fn true_literal(&self) -> &'static str {
        "TRUE"
    }

    /// Limit used when only an offset is requested.
    fn unbounded_limit(&self) -> &'static str {
        "ALL"
    }

    /// Function building a point from two placeholders.
    fn point_constructor(&self) -> Option<&'static str> {
        None
    }

    fn distance_function(&self, column: &str, point: &str) -> String {
        format!("ST_Distance({column}, {point})")
    }

    /// Select expression returning a point column as `[x, y]` JSON text.
    fn point_select(&self, column: &str) -> String {
        format!("JSON_ARRAY(ST_X({column}), ST_Y({column}))")
    }

    fn explain_prefix(&self) -> &'static str {
        "EXPLAIN"
    }

    /// Inserts report the new id with `RETURNING`.
    fn returning_id(&self) -> bool {
        false
    }

    /// Clause turning an insert into a native upsert.
    fn upsert_clause(&self) -> Option<&'static str> {
        None
    }

    fn empty_insert(&self, table: &str) -> String {
        format!("INSERT INTO {table} DEFAULT VALUES")
    }

    /// DDL type of a column; `None` when the type cannot be stored.
    fn column_type(&self, property: &Property) -> Option<String>;

    /// Definition of the implicit `id` column.
    fn primary_key_column(&self) -> String;

    /// Suffix appended to `CREATE TABLE`.
    fn table_options(&self) -> String {
        String::new()
    }

    /// Foreign keys are declared inside `CREATE TABLE` instead of `ALTER TABLE`.
    fn inline_foreign_keys(&self) -> bool {
        false
    }
}

fn varchar(max_len: Option<u32>) -> String {
    format!("VARCHAR({})", max_len.unwrap_or(255))
}

/// Portable baseline dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiDialect;

impl SqlDialect for AnsiDialect {
    fn name(&self) -> &'static str {
        "ansi"
    }

    fn column_type(&self, property: &Property) -> Option<String> {
        if property.is_array {
            return Some("TEXT".to_string());
        }
        let ty = match property.logical_type {
            LogicalType::String { max_len } => return Some(varchar(max_len)),
            LogicalType::Number => "DOUBLE PRECISION",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Integer | LogicalType::RecordId => "INTEGER",
            LogicalType::Date => "TIMESTAMP",
            LogicalType::Object | LogicalType::Text => "TEXT",
            LogicalType::GeoPoint => return None,
        };
        Some(ty.to_string())
    }

    fn primary_key_column(&self) -> String {
        format!("{} INTEGER PRIMARY KEY", self.quote("id"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, position: usize) -> String {
        format!("${position}")
    }

    fn like_operator(&self) -> &'static str {
        "ILIKE"
    }

    fn regex_operator(&self) -> Option<&'static str> {
        Some("~*")
    }

    fn point_constructor(&self) -> Option<&'static str> {
        Some("ST_Point")
    }

    fn point_select(&self, column: &str) -> String {
        format!("json_build_array(ST_X({column}), ST_Y({column}))::text")
    }

    fn returning_id(&self) -> bool {
        true
    }

    fn column_type(&self, property: &Property) -> Option<String> {
        if property.is_array {
            return Some("JSON".to_string());
        }
        let ty = match property.logical_type {
            LogicalType::String { max_len } => return Some(varchar(max_len)),
            LogicalType::Number => "DOUBLE PRECISION",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Integer | LogicalType::RecordId => "INT",
            LogicalType::GeoPoint => "GEOMETRY(POINT)",
            LogicalType::Date => "TIMESTAMP WITHOUT TIME ZONE",
            LogicalType::Object => "JSON",
            LogicalType::Text => "TEXT",
        };
        Some(ty.to_string())
    }

    fn primary_key_column(&self) -> String {
        format!("{} SERIAL PRIMARY KEY", self.quote("id"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlDialect {
    pub charset: String,
    pub collation: String,
}

impl Default for MySqlDialect {
    fn default() -> Self {
        Self::from(&MySqlSettings::default())
    }
}

impl From<&MySqlSettings> for MySqlDialect {
    fn from(settings: &MySqlSettings) -> Self {
        Self {
            charset: settings.charset.clone(),
            collation: settings.collation.clone(),
        }
    }
}

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn unbounded_limit(&self) -> &'static str {
        "2147483647"
    }

    fn point_constructor(&self) -> Option<&'static str> {
        Some("POINT")
    }

    fn distance_function(&self, column: &str, point: &str) -> String {
        format!("GLENGTH(LINESTRING({column}, {point}))")
    }

    fn upsert_clause(&self) -> Option<&'static str> {
        Some("ON DUPLICATE KEY UPDATE")
    }

    fn empty_insert(&self, table: &str) -> String {
        format!("INSERT INTO {table} () VALUES ()")
    }

    fn column_type(&self, property: &Property) -> Option<String> {
        if property.is_array {
            return Some("TEXT".to_string());
        }
        let ty = match property.logical_type {
            LogicalType::String { max_len } => return Some(varchar(max_len)),
            LogicalType::Number => "DOUBLE",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Integer | LogicalType::RecordId => "INT",
            LogicalType::GeoPoint => "POINT",
            LogicalType::Date => "DATETIME(3)",
            LogicalType::Object | LogicalType::Text => "TEXT",
        };
        Some(ty.to_string())
    }

    fn primary_key_column(&self) -> String {
        format!("{} INT NOT NULL AUTO_INCREMENT UNIQUE PRIMARY KEY", self.quote("id"))
    }

    fn table_options(&self) -> String {
        format!(" DEFAULT CHARSET={} COLLATE={}", self.charset, self.collation)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn like_escape(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    /// The registered `regexp` function takes the inline-flag form.
    fn regex_param(&self, pattern: &Pattern) -> String {
        pattern.inline_source()
    }

    fn false_literal(&self) -> &'static str {
        "0"
    }

    fn true_literal(&self) -> &'static str {
        "1"
    }

    fn unbounded_limit(&self) -> &'static str {
        "-1"
    }

    fn explain_prefix(&self) -> &'static str {
        "EXPLAIN QUERY PLAN"
    }

    fn column_type(&self, property: &Property) -> Option<String> {
        if property.is_array {
            return Some("JSON".to_string());
        }
        let ty = match property.logical_type {
            LogicalType::String { max_len } => return Some(varchar(max_len)),
            LogicalType::Number => "DOUBLE",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Integer | LogicalType::RecordId => "INTEGER",
            LogicalType::Date => "DATETIME",
            LogicalType::Object => "JSON",
            LogicalType::Text => "TEXT",
            LogicalType::GeoPoint => return None,
        };
        Some(ty.to_string())
    }

    fn primary_key_column(&self) -> String {
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote("id"))
    }

    fn inline_foreign_keys(&self) -> bool {
        true
    }
}
