//! Catalog queries through the `pragma_*` table-valued functions.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

use tessera_core::{ColumnDescriptor, ForeignKeyListing, IndexListing, LogicalType, TableDescriptor};

use crate::error::SqliteResult;

static VARCHAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^varchar\s*\(\s*(\d+)\s*\)$").expect("valid regex"));

/// Logical type of a declared column type, as written by the DDL generator.
pub(crate) fn logical_type(declared: &str) -> Option<LogicalType> {
    if let Some(captures) = VARCHAR.captures(declared.trim()) {
        return Some(LogicalType::String {
            max_len: captures[1].parse().ok(),
        });
    }
    let ty = match declared.trim().to_ascii_uppercase().as_str() {
        "VARCHAR" => LogicalType::STRING,
        "TEXT" => LogicalType::Text,
        "DOUBLE" | "REAL" | "FLOAT" | "NUMERIC" => LogicalType::Number,
        "INTEGER" | "INT" | "BIGINT" => LogicalType::Integer,
        "BOOLEAN" => LogicalType::Boolean,
        "DATETIME" | "DATE" | "TIMESTAMP" => LogicalType::Date,
        "JSON" => LogicalType::Object,
        _ => return None,
    };
    Some(ty)
}

pub(crate) fn list_tables(conn: &Connection) -> SqliteResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(tables)
}

/// Columns of `table`; `None` when the table does not exist.
pub(crate) fn describe(conn: &Connection, table: &str) -> SqliteResult<Option<TableDescriptor>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row| {
            let name: String = row.get(0)?;
            let declared: String = row.get(1)?;
            let not_null: bool = row.get(2)?;
            let primary_key: i64 = row.get(3)?;
            Ok((
                name,
                ColumnDescriptor {
                    logical_type: logical_type(&declared),
                    required: not_null || primary_key > 0,
                },
            ))
        })?
        .collect::<Result<TableDescriptor, _>>()?;
    Ok((!columns.is_empty()).then_some(columns))
}

/// Explicitly created indexes; constraint-backed ones are left out.
pub(crate) fn list_indexes(conn: &Connection) -> SqliteResult<IndexListing> {
    let mut listing = IndexListing::new();
    for table in list_tables(conn)? {
        let mut stmt =
            conn.prepare_cached("SELECT name FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name")?;
        let names = stmt
            .query_map([&table], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut indexes = IndexMap::new();
        for name in names {
            let mut stmt = conn.prepare_cached("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let columns = stmt
                .query_map([&name], |row| row.get::<_, String>(0))?
                .map(|column| column.map(|column| (column, 1)))
                .collect::<Result<IndexMap<String, i32>, _>>()?;
            indexes.insert(name, columns);
        }
        if !indexes.is_empty() {
            listing.insert(table, indexes);
        }
    }
    Ok(listing)
}

pub(crate) fn list_foreign_keys(conn: &Connection) -> SqliteResult<ForeignKeyListing> {
    let mut listing = ForeignKeyListing::new();
    for table in list_tables(conn)? {
        let mut stmt = conn.prepare_cached("SELECT \"from\", \"table\" FROM pragma_foreign_key_list(?1)")?;
        let references = stmt
            .query_map([&table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<IndexMap<String, String>, _>>()?;
        if !references.is_empty() {
            listing.insert(table, references);
        }
    }
    Ok(listing)
}

/// Whether `table` already carries an index called `name`.
pub(crate) fn has_index(conn: &Connection, table: &str, name: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2",
    )?;
    let count: i64 = stmt.query_row([table, name], |row| row.get(0))?;
    Ok(count > 0)
}
