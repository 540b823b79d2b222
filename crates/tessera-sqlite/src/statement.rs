//! Binding parameters and reading result rows.

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use tessera_core::coerce::SqlValue;
use tessera_core::value::format_timestamp;
use tessera_query::RenderedQuery;

use crate::error::{SqliteError, SqliteResult};

/// Storage form of a parameter. Booleans are 0/1, dates are RFC 3339 text.
pub(crate) fn to_sqlite(value: &SqlValue) -> SqliteResult<SqliteValue> {
    Ok(match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(i) => SqliteValue::Integer(*i),
        SqlValue::Real(n) => SqliteValue::Real(*n),
        SqlValue::Text(s) | SqlValue::Json(s) => SqliteValue::Text(s.clone()),
        SqlValue::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        SqlValue::Timestamp(date) => SqliteValue::Text(format_timestamp(date)),
        SqlValue::Point(_) => {
            return Err(SqliteError::Unsupported("geopoint parameters".to_string()))
        }
    })
}

pub(crate) fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(n) => SqlValue::Real(n),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn bind(params: &[SqlValue]) -> SqliteResult<Vec<SqliteValue>> {
    params.iter().map(to_sqlite).collect()
}

pub(crate) fn read_row(row: &rusqlite::Row<'_>, width: usize) -> SqliteResult<Vec<SqlValue>> {
    (0..width)
        .map(|index| Ok(from_sqlite(row.get_ref(index)?)))
        .collect()
}

/// Rows of one query, with the engine's column names.
#[derive(Debug, Default)]
pub(crate) struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

pub(crate) fn execute(conn: &Connection, query: &RenderedQuery) -> SqliteResult<usize> {
    debug!(sql = %query.sql, params = query.params.len(), "Executing statement");
    let mut stmt = conn.prepare_cached(&query.sql)?;
    Ok(stmt.execute(params_from_iter(bind(&query.params)?))?)
}

pub(crate) fn query(conn: &Connection, query: &RenderedQuery) -> SqliteResult<ResultSet> {
    debug!(sql = %query.sql, params = query.params.len(), "Running query");
    let mut stmt = conn.prepare_cached(&query.sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(bind(&query.params)?))?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(read_row(row, width)?);
    }
    Ok(ResultSet {
        columns,
        rows: result,
    })
}

/// First column of the first row as an integer.
pub(crate) fn query_scalar(conn: &Connection, query: &RenderedQuery) -> SqliteResult<i64> {
    debug!(sql = %query.sql, "Running scalar query");
    let mut stmt = conn.prepare_cached(&query.sql)?;
    Ok(stmt.query_row(params_from_iter(bind(&query.params)?), |row| row.get(0))?)
}
