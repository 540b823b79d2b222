//! SQL translation
//!
//! One translator serves every SQL backend; a [`SqlDialect`] supplies the
//! quoting, placeholder, literal and DDL differences.

mod ddl;
mod dialect;
mod filter;
mod select;
mod write;

pub use dialect::{AnsiDialect, MySqlDialect, PostgresDialect, SqlDialect, SqliteDialect};
pub use filter::escape_like;
pub use select::{raw_row, ColumnKind, OutputColumn, SelectPlan};

use std::sync::Arc;

use tessera_core::coerce::SqlValue;
use tessera_core::{Condition, Schema, StoreResult};

use crate::ConditionTranslator;
use filter::{FilterCompiler, Namespace, ParamSink};

/// A statement and its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl RenderedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Builds statements for one dialect.
#[derive(Debug, Clone)]
pub struct SqlTranslator {
    dialect: Arc<dyn SqlDialect>,
}

impl SqlTranslator {
    pub fn new(dialect: impl SqlDialect + 'static) -> Self {
        Self {
            dialect: Arc::new(dialect),
        }
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    fn table(&self, schema: &Schema) -> String {
        self.dialect.quote(schema.table())
    }

    /// Append ` WHERE ...` when there is a condition.
    fn push_where(
        &self,
        sql: &mut String,
        schema: &Schema,
        condition: Option<&Condition>,
        sink: &mut ParamSink<'_>,
    ) -> StoreResult<()> {
        if let Some(condition) = condition {
            let compiled = FilterCompiler::new(self.dialect(), Namespace::Table(schema))
                .compile(condition, sink)?;
            sql.push_str(" WHERE ");
            sql.push_str(&compiled);
        }
        Ok(())
    }
}

impl ConditionTranslator for SqlTranslator {
    type Output = RenderedQuery;

    fn name(&self) -> &str {
        self.dialect.name()
    }

    /// Render the bare predicate, without the `WHERE` keyword. An absent
    /// condition renders as an empty string.
    fn translate(&self, schema: &Schema, condition: Option<&Condition>) -> StoreResult<RenderedQuery> {
        let Some(condition) = condition else {
            return Ok(RenderedQuery::default());
        };
        let mut sink = ParamSink::new(self.dialect());
        let sql = FilterCompiler::new(self.dialect(), Namespace::Table(schema)).compile(condition, &mut sink)?;
        Ok(RenderedQuery {
            sql,
            params: sink.params,
        })
    }
}
