//! Query specification: everything a `find`/`count`/`stream` call needs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{StoreError, StoreResult};
use crate::value::{GeoPoint, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// `1` / `-1`, as used by document stores.
    pub fn signum(&self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: SortDirection,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Parse `"age"` / `"-age"`.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(column) => Self::desc(column),
            None => Self::asc(spec.strip_prefix('+').unwrap_or(spec)),
        }
    }
}

/// Aggregate computed per group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupExpr {
    /// `{$sum: 1}`
    Count,
    /// `{$sum: "$column"}`
    Sum(String),
    /// `{$min: "$column"}`
    Min(String),
    /// `{$max: "$column"}`
    Max(String),
}

impl GroupExpr {
    /// Parse the `{$sum|$min|$max: 1 | "$column"}` form.
    pub fn parse(expr: &Value) -> StoreResult<Self> {
        let map = expr
            .as_object()
            .filter(|map| map.len() == 1)
            .ok_or_else(|| StoreError::invalid_condition(format!("bad group expression {expr}")))?;
        let Some((operator, operand)) = map.iter().next() else {
            return Err(StoreError::invalid_condition("empty group expression"));
        };

        let column = || {
            operand
                .as_str()
                .and_then(|s| s.strip_prefix('$'))
                .map(str::to_string)
                .ok_or_else(|| {
                    StoreError::invalid_condition(format!("{operator} expects \"$column\", got {operand}"))
                })
        };

        match operator.as_str() {
            "$sum" if operand.as_i64() == Some(1) => Ok(Self::Count),
            "$sum" => column().map(Self::Sum),
            "$min" => column().map(Self::Min),
            "$max" => column().map(Self::Max),
            other => Err(StoreError::UnknownOperator(other.to_string())),
        }
    }

    /// Column the aggregate reads, if any.
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Count => None,
            Self::Sum(column) | Self::Min(column) | Self::Max(column) => Some(column),
        }
    }
}

/// Nearest-neighbour ordering around a point.
#[derive(Debug, Clone, PartialEq)]
pub struct Near {
    pub field: String,
    pub point: GeoPoint,
}

/// Options for one `find`/`count`/`stream` call.
///
/// Built once per call; defaults select every column, no ordering, no limit,
/// no grouping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub conditions: Option<Condition>,
    pub select: Option<Vec<String>>,
    pub orders: Vec<Order>,
    pub limit: Option<u64>,
    pub skip: u64,
    pub group_by: Option<Vec<String>>,
    pub group_fields: IndexMap<String, GroupExpr>,
    pub conditions_of_group: Option<Condition>,
    pub near: Option<Near>,
    pub explain: bool,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions = Some(condition);
        self
    }

    /// Parse a condition tree into the filter.
    pub fn where_tree(mut self, tree: impl Into<Value>) -> StoreResult<Self> {
        self.conditions = Condition::parse(&tree.into())?;
        Ok(self)
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Append an ordering, `"-column"` for descending.
    pub fn order(mut self, spec: &str) -> Self {
        self.orders.push(Order::parse(spec));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn group_field(mut self, name: impl Into<String>, expr: GroupExpr) -> Self {
        self.group_fields.insert(name.into(), expr);
        self
    }

    /// Parse a condition tree over the group fields.
    pub fn having_tree(mut self, tree: impl Into<Value>) -> StoreResult<Self> {
        self.conditions_of_group = Condition::parse(&tree.into())?;
        Ok(self)
    }

    pub fn near(mut self, field: impl Into<String>, point: GeoPoint) -> Self {
        self.near = Some(Near {
            field: field.into(),
            point,
        });
        self
    }

    pub fn explain(mut self) -> Self {
        self.explain = true;
        self
    }

    pub fn is_grouped(&self) -> bool {
        self.group_by.is_some() || !self.group_fields.is_empty()
    }

    /// Group-by columns, empty when ungrouped.
    pub fn group_keys(&self) -> &[String] {
        self.group_by.as_deref().unwrap_or_default()
    }
}

/// Options for `find_by_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub select: Option<Vec<String>>,
    pub explain: bool,
}
