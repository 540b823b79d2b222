//! Condition algebra
//!
//! A backend-independent filter AST, parsed from the JSON-shaped condition
//! grammar by a recursive-descent parser:
//!
//! ```text
//! tree      := object | [tree, ...]
//! object    := { entry, ... }                 (implicit AND of entries)
//! entry     := "and": (tree | [tree, ...])
//!            | "or":  (tree | [tree, ...])
//!            | field: predicate
//! predicate := [value, ...]                   (membership)
//!            | { operator: operand }          (exactly one operator)
//!            | regex
//!            | value                          (equality)
//! ```
//!
//! Operator and conjunction keys are accepted with or without a leading `$`.
//! Negation is resolved while parsing: `not` flips polarity so that a negated
//! equality becomes `Ne`, negated membership becomes `Nin`, and double
//! negation cancels.
//!
//! ```
//! use serde_json::json;
//! use tessera_core::condition::{Condition, Test};
//! use tessera_core::Value;
//!
//! let tree = Value::from(json!({"age": {"not": {"not": 18}}}));
//! let condition = Condition::parse(&tree).unwrap().unwrap();
//!
//! assert_eq!(condition, Condition::predicate("age", Test::Eq(Value::Integer(18))));
//! ```

use std::fmt;

use indexmap::IndexMap;

use crate::error::{StoreError, StoreResult};
use crate::value::{Pattern, Value};

/// Operators accepted inside a predicate object.
const OPERATORS: [&str; 11] = [
    "not",
    "ne",
    "gt",
    "lt",
    "gte",
    "lte",
    "contains",
    "startswith",
    "endswith",
    "in",
    "nin",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// A parsed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Group {
        conjunction: Conjunction,
        children: Vec<Condition>,
    },
    Predicate(Predicate),
}

/// A single-field test.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub test: Test,
}

/// The comparison a predicate performs on its field.
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Lt(Value),
    Gte(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    /// Substring match; several values are OR-combined
    Contains(Vec<Value>),
    StartsWith(Value),
    EndsWith(Value),
    Regex(Pattern),
    Not(Box<Test>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    Nin,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Not,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Regex => "regex",
            Self::Not => "not",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Test {
    pub fn operator(&self) -> Operator {
        match self {
            Self::Eq(_) => Operator::Eq,
            Self::Ne(_) => Operator::Ne,
            Self::Gt(_) => Operator::Gt,
            Self::Lt(_) => Operator::Lt,
            Self::Gte(_) => Operator::Gte,
            Self::Lte(_) => Operator::Lte,
            Self::In(_) => Operator::In,
            Self::Nin(_) => Operator::Nin,
            Self::Contains(_) => Operator::Contains,
            Self::StartsWith(_) => Operator::StartsWith,
            Self::EndsWith(_) => Operator::EndsWith,
            Self::Regex(_) => Operator::Regex,
            Self::Not(_) => Operator::Not,
        }
    }

    /// Logical negation, using the direct complement where one exists.
    pub fn negate(self) -> Self {
        match self {
            Self::Eq(value) => Self::Ne(value),
            Self::Ne(value) => Self::Eq(value),
            Self::In(values) => Self::Nin(values),
            Self::Nin(values) => Self::In(values),
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

impl Condition {
    /// Parse a condition tree. `Ok(None)` means "no condition".
    pub fn parse(tree: &Value) -> StoreResult<Option<Self>> {
        parse_tree(tree, Conjunction::And)
    }

    pub fn predicate(field: impl Into<String>, test: Test) -> Self {
        Self::Predicate(Predicate {
            field: field.into(),
            test,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::predicate(field, Test::Eq(value.into()))
    }

    pub fn and(children: Vec<Condition>) -> Self {
        Self::Group {
            conjunction: Conjunction::And,
            children,
        }
    }

    pub fn or(children: Vec<Condition>) -> Self {
        Self::Group {
            conjunction: Conjunction::Or,
            children,
        }
    }

    /// Combine children, collapsing empty and single-child groups.
    pub fn group(conjunction: Conjunction, mut children: Vec<Condition>) -> Option<Self> {
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(Self::Group {
                conjunction,
                children,
            }),
        }
    }

    /// Equality predicates that hold for every matching row.
    ///
    /// Only looks through AND groups; used to seed the row an upsert inserts.
    pub fn equalities(&self) -> IndexMap<&str, &Value> {
        let mut found = IndexMap::new();
        self.collect_equalities(&mut found);
        found
    }

    fn collect_equalities<'a>(&'a self, found: &mut IndexMap<&'a str, &'a Value>) {
        match self {
            Self::Predicate(Predicate {
                field,
                test: Test::Eq(value),
            }) => {
                found.insert(field.as_str(), value);
            }
            Self::Group {
                conjunction: Conjunction::And,
                children,
            } => {
                for child in children {
                    child.collect_equalities(found);
                }
            }
            _ => {}
        }
    }
}

fn conjunction_marker(key: &str) -> Option<Conjunction> {
    match key.strip_prefix('$').unwrap_or(key) {
        "and" => Some(Conjunction::And),
        "or" => Some(Conjunction::Or),
        _ => None,
    }
}

fn is_operator_key(key: &str) -> bool {
    key.starts_with('$') || OPERATORS.contains(&key)
}

fn parse_tree(tree: &Value, conjunction: Conjunction) -> StoreResult<Option<Condition>> {
    let mut children = Vec::new();
    match tree {
        Value::Array(items) => {
            for item in items {
                children.extend(parse_tree(item, Conjunction::And)?);
            }
        }
        Value::Object(entries) => {
            for (key, value) in entries {
                children.extend(parse_entry(key, value)?);
            }
        }
        other => {
            return Err(StoreError::invalid_condition(format!(
                "expected an object or a sequence, got {}",
                other.type_name()
            )))
        }
    }
    Ok(Condition::group(conjunction, children))
}

fn parse_entry(key: &str, value: &Value) -> StoreResult<Option<Condition>> {
    if let Some(conjunction) = conjunction_marker(key) {
        return parse_tree(value, conjunction);
    }
    if key.starts_with('$') {
        return Err(StoreError::UnknownOperator(key.to_string()));
    }
    Ok(Some(Condition::predicate(key, parse_test(key, value, false)?)))
}

fn parse_test(field: &str, value: &Value, negated: bool) -> StoreResult<Test> {
    let positive = match value {
        Value::Array(items) => Test::In(items.clone()),
        Value::Object(map) if map.keys().any(|key| is_operator_key(key)) => {
            let mut entries = map.iter();
            let (Some((key, operand)), None) = (entries.next(), entries.next()) else {
                return Err(StoreError::invalid_condition(format!(
                    "'{field}' combines several operators in one predicate"
                )));
            };
            return parse_operator(field, key, operand, negated);
        }
        Value::Regex(pattern) => Test::Regex(pattern.clone().ignore_case()),
        other => Test::Eq(other.clone()),
    };
    Ok(if negated { positive.negate() } else { positive })
}

fn parse_operator(field: &str, key: &str, operand: &Value, negated: bool) -> StoreResult<Test> {
    let name = key.strip_prefix('$').unwrap_or(key);
    let positive = match name {
        "not" => return parse_test(field, operand, !negated),
        "gt" => Test::Gt(comparable(field, operand)?),
        "lt" => Test::Lt(comparable(field, operand)?),
        "gte" => Test::Gte(comparable(field, operand)?),
        "lte" => Test::Lte(comparable(field, operand)?),
        "ne" => Test::Ne(operand.clone()),
        "in" => Test::In(sequence(field, name, operand)?),
        "nin" => Test::Nin(sequence(field, name, operand)?),
        "contains" => {
            let values = match operand {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            for value in &values {
                textual(field, value)?;
            }
            Test::Contains(values)
        }
        "startswith" => Test::StartsWith(textual(field, operand)?),
        "endswith" => Test::EndsWith(textual(field, operand)?),
        _ => return Err(StoreError::UnknownOperator(key.to_string())),
    };
    Ok(if negated { positive.negate() } else { positive })
}

fn sequence(field: &str, operator: &str, operand: &Value) -> StoreResult<Vec<Value>> {
    match operand {
        Value::Array(items) => Ok(items.clone()),
        other => Err(StoreError::invalid_condition(format!(
            "'{field}' {operator} expects a sequence, got {}",
            other.type_name()
        ))),
    }
}

fn comparable(field: &str, operand: &Value) -> StoreResult<Value> {
    match operand {
        Value::Array(_) | Value::Object(_) | Value::Regex(_) => Err(StoreError::invalid_condition(
            format!("'{field}' cannot be compared with {}", operand.type_name()),
        )),
        other => Ok(other.clone()),
    }
}

fn textual(field: &str, operand: &Value) -> StoreResult<Value> {
    match operand.to_text() {
        Some(_) => Ok(operand.clone()),
        None => Err(StoreError::invalid_condition(format!(
            "'{field}' pattern operand must be a scalar, got {}",
            operand.type_name()
        ))),
    }
}
