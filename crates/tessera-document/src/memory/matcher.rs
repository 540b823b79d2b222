//! Filter evaluation and ordering over in-memory documents.

use std::cmp::Ordering;

use bson::{Bson, Document};
use regex::{Regex, RegexBuilder};

use tessera_core::BackendFailure;

use crate::store::{codes, DriverResult};

pub(crate) fn bad_value(message: impl Into<String>) -> BackendFailure {
    BackendFailure::new(codes::BAD_VALUE, message)
}

/// Value at a dotted path through nested documents.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

/// Set at a dotted path, replacing non-document intermediates.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

pub(crate) fn remove_path(doc: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

// ============================================================================
// Values
// ============================================================================

enum Number {
    Int(i64),
    Float(f64),
}

fn number(value: &Bson) -> Option<Number> {
    match value {
        Bson::Int32(i) => Some(Number::Int(i64::from(*i))),
        Bson::Int64(i) => Some(Number::Int(*i)),
        Bson::Double(f) => Some(Number::Float(*f)),
        _ => None,
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match number(value)? {
        Number::Int(i) => Some(i as f64),
        Number::Float(f) => Some(f),
    }
}

fn compare_numbers(a: Number, b: Number) -> Option<Ordering> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
        (Number::Int(x), Number::Float(y)) => (x as f64).partial_cmp(&y),
        (Number::Float(x), Number::Int(y)) => x.partial_cmp(&(y as f64)),
        (Number::Float(x), Number::Float(y)) => x.partial_cmp(&y),
    }
}

/// Ordering between values of the same kind; `None` across kinds.
pub(crate) fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (number(a), number(b)) {
        return compare_numbers(x, y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.timestamp_millis().cmp(&y.timestamp_millis())),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

pub(crate) fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, value)| y.get(key).is_some_and(|other| values_equal(value, other)))
        }
        _ => match compare_values(a, b) {
            Some(ordering) => ordering == Ordering::Equal,
            None => a == b,
        },
    }
}

/// Rank of a value's kind in cross-type sort order.
fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null | Bson::Undefined) => 1,
        Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)) => 2,
        Some(Bson::String(_) | Bson::Symbol(_)) => 3,
        Some(Bson::Document(_)) => 4,
        Some(Bson::Array(_)) => 5,
        Some(Bson::Binary(_)) => 6,
        Some(Bson::ObjectId(_)) => 7,
        Some(Bson::Boolean(_)) => 8,
        Some(Bson::DateTime(_)) => 9,
        Some(Bson::Timestamp(_)) => 10,
        Some(Bson::RegularExpression(_)) => 11,
        Some(_) => 12,
    }
}

/// Total order used by `$sort`, `$min` and `$max`. Missing sorts as null.
pub(crate) fn sort_order(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }
    match (a, b) {
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// Stable sort by a `{path: 1 | -1}` specification.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| {
        for (path, direction) in sort {
            let ordering = sort_order(get_path(a, path), get_path(b, path));
            let ordering = match as_f64(direction) {
                Some(d) if d < 0.0 => ordering.reverse(),
                _ => ordering,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// A planar point stored as `[x, y]`.
pub(crate) fn point(value: &Bson) -> Option<(f64, f64)> {
    match value {
        Bson::Array(items) if items.len() == 2 => Some((as_f64(&items[0])?, as_f64(&items[1])?)),
        _ => None,
    }
}

/// Field and point of the `$near` clause in `filter`, if any.
pub(crate) fn near_clause(filter: &Document) -> Option<(String, (f64, f64))> {
    for (key, condition) in filter {
        if key == "$and" {
            if let Bson::Array(clauses) = condition {
                for clause in clauses.iter().filter_map(Bson::as_document) {
                    if let Some(found) = near_clause(clause) {
                        return Some(found);
                    }
                }
            }
            continue;
        }
        if let Bson::Document(operators) = condition {
            if let Some(target) = operators.get("$near").and_then(point) {
                return Some((key.clone(), target));
            }
        }
    }
    None
}

// ============================================================================
// Matching
// ============================================================================

/// Whether `doc` satisfies `filter`.
pub(crate) fn matches(doc: &Document, filter: &Document) -> DriverResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any == (key == "$or")
            }
            operator if operator.starts_with('$') => {
                return Err(bad_value(format!("unknown top level operator: {operator}")))
            }
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(operator: &str, value: &'a Bson) -> DriverResult<Vec<&'a Document>> {
    let Bson::Array(items) = value else {
        return Err(bad_value(format!("{operator} must be an array")));
    };
    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| bad_value(format!("{operator} entries must be objects")))
        })
        .collect()
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|key| key.starts_with('$'))
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> DriverResult<bool> {
    match condition {
        Bson::Document(operators) if is_operator_document(operators) => {
            for (operator, operand) in operators {
                if !operator_matches(value, operator, operand, operators)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => literal_matches(value, literal),
    }
}

/// The value itself, plus its elements when it is an array.
fn candidates(value: Option<&Bson>) -> Vec<&Bson> {
    match value {
        None => Vec::new(),
        Some(Bson::Array(items)) => {
            let mut all: Vec<&Bson> = items.iter().collect();
            all.extend(value);
            all
        }
        Some(value) => vec![value],
    }
}

/// Equality against a literal; a regex literal matches strings.
fn literal_matches(value: Option<&Bson>, literal: &Bson) -> DriverResult<bool> {
    match literal {
        Bson::Null => Ok(match value {
            None | Some(Bson::Null) => true,
            Some(Bson::Array(items)) => items.iter().any(|item| matches!(item, Bson::Null)),
            Some(_) => false,
        }),
        Bson::RegularExpression(re) => {
            let regex = compile(&re.pattern, &re.options)?;
            Ok(regex_matches(value, &regex))
        }
        literal => Ok(candidates(value)
            .into_iter()
            .any(|candidate| values_equal(candidate, literal))),
    }
}

fn regex_matches(value: Option<&Bson>, regex: &Regex) -> bool {
    candidates(value).into_iter().any(|candidate| match candidate {
        Bson::String(s) | Bson::Symbol(s) => regex.is_match(s),
        _ => false,
    })
}

fn compile(pattern: &str, options: &str) -> DriverResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| bad_value(format!("Regular expression is invalid: {e}")))
}

fn range_matches(value: Option<&Bson>, operand: &Bson, accept: fn(Ordering) -> bool) -> bool {
    if matches!(operand, Bson::Null) {
        return accept(Ordering::Equal) && matches!(value, None | Some(Bson::Null));
    }
    candidates(value)
        .into_iter()
        .any(|candidate| compare_values(candidate, operand).is_some_and(accept))
}

fn operator_matches(
    value: Option<&Bson>,
    operator: &str,
    operand: &Bson,
    siblings: &Document,
) -> DriverResult<bool> {
    Ok(match operator {
        "$eq" => literal_matches(value, operand)?,
        "$ne" => !literal_matches(value, operand)?,
        "$gt" => range_matches(value, operand, |o| o == Ordering::Greater),
        "$gte" => range_matches(value, operand, |o| o != Ordering::Less),
        "$lt" => range_matches(value, operand, |o| o == Ordering::Less),
        "$lte" => range_matches(value, operand, |o| o != Ordering::Greater),
        "$in" | "$nin" => {
            let Bson::Array(options) = operand else {
                return Err(bad_value(format!("{operator} needs an array")));
            };
            let mut found = false;
            for option in options {
                if literal_matches(value, option)? {
                    found = true;
                    break;
                }
            }
            found == (operator == "$in")
        }
        "$regex" => {
            let flags = siblings.get_str("$options").unwrap_or_default();
            let regex = match operand {
                Bson::String(pattern) => compile(pattern, flags)?,
                Bson::RegularExpression(re) => compile(&re.pattern, &format!("{}{flags}", re.options))?,
                _ => return Err(bad_value("$regex has to be a string")),
            };
            regex_matches(value, &regex)
        }
        "$options" => true,
        "$not" => match operand {
            Bson::Document(inner) if is_operator_document(inner) => !field_matches(value, operand)?,
            Bson::RegularExpression(_) => !literal_matches(value, operand)?,
            _ => return Err(bad_value("$not needs a regex or a document")),
        },
        "$exists" => {
            let wanted = match operand {
                Bson::Boolean(b) => *b,
                other => as_f64(other).map_or(true, |n| n != 0.0),
            };
            value.is_some() == wanted
        }
        "$near" => {
            if point(operand).is_none() {
                return Err(bad_value("$near needs a legacy [x, y] point"));
            }
            value.and_then(point).is_some()
        }
        other => return Err(bad_value(format!("unknown operator: {other}"))),
    })
}
