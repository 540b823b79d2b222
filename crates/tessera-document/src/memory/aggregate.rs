//! Aggregation pipeline execution: `$match`, `$group`, `$sort`, `$skip`,
//! `$limit`.

use std::cmp::Ordering;

use bson::{Bson, Document};
use indexmap::IndexMap;

use tessera_core::BackendFailure;

use super::matcher::{as_f64, bad_value, get_path, matches, sort_documents, sort_order};
use crate::store::DriverResult;

enum Accumulator {
    Sum { int: i64, float: f64, fractional: bool },
    Min(Option<Bson>),
    Max(Option<Bson>),
    Avg { total: f64, count: u64 },
}

impl Accumulator {
    fn parse(name: &str, spec: &Bson) -> DriverResult<(Self, Bson)> {
        let operator = spec
            .as_document()
            .filter(|doc| doc.len() == 1)
            .and_then(|doc| doc.iter().next())
            .ok_or_else(|| bad_value(format!("the field '{name}' must be an accumulator object")))?;
        let accumulator = match operator.0.as_str() {
            "$sum" => Self::Sum {
                int: 0,
                float: 0.0,
                fractional: false,
            },
            "$min" => Self::Min(None),
            "$max" => Self::Max(None),
            "$avg" => Self::Avg { total: 0.0, count: 0 },
            other => return Err(unknown_operator(other)),
        };
        Ok((accumulator, operator.1.clone()))
    }

    fn add(&mut self, value: Bson) {
        match self {
            Self::Sum { int, float, fractional } => match value {
                Bson::Int32(i) => add_int(int, float, fractional, i64::from(i)),
                Bson::Int64(i) => add_int(int, float, fractional, i),
                Bson::Double(f) => {
                    *float += f;
                    *fractional = true;
                }
                _ => {}
            },
            Self::Min(current) => keep(current, value, Ordering::Less),
            Self::Max(current) => keep(current, value, Ordering::Greater),
            Self::Avg { total, count } => {
                if let Some(n) = as_f64(&value) {
                    *total += n;
                    *count += 1;
                }
            }
        }
    }

    fn finish(self) -> Bson {
        match self {
            Self::Sum { int, float, fractional } => {
                if fractional {
                    Bson::Double(int as f64 + float)
                } else {
                    match i32::try_from(int) {
                        Ok(small) => Bson::Int32(small),
                        Err(_) => Bson::Int64(int),
                    }
                }
            }
            Self::Min(value) | Self::Max(value) => value.unwrap_or(Bson::Null),
            Self::Avg { total, count } => match count {
                0 => Bson::Null,
                n => Bson::Double(total / n as f64),
            },
        }
    }
}

fn add_int(int: &mut i64, float: &mut f64, fractional: &mut bool, i: i64) {
    match int.checked_add(i) {
        Some(sum) => *int = sum,
        None => {
            *float += i as f64;
            *fractional = true;
        }
    }
}

/// Keep `value` when it sorts `wanted` relative to `current`. Nulls never
/// win.
fn keep(current: &mut Option<Bson>, value: Bson, wanted: Ordering) {
    if matches!(value, Bson::Null | Bson::Undefined) {
        return;
    }
    let replace = match current {
        None => true,
        Some(existing) => sort_order(Some(&value), Some(existing)) == wanted,
    };
    if replace {
        *current = Some(value);
    }
}

fn unknown_operator(name: &str) -> BackendFailure {
    BackendFailure::new("15952", format!("unknown group operator '{name}'"))
}

/// `"$path"` reads a field; documents are evaluated field by field; anything
/// else is a literal.
fn evaluate(doc: &Document, expression: &Bson) -> Bson {
    match expression {
        Bson::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned().unwrap_or(Bson::Null),
        Bson::Document(fields) => Bson::Document(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), evaluate(doc, value)))
                .collect(),
        ),
        literal => literal.clone(),
    }
}

fn group(documents: Vec<Document>, spec: &Document) -> DriverResult<Vec<Document>> {
    let id = spec
        .get("_id")
        .ok_or_else(|| bad_value("a group specification must include an _id"))?;
    let fields: Vec<(&String, &Bson)> = spec.iter().filter(|(name, _)| *name != "_id").collect();
    for (name, accumulator) in &fields {
        Accumulator::parse(name, accumulator)?;
    }

    let mut groups: IndexMap<String, (Bson, Vec<(Accumulator, Bson)>)> = IndexMap::new();
    for doc in &documents {
        let key = evaluate(doc, id);
        let identity = key.clone().into_relaxed_extjson().to_string();
        if !groups.contains_key(&identity) {
            let mut accumulators = Vec::with_capacity(fields.len());
            for (name, accumulator) in &fields {
                accumulators.push(Accumulator::parse(name, accumulator)?);
            }
            groups.insert(identity.clone(), (key, accumulators));
        }
        if let Some((_, accumulators)) = groups.get_mut(&identity) {
            for (accumulator, expression) in accumulators.iter_mut() {
                accumulator.add(evaluate(doc, expression));
            }
        }
    }

    Ok(groups
        .into_values()
        .map(|(key, accumulators)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, _), (accumulator, _)) in fields.iter().zip(accumulators) {
                out.insert(name.as_str(), accumulator.finish());
            }
            out
        })
        .collect())
}

fn count_argument(stage: &str, value: &Bson) -> DriverResult<usize> {
    as_f64(value)
        .filter(|n| *n >= 0.0)
        .map(|n| n as usize)
        .ok_or_else(|| bad_value(format!("{stage} needs a non-negative number")))
}

/// Run `pipeline` over `documents`.
pub(crate) fn run(documents: Vec<Document>, pipeline: &[Document]) -> DriverResult<Vec<Document>> {
    let mut current = documents;
    for stage in pipeline {
        let (name, spec) = match stage.iter().next() {
            Some(entry) if stage.len() == 1 => entry,
            _ => return Err(bad_value("a pipeline stage specification must contain exactly one field")),
        };
        current = match (name.as_str(), spec) {
            ("$match", Bson::Document(filter)) => {
                let mut kept = Vec::with_capacity(current.len());
                for doc in current {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            ("$group", Bson::Document(spec)) => group(current, spec)?,
            ("$sort", Bson::Document(sort)) => {
                sort_documents(&mut current, sort);
                current
            }
            ("$skip", n) => current.into_iter().skip(count_argument(name, n)?).collect(),
            ("$limit", n) => current.into_iter().take(count_argument(name, n)?).collect(),
            ("$match" | "$group" | "$sort", _) => {
                return Err(bad_value(format!("the {name} stage specification must be an object")))
            }
            (other, _) => {
                return Err(BackendFailure::new(
                    "40324",
                    format!("Unrecognized pipeline stage name: '{other}'"),
                ))
            }
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn staff() -> Vec<Document> {
        vec![
            doc! {"dept": "eng", "salary": 100},
            doc! {"dept": "ops", "salary": 70},
            doc! {"dept": "eng", "salary": 150},
            doc! {"dept": "sales", "salary": 100.5},
        ]
    }

    #[test]
    fn test_group_sums_per_key_in_first_seen_order() {
        let pipeline = [doc! {"$group": {"_id": {"dept": "$dept"}, "total": {"$sum": "$salary"}, "n": {"$sum": 1}}}];

        let out = run(staff(), &pipeline).unwrap();

        assert_eq!(
            out,
            vec![
                doc! {"_id": {"dept": "eng"}, "total": 250, "n": 2},
                doc! {"_id": {"dept": "ops"}, "total": 70, "n": 1},
                doc! {"_id": {"dept": "sales"}, "total": 100.5, "n": 1},
            ]
        );
    }

    #[test]
    fn test_match_sort_skip_limit() {
        let pipeline = [
            doc! {"$group": {"_id": {"dept": "$dept"}, "top": {"$max": "$salary"}, "low": {"$min": "$salary"}}},
            doc! {"$match": {"top": {"$gte": 100}}},
            doc! {"$sort": {"_id.dept": -1}},
            doc! {"$skip": 1_i64},
            doc! {"$limit": 1_i64},
        ];

        let out = run(staff(), &pipeline).unwrap();

        assert_eq!(out, vec![doc! {"_id": {"dept": "eng"}, "top": 150, "low": 100}]);
    }

    #[test]
    fn test_null_key_makes_one_group() {
        let pipeline = [doc! {"$group": {"_id": null, "count": {"$sum": 1}}}];

        assert_eq!(run(staff(), &pipeline).unwrap(), vec![doc! {"_id": null, "count": 4}]);
        assert!(run(Vec::new(), &pipeline).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_stage() {
        let err = run(staff(), &[doc! {"$lookup": {}}]).unwrap_err();

        assert_eq!(err.code, "40324");
    }
}
