//! Update operators: `$set`, `$unset`, `$inc`, `$setOnInsert`.

use bson::{Bson, Document};

use tessera_core::BackendFailure;

use super::matcher::{get_path, remove_path, set_path};
use crate::store::{codes, DriverResult};

fn fields<'a>(operator: &str, value: &'a Bson) -> DriverResult<&'a Document> {
    value.as_document().ok_or_else(|| {
        BackendFailure::new(
            codes::FAILED_TO_PARSE,
            format!("Modifiers operate on fields but {operator} found type {:?} instead", value.element_type()),
        )
    })
}

fn increment(current: Option<&Bson>, amount: &Bson, path: &str) -> DriverResult<Bson> {
    let mismatch = |what: &str| {
        BackendFailure::new(
            codes::TYPE_MISMATCH,
            format!("Cannot apply $inc to field '{path}': {what}"),
        )
    };
    Ok(match (current, amount) {
        (None | Some(Bson::Null), Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => amount.clone(),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(i64::from(*a).saturating_add(*b)),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(a.saturating_add(i64::from(*b))),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(a.saturating_add(*b)),
        (Some(Bson::Double(a)), Bson::Int32(b)) => Bson::Double(a + f64::from(*b)),
        (Some(Bson::Double(a)), Bson::Int64(b)) => Bson::Double(a + *b as f64),
        (Some(Bson::Double(a)), Bson::Double(b)) => Bson::Double(a + b),
        (Some(Bson::Int32(a)), Bson::Double(b)) => Bson::Double(f64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        (_, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => return Err(mismatch("the field is not numeric")),
        _ => return Err(mismatch("the amount is not numeric")),
    })
}

/// Apply `update` to `doc`. `$setOnInsert` only runs when `inserting`.
/// Returns whether anything changed.
pub(crate) fn apply(doc: &mut Document, update: &Document, inserting: bool) -> DriverResult<bool> {
    let before = doc.clone();
    for (operator, value) in update {
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields(operator, value)? {
                    set_path(doc, path, value.clone());
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields(operator, value)? {
                        set_path(doc, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for path in fields(operator, value)?.keys() {
                    remove_path(doc, path);
                }
            }
            "$inc" => {
                for (path, amount) in fields(operator, value)? {
                    let next = increment(get_path(doc, path), amount, path)?;
                    set_path(doc, path, next);
                }
            }
            other if other.starts_with('$') => {
                return Err(BackendFailure::new(
                    codes::FAILED_TO_PARSE,
                    format!("Unknown modifier: {other}"),
                ))
            }
            _ => {
                return Err(BackendFailure::new(
                    codes::FAILED_TO_PARSE,
                    "update document requires atomic operators",
                ))
            }
        }
    }
    Ok(*doc != before)
}

/// Equality fields of `filter`, the seed of a document inserted by an upsert.
pub(crate) fn seed_from_filter(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key == "$and" {
            if let Bson::Array(clauses) = value {
                for clause in clauses.iter().filter_map(Bson::as_document) {
                    for (path, value) in seed_from_filter(clause) {
                        set_path(&mut seed, &path, value);
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match value {
            Bson::RegularExpression(_) => {}
            Bson::Document(operators) if operators.keys().any(|k| k.starts_with('$')) => {
                if let Some(eq) = operators.get("$eq") {
                    set_path(&mut seed, key, eq.clone());
                }
            }
            literal => set_path(&mut seed, key, literal.clone()),
        }
    }
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_operators() {
        let mut doc = doc! {"name": "a", "age": 3, "nick": "x"};

        let changed = apply(
            &mut doc,
            &doc! {"$set": {"name": "b", "address.city": "Oslo"}, "$unset": {"nick": ""}, "$inc": {"age": 2, "visits": 1}},
            false,
        )
        .unwrap();

        assert!(changed);
        assert_eq!(doc, doc! {"name": "b", "age": 5, "address": {"city": "Oslo"}, "visits": 1});
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let mut doc = Document::new();
        apply(&mut doc, &doc! {"$setOnInsert": {"created": true}}, false).unwrap();
        assert!(doc.is_empty());

        apply(&mut doc, &doc! {"$setOnInsert": {"created": true}}, true).unwrap();
        assert_eq!(doc, doc! {"created": true});
    }

    #[test]
    fn test_unchanged_document() {
        let mut doc = doc! {"a": 1};

        assert!(!apply(&mut doc, &doc! {"$set": {"a": 1}}, false).unwrap());
    }

    #[test]
    fn test_increment_rejects_text() {
        let mut doc = doc! {"name": "a"};

        let err = apply(&mut doc, &doc! {"$inc": {"name": 1}}, false).unwrap_err();

        assert_eq!(err.code, codes::TYPE_MISMATCH);
    }

    #[test]
    fn test_replacement_documents_are_rejected() {
        let mut doc = Document::new();

        assert!(apply(&mut doc, &doc! {"name": "a"}, false).is_err());
    }

    #[test]
    fn test_seed_takes_equalities_only() {
        let filter = doc! {
            "name": "a",
            "age": {"$gt": 3},
            "email": {"$eq": "a@b.c"},
            "$and": [{"city": "Oslo"}],
            "$or": [{"x": 1}],
        };

        assert_eq!(
            seed_from_filter(&filter),
            doc! {"name": "a", "email": "a@b.c", "city": "Oslo"}
        );
    }
}
