//! Predicate evaluation.
//!
//! Comparison semantics: numbers compare numerically with int/float
//! coercion; strings compare lexicographically; an ordered comparison
//! across types is false. A missing field matches no positive operator
//! (`$ne` is the one negative operator and treats a missing field as
//! "not equal").

use serde_json::Value;
use std::cmp::Ordering;

use loam_core::document::{values_equal, Document};

use crate::ast::{CompareOp, Filter};

/// Does `doc` satisfy `filter`?
pub fn matches(filter: &Filter, doc: &Document) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|c| matches(c, doc)),
        Filter::Or(children) => children.iter().any(|c| matches(c, doc)),
        Filter::Field { path, op, literal } => match doc.field(path) {
            Some(value) => compare(value, *op, literal),
            None => *op == CompareOp::Ne,
        },
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(value, literal),
        CompareOp::Ne => !values_equal(value, literal),
        CompareOp::In => literal
            .as_array()
            .map(|items| items.iter().any(|item| values_equal(value, item)))
            .unwrap_or(false),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            match ordered_compare(value, literal) {
                Some(ordering) => match op {
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Gte => ordering != Ordering::Less,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Lte => ordering != Ordering::Greater,
                    _ => unreachable!(),
                },
                // Incomparable pair
                None => false,
            }
        }
    }
}

/// Ordering for range operators. `None` when the pair has no meaningful
/// order (mixed types, arrays, objects, nulls, booleans).
fn ordered_compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn check(filter: Value, document: Value) -> bool {
        matches(&parse_filter(&filter).unwrap(), &doc(document))
    }

    #[test]
    fn equality_with_coercion() {
        assert!(check(json!({"age": 30}), json!({"age": 30.0})));
        assert!(check(json!({"name": "Alice"}), json!({"name": "Alice"})));
        assert!(!check(json!({"name": "Alice"}), json!({"name": "Bob"})));
    }

    #[test]
    fn range_operators() {
        assert!(check(json!({"age": {"$gt": 28}}), json!({"age": 30})));
        assert!(!check(json!({"age": {"$gt": 30}}), json!({"age": 30})));
        assert!(check(json!({"age": {"$gte": 30}}), json!({"age": 30})));
        assert!(check(json!({"age": {"$lt": 40}}), json!({"age": 30})));
        assert!(check(json!({"name": {"$lt": "b"}}), json!({"name": "alice"})));
    }

    #[test]
    fn incomparable_pairs_are_false() {
        assert!(!check(json!({"age": {"$gt": 28}}), json!({"age": "thirty"})));
        assert!(!check(json!({"age": {"$lt": 28}}), json!({"age": "thirty"})));
        assert!(!check(json!({"age": {"$gt": true}}), json!({"age": 30})));
    }

    #[test]
    fn missing_field_matches_only_ne() {
        assert!(!check(json!({"age": {"$gt": 0}}), json!({"name": "x"})));
        assert!(!check(json!({"age": 30}), json!({"name": "x"})));
        assert!(check(json!({"age": {"$ne": 30}}), json!({"name": "x"})));
    }

    #[test]
    fn in_operator() {
        assert!(check(json!({"tag": {"$in": ["a", "b"]}}), json!({"tag": "b"})));
        assert!(!check(json!({"tag": {"$in": ["a", "b"]}}), json!({"tag": "c"})));
        assert!(check(json!({"n": {"$in": [1, 2.0]}}), json!({"n": 2})));
    }

    #[test]
    fn logical_nesting() {
        let filter = json!({
            "$or": [
                {"role": "admin"},
                {"$and": [{"age": {"$gte": 18}}, {"age": {"$lt": 65}}]}
            ]
        });
        assert!(check(filter.clone(), json!({"role": "admin", "age": 9})));
        assert!(check(filter.clone(), json!({"role": "user", "age": 40})));
        assert!(!check(filter, json!({"role": "user", "age": 70})));
    }

    #[test]
    fn dotted_paths() {
        assert!(check(
            json!({"address.city": "Utrecht"}),
            json!({"address": {"city": "Utrecht"}})
        ));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(check(json!({}), json!({"anything": 1})));
    }
}
