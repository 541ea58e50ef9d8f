//! The planner.
//!
//! For each top-level conjunct, try to turn a comparison on an indexed
//! field into a B+Tree range. Selectivity is a coarse heuristic:
//! equality beats a range bound beats nothing. When the chosen index is
//! also the sort field (ascending), the sort stage is elided because
//! the index scan already yields that order.

use serde_json::Value;
use smallvec::SmallVec;
use std::ops::Bound;

use loam_core::{Error, Result};

use crate::ast::{CompareOp, Filter};

/// Options accompanying a find-query request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub sort_field: Option<String>,
    pub sort_desc: bool,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl QueryOptions {
    /// Clamp limit and skip against the engine's configured maximum.
    pub fn clamp(&self, max_result_limit: usize) -> Result<QueryOptions> {
        if self.skip > max_result_limit {
            return Err(Error::InvalidQuery(format!(
                "skip {} exceeds the maximum of {}",
                self.skip, max_result_limit
            )));
        }
        let limit = match self.limit {
            Some(limit) if limit > max_result_limit => {
                return Err(Error::InvalidQuery(format!(
                    "limit {} exceeds the maximum of {}",
                    limit, max_result_limit
                )))
            }
            Some(limit) => Some(limit),
            None => Some(max_result_limit),
        };
        Ok(QueryOptions {
            sort_field: self.sort_field.clone(),
            sort_desc: self.sort_desc,
            limit,
            skip: self.skip,
        })
    }
}

/// How documents are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanPlan {
    /// Walk the primary index.
    Table,
    /// Walk one secondary index within value bounds.
    Index {
        field: String,
        lo: Bound<Value>,
        hi: Bound<Value>,
    },
}

/// An executable plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub scan: ScanPlan,
    /// Predicate evaluated on every scanned document (the bound
    /// conjunct removed).
    pub residual: Filter,
    /// `Some` when an explicit sort stage is required.
    pub sort: Option<(String, bool)>,
    /// True when the index scan already yields the requested order.
    pub order_from_index: bool,
}

impl Plan {
    pub fn uses_index(&self) -> Option<&str> {
        match &self.scan {
            ScanPlan::Index { field, .. } => Some(field),
            ScanPlan::Table => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Selectivity {
    None,
    Range,
    Equality,
}

/// Choose a scan for `filter` given the fields that have secondary
/// indexes.
pub fn plan(filter: &Filter, options: &QueryOptions, indexed_fields: &[String]) -> Plan {
    let conjuncts = filter.conjuncts();

    // Best candidate across the top-level conjuncts
    let mut best: Option<(usize, Selectivity)> = None;
    for (idx, conjunct) in conjuncts.iter().enumerate() {
        let score = match conjunct {
            Filter::Field { path, op, literal }
                if indexed_fields.iter().any(|f| f == path) && indexable_literal(literal) =>
            {
                match op {
                    CompareOp::Eq => Selectivity::Equality,
                    op if op.is_range() => Selectivity::Range,
                    _ => Selectivity::None,
                }
            }
            _ => Selectivity::None,
        };
        if score > Selectivity::None && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((idx, score));
        }
    }

    if let Some((chosen, _)) = best {
        let (field, lo, hi) = match &conjuncts[chosen] {
            Filter::Field { path, op, literal } => bounds_for(path, *op, literal),
            _ => unreachable!("candidates are field comparisons"),
        };
        let residual: SmallVec<[Filter; 4]> = conjuncts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, c)| c.clone())
            .collect();
        let order_from_index = matches!(
            (&options.sort_field, options.sort_desc),
            (Some(sort), false) if *sort == field
        );
        return Plan {
            scan: ScanPlan::Index { field, lo, hi },
            residual: collapse(residual.into_vec()),
            sort: if order_from_index {
                None
            } else {
                options.sort_field.clone().map(|f| (f, options.sort_desc))
            },
            order_from_index,
        };
    }

    // No filter candidate: an unbounded scan of the sort field's index
    // still saves the sort stage
    if let Some(sort_field) = &options.sort_field {
        if !options.sort_desc && indexed_fields.iter().any(|f| f == sort_field) {
            return Plan {
                scan: ScanPlan::Index {
                    field: sort_field.clone(),
                    lo: Bound::Unbounded,
                    hi: Bound::Unbounded,
                },
                residual: filter.clone(),
                sort: None,
                order_from_index: true,
            };
        }
    }

    Plan {
        scan: ScanPlan::Table,
        residual: filter.clone(),
        sort: options.sort_field.clone().map(|f| (f, options.sort_desc)),
        order_from_index: false,
    }
}

/// Only scalar literals map onto index keys.
fn indexable_literal(literal: &Value) -> bool {
    matches!(
        literal,
        Value::Number(_) | Value::String(_) | Value::Bool(_) | Value::Null
    )
}

fn bounds_for(path: &str, op: CompareOp, literal: &Value) -> (String, Bound<Value>, Bound<Value>) {
    let field = path.to_string();
    let lit = literal.clone();
    match op {
        CompareOp::Eq => (field, Bound::Included(lit.clone()), Bound::Included(lit)),
        CompareOp::Gt => (field, Bound::Excluded(lit), Bound::Unbounded),
        CompareOp::Gte => (field, Bound::Included(lit), Bound::Unbounded),
        CompareOp::Lt => (field, Bound::Unbounded, Bound::Excluded(lit)),
        CompareOp::Lte => (field, Bound::Unbounded, Bound::Included(lit)),
        _ => (field, Bound::Unbounded, Bound::Unbounded),
    }
}

fn collapse(mut residual: Vec<Filter>) -> Filter {
    match residual.len() {
        0 => Filter::all(),
        1 => residual.pop().expect("one residual"),
        _ => Filter::And(residual),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;
    use serde_json::json;

    fn indexed(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equality_beats_range() {
        let filter = parse_filter(&json!({"age": {"$gt": 10}, "name": "Alice"})).unwrap();
        let plan = plan(&filter, &QueryOptions::default(), &indexed(&["age", "name"]));
        assert_eq!(plan.uses_index(), Some("name"));
        // The consumed conjunct is gone from the residual
        assert_eq!(plan.residual.node_count(), 1);
    }

    #[test]
    fn range_bounds_extracted() {
        let filter = parse_filter(&json!({"age": {"$gt": 28}})).unwrap();
        let p = plan(&filter, &QueryOptions::default(), &indexed(&["age"]));
        match p.scan {
            ScanPlan::Index { field, lo, hi } => {
                assert_eq!(field, "age");
                assert_eq!(lo, Bound::Excluded(json!(28)));
                assert_eq!(hi, Bound::Unbounded);
            }
            ScanPlan::Table => panic!("expected index scan"),
        }
        assert!(p.residual.is_trivial());
    }

    #[test]
    fn unindexed_fields_fall_back_to_table_scan() {
        let filter = parse_filter(&json!({"age": {"$gt": 28}})).unwrap();
        let p = plan(&filter, &QueryOptions::default(), &indexed(&["name"]));
        assert_eq!(p.scan, ScanPlan::Table);
        assert!(!p.residual.is_trivial());
    }

    #[test]
    fn or_filters_never_use_an_index() {
        let filter = parse_filter(&json!({"$or": [{"age": 1}, {"age": 2}]})).unwrap();
        let p = plan(&filter, &QueryOptions::default(), &indexed(&["age"]));
        assert_eq!(p.scan, ScanPlan::Table);
    }

    #[test]
    fn sort_elided_when_index_covers_it() {
        let filter = parse_filter(&json!({"age": {"$gt": 28}})).unwrap();
        let options = QueryOptions {
            sort_field: Some("age".into()),
            ..QueryOptions::default()
        };
        let p = plan(&filter, &options, &indexed(&["age"]));
        assert!(p.order_from_index);
        assert!(p.sort.is_none());

        // Descending needs an explicit sort stage
        let options = QueryOptions {
            sort_field: Some("age".into()),
            sort_desc: true,
            ..QueryOptions::default()
        };
        let p = plan(&filter, &options, &indexed(&["age"]));
        assert!(!p.order_from_index);
        assert_eq!(p.sort, Some(("age".into(), true)));
    }

    #[test]
    fn bare_sort_uses_index_scan() {
        let filter = Filter::all();
        let options = QueryOptions {
            sort_field: Some("age".into()),
            ..QueryOptions::default()
        };
        let p = plan(&filter, &options, &indexed(&["age"]));
        assert_eq!(p.uses_index(), Some("age"));
        assert!(p.order_from_index);
    }

    #[test]
    fn clamp_applies_default_and_rejects_excess() {
        let options = QueryOptions::default();
        let clamped = options.clamp(100).unwrap();
        assert_eq!(clamped.limit, Some(100));

        let options = QueryOptions {
            limit: Some(1000),
            ..QueryOptions::default()
        };
        assert!(options.clamp(100).is_err());
    }
}
