//! Filter parsing.
//!
//! The surface dialect is a JSON mapping:
//!
//! - the top-level mapping is an implicit AND of its entries;
//! - a value that is a mapping whose keys all start with `$` is an
//!   operator expression (`{"age": {"$gt": 28}}`);
//! - `$and` / `$or` take a non-empty sequence of sub-mappings and nest
//!   without a depth limit of their own;
//! - any other value is shorthand for equality.

use serde_json::Value;

use loam_core::limits::MAX_QUERY_NODES;
use loam_core::{Error, Result};

use crate::ast::{CompareOp, Filter};

/// Parse a filter document into the AST. Unknown `$` operators and
/// malformed shapes are validation errors.
pub fn parse_filter(value: &Value) -> Result<Filter> {
    let filter = parse_mapping(value)?;
    let nodes = filter.node_count();
    if nodes > MAX_QUERY_NODES {
        return Err(Error::InvalidQuery(format!(
            "filter has {} nodes, exceeding the maximum of {}",
            nodes, MAX_QUERY_NODES
        )));
    }
    Ok(filter)
}

fn parse_mapping(value: &Value) -> Result<Filter> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("filter must be a JSON object".into()))?;

    let mut children = Vec::with_capacity(map.len());
    for (key, entry) in map {
        children.push(parse_entry(key, entry)?);
    }
    Ok(match children.len() {
        1 => children.pop().expect("one child"),
        _ => Filter::And(children),
    })
}

fn parse_entry(key: &str, value: &Value) -> Result<Filter> {
    if let Some(stripped) = key.strip_prefix('$') {
        return match stripped {
            "and" => Ok(Filter::And(parse_logical_children(key, value)?)),
            "or" => Ok(Filter::Or(parse_logical_children(key, value)?)),
            _ => Err(Error::InvalidQuery(format!("unknown operator {:?}", key))),
        };
    }

    match value {
        Value::Object(ops) if is_operator_mapping(ops) => {
            let mut children = Vec::with_capacity(ops.len());
            for (op_key, literal) in ops {
                children.push(parse_comparison(key, op_key, literal)?);
            }
            Ok(match children.len() {
                1 => children.pop().expect("one child"),
                _ => Filter::And(children),
            })
        }
        // Anything else, plain objects included, is equality shorthand
        literal => Ok(Filter::Field {
            path: key.to_string(),
            op: CompareOp::Eq,
            literal: literal.clone(),
        }),
    }
}

fn is_operator_mapping(map: &serde_json::Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn parse_comparison(path: &str, op_key: &str, literal: &Value) -> Result<Filter> {
    let op = match op_key {
        "$eq" => CompareOp::Eq,
        "$ne" => CompareOp::Ne,
        "$gt" => CompareOp::Gt,
        "$gte" => CompareOp::Gte,
        "$lt" => CompareOp::Lt,
        "$lte" => CompareOp::Lte,
        "$in" => CompareOp::In,
        other => {
            return Err(Error::InvalidQuery(format!(
                "unknown operator {:?} on field {:?}",
                other, path
            )))
        }
    };
    if op == CompareOp::In && !literal.is_array() {
        return Err(Error::InvalidQuery(format!(
            "$in on field {:?} requires an array literal",
            path
        )));
    }
    Ok(Filter::Field {
        path: path.to_string(),
        op,
        literal: literal.clone(),
    })
}

fn parse_logical_children(key: &str, value: &Value) -> Result<Vec<Filter>> {
    let items = value.as_array().ok_or_else(|| {
        Error::InvalidQuery(format!("{} requires a sequence of sub-filters", key))
    })?;
    if items.is_empty() {
        return Err(Error::InvalidQuery(format!(
            "{} requires at least one sub-filter",
            key
        )));
    }
    items.iter().map(parse_mapping).collect()
}
