//! The iterator pipeline: Scan → Filter → Sort → Skip → Limit.
//!
//! Stages are lazy, pull-based, finite and not restartable. Sort is the
//! one pipeline breaker: it drains its input on first pull, using a
//! stable sort so equal keys keep scan order. Results are owned
//! documents; callers never see aliases into storage.

use serde_json::Value;
use std::cmp::Ordering;

use loam_core::document::compare_values;
use loam_core::{Document, Result};

use crate::ast::Filter;
use crate::eval::matches;

/// A stream of documents, possibly failing mid-way.
pub type DocIter<'a> = Box<dyn Iterator<Item = Result<Document>> + 'a>;

/// Keep only documents matching `filter`.
pub fn filter_stream<'a>(input: DocIter<'a>, filter: Filter) -> DocIter<'a> {
    if filter.is_trivial() {
        return input;
    }
    Box::new(input.filter(move |item| match item {
        Ok(doc) => matches(&filter, doc),
        // Errors always flow through to the caller
        Err(_) => true,
    }))
}

/// Skip the first `n` matching documents.
pub fn skip_stream(input: DocIter<'_>, n: usize) -> DocIter<'_> {
    if n == 0 {
        return input;
    }
    Box::new(input.skip(n))
}

/// Stop after `n` documents. Stops pulling from upstream as well.
pub fn limit_stream(input: DocIter<'_>, n: Option<usize>) -> DocIter<'_> {
    match n {
        Some(n) => Box::new(input.take(n)),
        None => input,
    }
}

/// Drain the stream and stable-sort by `field`. Documents missing the
/// field sort first (ascending). The descending order is the exact
/// reverse of the ascending one.
pub fn sort_documents(input: DocIter<'_>, field: &str, descending: bool) -> Result<Vec<Document>> {
    let mut docs: Vec<Document> = input.collect::<Result<_>>()?;
    docs.sort_by(|a, b| compare_fields(a.field(field), b.field(field)));
    if descending {
        docs.reverse();
    }
    Ok(docs)
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;
    use serde_json::json;

    fn docs(values: &[Value]) -> Vec<Document> {
        values
            .iter()
            .map(|v| Document::from_value(v.clone()).unwrap())
            .collect()
    }

    fn stream(values: Vec<Document>) -> DocIter<'static> {
        Box::new(values.into_iter().map(Ok))
    }

    fn ages(docs: &[Document]) -> Vec<i64> {
        docs.iter()
            .map(|d| d.get("age").and_then(Value::as_i64).unwrap())
            .collect()
    }

    #[test]
    fn pipeline_filters_sorts_skips_limits() {
        let input = docs(&[
            json!({"age": 40}),
            json!({"age": 25}),
            json!({"age": 35}),
            json!({"age": 30}),
        ]);

        let filter = parse_filter(&json!({"age": {"$gt": 28}})).unwrap();
        let filtered = filter_stream(stream(input), filter);
        let sorted = sort_documents(filtered, "age", false).unwrap();
        assert_eq!(ages(&sorted), vec![30, 35, 40]);

        let paged: Vec<Document> = limit_stream(skip_stream(stream(sorted), 1), Some(2))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ages(&paged), vec![35, 40]);
    }

    #[test]
    fn descending_sort_reverses() {
        let input = docs(&[json!({"age": 25}), json!({"age": 40}), json!({"age": 30})]);
        let sorted = sort_documents(stream(input), "age", true).unwrap();
        assert_eq!(ages(&sorted), vec![40, 30, 25]);
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let input = docs(&[
            json!({"age": 30, "n": 1}),
            json!({"age": 30, "n": 2}),
            json!({"age": 20, "n": 3}),
        ]);
        let sorted = sort_documents(stream(input), "age", false).unwrap();
        let ns: Vec<i64> = sorted
            .iter()
            .map(|d| d.get("n").and_then(Value::as_i64).unwrap())
            .collect();
        assert_eq!(ns, vec![3, 1, 2]);
    }

    #[test]
    fn missing_sort_field_orders_first() {
        let input = docs(&[json!({"age": 30}), json!({"name": "x"})]);
        let sorted = sort_documents(stream(input), "age", false).unwrap();
        assert!(sorted[0].get("age").is_none());
    }

    #[test]
    fn limit_stops_pulling_upstream() {
        let pulled = std::cell::Cell::new(0usize);
        let source = (0..100).map(|i| {
            pulled.set(pulled.get() + 1);
            Ok(Document::from_value(json!({ "n": i })).unwrap())
        });
        let limited: Vec<Document> = limit_stream(Box::new(source), Some(3))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(pulled.get(), 3);
    }
}
