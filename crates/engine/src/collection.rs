//! Collection handles.
//!
//! All operations take the caller's transaction id and run through the
//! transaction manager, so isolation and read-own-writes behave the
//! same whether a call arrives over the wire or from an embedder.
//! Returned documents are copies.

use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use loam_concurrency::{TransactionManager, WriteOp};
use loam_core::config::QueryConfig;
use loam_core::{Document, Error, Key, Result, TxnId};
use loam_query::{
    filter_stream, limit_stream, parse_filter, plan, skip_stream, sort_documents, DocIter,
    QueryOptions, ScanPlan,
};
use loam_storage::btree::BTree;

use crate::encoding::{decode_posting, encode_index_value};
use crate::engine::{CollectionCore, EngineShared};
use crate::schema::Schema;

/// One field-level patch operation. `Set` creates intermediate objects
/// along the path; `Remove` of a missing path is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Set { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    /// Apply this operation to a document in place.
    pub fn apply(&self, doc: &mut Document) -> Result<()> {
        match self {
            PatchOp::Set { path, value } => set_path(doc, path, value.clone()),
            PatchOp::Remove { path } => {
                remove_path(doc, path);
                Ok(())
            }
        }
    }
}

/// Handle for operations on one collection.
pub struct Collection {
    shared: Arc<EngineShared>,
    txns: Arc<TransactionManager>,
    core: Arc<CollectionCore>,
    query: QueryConfig,
}

impl Collection {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        txns: Arc<TransactionManager>,
        core: Arc<CollectionCore>,
        query: QueryConfig,
    ) -> Self {
        Collection {
            shared,
            txns,
            core,
            query,
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.core.schema.as_ref()
    }

    fn key(&self, id: &str) -> Key {
        Key::document(&self.core.name, id)
    }

    fn check_schema(&self, doc: &Document) -> Result<()> {
        if let Some(schema) = &self.core.schema {
            schema.validate(doc)?;
        }
        Ok(())
    }

    /// Insert a document, minting `_id` when absent. Returns the id.
    pub fn insert(&self, txn: TxnId, mut doc: Document) -> Result<String> {
        doc.validate()?;
        let id = match doc.id() {
            Some(id) => id.to_string(),
            None => {
                let minted = uuid::Uuid::new_v4().to_string();
                doc.set_id(minted.clone());
                minted
            }
        };
        self.check_schema(&doc)?;

        let key = self.key(&id);
        if self
            .txns
            .read(txn, &key, self.shared.as_ref())?
            .is_some()
        {
            return Err(Error::DuplicateKey { key });
        }
        self.txns
            .write(txn, key, WriteOp::Put(doc.to_bytes()), self.shared.as_ref())?;
        Ok(id)
    }

    /// Replace a document wholesale. The payload's `_id`, if present,
    /// must match `id`.
    pub fn update(&self, txn: TxnId, id: &str, mut doc: Document) -> Result<()> {
        if let Some(payload_id) = doc.id() {
            if payload_id != id {
                return Err(Error::InvalidDocument(format!(
                    "payload _id {:?} does not match target id {:?}",
                    payload_id, id
                )));
            }
        }
        doc.set_id(id);
        doc.validate()?;
        self.check_schema(&doc)?;

        let key = self.key(id);
        if self
            .txns
            .read(txn, &key, self.shared.as_ref())?
            .is_none()
        {
            return Err(Error::DocumentNotFound { key });
        }
        self.txns
            .write(txn, key, WriteOp::Put(doc.to_bytes()), self.shared.as_ref())?;
        Ok(())
    }

    /// Apply field-level patch operations and return the new document.
    pub fn patch(&self, txn: TxnId, id: &str, ops: &[PatchOp]) -> Result<Document> {
        let key = self.key(id);
        let current = self
            .txns
            .read(txn, &key, self.shared.as_ref())?
            .ok_or_else(|| Error::DocumentNotFound { key: key.clone() })?;
        let mut doc = Document::from_bytes(&current)?;

        for op in ops {
            op.apply(&mut doc)?;
        }
        doc.set_id(id);
        doc.validate()?;
        self.check_schema(&doc)?;

        self.txns
            .write(txn, key, WriteOp::Put(doc.to_bytes()), self.shared.as_ref())?;
        Ok(doc)
    }

    pub fn delete(&self, txn: TxnId, id: &str) -> Result<()> {
        let key = self.key(id);
        if self
            .txns
            .read(txn, &key, self.shared.as_ref())?
            .is_none()
        {
            return Err(Error::DocumentNotFound { key });
        }
        self.txns
            .write(txn, key, WriteOp::Delete, self.shared.as_ref())?;
        Ok(())
    }

    pub fn find_by_id(&self, txn: TxnId, id: &str) -> Result<Option<Document>> {
        let key = self.key(id);
        match self.txns.read(txn, &key, self.shared.as_ref())? {
            Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Run a filter query with sort, skip and limit.
    pub fn find_query(
        &self,
        txn: TxnId,
        filter_value: &Value,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        let _gauge = QueryGauge::enter(&self.shared, self.query.max_concurrent_queries)?;
        let filter = parse_filter(filter_value)?;
        let options = options.clamp(self.query.max_result_limit)?;
        let indexed = self.core.indexed_fields();
        let plan = plan(&filter, &options, &indexed);

        // One snapshot for the whole statement
        let snapshot = self.txns.statement_snapshot(txn)?;

        let candidate_ids = match &plan.scan {
            ScanPlan::Table => {
                let mut ids = Vec::new();
                self.core.primary.scan(&mut |id_bytes, _| {
                    ids.push(String::from_utf8_lossy(id_bytes).into_owned());
                    Ok(true)
                })?;
                ids
            }
            ScanPlan::Index { field, lo, hi } => {
                let tree = self
                    .core
                    .secondary(field)
                    .ok_or_else(|| Error::IndexNotFound {
                        collection: self.core.name.clone(),
                        field: field.clone(),
                    })?;
                match encode_bounds(&tree, lo, hi) {
                    Some((lo_bytes, hi_bytes)) => {
                        let mut ids = Vec::new();
                        tree.range(
                            as_bound(&lo_bytes),
                            as_bound(&hi_bytes),
                            &mut |_, posting| {
                                ids.extend(decode_posting(posting)?);
                                Ok(true)
                            },
                        )?;
                        ids
                    }
                    // Bound not representable in this index: no match
                    None => Vec::new(),
                }
            }
        };

        // Lazy fetch so Limit stops pulling early
        let shared = Arc::clone(&self.shared);
        let txns = Arc::clone(&self.txns);
        let core = Arc::clone(&self.core);
        let snapshot_for_fetch = snapshot.clone();
        let fetch: DocIter<'_> = Box::new(
            candidate_ids
                .into_iter()
                .filter_map(move |id| {
                    shared.docs_examined.fetch_add(1, Ordering::Relaxed);
                    let key = Key::document(&core.name, &id);
                    match txns.read_at(txn, &key, &snapshot_for_fetch, shared.as_ref()) {
                        Ok(Some(bytes)) => Some(Document::from_bytes(&bytes)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    }
                }),
        );

        let filtered = filter_stream(fetch, plan.residual.clone());
        let piped: DocIter<'_> = match &plan.sort {
            Some((field, desc)) => {
                let sorted = sort_documents(filtered, field, *desc)?;
                Box::new(sorted.into_iter().map(Ok))
            }
            None => filtered,
        };
        limit_stream(skip_stream(piped, options.skip), options.limit).collect()
    }

    /// Committed document count (ignores uncommitted staging).
    pub fn count(&self) -> Result<u64> {
        self.core.primary.entry_count()
    }

    pub fn create_index(
        &self,
        field: &str,
        comparator: loam_storage::btree::Comparator,
    ) -> Result<()> {
        self.shared.create_index(&self.core.name, field, comparator)
    }

    pub fn delete_index(&self, field: &str) -> Result<()> {
        self.shared.delete_index(&self.core.name, field)
    }

    pub fn indexed_fields(&self) -> Vec<String> {
        self.core.indexed_fields()
    }
}

/// RAII slot in the engine's concurrent-query gauge.
struct QueryGauge<'s> {
    shared: &'s Arc<EngineShared>,
}

impl<'s> QueryGauge<'s> {
    fn enter(shared: &'s Arc<EngineShared>, max: usize) -> Result<Self> {
        let previous = shared.active_queries.fetch_add(1, Ordering::AcqRel);
        if previous as usize >= max {
            shared.active_queries.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Transient(format!(
                "engine at its limit of {} concurrent queries",
                max
            )));
        }
        Ok(QueryGauge { shared })
    }
}

impl Drop for QueryGauge<'_> {
    fn drop(&mut self) {
        self.shared.active_queries.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Translate planner value bounds into encoded tree bounds. `None` when
/// a bound value is not representable in this index (no key can match).
fn encode_bounds(
    tree: &BTree,
    lo: &Bound<Value>,
    hi: &Bound<Value>,
) -> Option<(Bound<Vec<u8>>, Bound<Vec<u8>>)> {
    let encode = |bound: &Bound<Value>| -> Option<Bound<Vec<u8>>> {
        Some(match bound {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(v) => Bound::Included(encode_index_value(tree.comparator(), v)?),
            Bound::Excluded(v) => Bound::Excluded(encode_index_value(tree.comparator(), v)?),
        })
    };
    Some((encode(lo)?, encode(hi)?))
}

fn as_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
    }
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidArgument(format!("invalid patch path {:?}", path)));
    }
    if segments.len() == 1 {
        doc.insert(segments[0], value);
        return Ok(());
    }

    let mut current = doc
        .as_map()
        .get(segments[0])
        .cloned()
        .unwrap_or(Value::Object(Default::default()));
    set_path_value(&mut current, &segments[1..], value)?;
    doc.insert(segments[0], current);
    Ok(())
}

fn set_path_value(target: &mut Value, segments: &[&str], value: Value) -> Result<()> {
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let map = target.as_object_mut().expect("object ensured above");
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value);
        return Ok(());
    }
    let child = map
        .entry(segments[0].to_string())
        .or_insert(Value::Object(Default::default()));
    set_path_value(child, &segments[1..], value)
}

fn remove_path(doc: &mut Document, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() == 1 {
        doc.remove(segments[0]);
        return;
    }
    let mut current = match doc.as_map().get(segments[0]).cloned() {
        Some(v) => v,
        None => return,
    };
    remove_path_value(&mut current, &segments[1..]);
    doc.insert(segments[0], current);
}

fn remove_path_value(target: &mut Value, segments: &[&str]) {
    let map = match target.as_object_mut() {
        Some(m) => m,
        None => return,
    };
    if segments.len() == 1 {
        map.remove(segments[0]);
        return;
    }
    if let Some(child) = map.get_mut(segments[0]) {
        remove_path_value(child, &segments[1..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut doc = Document::from_value(json!({"a": 1})).unwrap();
        set_path(&mut doc, "b.c.d", json!(9)).unwrap();
        assert_eq!(doc.field("b.c.d"), Some(&json!(9)));
        assert_eq!(doc.field("a"), Some(&json!(1)));
    }

    #[test]
    fn set_path_replaces_scalars_along_the_way() {
        let mut doc = Document::from_value(json!({"a": 5})).unwrap();
        set_path(&mut doc, "a.b", json!(1)).unwrap();
        assert_eq!(doc.field("a.b"), Some(&json!(1)));
    }

    #[test]
    fn remove_path_is_noop_for_missing() {
        let mut doc = Document::from_value(json!({"a": {"b": 1}})).unwrap();
        remove_path(&mut doc, "a.b");
        remove_path(&mut doc, "x.y");
        assert_eq!(doc.field("a.b"), None);
    }
}
