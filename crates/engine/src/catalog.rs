//! The system catalog.
//!
//! `catalog.json` records everything the engine needs to reopen:
//! collection names and schemas, index definitions with their persisted
//! B+Tree roots, the WAL head and the checkpoint LSN. It is rewritten
//! atomically (write-tmp-then-rename) on schema changes, on index root
//! changes and at checkpoints.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use loam_core::{Error, Lsn, Result};
use loam_storage::btree::Comparator;

use crate::schema::Schema;

pub const CATALOG_FILE: &str = "catalog.json";

/// Persisted definition of one secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub comparator: Comparator,
    pub root: u64,
}

/// Persisted definition of one collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    /// Root of the primary (id → pointer) tree.
    pub primary_root: u64,
    /// Secondary indexes by field path.
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexMeta>,
}

/// The catalog document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogData {
    pub engine_uuid: String,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionMeta>,
    /// Root of the key/value surface tree.
    #[serde(default)]
    pub kv_root: u64,
    /// Highest LSN at the last catalog write.
    #[serde(default)]
    pub wal_head: Lsn,
    /// Recovery replays WAL records above this.
    #[serde(default)]
    pub checkpoint_lsn: Lsn,
}

/// Catalog file handle with atomic rewrite.
pub struct Catalog {
    path: PathBuf,
    data: Mutex<CatalogData>,
    /// Set by in-memory mutations that have not been persisted yet.
    dirty: Mutex<bool>,
}

impl Catalog {
    /// Load an existing catalog, or initialise a fresh one with the
    /// given engine uuid.
    pub fn load_or_create(dir: &Path, engine_uuid: &str) -> Result<Self> {
        let path = dir.join(CATALOG_FILE);
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Corruption(format!("catalog: {}", e)))?
        } else {
            CatalogData {
                engine_uuid: engine_uuid.to_string(),
                ..CatalogData::default()
            }
        };
        let catalog = Catalog {
            path,
            data: Mutex::new(data),
            dirty: Mutex::new(false),
        };
        if !catalog.path.exists() {
            catalog.save()?;
        }
        Ok(catalog)
    }

    /// A copy of the current catalog document.
    pub fn snapshot(&self) -> CatalogData {
        self.data.lock().clone()
    }

    /// Mutate in memory and persist immediately.
    pub fn update(&self, f: impl FnOnce(&mut CatalogData)) -> Result<()> {
        {
            let mut data = self.data.lock();
            f(&mut data);
        }
        self.save()
    }

    /// Mutate in memory only, deferring the rewrite to
    /// [`Catalog::save_if_dirty`]. Used by per-write index root updates
    /// so one commit causes one rewrite.
    pub fn update_deferred(&self, f: impl FnOnce(&mut CatalogData)) {
        let mut data = self.data.lock();
        f(&mut data);
        *self.dirty.lock() = true;
    }

    pub fn save_if_dirty(&self) -> Result<()> {
        let mut dirty = self.dirty.lock();
        if *dirty {
            self.save()?;
            *dirty = false;
        }
        Ok(())
    }

    /// Write-tmp-then-rename with an fsync in between.
    pub fn save(&self) -> Result<()> {
        let bytes = {
            let data = self.data.lock();
            serde_json::to_vec_pretty(&*data)?
        };
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempdir().unwrap();
        {
            let catalog = Catalog::load_or_create(dir.path(), "uuid-1").unwrap();
            catalog
                .update(|data| {
                    data.collections.insert(
                        "users".into(),
                        CollectionMeta {
                            schema: None,
                            primary_root: 42,
                            indexes: BTreeMap::from([(
                                "age".to_string(),
                                IndexMeta {
                                    comparator: Comparator::Numeric,
                                    root: 7,
                                },
                            )]),
                        },
                    );
                    data.checkpoint_lsn = 9;
                })
                .unwrap();
        }

        let catalog = Catalog::load_or_create(dir.path(), "ignored").unwrap();
        let data = catalog.snapshot();
        assert_eq!(data.engine_uuid, "uuid-1");
        assert_eq!(data.collections["users"].primary_root, 42);
        assert_eq!(data.collections["users"].indexes["age"].root, 7);
        assert_eq!(data.checkpoint_lsn, 9);
    }

    #[test]
    fn deferred_updates_persist_on_flush() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::load_or_create(dir.path(), "u").unwrap();
        catalog.update_deferred(|data| data.wal_head = 5);

        // Not yet on disk
        let reread = Catalog::load_or_create(dir.path(), "u").unwrap();
        assert_eq!(reread.snapshot().wal_head, 0);

        catalog.save_if_dirty().unwrap();
        let reread = Catalog::load_or_create(dir.path(), "u").unwrap();
        assert_eq!(reread.snapshot().wal_head, 5);
    }

    #[test]
    fn corrupt_catalog_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CATALOG_FILE), b"{ not json").unwrap();
        assert!(Catalog::load_or_create(dir.path(), "u").is_err());
    }
}
