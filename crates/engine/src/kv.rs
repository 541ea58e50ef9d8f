//! The auxiliary key/value surface.
//!
//! A Redis-style store used by neighbouring services (auth sessions,
//! function state): string, list, set and hash values with optional
//! time-to-live. Entries live in their own tree but share the engine's
//! WAL and transaction pipeline, so KV writes are recovered and
//! replicated exactly like document writes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use loam_concurrency::WriteOp;
use loam_core::{Error, IsolationLevel, Key, Result, TxnId};

use crate::engine::Engine;

/// Value kinds of the KV surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KvValue {
    Str { value: String },
    List { items: VecDeque<String> },
    Set { members: BTreeSet<String> },
    Hash { fields: BTreeMap<String, String> },
}

/// Stored envelope: the value plus its optional expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: KvValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

impl KvEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map(|at| at <= now_ms).unwrap_or(false)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corruption(format!("kv entry: {}", e)))
    }
}

/// Handle on the KV surface of one engine.
pub struct KvSurface<'e> {
    engine: &'e Engine,
}

impl<'e> KvSurface<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        KvSurface { engine }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Run one operation in its own ReadCommitted transaction.
    fn with_txn<T>(&self, f: impl FnOnce(TxnId) -> Result<T>) -> Result<T> {
        let txn = self.engine.begin(IsolationLevel::ReadCommitted)?;
        match f(txn) {
            Ok(value) => {
                self.engine.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.engine.rollback(txn);
                Err(e)
            }
        }
    }

    fn load(&self, txn: TxnId, key: &str) -> Result<Option<KvEntry>> {
        let storage_key = Key::kv(key);
        let bytes = self
            .engine
            .txn_manager()
            .read(txn, &storage_key, self.engine.shared().as_ref())?;
        match bytes {
            None => Ok(None),
            Some(bytes) => {
                let entry = KvEntry::decode(&bytes)?;
                if entry.is_expired(Self::now_ms()) {
                    Ok(None)
                } else {
                    Ok(Some(entry))
                }
            }
        }
    }

    fn store(&self, txn: TxnId, key: &str, entry: &KvEntry) -> Result<()> {
        self.engine.txn_manager().write(
            txn,
            Key::kv(key),
            WriteOp::Put(entry.encode()?),
            self.engine.shared().as_ref(),
        )
    }

    // --- strings ------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_txn(|txn| match self.load(txn, key)? {
            Some(KvEntry { value: KvValue::Str { value }, .. }) => Ok(Some(value)),
            Some(_) => Err(wrong_kind(key, "string")),
            None => Ok(None),
        })
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_txn(|txn| {
            let entry = KvEntry {
                value: KvValue::Str { value: value.to_string() },
                expires_at_ms: ttl.map(|d| Self::now_ms() + d.as_millis() as i64),
            };
            self.store(txn, key, &entry)
        })
    }

    /// Delete a key of any kind. Returns whether it existed.
    pub fn del(&self, key: &str) -> Result<bool> {
        self.with_txn(|txn| {
            if self.load(txn, key)?.is_none() {
                return Ok(false);
            }
            self.engine.txn_manager().write(
                txn,
                Key::kv(key),
                WriteOp::Delete,
                self.engine.shared().as_ref(),
            )?;
            Ok(true)
        })
    }

    /// Set or refresh a time-to-live. Returns false for a missing key.
    /// Recorded in the WAL under its own record kind.
    pub fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_txn(|txn| {
            let mut entry = match self.load(txn, key)? {
                Some(entry) => entry,
                None => return Ok(false),
            };
            entry.expires_at_ms = Some(Self::now_ms() + ttl.as_millis() as i64);
            self.engine.txn_manager().write(
                txn,
                Key::kv(key),
                WriteOp::Expire(entry.encode()?),
                self.engine.shared().as_ref(),
            )?;
            Ok(true)
        })
    }

    // --- lists --------------------------------------------------------

    pub fn lpush(&self, key: &str, item: &str) -> Result<usize> {
        self.list_mutate(key, |items| {
            items.push_front(item.to_string());
            items.len()
        })
    }

    pub fn rpush(&self, key: &str, item: &str) -> Result<usize> {
        self.list_mutate(key, |items| {
            items.push_back(item.to_string());
            items.len()
        })
    }

    pub fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.list_mutate(key, VecDeque::pop_front)
    }

    pub fn rpop(&self, key: &str) -> Result<Option<String>> {
        self.list_mutate(key, VecDeque::pop_back)
    }

    /// Inclusive range with Redis-style negative indices.
    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.with_txn(|txn| match self.load(txn, key)? {
            Some(KvEntry { value: KvValue::List { items }, .. }) => {
                let len = items.len() as i64;
                let clamp = |i: i64| -> i64 {
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i.min(len - 1)
                    }
                };
                if len == 0 {
                    return Ok(Vec::new());
                }
                let (from, to) = (clamp(start), clamp(stop));
                if from > to {
                    return Ok(Vec::new());
                }
                Ok(items
                    .iter()
                    .skip(from as usize)
                    .take((to - from + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(wrong_kind(key, "list")),
            None => Ok(Vec::new()),
        })
    }

    fn list_mutate<T>(&self, key: &str, f: impl FnOnce(&mut VecDeque<String>) -> T) -> Result<T> {
        self.with_txn(|txn| {
            let mut entry = match self.load(txn, key)? {
                Some(entry @ KvEntry { value: KvValue::List { .. }, .. }) => entry,
                Some(_) => return Err(wrong_kind(key, "list")),
                None => KvEntry {
                    value: KvValue::List { items: VecDeque::new() },
                    expires_at_ms: None,
                },
            };
            let result = match &mut entry.value {
                KvValue::List { items } => f(items),
                _ => unreachable!("kind checked above"),
            };
            let empty = matches!(&entry.value, KvValue::List { items } if items.is_empty());
            if empty {
                self.engine.txn_manager().write(
                    txn,
                    Key::kv(key),
                    WriteOp::Delete,
                    self.engine.shared().as_ref(),
                )?;
            } else {
                self.store(txn, key, &entry)?;
            }
            Ok(result)
        })
    }

    // --- sets ---------------------------------------------------------

    pub fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.set_mutate(key, |members| members.insert(member.to_string()))
    }

    pub fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.set_mutate(key, |members| members.remove(member))
    }

    pub fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_txn(|txn| match self.load(txn, key)? {
            Some(KvEntry { value: KvValue::Set { members }, .. }) => {
                Ok(members.into_iter().collect())
            }
            Some(_) => Err(wrong_kind(key, "set")),
            None => Ok(Vec::new()),
        })
    }

    fn set_mutate<T>(&self, key: &str, f: impl FnOnce(&mut BTreeSet<String>) -> T) -> Result<T> {
        self.with_txn(|txn| {
            let mut entry = match self.load(txn, key)? {
                Some(entry @ KvEntry { value: KvValue::Set { .. }, .. }) => entry,
                Some(_) => return Err(wrong_kind(key, "set")),
                None => KvEntry {
                    value: KvValue::Set { members: BTreeSet::new() },
                    expires_at_ms: None,
                },
            };
            let result = match &mut entry.value {
                KvValue::Set { members } => f(members),
                _ => unreachable!("kind checked above"),
            };
            let empty = matches!(&entry.value, KvValue::Set { members } if members.is_empty());
            if empty {
                self.engine.txn_manager().write(
                    txn,
                    Key::kv(key),
                    WriteOp::Delete,
                    self.engine.shared().as_ref(),
                )?;
            } else {
                self.store(txn, key, &entry)?;
            }
            Ok(result)
        })
    }

    // --- hashes -------------------------------------------------------

    pub fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_txn(|txn| {
            let mut entry = match self.load(txn, key)? {
                Some(entry @ KvEntry { value: KvValue::Hash { .. }, .. }) => entry,
                Some(_) => return Err(wrong_kind(key, "hash")),
                None => KvEntry {
                    value: KvValue::Hash { fields: BTreeMap::new() },
                    expires_at_ms: None,
                },
            };
            if let KvValue::Hash { fields } = &mut entry.value {
                fields.insert(field.to_string(), value.to_string());
            }
            self.store(txn, key, &entry)
        })
    }

    pub fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_txn(|txn| match self.load(txn, key)? {
            Some(KvEntry { value: KvValue::Hash { fields }, .. }) => {
                Ok(fields.get(field).cloned())
            }
            Some(_) => Err(wrong_kind(key, "hash")),
            None => Ok(None),
        })
    }

    pub fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.with_txn(|txn| {
            let mut entry = match self.load(txn, key)? {
                Some(entry @ KvEntry { value: KvValue::Hash { .. }, .. }) => entry,
                Some(_) => return Err(wrong_kind(key, "hash")),
                None => return Ok(false),
            };
            let removed = match &mut entry.value {
                KvValue::Hash { fields } => fields.remove(field).is_some(),
                _ => unreachable!("kind checked above"),
            };
            let empty = matches!(&entry.value, KvValue::Hash { fields } if fields.is_empty());
            if empty {
                self.engine.txn_manager().write(
                    txn,
                    Key::kv(key),
                    WriteOp::Delete,
                    self.engine.shared().as_ref(),
                )?;
            } else if removed {
                self.store(txn, key, &entry)?;
            }
            Ok(removed)
        })
    }

    pub fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        self.with_txn(|txn| match self.load(txn, key)? {
            Some(KvEntry { value: KvValue::Hash { fields }, .. }) => Ok(fields),
            Some(_) => Err(wrong_kind(key, "hash")),
            None => Ok(BTreeMap::new()),
        })
    }
}

fn wrong_kind(key: &str, expected: &str) -> Error {
    Error::InvalidArgument(format!(
        "kv key {:?} holds a different kind (expected {})",
        key, expected
    ))
}
