//! Versioned key/value attributes shared between sensors, operators and
//! actions.
//!
//! Every value carries the set of producers that last wrote it, the write
//! timestamp and a visibility flag. Hidden attributes are internal
//! bookkeeping: they travel with [`AttributeStore::copy_all_from`] but are
//! never part of [`AttributeStore::exposed`] or any serialized form.
//!
//! Values are stored as JSON so snapshots stay self-describing; typed
//! access goes through [`AttributeKey`] constants so a key is always read
//! back as the type it was written with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Result, WardError};

// ---------------------------------------------------------------------------
// AttributeKey
// ---------------------------------------------------------------------------

/// A named attribute slot with a fixed value type.
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> std::fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttributeKey({})", self.name)
    }
}

/// Well-known attribute keys.
pub mod keys {
    use super::AttributeKey;
    use crate::collaborators::ShardReplicas;
    use std::collections::BTreeSet;

    /// Target nodes of a cluster-wide action.
    pub const NODE_IDS: AttributeKey<Vec<String>> = AttributeKey::new("nodeIds");
    /// Target node of a node-level action.
    pub const NODE_ID: AttributeKey<String> = AttributeKey::new("nodeId");
    /// Replica placement per data shard, published by the topology sensor.
    pub const TOPOLOGY: AttributeKey<Vec<ShardReplicas>> = AttributeKey::new("topology");
    /// Nodes with a recovery in flight; the write timestamp starts the cooldown.
    pub const RECOVERING_NODES: AttributeKey<BTreeSet<String>> =
        AttributeKey::new("recoveringNodes");
    pub const TRY_RESTART: AttributeKey<bool> = AttributeKey::new("tryRestart");
    pub const NODE_EXISTS: AttributeKey<bool> = AttributeKey::new("nodeExists");
    pub const MAX_CONCURRENCY: AttributeKey<usize> = AttributeKey::new("maxConcurrency");
    pub const CHECKING_INTERVAL_MS: AttributeKey<u64> = AttributeKey::new("checkingIntervalMs");
    pub const CANCEL_ALL_IF_FAILED: AttributeKey<bool> = AttributeKey::new("cancelAllIfFailed");
    pub const ACTION_TIMEOUT_SECS: AttributeKey<u64> = AttributeKey::new("actionTimeout");
}

// ---------------------------------------------------------------------------
// Attribute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: Value,
    #[serde(default)]
    pub publishers: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl Attribute {
    pub fn new(value: Value, publishers: BTreeSet<String>) -> Self {
        Self {
            value,
            publishers,
            updated_at: Utc::now(),
            hidden: false,
        }
    }

    /// Time elapsed since the last write, clamped at zero.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.updated_at).max(chrono::Duration::zero())
    }

    fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        match serde_json::from_value::<T>(self.value.clone()) {
            Ok(v) => Ok(v),
            // Values set from the command line or config arrive as strings.
            Err(first) => match &self.value {
                Value::String(s) => {
                    serde_json::from_str::<T>(s).map_err(|_| WardError::AttributeType {
                        key: key.to_string(),
                        message: first.to_string(),
                    })
                }
                _ => Err(WardError::AttributeType {
                    key: key.to_string(),
                    message: first.to_string(),
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// AttributeStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AttributeStore {
    inner: RwLock<HashMap<String, Attribute>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(&self, key: AttributeKey<T>, value: &T) -> Result<()> {
        self.set_with_publishers(key, value, std::iter::empty::<String>())
    }

    /// Write `value`, attributing it to `publishers` (typically sensor names).
    pub fn set_with_publishers<T, I, S>(
        &self,
        key: AttributeKey<T>,
        value: &T,
        publishers: I,
    ) -> Result<()>
    where
        T: Serialize,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let value = serde_json::to_value(value)?;
        let publishers = publishers.into_iter().map(Into::into).collect();
        self.insert(key.name(), Attribute::new(value, publishers));
        Ok(())
    }

    /// Write an internal attribute that never shows up in exposed views.
    pub fn set_hidden<T: Serialize>(&self, key: AttributeKey<T>, value: &T) -> Result<()> {
        let mut attr = Attribute::new(serde_json::to_value(value)?, BTreeSet::new());
        attr.hidden = true;
        self.insert(key.name(), attr);
        Ok(())
    }

    /// Untyped write, for values arriving from outside (CLI, config).
    pub fn set_raw(&self, name: &str, value: Value) {
        self.insert(name, Attribute::new(value, BTreeSet::new()));
    }

    pub fn insert(&self, name: &str, attr: Attribute) {
        self.write().insert(name.to_string(), attr);
    }

    pub fn get<T: DeserializeOwned>(&self, key: AttributeKey<T>) -> Result<Option<T>> {
        match self.read().get(key.name()) {
            Some(attr) => attr.decode(key.name()).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_raw(&self, name: &str) -> Option<Attribute> {
        self.read().get(name).cloned()
    }

    pub fn contains<T>(&self, key: AttributeKey<T>) -> bool {
        self.contains_name(key.name())
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Attribute> {
        self.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy every attribute of `other` into this store, hidden ones included.
    pub fn copy_all_from(&self, other: &AttributeStore) {
        let copied = other.read().clone();
        self.write().extend(copied);
    }

    /// Copy one attribute of `other` under a (possibly different) name.
    /// Returns false when `other` has no attribute `from`.
    pub fn copy_from(&self, other: &AttributeStore, from: &str, to: &str) -> bool {
        match other.get_raw(from) {
            Some(attr) => {
                self.insert(to, attr);
                true
            }
            None => false,
        }
    }

    /// Externally visible attributes.
    pub fn exposed(&self) -> BTreeMap<String, Attribute> {
        self.read()
            .iter()
            .filter(|(_, a)| !a.hidden)
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect()
    }

    /// Replace the whole content, as when restoring a snapshot.
    pub fn replace_all(&self, attrs: BTreeMap<String, Attribute>) {
        *self.write() = attrs.into_iter().collect();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Attribute>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Attribute>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Serialize for AttributeStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.exposed().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttributeStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let attrs = BTreeMap::<String, Attribute>::deserialize(deserializer)?;
        let store = AttributeStore::new();
        store.replace_all(attrs);
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
