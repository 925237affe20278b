//! Deduplicating value store.
//!
//! Grows monotonically: a value, once observed, is never removed. Alongside
//! the set the store keeps a [`SetDigest`], which anti-entropy pulls send so a
//! neighbor can tell whether the two sets actually differ.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Digest values stay below 2^53 so they survive JSON parsers that read numbers as doubles.
const DIGEST_MASK: u64 = (1 << 53) - 1;

/// Size and order-independent hash of a value set.
///
/// Two stores with the same digest hold the same values, up to hash
/// collisions. Equal sizes alone say nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetDigest {
    /// Number of distinct values
    pub len: usize,
    /// Wrapping sum of the per-value fingerprints, masked to 53 bits
    pub hash: u64,
}

#[derive(Debug, Default)]
struct Inner {
    values: BTreeSet<Value>,
    hash: u64,
}

impl Inner {
    fn insert(&mut self, value: Value) -> bool {
        let new = self.values.insert(value);
        if new {
            self.hash = self.hash.wrapping_add(fingerprint(value));
        }
        new
    }
}

/// splitmix64 finalizer.
fn fingerprint(value: Value) -> u64 {
    let mut z = (value.0 as u64).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Set of every value this node has seen.
#[derive(Debug, Default)]
pub struct ValueStore {
    inner: Mutex<Inner>,
}

impl ValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value; returns `true` only for the first observation.
    ///
    /// Check and insert happen under one lock, so concurrent callers can
    /// never both see `true` for the same value.
    pub fn observe(&self, value: Value) -> bool {
        self.inner.lock().insert(value)
    }

    /// Merge many values, returning how many were new.
    pub fn observe_all(&self, values: impl IntoIterator<Item = Value>) -> usize {
        let mut inner = self.inner.lock();
        values.into_iter().filter(|v| inner.insert(*v)).count()
    }

    /// Whether the value has been observed.
    pub fn contains(&self, value: &Value) -> bool {
        self.inner.lock().values.contains(value)
    }

    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    /// Whether nothing has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().values.is_empty()
    }

    /// Every observed value, in ascending order.
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner.lock().values.iter().copied().collect()
    }

    /// Size and hash of the current set, read under one lock.
    pub fn digest(&self) -> SetDigest {
        let inner = self.inner.lock();
        SetDigest {
            len: inner.values.len(),
            hash: inner.hash & DIGEST_MASK,
        }
    }
}
