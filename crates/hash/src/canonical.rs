//! Canonical byte serialization for hashable records.
//!
//! Records are serialized by hand, field by field, in an order fixed by the
//! record's [`CanonicalHash`] impl. Nothing here is derived: adding, removing
//! or reordering a field is a visible code change that must come with a bump
//! of [`crate::HASH_FORMAT_VERSION`].
//!
//! Encoding: every field starts with a one-byte type marker. Strings carry
//! their byte length, lists and maps their element count, so no two distinct
//! records share a serialization.

use std::collections::BTreeMap;
use xxhash_rust::xxh64::xxh64;

/// Accumulates the canonical serialization of one record.
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    /// Start a record. `tag` names the record type so that two different
    /// record types with equal field values still serialize differently.
    #[must_use]
    pub fn record(tag: &str) -> Self {
        let mut writer = Self::default();
        writer.str(tag);
        writer
    }

    /// Append a string field.
    pub fn str(&mut self, value: &str) -> &mut Self {
        self.buf.push(b's');
        self.len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append a boolean field.
    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(b'b');
        self.buf.push(u8::from(value));
        self
    }

    /// Append a list field, preserving the given order.
    pub fn list<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.buf.push(b'l');
        self.len(items.len());
        for item in items {
            self.str(item.as_ref());
        }
        self
    }

    /// Append a list field after sorting and deduplicating it.
    pub fn sorted_list<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        let mut sorted: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        sorted.dedup();
        self.list(&sorted)
    }

    /// Append a map field in key order.
    pub fn map(&mut self, map: &BTreeMap<String, String>) -> &mut Self {
        self.buf.push(b'm');
        self.len(map.len());
        for (key, value) in map {
            self.str(key);
            self.str(value);
        }
        self
    }

    /// The serialized bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn len(&mut self, len: usize) {
        self.buf.extend_from_slice(&(len as u64).to_le_bytes());
    }
}

/// A record with a fixed, hand-written canonical serialization.
pub trait CanonicalHash {
    /// Write every field, in the record's fixed order.
    fn write_canonical(&self) -> CanonicalWriter;

    /// xxHash64 of the canonical serialization as 16 lowercase hex digits.
    fn hash(&self) -> String {
        hash_bytes(&self.write_canonical().into_bytes())
    }
}

/// xxHash64 (seed 0) of `bytes` as 16 lowercase hex digits.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:016x}", xxh64(bytes, 0))
}
