//! An inverted-index builder on a MapReduce (lite) engine.
//!
//! Forward records of the form `id,attr,attr,...` are expanded into
//! `(attr, id)` pairs by a map function, shuffled into buckets by key, and
//! reduced into one posting list per attribute. The engine runs standalone
//! on a single machine; the workload functions themselves are pure and can be
//! driven by any executor that honours the group-by-key contract.

use bytes::Bytes;
use std::hash::Hasher;

pub mod encode;
pub mod error;
pub mod standalone;
pub mod utils;
pub mod workload;

pub use error::JobError;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a key-value pair and auxiliary arguments.
///
/// It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing the rendered output for that key.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes>;

/// Checks the user's auxiliary arguments (a JSON list of strings) once per
/// job and turns them into the `aux` handed to every map and reduce call.
///
/// Runs before the job touches its output, so a bad argument leaves any
/// previous output in place.
pub type ArgsFn = fn(aux: Bytes) -> anyhow::Result<Bytes>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub args_fn: ArgsFn,
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    // masked to 31 bits, always fits
    (hasher.finish() & 0x7fffffff) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_is_stable_and_31_bit() {
        let a = ihash(b"red");
        assert_eq!(a, ihash(b"red"));
        assert!(a <= 0x7fffffff);
        assert_ne!(ihash(b"red"), ihash(b"blue"));
    }

    #[test]
    fn key_value_accessors() {
        let kv = KeyValue::new(Bytes::from("k"), Bytes::from("v"));
        assert_eq!(kv.key(), Bytes::from("k"));
        assert_eq!(kv.value(), Bytes::from("v"));
        assert_eq!(kv.into_value(), Bytes::from("v"));
    }
}
