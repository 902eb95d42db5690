//! Order-invariant hashing of key/value maps.
//!
//! Used to fingerprint option maps so that pools can be shared between data
//! sources configured with the same options.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash the entries of a map so that insertion order never matters.
///
/// Entries are visited in key order; duplicate keys keep the last value.
pub fn map_hash<'a, K, V, I>(entries: I) -> u64
where
    K: Hash + Ord + 'a,
    V: Hash + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    let sorted: BTreeMap<&K, &V> = entries.into_iter().collect();
    let mut hasher = DefaultHasher::new();
    sorted.len().hash(&mut hasher);
    for (key, value) in sorted {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}
