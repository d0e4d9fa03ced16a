use crate::hasher::Fingerprint;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

/// Ordered set of visible fingerprints for prefix lookups.
///
/// The store mutates it only while holding the owning shard's lock
/// (shard first, index second). Readers collect keys and drop the index
/// lock before touching any shard.
#[derive(Debug, Default)]
pub struct QueryIndex {
    keys: RwLock<BTreeSet<Fingerprint>>,
}

impl QueryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, fingerprint: Fingerprint) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint)
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fingerprint)
    }

    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `limit` keys starting with `prefix`, in lexicographic order,
    /// and how many keys match in total. Both come from one read of the
    /// index.
    ///
    /// `prefix` must already be lowercase.
    #[must_use]
    pub fn prefix_scan(&self, prefix: &str, limit: usize) -> (Vec<Fingerprint>, usize) {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches = keys
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|key| key.as_str().starts_with(prefix));
        let first: Vec<Fingerprint> = matches.by_ref().take(limit).cloned().collect();
        let total = first.len() + matches.count();
        (first, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::fingerprint;
    use pretty_assertions::assert_eq;

    fn fp(hex_prefix: &str) -> Fingerprint {
        let mut raw = hex_prefix.to_string();
        while raw.len() < 64 {
            raw.push('0');
        }
        Fingerprint::parse(&raw).unwrap()
    }

    #[test]
    fn test_prefix_scan_is_ordered_and_bounded() {
        let index = QueryIndex::new();
        for prefix in ["ab1", "ab3", "ab2", "ac", "aa", "b"] {
            index.insert(fp(prefix));
        }

        let (keys, total) = index.prefix_scan("ab", 10);
        let hits: Vec<_> = keys.iter().map(|k| k.as_str()[..3].to_string()).collect();
        assert_eq!(hits, vec!["ab1", "ab2", "ab3"]);
        assert_eq!(total, 3);

        let (keys, total) = index.prefix_scan("a", 2);
        assert_eq!(keys, vec![fp("aa"), fp("ab1")]);
        assert_eq!(total, 5);

        assert_eq!(index.prefix_scan("c", 10), (Vec::new(), 0));
        assert_eq!(index.prefix_scan("", 0), (Vec::new(), 6));
    }

    #[test]
    fn test_insert_remove() {
        let index = QueryIndex::new();
        let key = fingerprint(b"k");
        assert!(index.insert(key.clone()));
        assert!(!index.insert(key.clone()));
        assert!(index.contains(&key));
        assert_eq!(index.len(), 1);
        assert!(index.remove(&key));
        assert!(index.is_empty());
    }

    #[test]
    fn test_full_key_is_its_own_prefix() {
        let index = QueryIndex::new();
        let key = fingerprint(b"exact");
        index.insert(key.clone());
        assert_eq!(index.prefix_scan(key.as_str(), 5), (vec![key], 1));
    }
}
