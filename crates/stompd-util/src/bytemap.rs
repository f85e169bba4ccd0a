use std::hash::Hasher;

use once_cell::sync::Lazy;
use rand::{TryRngCore, rngs::OsRng};
use siphasher::sip::SipHasher24;

use crate::ByteString;

const MIN_BUCKETS: usize = 16;
const MAX_BUCKETS: usize = 1 << 20;
const LOAD_FACTOR: f64 = 0.75;

/// Per-process SipHash secret, drawn once from the OS entropy source.
/// Randomizing the key defends the bucket distribution against crafted
/// colliding keys from remote peers.
static PROCESS_SECRET: Lazy<(u64, u64)> = Lazy::new(|| {
    let mut key = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut key)
        .expect("no OS entropy source available for hash secret");
    (
        u64::from_le_bytes(key[..8].try_into().unwrap_or_default()),
        u64::from_le_bytes(key[8..].try_into().unwrap_or_default()),
    )
});

struct Entry<V> {
    key: ByteString,
    value: V,
}

/// Separately-chained hash map keyed by opaque byte strings.
///
/// Buckets are a power of two in [16, 2^20]; the table doubles when the load
/// factor exceeds 0.75 and never shrinks. The map owns both keys and values.
pub struct ByteMap<V> {
    buckets: Vec<Vec<Entry<V>>>,
    items: usize,
    k0: u64,
    k1: u64,
}

impl<V> ByteMap<V> {
    pub fn new() -> Self {
        let (k0, k1) = *PROCESS_SECRET;
        Self::with_secret(k0, k1)
    }

    /// A map hashing with a caller-chosen secret instead of the process one.
    /// Deterministic secrets make collision behavior reproducible in tests.
    pub fn with_secret(k0: u64, k1: u64) -> Self {
        let mut buckets = Vec::with_capacity(MIN_BUCKETS);
        buckets.resize_with(MIN_BUCKETS, Vec::new);
        Self { buckets, items: 0, k0, k1 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        let mut hasher = SipHasher24::new_with_keys(self.k0, self.k1);
        hasher.write(key);
        (hasher.finish() as usize) & (self.buckets.len() - 1)
    }

    fn grow_if_needed(&mut self) {
        if self.buckets.len() >= MAX_BUCKETS {
            return;
        }
        if (self.items + 1) as f64 <= LOAD_FACTOR * self.buckets.len() as f64 {
            return;
        }

        let new_count = (self.buckets.len() * 2).min(MAX_BUCKETS);
        let old = std::mem::take(&mut self.buckets);
        self.buckets.resize_with(new_count, Vec::new);
        for entry in old.into_iter().flatten() {
            let b = self.bucket_index(&entry.key);
            self.buckets[b].push(entry);
        }
    }

    /// Adds a key/value pair. Returns false (and drops the pair) if the key
    /// is already present.
    pub fn insert(&mut self, key: ByteString, value: V) -> bool {
        self.grow_if_needed();

        let b = self.bucket_index(&key);
        if self.buckets[b].iter().any(|e| e.key == key) {
            return false;
        }
        self.buckets[b].push(Entry { key, value });
        self.items += 1;
        true
    }

    /// Inserts the pair, returning the previous value for the key if any.
    pub fn replace(&mut self, key: ByteString, value: V) -> Option<V> {
        let b = self.bucket_index(&key);
        if let Some(entry) = self.buckets[b].iter_mut().find(|e| e.key == key) {
            return Some(std::mem::replace(&mut entry.value, value));
        }
        self.grow_if_needed();
        let b = self.bucket_index(&key);
        self.buckets[b].push(Entry { key, value });
        self.items += 1;
        None
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Looks a value up by raw bytes; a `ByteString` key derefs to the same.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let b = self.bucket_index(key);
        self.buckets[b].iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let b = self.bucket_index(key);
        self.buckets[b].iter_mut().find(|e| e.key == key).map(|e| &mut e.value)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let b = self.bucket_index(key);
        let pos = self.buckets[b].iter().position(|e| e.key == key)?;
        let entry = self.buckets[b].swap_remove(pos);
        self.items -= 1;
        Some(entry.value)
    }

    /// Removes an arbitrary entry; used to drain the map at teardown.
    pub fn remove_any(&mut self) -> Option<(ByteString, V)> {
        if self.items == 0 {
            return None;
        }
        let bucket = self.buckets.iter_mut().find(|b| !b.is_empty())?;
        let entry = bucket.pop()?;
        self.items -= 1;
        Some((entry.key, entry.value))
    }

    pub fn get_any(&self) -> Option<(&ByteString, &V)> {
        if self.items == 0 {
            return None;
        }
        self.buckets
            .iter()
            .find_map(|b| b.first())
            .map(|e| (&e.key, &e.value))
    }

    /// Snapshot of the keys, in unspecified order.
    pub fn keys(&self) -> Vec<&ByteString> {
        self.buckets.iter().flatten().map(|e| &e.key).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ByteString, &V)> {
        self.buckets.iter().flatten().map(|e| (&e.key, &e.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ByteString, &mut V)> {
        self.buckets
            .iter_mut()
            .flatten()
            .map(|e| (&e.key, &mut e.value))
    }
}

impl<V> Default for ByteMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(s: &str) -> ByteString {
        ByteString::from(s)
    }

    #[test]
    fn insert_get_remove() {
        let mut map = ByteMap::new();
        assert!(map.insert(key("alpha"), 1));
        assert!(map.insert(key("beta"), 2));
        assert!(!map.insert(key("alpha"), 3));

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(b"alpha"), Some(&1));
        assert_eq!(map.get(b"beta"), Some(&2));
        assert_eq!(map.get(b"gamma"), None);

        assert_eq!(map.remove(b"alpha"), Some(1));
        assert_eq!(map.get(b"alpha"), None);
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(b"alpha"), None);
    }

    #[test]
    fn replace_returns_old() {
        let mut map = ByteMap::new();
        assert_eq!(map.replace(key("k"), 1), None);
        assert_eq!(map.replace(key("k"), 2), Some(1));
        assert_eq!(map.get(b"k"), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn repeated_add_remove_keeps_count_exact() {
        let mut map = ByteMap::new();
        for round in 0..4 {
            for i in 0..50 {
                let mut k = key("item-");
                k.extend_from_slice(i.to_string().as_bytes());
                assert!(map.insert(k, i), "round {round} item {i}");
            }
            assert_eq!(map.len(), 50);
            for i in 0..50 {
                let mut k = key("item-");
                k.extend_from_slice(i.to_string().as_bytes());
                assert_eq!(map.remove(&k), Some(i));
            }
            assert_eq!(map.len(), 0);
        }
    }

    #[test]
    fn grows_past_load_factor() {
        let mut map = ByteMap::new();
        assert_eq!(map.bucket_count(), 16);
        for i in 0..100u32 {
            let mut k = key("grow-");
            k.extend_from_slice(i.to_string().as_bytes());
            map.insert(k, i);
        }
        assert!(map.bucket_count() >= 128);
        for i in 0..100u32 {
            let mut k = key("grow-");
            k.extend_from_slice(i.to_string().as_bytes());
            assert_eq!(map.get(&k), Some(&i), "lost key {i} across growth");
        }
    }

    #[test]
    fn collision_chain_survives_operations() {
        // With a fixed secret, hunt for keys that land in one bucket so a
        // chain at least four deep is exercised deterministically.
        let mut map = ByteMap::with_secret(7, 11);
        let mut colliding = Vec::new();
        let probe: ByteMap<()> = ByteMap::with_secret(7, 11);
        let mut i = 0u32;
        while colliding.len() < 4 {
            let k = ByteString::from(format!("probe-{i}").as_str());
            if probe.bucket_index(&k) == 0 {
                colliding.push(k);
            }
            i += 1;
        }

        for (n, k) in colliding.iter().enumerate() {
            assert!(map.insert(k.clone(), n));
        }
        for (n, k) in colliding.iter().enumerate() {
            assert_eq!(map.get(k), Some(&n));
        }
        // Remove from the middle of the chain and make sure the rest survive.
        assert_eq!(map.remove(&colliding[1]), Some(1));
        assert_eq!(map.get(&colliding[0]), Some(&0));
        assert_eq!(map.get(&colliding[2]), Some(&2));
        assert_eq!(map.get(&colliding[3]), Some(&3));
    }

    #[test]
    fn keys_snapshot_tracks_membership() {
        let mut map = ByteMap::new();
        assert!(map.keys().is_empty());

        for name in ["sub-0", "sub-1", "sub-2"] {
            map.insert(key(name), ());
        }
        let mut names: Vec<&[u8]> = map.keys().into_iter().map(|k| k.as_bytes()).collect();
        names.sort_unstable();
        assert_eq!(names, [b"sub-0".as_slice(), b"sub-1".as_slice(), b"sub-2".as_slice()]);

        map.remove(b"sub-1");
        let mut names: Vec<&[u8]> = map.keys().into_iter().map(|k| k.as_bytes()).collect();
        names.sort_unstable();
        assert_eq!(names, [b"sub-0".as_slice(), b"sub-2".as_slice()]);
    }

    #[test]
    fn drain_via_remove_any() {
        let mut map = ByteMap::new();
        for i in 0..10u32 {
            map.insert(ByteString::from(format!("d{i}").as_str()), i);
        }
        let mut seen = Vec::new();
        while let Some((_, v)) = map.remove_any() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(map.is_empty());
        assert!(map.get_any().is_none());
    }
}
