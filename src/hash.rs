// hash.rs
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bits::Orb;

// Marker stored in a freshly inserted entry until the caller assigns it a slot.
pub const PENDING: isize = -1;

/// Random salt used to hash occupied-orbital lists. One entry per single-particle basis function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scrambler(Vec<u32>);

impl Scrambler {
    /// Draw a fresh salt.
    /// # Arguments:
    ///   `n_bits`: usize, number of single-particle basis functions.
    ///   `rng`: Rng, random number generator.
    pub fn random(n_bits: usize, rng: &mut impl Rng) -> Self {
        Self((0..n_bits).map(|_| rng.gen::<u32>()).collect())
    }

    pub fn from_vec(salt: Vec<u32>) -> Self {
        Self(salt)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keyed hash of an occupied-orbital list.
    /// # Arguments:
    ///   `orbs`: [Orb], ascending occupied orbitals of a key.
    pub fn hash(&self, orbs: &[Orb]) -> u64 {
        let mut h: u64 = 0;
        for (j, &o) in orbs.iter().enumerate() {
            h = h.wrapping_mul(1099511628211).wrapping_add((j as u64 + 1).wrapping_mul(self.0[o as usize] as u64));
        }
        h
    }
}

/// Maps keys to the shard that owns them. Every shard must hold the same salt.
#[derive(Clone, Debug)]
pub struct ShardRouter {
    salt: Scrambler,
    n_shards: usize,
}

impl ShardRouter {
    pub fn new(salt: Scrambler, n_shards: usize) -> Self {
        Self { salt, n_shards: n_shards.max(1) }
    }

    /// Owning shard of a key given its occupied orbitals.
    pub fn shard_of(&self, orbs: &[Orb]) -> usize {
        (self.salt.hash(orbs) % self.n_shards as u64) as usize
    }

    pub fn n_shards(&self) -> usize {
        self.n_shards
    }

    pub fn salt(&self) -> &Scrambler {
        &self.salt
    }
}

// A single chained entry.
#[derive(Clone, Debug)]
struct Entry {
    key: Box<[u8]>,
    slot: isize,
}

/// Handle on an entry returned by `HashIndex::locate`. Valid until the next deletion from the
/// same bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryRef {
    bucket: usize,
    offset: usize,
}

/// Fixed-size table of chained buckets mapping keys to slot indices.
pub struct HashIndex {
    buckets: Vec<Vec<Entry>>,
    scrambler: Scrambler,
    n_entries: usize,
}

impl HashIndex {
    /// Create an empty index.
    /// # Arguments:
    ///   `capacity`: usize, number of buckets. Equal to the maximum vector size.
    ///   `scrambler`: Scrambler, salt used by `hash`.
    pub fn new(capacity: usize, scrambler: Scrambler) -> Self {
        Self { buckets: vec![Vec::new(); capacity.max(1)], scrambler, n_entries: 0 }
    }

    /// Hash of an occupied-orbital list under this index's salt.
    pub fn hash(&self, orbs: &[Orb]) -> u64 {
        self.scrambler.hash(orbs)
    }

    pub fn scrambler(&self) -> &Scrambler {
        &self.scrambler
    }

    pub fn len(&self) -> usize {
        self.n_entries
    }

    pub fn is_empty(&self) -> bool {
        self.n_entries == 0
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    /// Find the entry for `key`, optionally inserting a `PENDING` entry if it is absent.
    /// # Arguments:
    ///   `key`: [u8], bit key.
    ///   `hash`: u64, hash of the key's occupied orbitals.
    ///   `insert`: bool, whether to insert when missing.
    pub fn locate(&mut self, key: &[u8], hash: u64, insert: bool) -> Option<EntryRef> {
        if insert {
            return Some(self.entry(key, hash));
        }
        let bucket = self.bucket_of(hash);
        let offset = self.buckets[bucket].iter().position(|e| &*e.key == key)?;
        Some(EntryRef { bucket, offset })
    }

    /// Find the entry for `key`, inserting a `PENDING` entry if it is absent.
    pub fn entry(&mut self, key: &[u8], hash: u64) -> EntryRef {
        let bucket = self.bucket_of(hash);
        let chain = &mut self.buckets[bucket];
        if let Some(offset) = chain.iter().position(|e| &*e.key == key) {
            return EntryRef { bucket, offset };
        }
        chain.push(Entry { key: key.into(), slot: PENDING });
        self.n_entries += 1;
        EntryRef { bucket, offset: chain.len() - 1 }
    }

    /// Slot stored in a located entry.
    pub fn slot(&self, entry: EntryRef) -> isize {
        self.buckets[entry.bucket][entry.offset].slot
    }

    /// Fill in the slot of a located entry.
    pub fn assign(&mut self, entry: EntryRef, slot: isize) {
        self.buckets[entry.bucket][entry.offset].slot = slot;
    }

    /// Insert-or-get returning a mutable reference to the stored slot. A newly inserted entry holds
    /// `PENDING` until the caller writes the real slot index.
    pub fn read(&mut self, key: &[u8], hash: u64, insert: bool) -> Option<&mut isize> {
        let entry = self.locate(key, hash, insert)?;
        Some(&mut self.buckets[entry.bucket][entry.offset].slot)
    }

    /// Read-only lookup. Pending entries are reported as absent.
    pub fn lookup(&self, key: &[u8], hash: u64) -> Option<usize> {
        self.buckets[self.bucket_of(hash)]
            .iter()
            .find(|e| &*e.key == key)
            .and_then(|e| usize::try_from(e.slot).ok())
    }

    /// Remove the entry for `key`. Returns whether an entry was removed.
    pub fn delete(&mut self, key: &[u8], hash: u64) -> bool {
        let bucket = self.bucket_of(hash);
        let chain = &mut self.buckets[bucket];
        match chain.iter().position(|e| &*e.key == key) {
            Some(offset) => {
                chain.swap_remove(offset);
                self.n_entries -= 1;
                true
            }
            None => false,
        }
    }

    /// Drop every entry, keeping the bucket count.
    pub fn clear(&mut self) {
        for chain in self.buckets.iter_mut() {
            chain.clear();
        }
        self.n_entries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn index() -> HashIndex {
        let mut rng = SmallRng::seed_from_u64(7);
        HashIndex::new(8, Scrambler::random(16, &mut rng))
    }

    #[test]
    fn pending_insert_then_assign() {
        let mut idx = index();
        let key = [0b0000_0101u8, 0];
        let h = idx.hash(&[0, 2]);
        assert!(idx.read(&key, h, false).is_none());

        let slot = idx.read(&key, h, true).unwrap();
        assert_eq!(*slot, PENDING);
        *slot = 3;
        assert_eq!(idx.lookup(&key, h), Some(3));
        assert_eq!(*idx.read(&key, h, true).unwrap(), 3);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn delete_keeps_other_chain_members() {
        // One bucket so every key collides.
        let mut rng = SmallRng::seed_from_u64(1);
        let mut idx = HashIndex::new(1, Scrambler::random(16, &mut rng));
        let keys: Vec<[u8; 2]> = (1..6u8).map(|i| [i, 0]).collect();
        for (i, k) in keys.iter().enumerate() {
            *idx.read(k, 0, true).unwrap() = i as isize;
        }
        assert!(idx.delete(&keys[1], 0));
        assert!(!idx.delete(&keys[1], 0));
        for (i, k) in keys.iter().enumerate() {
            let expected = if i == 1 { None } else { Some(i) };
            assert_eq!(idx.lookup(k, 0), expected);
        }
        assert_eq!(idx.len(), 4);
    }

    #[test]
    fn hash_depends_on_position_and_salt() {
        let s = Scrambler::from_vec(vec![1, 2, 3, 4]);
        assert_ne!(s.hash(&[0, 1]), s.hash(&[1, 2]));
        assert_eq!(s.hash(&[]), 0);
        let router = ShardRouter::new(s.clone(), 3);
        assert!(router.shard_of(&[0, 3]) < 3);
        assert_eq!(router.shard_of(&[0, 3]), (s.hash(&[0, 3]) % 3) as usize);
    }
}
