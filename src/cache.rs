//! Cluster-partitioned memoization cache.
//!
//! Best-effort, evicting, and racy by design: a miss always falls back to
//! recomputation, and a hit is trusted only after the reader re-validates the
//! *full* three-operand key against the data slot — a matching hash tag never
//! suffices. Writers resolve collisions by overwrite, with no retries and no
//! chaining; concurrent writers may clobber each other and that is accepted.
//!
//! Lookups are split into a non-blocking `request` and a later `check`, so a
//! caller can overlap the remote fetch with other work.

use crate::bdd::Worker;
use crate::comm::Arena;
use crate::config::Config;
use crate::reference::Ref;
use crate::table::{IDX_HASH, IDX_ID, IDX_OCC};
use crate::utils::{hash_triple, PRIME2};

// operator tags folded into the data field of the first cache operand
pub(crate) const TAG_ITE: u16 = 0;
pub(crate) const TAG_RELNEXT: u16 = 1;
pub(crate) const TAG_AND: u16 = 2;
pub(crate) const TAG_XOR: u16 = 3;
pub(crate) const TAG_SATCOUNT: u16 = 4;
pub(crate) const TAG_SUPPORT: u16 = 5;

pub(crate) struct OpCache {
    pub index: Arena,
    /// Four words per entry (a, b, c, res); entry `i` occupies words `4i..4i+4`.
    pub data: Arena,
    pub total: u64,
    pub block: u64,
    pub portions: u64,
    pub workers: u64,
}

impl OpCache {
    pub fn new(config: &Config) -> Self {
        let per_worker = config.cache_entries();
        let block = config.block_size();
        let workers = config.workers as u64;
        Self {
            index: Arena::new(per_worker * workers),
            data: Arena::new(per_worker * workers * 4),
            total: per_worker * workers,
            block,
            portions: per_worker / block,
            workers,
        }
    }

    pub fn owner(&self, addr: u64) -> usize {
        ((addr / self.block) % self.workers) as usize
    }
}

impl Worker {
    /// Start a non-blocking lookup: issue the one-sided fetch of the index
    /// bucket and return immediately. Join with [`cache_check`][Worker::cache_check].
    pub(crate) fn cache_request(&mut self, a: u64, b: u64, c: u64) {
        let a = Ref::from_bits(a).clear_lock().bits();
        let h = hash_triple(a, b, c);
        let bucket = h % self.shared.cache.total;
        self.cache_fetch = Some(self.shared.cache.index.get_nb::<1>(bucket));
    }

    fn cache_join(&mut self) -> u64 {
        let mut fetch = self
            .cache_fetch
            .take()
            .expect("No cache request in flight");
        while !fetch.try_sync() {
            self.communicate();
        }
        fetch.word(0)
    }

    /// Join an in-flight lookup. Accept the entry only if the bucket is
    /// occupied, its hash tag matches, and the referenced data slot is
    /// unlocked and stores exactly (a, b, c).
    pub(crate) fn cache_check(&mut self, a: u64, b: u64, c: u64) -> Option<u64> {
        let entry = self.cache_join();
        if entry & IDX_OCC == 0 {
            return None;
        }

        let a = Ref::from_bits(a).clear_lock().bits();
        let h = hash_triple(a, b, c);
        if (h & IDX_HASH) != (entry & IDX_HASH) {
            return None;
        }

        let slot = entry & IDX_ID;
        let mut fetch = self.shared.cache.data.get_nb::<4>(slot * 4);
        while !fetch.try_sync() {
            self.communicate();
        }

        if Ref::from_bits(fetch.word(0)).is_locked() {
            return None;
        }
        if fetch.word(0) != a || fetch.word(1) != b || fetch.word(2) != c {
            return None;
        }
        Some(fetch.word(3))
    }

    /// Blocking lookup: request and check in one step.
    pub(crate) fn cache_get(&mut self, a: u64, b: u64, c: u64) -> Option<u64> {
        self.cache_request(a, b, c);
        self.cache_check(a, b, c)
    }

    /// The data slot for hash `h`, chosen through an independent salted mix
    /// so that it is guaranteed to land in a block owned by this worker.
    fn cache_data_addr(&self, h: u64) -> u64 {
        let cache = &self.shared.cache;
        let section = (h.wrapping_mul(PRIME2) >> 32) % cache.portions;
        let offset = (h >> 34) % cache.block;
        section * cache.workers * cache.block + self.id() as u64 * cache.block + offset
    }

    /// Store a result. Lock the slot, fill the record, unlock by writing the
    /// key last, then atomically publish the index entry. No coordination
    /// with concurrent writers: the next reader's full-key check is the only
    /// correctness mechanism.
    pub(crate) fn cache_put(&mut self, a: u64, b: u64, c: u64, res: u64) {
        let a = Ref::from_bits(a).clear_lock().bits();
        let h = hash_triple(a, b, c);
        let bucket = h % self.shared.cache.total;
        let slot = self.cache_data_addr(h);

        assert!(
            self.shared.cache.owner(slot) == self.id(),
            "Memoization table violation: data locality is not preserved"
        );

        let entry = IDX_OCC | (h & IDX_HASH) | (slot & IDX_ID);
        let data = &self.shared.cache.data;
        data.set(slot * 4, Ref::FALSE.with_lock().bits());
        data.put(slot * 4 + 1, &[b, c, res]);
        data.set(slot * 4, a);
        self.shared.cache.index.set(bucket, entry);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::cluster::Cluster;
    use crate::config::Config;

    fn tiny() -> Config {
        // 16 buckets force plenty of collisions
        Config {
            cache_bits: 4,
            block_bits: 4,
            table_bits: 10,
            ..Config::default()
        }
    }

    #[test]
    fn test_roundtrip_and_collisions() {
        Cluster::new(tiny()).run(|w| {
            w.cache_put(11, 22, 33, 4242);
            assert_eq!(w.cache_get(11, 22, 33), Some(4242));

            // no other key may ever alias onto this entry, bucket
            // collisions included
            for c in 0..200u64 {
                if c == 33 {
                    continue;
                }
                assert_eq!(w.cache_get(11, 22, c), None);
            }

            // same key overwrites in place
            w.cache_put(11, 22, 33, 9999);
            assert_eq!(w.cache_get(11, 22, 33), Some(9999));
        });
    }

    #[test]
    fn test_lock_bit_is_not_part_of_the_key() {
        Cluster::new(tiny()).run(|w| {
            let locked = crate::reference::Ref::from_bits(11).with_lock().bits();
            w.cache_put(locked, 0, 0, 7);
            assert_eq!(w.cache_get(11, 0, 0), Some(7));
            assert_eq!(w.cache_get(locked, 0, 0), Some(7));
        });
    }

    #[test]
    fn test_eviction_is_never_aliasing() {
        Cluster::new(tiny()).run(|w| {
            // overwrite-only eviction: a hit must always be the exact value
            // stored for that exact key
            let mut reference = std::collections::HashMap::new();
            let mut state = 0x2545_F491_4F6C_DD1Du64;
            for i in 0..200u64 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let key = (state >> 16 & 0xFF, state >> 24 & 0xFF, state >> 32 & 0xFF);
                w.cache_put(key.0, key.1, key.2, i);
                reference.insert(key, i);
            }
            let mut hits = 0;
            for (&(a, b, c), &value) in &reference {
                if let Some(res) = w.cache_get(a, b, c) {
                    assert_eq!(res, value);
                    hits += 1;
                }
            }
            assert!(hits > 0);
        });
    }
}
