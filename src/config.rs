use log::debug;

/// Collision strategy of the distributed unique table.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Probing {
    /// Contiguous chunks with an adaptively shrinking chunk size.
    #[default]
    Linear,
    /// Re-salted hashing per attempt with a fixed configured chunk size.
    /// Avoids clustering, at the price of more scattered remote reads.
    Quadratic,
}

/// Run configuration, fixed for the lifetime of a [`Cluster`][crate::cluster::Cluster].
///
/// All components receive the worker count and the partition geometry from
/// here; nothing is inferred from ambient state. Sizes are powers of two,
/// counted *per worker* (the cluster-wide tables hold `workers << bits`
/// entries). Production runs use `block_bits = 23` and a node table of at
/// least `2^24` entries; the defaults below are sized for single-machine
/// experiments and tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of SPMD workers, fixed for the whole run.
    pub workers: usize,
    /// Node table size per worker: `2^table_bits` entries.
    pub table_bits: u32,
    /// Memoization table size per worker: `2^cache_bits` entries.
    pub cache_bits: u32,
    /// Consult the memoization table only every `1/N` BDD levels (floor 4).
    pub granularity: u32,
    /// Collision strategy of the node table.
    pub probing: Probing,
    /// Buckets fetched per probe under quadratic probing (1..=4096).
    pub chunk_size: u64,
    /// Partition block size: `2^block_bits` contiguous entries per block.
    pub block_bits: u32,
    /// Task deque size per worker: `2^deque_bits` slots.
    pub deque_bits: u32,
    /// Worker-local store capacity: `2^localstore_bits` nodes.
    pub localstore_bits: u32,
    /// Worker-local read cache of remote nodes: `2^nodecache_bits` slots.
    pub nodecache_bits: u32,
    /// Workers per "near" distance tier of the victim topology.
    pub near_group: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            table_bits: 16,
            cache_bits: 14,
            granularity: 8,
            probing: Probing::Linear,
            chunk_size: 8,
            block_bits: 12,
            deque_bits: 14,
            localstore_bits: 16,
            nodecache_bits: 12,
            near_group: 8,
        }
    }
}

impl Config {
    /// Normalize the configuration, clamping every knob into its valid range.
    pub fn validate(mut self) -> Self {
        assert!(self.workers >= 1, "At least one worker is required");
        assert!(
            self.workers < 1 << 19,
            "Worker id must fit the 19-bit thief field"
        );

        self.granularity = self.granularity.max(4);
        self.block_bits = self.block_bits.clamp(4, 26);

        // the table and the cache must each cover at least one block
        self.table_bits = self.table_bits.clamp(self.block_bits, 32);
        self.cache_bits = self.cache_bits.clamp(self.block_bits, 32);

        // a chunk never spans more than two blocks
        self.chunk_size = self.chunk_size.clamp(1, 4096);
        self.chunk_size = self.chunk_size.min(1 << self.block_bits);

        self.deque_bits = self.deque_bits.clamp(4, 28);
        assert!(
            (self.workers as u64) << self.deque_bits < 1 << 35,
            "Deque slots must fit the 35-bit task index field"
        );

        self.near_group = self.near_group.max(1);

        debug!(
            "config: {} workers, table 2^{}, cache 2^{}, granularity {}, {:?} probing, chunk {}",
            self.workers,
            self.table_bits,
            self.cache_bits,
            self.granularity,
            self.probing,
            self.chunk_size
        );
        self
    }

    pub(crate) fn table_entries(&self) -> u64 {
        1 << self.table_bits
    }
    pub(crate) fn cache_entries(&self) -> u64 {
        1 << self.cache_bits
    }
    pub(crate) fn block_size(&self) -> u64 {
        1 << self.block_bits
    }
    pub(crate) fn deque_size(&self) -> u64 {
        1 << self.deque_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granularity_floor() {
        let config = Config {
            granularity: 1,
            ..Config::default()
        };
        assert_eq!(config.validate().granularity, 4);
    }

    #[test]
    fn test_chunk_bounds() {
        let config = Config {
            chunk_size: 100_000,
            ..Config::default()
        };
        assert_eq!(config.validate().chunk_size, 4096);

        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert_eq!(config.validate().chunk_size, 1);
    }

    #[test]
    fn test_table_covers_a_block() {
        let config = Config {
            table_bits: 4,
            block_bits: 12,
            ..Config::default()
        };
        assert_eq!(config.validate().table_bits, 12);
    }

    #[test]
    #[should_panic(expected = "At least one worker")]
    fn test_zero_workers() {
        Config {
            workers: 0,
            ..Config::default()
        }
        .validate();
    }
}
