//! Distributed unique table: the cluster-partitioned canonical node store.
//!
//! An injective content-to-index map, globally visible and append-only. The
//! *identity* of a BDD node is its index here: concurrent inserts of the same
//! content from any number of workers converge to a single index through the
//! compare-and-swap publication protocol below.
//!
//! The table is split into an `index` arena (occupancy flag, hash tag,
//! data-slot reference) and a `data` arena (the packed nodes), both
//! partitioned block-cyclically across all workers. A worker writes node
//! content only into data blocks it owns; any other outcome is a fatal
//! data-locality violation.

use log::error;

use crate::bdd::Worker;
use crate::comm::Arena;
use crate::config::{Config, Probing};
use crate::node::Node;
use crate::utils::hash_node;

// bitmaps for index entries (shared with the memoization cache)
pub(crate) const IDX_OCC: u64 = 0x8000_0000_0000_0000;
pub(crate) const IDX_HASH: u64 = 0x7FFF_FC00_0000_0000;
pub(crate) const IDX_ID: u64 = 0x0000_03FF_FFFF_FFFF;

pub(crate) struct NodeTable {
    pub index: Arena,
    /// Two words per node; slot `i` occupies words `2i` and `2i + 1`.
    pub data: Arena,
    pub total: u64,
    pub block: u64,
    /// Data blocks owned by each worker.
    pub portions: u64,
    pub workers: u64,
}

impl NodeTable {
    pub fn new(config: &Config) -> Self {
        let per_worker = config.table_entries();
        let block = config.block_size();
        let workers = config.workers as u64;
        Self {
            index: Arena::new(per_worker * workers),
            data: Arena::new(per_worker * workers * 2),
            total: per_worker * workers,
            block,
            portions: per_worker / block,
            workers,
        }
    }

    /// The worker owning the block containing `addr` (block-cyclic layout).
    pub fn owner(&self, addr: u64) -> usize {
        ((addr / self.block) % self.workers) as usize
    }
}

impl Worker {
    /// Number of contiguous index buckets fetched per remote probe.
    ///
    /// Fixed under re-salted probing; otherwise shrunk adaptively as the
    /// table fills, from the worker-local estimate of the empty fraction:
    /// large chunks amortize round trips while the table is nearly empty,
    /// small chunks avoid wasted bandwidth once it is not.
    fn chunk_size(&self) -> u64 {
        let table = &self.shared.table;
        if self.shared.config.probing == Probing::Quadratic {
            return self.shared.config.chunk_size;
        }

        let tablesize = (table.total / table.workers) as f64;
        let mut alpha = 1.0 - self.inserted as f64 / tablesize;
        alpha *= alpha;

        let size = 3.6 * ((1.0 + alpha) / (2.0 * alpha));
        let size = size.clamp(8.0, 2048.0) as u64;
        size.min(table.block)
    }

    /// Bulk-fetch `chunk` index buckets starting at `start`, splitting the
    /// read in two when the chunk straddles a partition boundary.
    fn query_chunk(&mut self, start: u64, chunk: u64) -> Vec<u64> {
        let (total, block) = {
            let t = &self.shared.table;
            (t.total, t.block)
        };
        let addr = start % total;
        let seg = (block - addr % block).min(total - addr).min(chunk);

        let mut first = self.shared.table.index.get_bulk_nb(addr, seg);
        let second = if seg < chunk {
            Some(
                self.shared
                    .table
                    .index
                    .get_bulk_nb(start.wrapping_add(seg) % total, chunk - seg),
            )
        } else {
            None
        };

        while !first.try_sync() {
            self.communicate();
        }
        let mut words = first.into_words();
        if let Some(mut fetch) = second {
            while !fetch.try_sync() {
                self.communicate();
            }
            words.extend_from_slice(fetch.words());
        }
        words
    }

    /// The next free data slot owned by this worker, or a fatal abort when
    /// all of its data sections are full. Panics if the computed address is
    /// not actually local — that is a programming error, never tolerated.
    fn table_data_index(&self, i: u64) -> u64 {
        let table = &self.shared.table;
        let section = i / table.block;
        let offset = i % table.block;

        if section >= table.portions {
            error!(
                "node table: all data sections owned by worker {} are full",
                self.id()
            );
            panic!("Node table is full");
        }

        let addr =
            section * table.workers * table.block + self.id() as u64 * table.block + offset;
        assert!(
            table.owner(addr) == self.id(),
            "Node table violation: data locality is not preserved"
        );
        addr
    }

    /// Find the node in the table, inserting it if absent, and return its
    /// cluster-wide data index.
    ///
    /// The node's content is written to a self-owned data slot *before* the
    /// index bucket is claimed with a compare-and-swap, so an index entry is
    /// only ever observed with its data already published. Losing the CAS
    /// (or meeting a matching hash tag) falls back to a content compare
    /// against the winner — structural sharing, not an error.
    pub(crate) fn table_find_or_put(&mut self, key: &Node) -> u64 {
        let chunk = self.chunk_size();
        let attempts = (4096 / chunk).max(1);

        let (word0, word1) = key.words();
        let h0 = hash_node(word0, word1, 0);
        let data_addr = self.table_data_index(self.data_i);
        self.shared.table.data.put(data_addr * 2, &[word0, word1]);

        let quadratic = self.shared.config.probing == Probing::Quadratic;
        let total = self.shared.table.total;

        for attempt in 0..attempts {
            let start = if quadratic {
                hash_node(word0, word1, attempt)
            } else {
                h0.wrapping_add(chunk * attempt)
            };
            let buckets = self.query_chunk(start, chunk);

            for (j, &entry) in buckets.iter().enumerate() {
                if entry & IDX_OCC == 0 {
                    let index_addr = start.wrapping_add(j as u64) % total;
                    let bucket = IDX_OCC | (h0 & IDX_HASH) | (data_addr & IDX_ID);
                    let prev = self.shared.table.index.cas(index_addr, entry, bucket);
                    if prev == entry {
                        self.inserted += 1;
                        self.data_i += 1;
                        return data_addr;
                    }
                    if (h0 & IDX_HASH) == (prev & IDX_HASH) {
                        let found = prev & IDX_ID;
                        if self.read_node(found) == *key {
                            return found;
                        }
                    }
                } else if (h0 & IDX_HASH) == (entry & IDX_HASH) {
                    let found = entry & IDX_ID;
                    if self.read_node(found) == *key {
                        return found;
                    }
                }
            }
        }

        error!(
            "node table full: worker {} inserted ~{}, chunk size {}, attempts {}",
            self.id(),
            self.inserted,
            chunk,
            attempts
        );
        panic!("Node table is full");
    }

    fn read_node(&mut self, index: u64) -> Node {
        if let Some(node) = self.nodecache.get(index) {
            return node;
        }
        self.table_get_data(index)
    }

    /// Resolve a data index to its node content.
    pub(crate) fn table_get_data(&mut self, index: u64) -> Node {
        let mut fetch = self.shared.table.data.get_nb::<2>(index * 2);
        while !fetch.try_sync() {
            self.communicate();
        }
        Node::from_words(fetch.word(0), fetch.word(1))
    }

    /// Overwrite a published data slot in place (traversal-mark writeback).
    pub(crate) fn table_set_data(&self, index: u64, node: &Node) {
        let (word0, word1) = node.words();
        self.shared.table.data.put(index * 2, &[word0, word1]);
    }
}
