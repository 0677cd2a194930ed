//! One-sided shared-memory substrate.
//!
//! Workers share no data structures other than [`Arena`]s: flat arrays of
//! 64-bit words with block-cyclic ownership, accessed through one-sided bulk
//! reads, plain writes, and compare-and-swap on designated words — the same
//! surface a partitioned-global-address-space transport provides.
//!
//! Reads are issued non-blocking and joined through an explicit [`Fetch`]
//! handle, so callers can overlap the miss latency with useful work (the
//! scheduler's cooperative-progress step runs inside every join loop). In
//! this in-memory build a transfer completes at issue time, but call sites
//! keep the issue/poll split so that a network-backed transport can slot in
//! without touching them.

use std::sync::atomic::{AtomicU64, Ordering};

/// A process-lifetime shared array of 64-bit words.
///
/// Any worker may read any word; writes must stay inside the partition owned
/// by the writing worker (the tables enforce this, fatally). There is no
/// deletion and no compaction: an arena only ever accumulates state until the
/// whole run terminates.
pub struct Arena {
    words: Box<[AtomicU64]>,
}

impl Arena {
    /// Allocate a zero-initialized arena of `len` words.
    pub fn new(len: u64) -> Self {
        let mut words = Vec::with_capacity(len as usize);
        words.resize_with(len as usize, || AtomicU64::new(0));
        Self {
            words: words.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> u64 {
        self.words.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Atomic read of a single word.
    pub fn load(&self, addr: u64) -> u64 {
        self.words[addr as usize].load(Ordering::Acquire)
    }

    /// Atomic write of a single word (publishes all prior writes).
    pub fn set(&self, addr: u64, word: u64) {
        self.words[addr as usize].store(word, Ordering::Release);
    }

    /// One-sided bulk write starting at `addr`.
    ///
    /// Plain (relaxed) stores: publication happens through a subsequent
    /// [`set`][Arena::set] or [`cas`][Arena::cas] on a designated word.
    pub fn put(&self, addr: u64, words: &[u64]) {
        for (i, &w) in words.iter().enumerate() {
            self.words[addr as usize + i].store(w, Ordering::Relaxed);
        }
    }

    /// Atomic compare-and-swap; returns the previous value.
    pub fn cas(&self, addr: u64, expected: u64, new: u64) -> u64 {
        match self.words[addr as usize].compare_exchange(
            expected,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }

    /// Issue a non-blocking one-sided read of `N` contiguous words.
    pub fn get_nb<const N: usize>(&self, addr: u64) -> Fetch<N> {
        let mut words = [0u64; N];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[addr as usize + i].load(Ordering::Acquire);
        }
        Fetch {
            words,
            pending: true,
        }
    }

    /// Issue a non-blocking one-sided bulk read of `len` contiguous words.
    pub fn get_bulk_nb(&self, addr: u64, len: u64) -> BulkFetch {
        let mut words = Vec::with_capacity(len as usize);
        for i in 0..len {
            words.push(self.words[(addr + i) as usize].load(Ordering::Acquire));
        }
        BulkFetch {
            words,
            pending: true,
        }
    }
}

/// An in-flight fixed-size read. Poll with [`try_sync`][Fetch::try_sync]
/// until completion, then consume the words.
#[derive(Debug)]
pub struct Fetch<const N: usize> {
    words: [u64; N],
    pending: bool,
}

impl<const N: usize> Fetch<N> {
    /// Poll for completion. Join loops look like:
    ///
    /// ```text
    /// while !fetch.try_sync() { worker.communicate(); }
    /// ```
    pub fn try_sync(&mut self) -> bool {
        self.pending = false;
        true
    }

    pub fn word(&self, i: usize) -> u64 {
        debug_assert!(!self.pending, "Fetch consumed before completion");
        self.words[i]
    }
}

/// An in-flight bulk read of a probe chunk.
#[derive(Debug)]
pub struct BulkFetch {
    words: Vec<u64>,
    pending: bool,
}

impl BulkFetch {
    pub fn try_sync(&mut self) -> bool {
        self.pending = false;
        true
    }

    pub fn words(&self) -> &[u64] {
        debug_assert!(!self.pending, "Fetch consumed before completion");
        &self.words
    }

    pub fn into_words(self) -> Vec<u64> {
        debug_assert!(!self.pending, "Fetch consumed before completion");
        self.words
    }
}

/// A counting completion signal, paired with task transfers: the sender
/// posts after the payload write, the receiver spins the counter down.
#[derive(Debug, Default)]
pub struct Signal {
    count: AtomicU64,
}

impl Signal {
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Try to consume one pending post. Only the owning worker consumes.
    pub fn try_wait(&self) -> bool {
        if self.count.load(Ordering::Acquire) > 0 {
            self.count.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }
}
