//! Work-stealing scheduler over one-sided memory.
//!
//! SPMD: every worker owns a deque of spawned tasks and interleaves its own
//! recursion with servicing steal requests at well-defined suspension points
//! ([`call`][Worker::call], [`sync`][Worker::sync], and the blocking step of
//! a steal). There is no shared-memory deque protocol: a thief claims a
//! victim's single-slot request cell with a compare-and-swap, and the victim
//! pushes one task descriptor into the thief's transfer cell with a one-sided
//! write plus a completion signal.
//!
//! Local order is strictly LIFO; steals take the oldest (head) task. A
//! blocked [`sync`][Worker::sync] first tries to steal *back from the thief*
//! (leapfrogging — that worker is the one closest to finishing the result we
//! need), then sweeps random victims grouped into distance tiers, nearest
//! tier first. Every spawned task executes exactly once, somewhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use log::debug;
use nanorand::{Rng, WyRand};

use crate::bdd::Worker;
use crate::comm::{Arena, Signal};
use crate::config::Config;

/// Words per deque task slot: metadata, a, b, c, lvl, output.
pub(crate) const TASK_WORDS: u64 = 6;
/// Words per transfer cell: metadata plus the four input words.
const TRANSFER_WORDS: u64 = 5;

// task metadata bits
const TASK_STOLEN: u64 = 1 << 63;
const TASK_EMPTY: u64 = 1 << 62;
const TASK_OP_SHIFT: u32 = 54;
const TASK_OP_MASK: u64 = 0xFF << TASK_OP_SHIFT;
const TASK_THIEF_SHIFT: u32 = 35;
const TASK_THIEF_MASK: u64 = 0x7FFFF << TASK_THIEF_SHIFT;
const TASK_INDEX_MASK: u64 = (1 << 35) - 1;

// request cell states
const REQ_EMPTY: u64 = 0;
const REQ_BLOCK: u64 = 1 << 63;
const REQ_OCC: u64 = 1 << 62;
const REQ_THIEF_MASK: u64 = (1 << 62) - 1;

/// "Done" flag on a published task output (same bit as [`Ref`]'s done flag).
const OUT_DONE: u64 = 1 << 63;

/// Keep at least this many queued tasks before granting steals.
const TRANS_THRESHOLD: u64 = 2;

/// Number of victim distance tiers.
const TIERS: usize = 4;

/// Operators understood by the task dispatcher.
///
/// An operator tag outside this set reaching the dispatcher is a programming
/// error and aborts the run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Ite = 1,
    RelNext = 2,
    SatCount = 3,
    GoPar = 4,
    Par = 5,
    And = 6,
    Xor = 7,
    Support = 8,
}

impl Op {
    pub(crate) fn bits(self) -> u64 {
        (self as u64) << TASK_OP_SHIFT
    }

    fn from_meta(meta: u64) -> Option<Op> {
        match (meta & TASK_OP_MASK) >> TASK_OP_SHIFT {
            1 => Some(Op::Ite),
            2 => Some(Op::RelNext),
            3 => Some(Op::SatCount),
            4 => Some(Op::GoPar),
            5 => Some(Op::Par),
            6 => Some(Op::And),
            7 => Some(Op::Xor),
            8 => Some(Op::Support),
            _ => None,
        }
    }
}

/// Per-worker scheduler counters.
///
/// The exactly-once property of the scheduler is observable here: summed over
/// all workers, `spawned == synced_local + stolen`.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Tasks appended to this worker's deque.
    pub spawned: u64,
    /// Spawned tasks popped and executed locally at `sync`.
    pub synced_local: u64,
    /// Tasks this worker stole from others and executed.
    pub stolen: u64,
    /// Steal attempts (successful or not).
    pub steal_attempts: u64,
    /// Steals answered with the empty sentinel.
    pub empty_steals: u64,
    /// Steals refused because the request cell was already taken.
    pub failed_steals: u64,
    /// Steals refused because the victim was blocked.
    pub blocked_steals: u64,
    /// Tasks executed by this worker (called, synced or stolen).
    pub executed: u64,
}

/// Victim selection tiers, nearest first.
///
/// The in-process stand-in for hardware distance: workers within the same
/// `near_group` land in tier 0, everyone else in tier 1 (the two far tiers
/// stay empty until a real topology backs them).
pub struct Topology {
    tiers: [Vec<usize>; TIERS],
}

impl Topology {
    pub(crate) fn new(me: usize, workers: usize, near_group: usize) -> Self {
        let mut tiers: [Vec<usize>; TIERS] = Default::default();
        for i in 0..workers {
            if i == me {
                continue;
            }
            let tier = if i / near_group == me / near_group { 0 } else { 1 };
            tiers[tier].push(i);
        }
        Self { tiers }
    }

    pub fn tier_len(&self, tier: usize) -> usize {
        self.tiers[tier].len()
    }

    fn victim(&self, tier: usize, i: usize) -> usize {
        self.tiers[tier][i]
    }

    fn pick(&self, tier: usize, rng: &mut WyRand) -> usize {
        self.tiers[tier][rng.generate_range(0..self.tiers[tier].len())]
    }
}

/// Shared scheduler state: deques, transfer cells, request cells,
/// termination flags and completion signals, one of each per worker.
pub(crate) struct Sched {
    pub deque: Arena,
    pub transfer: Arena,
    pub request: Box<[CachePadded<AtomicU64>]>,
    pub term: Box<[CachePadded<AtomicU64>]>,
    pub signal: Box<[CachePadded<Signal>]>,
    /// Count of workers that have acknowledged termination this round.
    pub quiesced: AtomicU64,
    pub deque_size: u64,
}

impl Sched {
    pub fn new(config: &Config) -> Self {
        let workers = config.workers as u64;
        let deque_size = config.deque_size();
        Self {
            deque: Arena::new(workers * deque_size * TASK_WORDS),
            transfer: Arena::new(workers * TRANSFER_WORDS),
            request: (0..workers)
                .map(|_| CachePadded::new(AtomicU64::new(REQ_EMPTY)))
                .collect(),
            term: (0..workers)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            signal: (0..workers)
                .map(|_| CachePadded::new(Signal::default()))
                .collect(),
            quiesced: AtomicU64::new(0),
            deque_size,
        }
    }
}

/// Result of a cluster-wide computation, returned on the initiating worker.
#[derive(Debug, Clone)]
pub struct ComputeOut {
    /// Raw output word of the root task (a [`Ref`][crate::reference::Ref]
    /// for BDD-valued operators, a count for `SatCount`).
    pub output: u64,
    /// Wall-clock time of the root call.
    pub elapsed: Duration,
}

impl Worker {
    fn task_addr(&self, worker: usize, slot: u64) -> u64 {
        (worker as u64 * self.shared.sched.deque_size + slot) * TASK_WORDS
    }

    /// Append a task to the tail of the local deque.
    pub(crate) fn spawn(&mut self, op: Op, a: u64, b: u64, c: u64, lvl: u32) {
        if self.tail + 1 >= self.shared.sched.deque_size {
            panic!("Deque is full");
        }
        let addr = self.task_addr(self.id(), self.tail);
        self.shared
            .sched
            .deque
            .put(addr, &[op.bits(), a, b, c, lvl as u64, 0]);
        self.tail += 1;
        self.stats.spawned += 1;
    }

    /// Execute a task immediately and synchronously, after servicing one
    /// pending steal request (cooperative progress).
    pub(crate) fn call(&mut self, op: Op, a: u64, b: u64, c: u64, lvl: u32) -> u64 {
        self.communicate();
        self.stats.executed += 1;
        self.dispatch(op, a, b, c, lvl)
    }

    /// Pop the most recently spawned task.
    ///
    /// If it was never stolen, execute it here and now. If it was stolen,
    /// wait for its published result, leapfrogging the thief first and then
    /// sweeping random victims, nearest tier first.
    pub(crate) fn sync(&mut self) -> u64 {
        self.communicate();
        debug_assert!(self.tail > 0, "sync without a matching spawn");
        let slot = self.tail - 1;
        let addr = self.task_addr(self.id(), slot);
        let meta = self.shared.sched.deque.load(addr);

        if meta & TASK_STOLEN != 0 {
            let thief = ((meta & TASK_THIEF_MASK) >> TASK_THIEF_SHIFT) as usize;
            let out_addr = addr + 5;

            'wait: while self.shared.sched.deque.load(out_addr) & OUT_DONE == 0 {
                // leapfrog: the thief is the closest to finishing our result
                if self.steal_from(thief) {
                    continue 'wait;
                }
                if self.shared.sched.deque.load(out_addr) & OUT_DONE != 0 {
                    break 'wait;
                }
                for tier in 0..TIERS {
                    for _ in 0..self.topology.tier_len(tier) {
                        let victim = self.topology.pick(tier, &mut self.rng);
                        if self.steal_from(victim) {
                            continue 'wait;
                        }
                        if self.shared.sched.deque.load(out_addr) & OUT_DONE != 0 {
                            break 'wait;
                        }
                    }
                }
            }

            let output = self.shared.sched.deque.load(out_addr);
            self.head -= 1;
            self.tail -= 1;
            output & !OUT_DONE
        } else {
            self.tail -= 1;
            self.stats.synced_local += 1;
            self.stats.executed += 1;
            let deque = &self.shared.sched.deque;
            let (a, b, c, lvl) = (
                deque.load(addr + 1),
                deque.load(addr + 2),
                deque.load(addr + 3),
                deque.load(addr + 4),
            );
            let op = Op::from_meta(meta).expect("Unrecognized task operator");
            self.dispatch(op, a, b, c, lvl as u32)
        }
    }

    /// Attempt to steal one task from `victim`.
    ///
    /// On a successful claim of the victim's request cell, block until the
    /// task descriptor arrives (servicing our own pending requests while
    /// waiting), execute it, and publish the result into the originating
    /// deque slot marked done. An empty sentinel is a benign failure.
    pub(crate) fn steal_from(&mut self, victim: usize) -> bool {
        self.communicate();
        self.stats.steal_attempts += 1;

        let me = self.id();
        let prev = match self.shared.sched.request[victim].compare_exchange(
            REQ_EMPTY,
            (me as u64 & REQ_THIEF_MASK) | REQ_OCC,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) => prev,
            Err(prev) => prev,
        };

        if prev != REQ_EMPTY {
            if prev & REQ_BLOCK != 0 {
                self.stats.blocked_steals += 1;
            } else {
                self.stats.failed_steals += 1;
            }
            return false;
        }

        // wait for the task to arrive
        while !self.shared.sched.signal[me].try_wait() {
            self.communicate();
            std::hint::spin_loop();
        }

        let base = me as u64 * TRANSFER_WORDS;
        let meta = self.shared.sched.transfer.load(base);
        if meta & TASK_EMPTY != 0 {
            // no work was available, or we lost a race: not an error
            self.stats.empty_steals += 1;
            return false;
        }

        let transfer = &self.shared.sched.transfer;
        let (a, b, c, lvl) = (
            transfer.load(base + 1),
            transfer.load(base + 2),
            transfer.load(base + 3),
            transfer.load(base + 4),
        );
        let op = Op::from_meta(meta).expect("Unrecognized task operator");

        self.stats.stolen += 1;
        self.stats.executed += 1;
        let output = self.dispatch(op, a, b, c, lvl as u32);

        // publish the result back into the originating deque slot
        let origin = meta & TASK_INDEX_MASK;
        self.shared
            .sched
            .deque
            .set(origin * TASK_WORDS + 5, output | OUT_DONE);
        true
    }

    /// Cooperative progress, invoked at every suspension point.
    ///
    /// With fewer than [`TRANS_THRESHOLD`] queued tasks the worker marks
    /// itself unstealable rather than giving away its last work; otherwise a
    /// pending steal request is answered with the oldest queued task.
    pub(crate) fn communicate(&mut self) {
        let me = self.id();
        let req = self.shared.sched.request[me].load(Ordering::Acquire);

        if self.tail - self.head < TRANS_THRESHOLD {
            if req & REQ_BLOCK == 0 {
                if req & REQ_OCC != 0 {
                    self.refuse_and_block();
                } else if self.shared.sched.request[me]
                    .compare_exchange(REQ_EMPTY, REQ_BLOCK, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // a thief slipped in between the load and the swap
                    self.refuse_and_block();
                }
            }
        } else if req & REQ_BLOCK != 0 {
            self.shared.sched.request[me].store(REQ_EMPTY, Ordering::Release);
        } else if req & REQ_OCC != 0 {
            let thief = (req & REQ_THIEF_MASK) as usize;
            self.shared.sched.request[me].store(REQ_EMPTY, Ordering::Release);

            // mark the head task stolen and hand it to the thief
            let slot = self.head;
            let addr = self.task_addr(me, slot);
            let global = me as u64 * self.shared.sched.deque_size + slot;
            let deque = &self.shared.sched.deque;
            let meta = deque.load(addr)
                | TASK_STOLEN
                | (((thief as u64) << TASK_THIEF_SHIFT) & TASK_THIEF_MASK)
                | (global & TASK_INDEX_MASK);
            deque.set(addr, meta);
            let words = [
                meta,
                deque.load(addr + 1),
                deque.load(addr + 2),
                deque.load(addr + 3),
                deque.load(addr + 4),
            ];
            self.shared
                .sched
                .transfer
                .put(thief as u64 * TRANSFER_WORDS, &words);
            self.shared.sched.signal[thief].post();
            self.head += 1;
        }
    }

    /// Answer the pending thief with the empty sentinel, then mark this
    /// worker unstealable.
    fn refuse_and_block(&mut self) {
        let me = self.id();
        let req = self.shared.sched.request[me].load(Ordering::Acquire);
        let thief = (req & REQ_THIEF_MASK) as usize;
        self.shared
            .sched
            .transfer
            .set(thief as u64 * TRANSFER_WORDS, TASK_EMPTY);
        self.shared.sched.signal[thief].post();
        self.shared.sched.request[me].store(REQ_BLOCK, Ordering::Release);
    }

    fn initiate(&mut self, op: Op, a: u64, b: u64, c: u64, lvl: u32) -> ComputeOut {
        let me = self.id();
        self.shared.sched.term[me].store(0, Ordering::Release);
        self.shared.sched.quiesced.store(0, Ordering::Release);
        self.shared.barrier.wait();

        let start = Instant::now();
        let output = self.call(op, a, b, c, lvl);
        let elapsed = start.elapsed();
        debug!("initiator finished root task in {:?}", elapsed);

        for i in 0..self.shared.config.workers {
            self.shared.sched.term[i].store(u64::MAX, Ordering::Release);
        }
        self.rendezvous();
        // close the round: the next one may not reset the quiescence count
        // while anyone is still inside this rendezvous
        self.shared.barrier.wait();

        ComputeOut { output, elapsed }
    }

    /// Acknowledge termination, then keep servicing steal requests until
    /// every worker has acknowledged too. A thief that claimed our request
    /// cell in the window between our last suspension point and the flag
    /// broadcast would otherwise wait forever on a transfer nobody sends.
    fn rendezvous(&mut self) {
        let workers = self.shared.config.workers as u64;
        self.shared.sched.quiesced.fetch_add(1, Ordering::AcqRel);
        while self.shared.sched.quiesced.load(Ordering::Acquire) < workers {
            self.communicate();
            std::hint::spin_loop();
        }
    }

    fn participate(&mut self) {
        let me = self.id();
        self.shared.sched.term[me].store(0, Ordering::Release);
        self.shared.barrier.wait();

        'sweep: while self.shared.sched.term[me].load(Ordering::Acquire) == 0 {
            for tier in 0..TIERS {
                for _ in 0..self.topology.tier_len(tier) {
                    let victim = self.topology.pick(tier, &mut self.rng);
                    if self.steal_from(victim) {
                        continue 'sweep;
                    }
                    if self.shared.sched.term[me].load(Ordering::Acquire) != 0 {
                        break 'sweep;
                    }
                }
            }
        }

        // The flag alone does not prove quiescence: results may still be in
        // flight. Keep sweeping every victim until one complete round yields
        // no work at all, then hold the line until everyone agrees.
        loop {
            let mut hits = 0;
            for tier in 0..TIERS {
                for i in 0..self.topology.tier_len(tier) {
                    let victim = self.topology.victim(tier, i);
                    if self.steal_from(victim) {
                        hits += 1;
                    }
                }
            }
            if hits == 0 {
                break;
            }
        }
        self.rendezvous();
        self.shared.barrier.wait();
    }

    /// Run a cluster-wide computation: worker 0 initiates the root task and,
    /// once it completes, raises every worker's termination flag; all other
    /// workers steal until they observe their own flag and quiesce.
    ///
    /// Returns the result on the initiating worker, `None` elsewhere.
    pub(crate) fn compute(&mut self, op: Op, a: u64, b: u64, c: u64, lvl: u32) -> Option<ComputeOut> {
        if self.id() == 0 {
            Some(self.initiate(op, a, b, c, lvl))
        } else {
            self.participate();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_roundtrip() {
        for op in [
            Op::Ite,
            Op::RelNext,
            Op::SatCount,
            Op::GoPar,
            Op::Par,
            Op::And,
            Op::Xor,
            Op::Support,
        ] {
            assert_eq!(Op::from_meta(op.bits()), Some(op));
            assert_eq!(Op::from_meta(op.bits() | TASK_STOLEN | 12345), Some(op));
        }
        assert_eq!(Op::from_meta(0), None);
    }

    #[test]
    fn test_topology_tiers() {
        let topology = Topology::new(2, 16, 8);
        // everyone except self, split by near group
        assert_eq!(topology.tier_len(0), 7);
        assert_eq!(topology.tier_len(1), 8);
        assert_eq!(topology.tier_len(2), 0);
        assert_eq!(topology.tier_len(3), 0);
        assert!(!topology.tiers[0].contains(&2));
        assert!(topology.tiers[0].contains(&7));
        assert!(topology.tiers[1].contains(&8));
    }

    #[test]
    fn test_topology_single_worker() {
        let topology = Topology::new(0, 1, 8);
        for tier in 0..TIERS {
            assert_eq!(topology.tier_len(tier), 0);
        }
    }
}
