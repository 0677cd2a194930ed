//! The worker manager and the recursive operation engine.
//!
//! A [`Worker`] is one SPMD participant: a single logical thread of control
//! that owns its local stores and deque, shares the partitioned node table
//! and memoization cache with every other worker, and interleaves its own
//! recursion with servicing steal requests at suspension points.
//!
//! All operators follow one template: terminal-case short-circuits, operand
//! canonicalization for cache-hit rate, a granularity-gated cache probe,
//! cofactor decomposition on the lowest variable level, a recursive split
//! (spawn one branch, call the other, sync), recombination through
//! [`make_node`][Worker::make_node], and a cache store. Results are
//! content-addressed, so any interleaving across workers converges to the
//! same canonical answer.

use std::sync::Arc;

use log::info;
use nanorand::WyRand;

use crate::cache::{TAG_AND, TAG_ITE, TAG_RELNEXT, TAG_SATCOUNT, TAG_SUPPORT, TAG_XOR};
use crate::cluster::Shared;
use crate::comm::Fetch;
use crate::localstore::LocalStore;
use crate::model::{Relation, StateSet};
use crate::node::Node;
use crate::nodecache::NodeCache;
use crate::reference::Ref;
use crate::stealer::{ComputeOut, Op, Stats, Topology};

/// One SPMD worker of the cluster.
///
/// Constructed by [`Cluster::run`][crate::cluster::Cluster::run], one per
/// thread of the run. All BDD construction and every operator goes through
/// a worker; references returned by one worker are valid on all of them
/// (except local-store references, which rely on every worker holding an
/// identical replica).
pub struct Worker {
    id: usize,
    pub(crate) shared: Arc<Shared>,

    // unique table: next free self-owned data slot and the insert estimate
    pub(crate) data_i: u64,
    pub(crate) inserted: u64,

    // memoization cache: the one in-flight index fetch
    pub(crate) cache_fetch: Option<Fetch<1>>,

    pub(crate) localstore: LocalStore,
    pub(crate) nodecache: NodeCache,

    // scheduler
    pub(crate) head: u64,
    pub(crate) tail: u64,
    pub(crate) rng: WyRand,
    pub(crate) topology: Topology,
    pub(crate) stats: Stats,

    // model replica (every worker loads its own copy)
    pub(crate) states: Option<StateSet>,
    pub(crate) relations: Vec<Relation>,
}

enum NodeQuery {
    Ready(Node),
    Pending(Fetch<2>),
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, id: usize) -> Self {
        let config = &shared.config;
        let topology = Topology::new(id, config.workers, config.near_group);
        let localstore = LocalStore::new(config.localstore_bits);
        let nodecache = NodeCache::new(config.nodecache_bits);
        let rng = WyRand::new_seed((id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        Self {
            id,
            shared,
            data_i: 1,
            inserted: 0,
            cache_fetch: None,
            localstore,
            nodecache,
            head: 0,
            tail: 0,
            rng,
            topology,
            stats: Stats::default(),
            states: None,
            relations: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn workers(&self) -> usize {
        self.shared.config.workers
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn state_set(&self) -> Option<&StateSet> {
        self.states.as_ref()
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Wait until every worker of the cluster reaches this point.
    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    // -- node access ------------------------------------------------------

    fn node_query(&mut self, bdd: Ref, allow_cache: bool) -> NodeQuery {
        if bdd.is_const() {
            return NodeQuery::Ready(Node::default());
        }
        let index = bdd.strip_mark_metadata().index();
        if bdd.is_local() {
            return NodeQuery::Ready(self.localstore.retrieve(index));
        }
        if allow_cache {
            if let Some(node) = self.nodecache.get(index) {
                return NodeQuery::Ready(node);
            }
        }
        NodeQuery::Pending(self.shared.table.data.get_nb::<2>(index * 2))
    }

    fn node_join(&mut self, query: NodeQuery, bdd: Ref, allow_cache: bool) -> Node {
        match query {
            NodeQuery::Ready(node) => node,
            NodeQuery::Pending(mut fetch) => {
                while !fetch.try_sync() {
                    self.communicate();
                }
                let node = Node::from_words(fetch.word(0), fetch.word(1));
                if allow_cache {
                    self.nodecache.put(bdd.strip_mark_metadata().index(), node);
                }
                node
            }
        }
    }

    fn fetch_node(&mut self, bdd: Ref) -> Node {
        let query = self.node_query(bdd, true);
        self.node_join(query, bdd, true)
    }

    /// Uncached fetch, used by the mark/unmark passes and the plain edge
    /// queries so that in-place data updates are never shadowed.
    fn fetch_node_uncached(&mut self, bdd: Ref) -> Node {
        let query = self.node_query(bdd, false);
        self.node_join(query, bdd, false)
    }

    fn node_update(&mut self, bdd: Ref, node: &Node) {
        let index = bdd.strip_mark_metadata().index();
        if bdd.is_local() {
            self.localstore.set(index, *node);
        } else {
            self.table_set_data(index, node);
        }
    }

    /// Follow the low edge.
    pub fn low(&mut self, bdd: Ref) -> Ref {
        if bdd.is_const() {
            return bdd;
        }
        let node = self.fetch_node_uncached(bdd);
        node.low(bdd)
    }

    /// Follow the high edge.
    pub fn high(&mut self, bdd: Ref) -> Ref {
        if bdd.is_const() {
            return bdd;
        }
        let node = self.fetch_node_uncached(bdd);
        node.high(bdd)
    }

    /// The variable level tested by the root node.
    pub fn var(&mut self, bdd: Ref) -> u32 {
        assert!(!bdd.is_const(), "Constant BDD has no variable");
        let node = self.fetch_node_uncached(bdd);
        node.level()
    }

    // -- construction -----------------------------------------------------

    /// The canonicalizing node constructor.
    ///
    /// Applies the reduction rule (`low == high` up to metadata returns
    /// `low` unchanged, never allocating), pushes the low edge's complement
    /// mark onto the returned reference, and inserts into the distributed
    /// unique table.
    pub fn make_node(&mut self, level: u32, low: Ref, high: Ref) -> Ref {
        if low.strip_metadata() == high.strip_metadata() {
            return low;
        }
        let (node, mark) = Node::pack(level, low, high);
        let index = self.table_find_or_put(&node);
        let result = Ref::new(index);
        if mark {
            -result
        } else {
            result
        }
    }

    /// Like [`make_node`][Worker::make_node], but inserts into the private
    /// local store. Only for nodes that will never be referenced by other
    /// workers directly — trades global canonicity for avoiding a network
    /// round trip.
    pub fn make_node_local(&mut self, level: u32, low: Ref, high: Ref) -> Ref {
        if low.strip_metadata() == high.strip_metadata() {
            return low;
        }
        let (node, mark) = Node::pack(level, low, high);
        let index = self.localstore.find_or_put(&node);
        let result = Ref::new(index).with_local();
        if mark {
            -result
        } else {
            result
        }
    }

    /// The single-variable indicator function for `level`.
    pub fn ithvar(&mut self, level: u32) -> Ref {
        self.make_node(level, Ref::FALSE, Ref::TRUE)
    }

    // -- operator template helpers ---------------------------------------

    fn cache_now(&self, prev_lvl: u32, level: u32) -> bool {
        let granularity = self.shared.config.granularity;
        granularity < 2 || prev_lvl == 0 || prev_lvl / granularity != level / granularity
    }

    // -- boolean operators ------------------------------------------------

    /// Conjunction of `a` and `b`. `prev_lvl` is the level of the caller's
    /// cofactor split (0 at the root); it gates the cache probe.
    pub fn and(&mut self, a: Ref, b: Ref, prev_lvl: u32) -> Ref {
        // terminal cases
        if a.is_true() {
            return b;
        }
        if b.is_true() {
            return a;
        }
        if a.is_false() || b.is_false() {
            return Ref::FALSE;
        }
        if a.strip_metadata() == b.strip_metadata() {
            return a;
        }
        if a.strip_metadata() == b.strip_metadata().negate() {
            return Ref::FALSE;
        }

        // commutative: order the operands for cache-hit rate
        let (a, b) = if a.strip_mark_metadata().bits() > b.strip_mark_metadata().bits() {
            (b, a)
        } else {
            (a, b)
        };

        let qa = self.node_query(a, true);
        let qb = self.node_query(b, true);
        let na = self.node_join(qa, a, true);
        let nb = self.node_join(qb, b, true);

        let va = na.level();
        let vb = nb.level();
        let level = va.min(vb);

        let cachenow = self.cache_now(prev_lvl, level);
        if cachenow {
            if let Some(res) =
                self.cache_get(a.with_data(TAG_AND).bits(), b.bits(), Ref::FALSE.bits())
            {
                return Ref::from_bits(res);
            }
        }

        let (a_low, a_high) = if level == va {
            (na.low(a), na.high(a))
        } else {
            (a, a)
        };
        let (b_low, b_high) = if level == vb {
            (nb.low(b), nb.high(b))
        } else {
            (b, b)
        };

        // spawn only the non-trivial branch
        let mut high = Ref::INVALID;
        let mut spawned = false;
        if a_high.is_true() {
            high = b_high;
        } else if a_high.is_false() || b_high.is_false() {
            high = Ref::FALSE;
        } else if b_high.is_true() {
            high = a_high;
        } else {
            self.spawn(Op::And, a_high.bits(), b_high.bits(), 0, level);
            spawned = true;
        }

        let low = if a_low.is_true() {
            b_low
        } else if a_low.is_false() || b_low.is_false() {
            Ref::FALSE
        } else if b_low.is_true() {
            a_low
        } else {
            Ref::from_bits(self.call(Op::And, a_low.bits(), b_low.bits(), 0, level))
        };

        if spawned {
            high = Ref::from_bits(self.sync());
        }

        let result = self.make_node(level, low, high);
        if cachenow {
            self.cache_put(
                a.with_data(TAG_AND).bits(),
                b.bits(),
                Ref::FALSE.bits(),
                result.bits(),
            );
        }
        result
    }

    /// Exclusive or of `a` and `b`.
    pub fn xor(&mut self, a: Ref, b: Ref, prev_lvl: u32) -> Ref {
        // terminal cases
        if a.is_false() {
            return b;
        }
        if b.is_false() {
            return a;
        }
        if a.is_true() {
            return -b;
        }
        if b.is_true() {
            return -a;
        }
        if a.strip_metadata() == b.strip_metadata() {
            return Ref::FALSE;
        }
        if a.strip_metadata() == b.strip_metadata().negate() {
            return Ref::TRUE;
        }

        let (mut a, mut b) = if a.strip_mark_metadata().bits() > b.strip_mark_metadata().bits() {
            (b, a)
        } else {
            (a, b)
        };

        // a ^ b == ~a ^ ~b: push the complement to one side
        if a.has_mark() {
            a = a.strip_mark();
            b = -b;
        }

        let qa = self.node_query(a, true);
        let qb = self.node_query(b, true);
        let na = self.node_join(qa, a, true);
        let nb = self.node_join(qb, b, true);

        let va = na.level();
        let vb = nb.level();
        let level = va.min(vb);

        let cachenow = self.cache_now(prev_lvl, level);
        if cachenow {
            if let Some(res) =
                self.cache_get(a.with_data(TAG_XOR).bits(), b.bits(), Ref::FALSE.bits())
            {
                return Ref::from_bits(res);
            }
        }

        let (a_low, a_high) = if level == va {
            (na.low(a), na.high(a))
        } else {
            (a, a)
        };
        let (b_low, b_high) = if level == vb {
            (nb.low(b), nb.high(b))
        } else {
            (b, b)
        };

        self.spawn(Op::Xor, a_high.bits(), b_high.bits(), 0, level);
        let low = Ref::from_bits(self.call(Op::Xor, a_low.bits(), b_low.bits(), 0, level));
        let high = Ref::from_bits(self.sync());

        let result = self.make_node(level, low, high);
        if cachenow {
            self.cache_put(
                a.with_data(TAG_XOR).bits(),
                b.bits(),
                Ref::FALSE.bits(),
                result.bits(),
            );
        }
        result
    }

    /// If-then-else: `(a ∧ b) ∨ (¬a ∧ c)`.
    pub fn ite(&mut self, a: Ref, b: Ref, c: Ref, prev_lvl: u32) -> Ref {
        // terminal cases
        if a.is_true() {
            return b;
        }
        if a.is_false() {
            return c;
        }
        let mut b = b;
        let mut c = c;
        if a.strip_metadata() == b.strip_metadata() {
            b = Ref::TRUE;
        }
        if a.strip_metadata() == b.strip_metadata().negate() {
            b = Ref::FALSE;
        }
        if a.strip_metadata() == c.strip_metadata() {
            c = Ref::FALSE;
        }
        if a.strip_metadata() == c.strip_metadata().negate() {
            c = Ref::TRUE;
        }
        if b.strip_metadata() == c.strip_metadata() {
            return b;
        }
        if b.is_true() && c.is_false() {
            return a;
        }
        if b.is_false() && c.is_true() {
            return -a;
        }

        // cases that reduce to AND and XOR
        if c.is_false() {
            return Ref::from_bits(self.call(Op::And, a.bits(), b.bits(), 0, prev_lvl));
        }
        if b.is_true() {
            return -Ref::from_bits(self.call(Op::And, (-a).bits(), (-c).bits(), 0, prev_lvl));
        }
        if b.is_false() {
            return Ref::from_bits(self.call(Op::And, (-a).bits(), c.bits(), 0, prev_lvl));
        }
        if c.is_true() {
            return -Ref::from_bits(self.call(Op::And, a.bits(), (-b).bits(), 0, prev_lvl));
        }
        if b.strip_metadata() == c.strip_metadata().negate() {
            return Ref::from_bits(self.call(Op::Xor, a.bits(), c.bits(), 0, 0));
        }

        // canonical form for optimal cache use
        let mut a = a;
        if a.has_mark() {
            a = a.strip_mark();
            std::mem::swap(&mut b, &mut c);
        }
        let mut mark = false;
        if b.has_mark() {
            b = -b;
            c = -c;
            mark = true;
        }

        let qa = self.node_query(a, true);
        let qb = self.node_query(b, true);
        let qc = self.node_query(c, true);
        let na = self.node_join(qa, a, true);
        let nb = self.node_join(qb, b, true);
        let nc = self.node_join(qc, c, true);

        let va = na.level();
        let vb = nb.level();
        let vc = nc.level();
        let mut level = vb.min(vc);

        // fast path: `a` is the plain indicator of a variable above both
        // branches, so the result is a node on that variable selecting (c, b)
        if va < level && na.low(a).is_false() && na.high(a).is_true() {
            let result = self.make_node(va, c, b);
            return if mark { -result } else { result };
        }

        level = level.min(va);

        let cachenow = self.cache_now(prev_lvl, level);
        if cachenow {
            if let Some(res) = self.cache_get(a.with_data(TAG_ITE).bits(), b.bits(), c.bits()) {
                let res = Ref::from_bits(res);
                return if mark { -res } else { res };
            }
        }

        let (a_low, a_high) = if level == va {
            (na.low(a), na.high(a))
        } else {
            (a, a)
        };
        let (b_low, b_high) = if level == vb {
            (nb.low(b), nb.high(b))
        } else {
            (b, b)
        };
        let (c_low, c_high) = if level == vc {
            (nc.low(c), nc.high(c))
        } else {
            (c, c)
        };

        let mut high = Ref::INVALID;
        let mut spawned = false;
        if a_high.is_true() {
            high = b_high;
        } else if a_high.is_false() {
            high = c_high;
        } else {
            self.spawn(Op::Ite, a_high.bits(), b_high.bits(), c_high.bits(), level);
            spawned = true;
        }

        let low = if a_low.is_true() {
            b_low
        } else if a_low.is_false() {
            c_low
        } else {
            Ref::from_bits(self.call(Op::Ite, a_low.bits(), b_low.bits(), c_low.bits(), level))
        };

        if spawned {
            high = Ref::from_bits(self.sync());
        }

        let result = self.make_node(level, low, high);
        if cachenow {
            self.cache_put(
                a.with_data(TAG_ITE).bits(),
                b.bits(),
                c.bits(),
                result.bits(),
            );
        }
        if mark {
            -result
        } else {
            result
        }
    }

    /// Disjunction, as a De Morgan rewrite of [`and`][Worker::and].
    pub fn or(&mut self, a: Ref, b: Ref) -> Ref {
        -Ref::from_bits(self.call(Op::And, (-a).bits(), (-b).bits(), 0, 0))
    }

    /// Set difference: `a \ b`.
    pub fn diff(&mut self, a: Ref, b: Ref) -> Ref {
        Ref::from_bits(self.call(Op::And, a.bits(), (-b).bits(), 0, 0))
    }

    // -- variable sets ----------------------------------------------------

    /// Add a variable to a variable set (sets are positive cubes).
    pub fn set_add(&mut self, set: Ref, var: u32) -> Ref {
        let indicator = self.ithvar(var);
        Ref::from_bits(self.call(Op::And, set.bits(), indicator.bits(), 0, 0))
    }

    /// Union of two variable sets.
    pub fn set_add_all(&mut self, set: Ref, other: Ref) -> Ref {
        Ref::from_bits(self.call(Op::And, set.bits(), other.bits(), 0, 0))
    }

    /// Build a variable set from an array of levels.
    pub fn set_from_array(&mut self, vars: &[u32]) -> Ref {
        let mut vars = vars.to_vec();
        vars.sort_unstable();
        let mut set = Ref::TRUE;
        for &var in vars.iter().rev() {
            set = self.make_node(var, Ref::FALSE, set);
        }
        set
    }

    /// Flatten a variable-set BDD into its ordered list of levels.
    pub fn to_chain(&mut self, bdd: Ref) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut current = bdd;
        while !current.is_const() {
            let node = self.fetch_node(current);
            chain.push(node.level());
            current = node.high(current);
        }
        chain
    }

    // -- structural queries -----------------------------------------------

    /// The set of variables tested on some path of `bdd`, as a variable-set
    /// BDD. Cached per node under a unary key.
    pub fn support(&mut self, bdd: Ref) -> Ref {
        if bdd.is_const() {
            return Ref::TRUE;
        }

        if let Some(res) = self.cache_get(bdd.with_data(TAG_SUPPORT).bits(), 0, 0) {
            return Ref::from_bits(res);
        }

        let node = self.fetch_node(bdd);

        self.spawn(Op::Support, node.low_edge().bits(), 0, 0, 0);
        let high = Ref::from_bits(self.call(Op::Support, node.high_edge().bits(), 0, 0, 0));
        let low = Ref::from_bits(self.sync());

        // combine the supports of both cofactors, then add the current level
        let set = Ref::from_bits(self.call(Op::And, low.bits(), high.bits(), 0, 0));
        let result = self.make_node(node.level(), Ref::FALSE, set);

        self.cache_put(bdd.with_data(TAG_SUPPORT).bits(), 0, 0, result.bits());
        result
    }

    /// Number of nodes in the graph rooted at `bdd`.
    ///
    /// Two full passes flipping the auxiliary mark bit through the table;
    /// there is no separate visited-set structure. Not safe to run
    /// concurrently with other operations on the same subgraph.
    pub fn nodecount(&mut self, bdd: Ref) -> u64 {
        let count = self.nodecount_mark(bdd);
        self.nodecount_unmark(bdd);
        count
    }

    fn nodecount_mark(&mut self, bdd: Ref) -> u64 {
        if bdd.is_const() {
            return 0;
        }
        let mut node = self.fetch_node_uncached(bdd);
        if node.is_marked() {
            return 0;
        }
        node.set_mark(true);
        self.node_update(bdd, &node);
        1 + self.nodecount_mark(node.low_edge()) + self.nodecount_mark(node.high_edge())
    }

    fn nodecount_unmark(&mut self, bdd: Ref) {
        if bdd.is_const() {
            return;
        }
        let mut node = self.fetch_node_uncached(bdd);
        if !node.is_marked() {
            return;
        }
        node.set_mark(false);
        self.node_update(bdd, &node);
        self.nodecount_unmark(node.low_edge());
        self.nodecount_unmark(node.high_edge());
    }

    /// Number of raw graph paths ending in the `true` terminal.
    pub fn positive_paths(&mut self, bdd: Ref) -> u64 {
        if bdd.is_false() {
            return 0;
        }
        if bdd.is_true() {
            return 1;
        }
        let node = self.fetch_node(bdd);
        let high = self.positive_paths(node.high_edge());
        let low = self.positive_paths(node.low_edge());
        high + low
    }

    // -- counting ---------------------------------------------------------

    fn state_level(&self, i: u64) -> u32 {
        let states = self.states.as_ref().expect("State set is not loaded");
        states.chain[i as usize]
    }

    /// Number of satisfying assignments of `bdd` over the declared state
    /// variables, starting at chain position `vars`.
    ///
    /// Variables present in the domain but absent from the subgraph scale
    /// the result by `2^skipped`; the cache stores the *unscaled* count, so
    /// identical subgraphs reached with different skip counts share an entry.
    pub fn satcount(&mut self, bdd: Ref, vars: u64, prev_lvl: u32) -> u64 {
        if bdd.is_false() {
            return 0;
        }

        let varcount = self
            .states
            .as_ref()
            .expect("State set is not loaded")
            .chain
            .len() as u64;
        if bdd.is_true() {
            return 1u64 << varcount.saturating_sub(vars);
        }

        // count the domain variables skipped above this node
        let mut vars = vars;
        let mut skipped = 0u32;
        let var = self.var(bdd);
        while var != self.state_level(vars) {
            skipped += 1;
            vars += 1;
        }

        let cachenow = self.cache_now(prev_lvl, var);
        if cachenow {
            if let Some(res) =
                self.cache_get(bdd.with_data(TAG_SATCOUNT).bits(), vars, Ref::FALSE.bits())
            {
                return res << skipped;
            }
        }

        let high = self.high(bdd);
        let low = self.low(bdd);
        self.spawn(Op::SatCount, high.bits(), vars + 1, 0, var);
        let low_count = self.call(Op::SatCount, low.bits(), vars + 1, 0, var);
        let high_count = self.sync();
        let result = low_count + high_count;

        if cachenow {
            self.cache_put(
                bdd.with_data(TAG_SATCOUNT).bits(),
                vars,
                Ref::FALSE.bits(),
                result,
            );
        }
        result << skipped
    }

    // -- relational operators ---------------------------------------------

    fn rel_chain_level(&self, from: usize, i: usize) -> Option<u32> {
        self.relations
            .get(from)
            .expect("Transition relation index out of range")
            .chain
            .get(i)
            .copied()
    }

    /// The image of state set `a` under transition relation `b`
    /// (next-state computation).
    ///
    /// The relation's variable chain interleaves current-state (even level)
    /// and next-state (odd level) pairs. `vars` packs the relation index in
    /// its low 32 bits and the chain position in its high 32 bits.
    pub fn relnext(&mut self, a: Ref, b: Ref, vars: u64, prev_lvl: u32) -> Ref {
        // terminal cases
        if a.is_true() && b.is_true() {
            return Ref::TRUE;
        }
        if a.is_false() || b.is_false() {
            return Ref::FALSE;
        }

        let from = (vars & 0xFFFF_FFFF) as usize;
        let mut node_i = (vars >> 32) as usize;
        if self.rel_chain_level(from, node_i).is_none() {
            return a;
        }

        let qa = self.node_query(a, true);
        let qb = self.node_query(b, true);
        let na = self.node_join(qa, a, true);
        let nb = self.node_join(qb, b, true);

        let va = if a.is_const() { u32::MAX } else { na.level() };
        let vb = if b.is_const() { u32::MAX } else { nb.level() };
        let level = va.min(vb);

        // advance the chain to the first variable at or below the top level
        let chain_level = loop {
            match self.rel_chain_level(from, node_i) {
                None => return a,
                Some(cl) => {
                    if level == cl || (level ^ 1) == cl || level < cl {
                        break cl;
                    }
                    node_i += 1;
                }
            }
        };

        let cachenow = self.cache_now(prev_lvl, level);
        let cache_vars = (from as u64) | ((node_i as u64) << 32);
        if cachenow {
            if let Some(res) =
                self.cache_get(a.with_data(TAG_RELNEXT).bits(), b.bits(), cache_vars)
            {
                return Ref::from_bits(res);
            }
        }

        let result = if level == chain_level || (level ^ 1) == chain_level {
            // paired case: quantify the current-state variable `s` and
            // rename its paired next-state variable `t` back onto `s`
            let s = level & !1;
            let t = s + 1;

            let (a0, a1) = if !a.is_const() && na.level() == s {
                (na.low(a), na.high(a))
            } else {
                (a, a)
            };
            let (b0, b1) = if !b.is_const() && nb.level() == s {
                (nb.low(b), nb.high(b))
            } else {
                (b, b)
            };

            // two-step cofactors of the relation on `t`
            let qb0 = self.node_query(b0, true);
            let qb1 = self.node_query(b1, true);
            let nb0 = self.node_join(qb0, b0, true);
            let nb1 = self.node_join(qb1, b1, true);

            let (b00, b01) = if !b0.is_const() && nb0.level() == t {
                (nb0.low(b0), nb0.high(b0))
            } else {
                (b0, b0)
            };
            let (b10, b11) = if !b1.is_const() && nb1.level() == t {
                (nb1.low(b1), nb1.high(b1))
            } else {
                (b1, b1)
            };

            let next_vars = (from as u64) | (((node_i + 1) as u64) << 32);

            self.spawn(Op::RelNext, a0.bits(), b00.bits(), next_vars, level);
            self.spawn(Op::RelNext, a1.bits(), b10.bits(), next_vars, level);
            self.spawn(Op::RelNext, a0.bits(), b01.bits(), next_vars, level);
            let f = Ref::from_bits(self.call(Op::RelNext, a1.bits(), b11.bits(), next_vars, level));
            let e = Ref::from_bits(self.sync());
            let d = Ref::from_bits(self.sync());
            let c = Ref::from_bits(self.sync());

            // disjoint unions per next-state value, then the renamed node
            self.spawn(Op::Ite, c.bits(), Ref::TRUE.bits(), d.bits(), 0);
            let high = Ref::from_bits(self.call(Op::Ite, e.bits(), Ref::TRUE.bits(), f.bits(), 0));
            let low = Ref::from_bits(self.sync());

            self.make_node(s, low, high)
        } else {
            // the top level is not touched by the relation here: keep it
            let (a0, a1) = if !a.is_const() && na.level() == level {
                (na.low(a), na.high(a))
            } else {
                (a, a)
            };
            let (b0, b1) = if !b.is_const() && nb.level() == level {
                (nb.low(b), nb.high(b))
            } else {
                (b, b)
            };

            let next_vars = (from as u64) | ((node_i as u64) << 32);

            if b0 == b1 {
                self.spawn(Op::RelNext, a0.bits(), b0.bits(), next_vars, level);
                let r1 = Ref::from_bits(self.call(Op::RelNext, a1.bits(), b1.bits(), next_vars, level));
                let r0 = Ref::from_bits(self.sync());
                self.make_node(level, r0, r1)
            } else if a0 == a1 {
                self.spawn(Op::RelNext, a0.bits(), b0.bits(), next_vars, level);
                let r1 = Ref::from_bits(self.call(Op::RelNext, a1.bits(), b1.bits(), next_vars, level));
                let r0 = Ref::from_bits(self.sync());
                self.or(r0, r1)
            } else {
                self.spawn(Op::RelNext, a0.bits(), b0.bits(), next_vars, level);
                self.spawn(Op::RelNext, a1.bits(), b0.bits(), next_vars, level);
                self.spawn(Op::RelNext, a0.bits(), b1.bits(), next_vars, level);
                let r11 =
                    Ref::from_bits(self.call(Op::RelNext, a1.bits(), b1.bits(), next_vars, level));
                let r01 = Ref::from_bits(self.sync());
                let r10 = Ref::from_bits(self.sync());
                let r00 = Ref::from_bits(self.sync());

                self.spawn(Op::Ite, r00.bits(), Ref::TRUE.bits(), r01.bits(), 0);
                let r1 =
                    Ref::from_bits(self.call(Op::Ite, r10.bits(), Ref::TRUE.bits(), r11.bits(), 0));
                let r0 = Ref::from_bits(self.sync());
                self.make_node(level, r0, r1)
            }
        };

        if cachenow {
            self.cache_put(
                a.with_data(TAG_RELNEXT).bits(),
                b.bits(),
                cache_vars,
                result.bits(),
            );
        }
        result
    }

    /// One frontier step: the image of `cur` under all relation partitions
    /// in `[from, from + len)` as a balanced binary task tree, minus
    /// `visited`.
    pub fn go_par(&mut self, cur: Ref, visited: Ref, from: usize, len: usize) -> Ref {
        if len == 1 {
            let rel = self.relations[from].bdd;
            let succ =
                Ref::from_bits(self.call(Op::RelNext, cur.bits(), rel.bits(), from as u64, 0));
            self.diff(succ, visited)
        } else {
            let half = (len + 1) / 2;
            self.spawn(Op::GoPar, cur.bits(), visited.bits(), from as u64, half as u32);
            let right = Ref::from_bits(self.call(
                Op::GoPar,
                cur.bits(),
                visited.bits(),
                (from + half) as u64,
                (len - half) as u32,
            ));
            let left = Ref::from_bits(self.sync());
            self.or(left, right)
        }
    }

    /// Parallel reachability fixpoint from the initial set `bdd`: iterate
    /// frontier images until no new states are discovered, and return the
    /// set of all reachable states.
    pub fn par(&mut self, bdd: Ref) -> Ref {
        assert!(!self.relations.is_empty(), "No transition relations loaded");
        let mut visited = bdd;
        let mut frontier = visited;
        let mut level = 1u64;
        loop {
            info!("reachability level {}", level);
            level += 1;
            frontier = Ref::from_bits(self.call(
                Op::GoPar,
                frontier.bits(),
                visited.bits(),
                0,
                self.relations.len() as u32,
            ));
            visited = self.or(visited, frontier);
            if frontier.strip_metadata() == Ref::FALSE {
                return visited;
            }
        }
    }

    // -- task dispatch ----------------------------------------------------

    pub(crate) fn dispatch(&mut self, op: Op, a: u64, b: u64, c: u64, lvl: u32) -> u64 {
        match op {
            Op::Ite => self
                .ite(Ref::from_bits(a), Ref::from_bits(b), Ref::from_bits(c), lvl)
                .bits(),
            Op::RelNext => self.relnext(Ref::from_bits(a), Ref::from_bits(b), c, lvl).bits(),
            Op::SatCount => self.satcount(Ref::from_bits(a), b, lvl),
            Op::GoPar => self
                .go_par(Ref::from_bits(a), Ref::from_bits(b), c as usize, lvl as usize)
                .bits(),
            Op::Par => self.par(Ref::from_bits(a)).bits(),
            Op::And => self.and(Ref::from_bits(a), Ref::from_bits(b), lvl).bits(),
            Op::Xor => self.xor(Ref::from_bits(a), Ref::from_bits(b), lvl).bits(),
            Op::Support => self.support(Ref::from_bits(a)).bits(),
        }
    }

    /// Cluster-wide reachability: worker 0 initiates, everyone else steals.
    pub fn compute_par(&mut self, states: Ref) -> Option<ComputeOut> {
        self.compute(Op::Par, states.bits(), 0, 0, 0)
    }

    /// Cluster-wide satisfying-assignment count over the loaded state set.
    pub fn compute_satcount(&mut self, bdd: Ref) -> Option<ComputeOut> {
        self.compute(Op::SatCount, bdd.bits(), 0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cluster::Cluster;
    use crate::config::Config;

    fn single<T, F>(f: F) -> T
    where
        F: Fn(&mut Worker) -> T + Sync,
        T: Send,
    {
        Cluster::new(Config::default()).run(f).pop().unwrap()
    }

    #[test]
    fn test_ithvar() {
        single(|w| {
            let x = w.ithvar(1);
            assert_eq!(w.var(x), 1);
            assert_eq!(w.low(x), Ref::FALSE);
            assert_eq!(w.high(x), Ref::TRUE);

            let not_x = -x;
            assert_eq!(w.var(not_x), 1);
            assert_eq!(w.low(not_x), Ref::TRUE);
            assert_eq!(w.high(not_x), Ref::FALSE);
        });
    }

    #[test]
    fn test_make_node_reduction() {
        single(|w| {
            let x = w.ithvar(2);
            assert_eq!(w.make_node(1, x, x), x);
            assert_eq!(w.make_node(1, -x, -x), -x);
            assert_eq!(w.make_node(1, Ref::FALSE, Ref::FALSE), Ref::FALSE);
        });
    }

    #[test]
    fn test_make_node_canonical() {
        single(|w| {
            let x = w.ithvar(2);
            let y = w.ithvar(3);
            // the same function built twice is bit-identical
            let f = w.make_node(1, x, y);
            let g = w.make_node(1, x, y);
            assert_eq!(f, g);
            // and its complement shares the same node
            let h = w.make_node(1, -x, -y);
            assert_eq!(h, -f);
        });
    }

    #[test]
    fn test_and_laws() {
        single(|w| {
            let x = w.ithvar(1);
            let y = w.ithvar(2);
            let f = w.and(x, y, 0);

            assert_eq!(w.and(Ref::TRUE, f, 0), f);
            assert_eq!(w.and(f, Ref::TRUE, 0), f);
            assert_eq!(w.and(Ref::FALSE, f, 0), Ref::FALSE);
            assert_eq!(w.and(f, -f, 0), Ref::FALSE);
            assert_eq!(w.and(f, f, 0), f);
            assert_eq!(w.and(x, y, 0), w.and(y, x, 0));
        });
    }

    #[test]
    fn test_de_morgan() {
        single(|w| {
            let x = w.ithvar(1);
            let y = w.ithvar(2);
            let f = w.and(x, y, 0);
            let g = w.or(-x, -y);
            assert_eq!(-f, g);
        });
    }

    #[test]
    fn test_xor_laws() {
        single(|w| {
            let x = w.ithvar(1);
            let y = w.ithvar(2);
            let f = w.and(x, y, 0);

            assert_eq!(w.xor(f, f, 0), Ref::FALSE);
            assert_eq!(w.xor(f, -f, 0), Ref::TRUE);
            assert_eq!(w.xor(x, y, 0), w.xor(y, x, 0));
            assert_eq!(w.xor(x, Ref::FALSE, 0), x);
            assert_eq!(w.xor(x, Ref::TRUE, 0), -x);
            // ~a ^ ~b == a ^ b
            assert_eq!(w.xor(-x, -y, 0), w.xor(x, y, 0));
        });
    }

    #[test]
    fn test_ite_laws() {
        single(|w| {
            let a = w.ithvar(1);
            let b = w.ithvar(2);
            let c = w.ithvar(3);

            assert_eq!(w.ite(Ref::TRUE, b, c, 0), b);
            assert_eq!(w.ite(Ref::FALSE, b, c, 0), c);
            assert_eq!(w.ite(a, Ref::TRUE, Ref::FALSE, 0), a);
            assert_eq!(w.ite(a, Ref::FALSE, Ref::TRUE, 0), -a);
            assert_eq!(w.ite(a, b, b, 0), b);
        });
    }

    #[test]
    fn test_ite_matches_composition() {
        single(|w| {
            let a = w.ithvar(1);
            let b = w.ithvar(2);
            let c = w.ithvar(3);

            let f = w.ite(a, b, c, 0);
            let ab = w.and(a, b, 0);
            let nac = w.and(-a, c, 0);
            let g = w.or(ab, nac);
            assert_eq!(f, g);

            // the complement-canonicalized path
            let f = w.ite(-a, -b, c, 0);
            let ab = w.and(-a, -b, 0);
            let nac = w.and(a, c, 0);
            let g = w.or(ab, nac);
            assert_eq!(f, g);
        });
    }

    #[test]
    fn test_ite_indicator_fast_path() {
        single(|w| {
            let a = w.ithvar(1);
            let b = w.ithvar(4);
            let c = w.ithvar(5);
            let f = w.ite(a, b, c, 0);
            // node on var 1 selecting (c, b)
            let expected = w.make_node(1, c, b);
            assert_eq!(f, expected);
        });
    }

    #[test]
    fn test_support() {
        single(|w| {
            let x1 = w.ithvar(1);
            let x3 = w.ithvar(3);
            let f = w.and(x1, x3, 0);
            let support = w.support(f);
            assert_eq!(w.to_chain(support), vec![1, 3]);

            assert_eq!(w.support(Ref::TRUE), Ref::TRUE);
            assert_eq!(w.support(Ref::FALSE), Ref::TRUE);
        });
    }

    #[test]
    fn test_set_from_array() {
        single(|w| {
            let set = w.set_from_array(&[3, 1, 2]);
            assert_eq!(w.to_chain(set), vec![1, 2, 3]);

            let with4 = w.set_add(set, 4);
            assert_eq!(w.to_chain(with4), vec![1, 2, 3, 4]);

            let other = w.set_from_array(&[0, 5]);
            let all = w.set_add_all(with4, other);
            assert_eq!(w.to_chain(all), vec![0, 1, 2, 3, 4, 5]);
        });
    }

    #[test]
    fn test_satcount() {
        single(|w| {
            let x0 = w.ithvar(0);
            let x1 = w.ithvar(1);
            let domain = w.set_from_array(&[0, 1]);
            w.make_state_set(Ref::FALSE, domain);

            let f = w.and(x0, x1, 0);
            assert_eq!(w.satcount(f, 0, 0), 1);
            assert_eq!(w.satcount(-f, 0, 0), 3);
            assert_eq!(w.satcount(Ref::TRUE, 0, 0), 4);
            assert_eq!(w.satcount(Ref::FALSE, 0, 0), 0);
            assert_eq!(w.satcount(x0, 0, 0), 2);
        });
    }

    #[test]
    fn test_satcount_skipped_scaling() {
        single(|w| {
            let x2 = w.ithvar(2);
            let domain = w.set_from_array(&[0, 1, 2, 3]);
            w.make_state_set(Ref::FALSE, domain);
            // x2 alone over a 4-variable domain: 2^3 assignments
            assert_eq!(w.satcount(x2, 0, 0), 8);
        });
    }

    #[test]
    fn test_satcount_complement_roundtrip() {
        single(|w| {
            let x0 = w.ithvar(0);
            let x1 = w.ithvar(1);
            let x2 = w.ithvar(2);
            let domain = w.set_from_array(&[0, 1, 2]);
            w.make_state_set(Ref::FALSE, domain);

            let xo = w.xor(x0, x1, 0);
            let f = w.or(xo, x2);
            let count = w.satcount(f, 0, 0);
            let complement = w.satcount(-f, 0, 0);
            assert_eq!(count + complement, 1 << 3);
        });
    }

    #[test]
    fn test_nodecount() {
        single(|w| {
            let x0 = w.ithvar(0);
            let x1 = w.ithvar(1);
            let f = w.and(x0, x1, 0);
            assert_eq!(w.nodecount(f), 2);
            assert_eq!(w.nodecount(Ref::TRUE), 0);
            // counting twice gives the same answer (marks were undone)
            assert_eq!(w.nodecount(f), 2);
        });
    }

    #[test]
    fn test_positive_paths() {
        single(|w| {
            let x0 = w.ithvar(0);
            let x1 = w.ithvar(1);
            let f = w.and(x0, x1, 0);
            assert_eq!(w.positive_paths(f), 1);
        });
    }

    #[test]
    fn test_local_nodes() {
        single(|w| {
            let x = w.make_node_local(1, Ref::FALSE, Ref::TRUE);
            assert!(x.is_local());
            assert_eq!(w.var(x), 1);
            assert_eq!(w.low(x), Ref::FALSE);
            assert_eq!(w.high(x), Ref::TRUE);

            // deduplicated within the local store
            let y = w.make_node_local(1, Ref::FALSE, Ref::TRUE);
            assert_eq!(x, y);

            // a global node above local children keeps their locality hints
            let z = w.make_node(0, x, -x);
            assert_eq!(w.low(z), x);
            assert_eq!(w.high(z), -x);
        });
    }
}
