//! # distdd: Distributed-memory Binary Decision Diagrams in Rust
//!
//! **`distdd`** is an engine for canonical Reduced Ordered BDDs with
//! complement edges, built for symbolic reachability over large transition
//! systems on a cluster of SPMD workers that share no data structures beyond
//! explicitly partitioned arenas.
//!
//! ## Architecture
//!
//! - **Distributed unique table**: node identity is a cluster-wide index in
//!   a partitioned, append-only content-addressed store. Structural sharing
//!   works across workers because concurrent inserts of equal content
//!   converge through a compare-and-swap publication protocol.
//! - **Racy memoization cache**: a partitioned, lossy operation cache where
//!   writers overwrite freely and readers re-validate the full key — a miss
//!   is always safe, so no write-side coordination exists at all.
//! - **Work-stealing scheduler**: recursive operations run as spawn/call/sync
//!   task trees over per-worker deques, balanced by steals over one-sided
//!   task transfers with leapfrogging and distance-tiered victim selection.
//! - **Operation engine**: AND/XOR/ITE, relational image (next-state),
//!   satisfying-assignment counting, support, node counting, and a parallel
//!   reachability fixpoint, all expressed over the three layers above.
//!
//! ## Quick Start
//!
//! ```rust
//! use distdd::{Cluster, Config, Ref};
//!
//! let cluster = Cluster::new(Config::default());
//! let counts = cluster.run(|w| {
//!     // f = x0 AND x1
//!     let x0 = w.ithvar(0);
//!     let x1 = w.ithvar(1);
//!     let f = w.and(x0, x1, 0);
//!
//!     // count satisfying assignments over the domain {x0, x1}
//!     let domain = w.set_from_array(&[0, 1]);
//!     w.make_state_set(Ref::FALSE, domain);
//!     (w.satcount(f, 0, 0), w.nodecount(f))
//! });
//! assert_eq!(counts, vec![(1, 2)]);
//! ```
//!
//! The closure passed to [`Cluster::run`] executes on *every* worker (SPMD);
//! with `workers > 1`, cluster-wide operations go through
//! [`Worker::compute_par`] and friends, where worker 0 initiates the root
//! task and the rest steal their share of the recursion.
//!
//! ## Core Components
//!
//! - [`bdd`]: the [`Worker`] manager and the recursive operation engine.
//! - [`table`] / [`cache`]: the partitioned unique table and memoization cache.
//! - [`stealer`]: the cooperative work-stealing scheduler.
//! - [`model`]: state sets, transition relations, and the model-file loader.

pub mod bdd;
pub mod cache;
pub mod cluster;
pub mod comm;
pub mod config;
pub mod localstore;
pub mod model;
pub mod node;
pub mod nodecache;
pub mod reference;
pub mod stealer;
pub mod table;
pub mod utils;

pub use crate::bdd::Worker;
pub use crate::cluster::Cluster;
pub use crate::config::{Config, Probing};
pub use crate::model::{ModelError, ModelInfo, Relation, StateSet};
pub use crate::reference::Ref;
pub use crate::stealer::{ComputeOut, Op, Stats};
