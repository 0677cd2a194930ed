//! State sets, transition relations, and the persisted model input.
//!
//! A set or relation aggregates a BDD with its support, kept as the ordered
//! list of variable levels (`chain`): the counting and relational operators
//! walk it to account for domain variables skipped by the graph.
//!
//! The model file is read once at startup, by every worker: each builds its
//! own local-store replica of the serialized nodes, so the local references
//! agree cluster-wide. The stream maps file-local ordinals to freshly
//! constructed handles through a pure relocation table.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};

use log::info;
use thiserror::Error;

use crate::bdd::Worker;
use crate::reference::Ref;
use crate::stealer::Op;

/// A set of states: a BDD plus its declared variable chain.
#[derive(Debug, Clone)]
pub struct StateSet {
    pub bdd: Ref,
    /// The state variables as a variable-set BDD.
    pub variables: Ref,
    /// The same variables as an ordered list of levels.
    pub chain: Vec<u32>,
}

/// One partition of the transition relation.
#[derive(Debug, Clone)]
pub struct Relation {
    pub bdd: Ref,
    /// The relation's variables as a variable-set BDD (current-state levels
    /// are even, their next-state partners odd).
    pub variables: Ref,
    pub chain: Vec<u32>,
}

/// Errors of the model loader. All of them are fatal at the call site: a
/// malformed model cannot be partially loaded.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("i/o error reading model: {0}")]
    Io(#[from] std::io::Error),
    #[error("model file is truncated")]
    Truncated,
    #[error("model header is malformed")]
    BadHeader,
    #[error("model node stream references unknown node {0}")]
    DanglingNode(u64),
}

/// Summary of a loaded model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub vector_size: u32,
    pub bits_per_integer: u32,
    /// Total state bits: `vector_size * bits_per_integer`.
    pub state_bits: u32,
    pub action_bits: u32,
    pub relations: usize,
}

/// The serialized stream keeps the complement flag of a high edge at bit 63;
/// relocation moves it back onto the reference's complement position.
const SERIAL_COMP: u64 = 1 << 63;

/// Maps file-local ordinals (1-based, in stream order) to constructed
/// handles. Constants pass through unchanged.
#[derive(Debug, Default)]
struct Relocation {
    map: HashMap<u64, Ref>,
    assigned: u64,
}

impl Relocation {
    fn assign(&mut self, bdd: Ref) {
        self.assigned += 1;
        self.map.insert(self.assigned, bdd);
    }

    fn relocate(&self, value: u64) -> Result<Ref, ModelError> {
        let r = Ref::from_bits(value);
        if !r.is_node() {
            return Ok(r);
        }
        let ordinal = r.strip_mark().bits();
        match self.map.get(&ordinal) {
            Some(&found) => Ok(Ref::transfer_mark(r, found)),
            None => Err(ModelError::DanglingNode(ordinal)),
        }
    }
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    match input.read_exact(&mut buf) {
        Ok(()) => Ok(u64::from_le_bytes(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ModelError::Truncated),
        Err(e) => Err(ModelError::Io(e)),
    }
}

fn read_i32<R: Read>(input: &mut R) -> Result<i32, ModelError> {
    let mut buf = [0u8; 4];
    match input.read_exact(&mut buf) {
        Ok(()) => Ok(i32::from_le_bytes(buf)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ModelError::Truncated),
        Err(e) => Err(ModelError::Io(e)),
    }
}

impl Worker {
    /// Declare the state set: derive the variable chain of `variable_set`
    /// and install it for the counting operators.
    pub fn make_state_set(&mut self, bdd: Ref, variable_set: Ref) {
        let variables = Ref::from_bits(self.call(Op::Support, variable_set.bits(), 0, 0, 0));
        let chain = self.to_chain(variables);
        self.states = Some(StateSet {
            bdd,
            variables,
            chain,
        });
    }

    /// Append a transition-relation partition, deriving its variable chain.
    pub fn add_relation(&mut self, bdd: Ref, variable_set: Ref) {
        let variables = Ref::from_bits(self.call(Op::Support, variable_set.bits(), 0, 0, 0));
        let chain = self.to_chain(variables);
        self.relations.push(Relation {
            bdd,
            variables,
            chain,
        });
    }

    /// One serialized canonical-node stream: a count, then per node two
    /// words holding the packed edges (40-bit ordinals), the level, and the
    /// relocated complement bit.
    fn load_stream<R: Read>(
        &mut self,
        input: &mut R,
        relocation: &mut Relocation,
    ) -> Result<(), ModelError> {
        let count = read_u64(input)?;
        for _ in 0..count {
            let a = read_u64(input)?;
            let b = read_u64(input)?;

            let mut high_raw = a & 0x8000_00FF_FFFF_FFFF;
            let low_raw = b & 0x0000_00FF_FFFF_FFFF;
            let level = (b >> 40) as u32;

            if high_raw & SERIAL_COMP != 0 {
                high_raw = (high_raw & !SERIAL_COMP) | Ref::TRUE.bits();
            }

            let low = relocation.relocate(low_raw)?;
            let high = relocation.relocate(high_raw)?;
            let node = self.make_node_local(level, low, high);
            relocation.assign(node);
        }
        Ok(())
    }

    /// Load a model: header, the initial state set, then the transition
    /// relation partitions. Every worker loads its own replica.
    pub fn load_model<R: Read>(&mut self, input: &mut R) -> Result<ModelInfo, ModelError> {
        let vector_size = read_i32(input)?;
        let bits_per_integer = read_i32(input)?;
        let action_bits = read_i32(input)?;
        if vector_size <= 0 || bits_per_integer <= 0 || action_bits < 0 {
            return Err(ModelError::BadHeader);
        }

        let mut relocation = Relocation::default();

        // initial states
        self.load_stream(input, &mut relocation)?;
        let set_bdd = read_u64(input)?;
        let _set_vector_size = read_u64(input)?;
        let state_vars = read_u64(input)?;
        let bdd = relocation.relocate(set_bdd)?;
        let variables = relocation.relocate(state_vars)?;
        self.make_state_set(bdd, variables);

        // transition relations
        let relation_count = read_i32(input)?;
        if relation_count < 0 {
            return Err(ModelError::BadHeader);
        }
        for _ in 0..relation_count {
            self.load_stream(input, &mut relocation)?;
            let rel_bdd = read_u64(input)?;
            let rel_vars = read_u64(input)?;
            let bdd = relocation.relocate(rel_bdd)?;
            let variables = relocation.relocate(rel_vars)?;
            self.add_relation(bdd, variables);
        }

        let info = ModelInfo {
            vector_size: vector_size as u32,
            bits_per_integer: bits_per_integer as u32,
            state_bits: (vector_size * bits_per_integer) as u32,
            action_bits: action_bits as u32,
            relations: relation_count as usize,
        };
        if self.id() == 0 {
            info!(
                "model: {} integers per state, {} bits per integer, {} transition groups",
                info.vector_size, info.bits_per_integer, info.relations
            );
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cluster::Cluster;
    use crate::config::Config;

    fn w32(buf: &mut Vec<u8>, v: i32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn w64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    /// A 1-bit counter: one state bit (level 0, next-state partner 1),
    /// initial state `{0}`, transition `next = !current`.
    fn one_bit_counter() -> Vec<u8> {
        let mut buf = Vec::new();
        // header: vector size 1, 1 bit per integer, no action bits
        w32(&mut buf, 1);
        w32(&mut buf, 1);
        w32(&mut buf, 0);

        // state set stream: node 1 = x0 (level 0, low false, high true)
        w64(&mut buf, 1);
        w64(&mut buf, SERIAL_COMP); // high = true (complement at bit 63)
        w64(&mut buf, 0); // low = false, level 0
        w64(&mut buf, 1 | Ref::TRUE.bits()); // initial states = ~x0
        w64(&mut buf, 1); // vector size
        w64(&mut buf, 1); // state variables = {0}

        // one transition relation
        w32(&mut buf, 1);
        // stream: node 2 = x1, node 3 = x0 xor x1, node 4 = cube {0, 1}
        w64(&mut buf, 3);
        w64(&mut buf, SERIAL_COMP); // node 2: high = true
        w64(&mut buf, 1 << 40); //         low = false, level 1
        w64(&mut buf, 2 | SERIAL_COMP); // node 3: high = ~node2
        w64(&mut buf, 2); //         low = node2, level 0
        w64(&mut buf, 2); // node 4: high = node2
        w64(&mut buf, 0); //         low = false, level 0
        w64(&mut buf, 3); // relation bdd
        w64(&mut buf, 4); // relation variables = {0, 1}
        buf
    }

    #[test]
    fn test_load_one_bit_counter() {
        Cluster::new(Config::default()).run(|w| {
            let info = w.load_model(&mut one_bit_counter().as_slice()).unwrap();
            assert_eq!(info.vector_size, 1);
            assert_eq!(info.bits_per_integer, 1);
            assert_eq!(info.state_bits, 1);
            assert_eq!(info.relations, 1);

            let states = w.state_set().unwrap().clone();
            assert_eq!(states.chain, vec![0]);
            assert!(states.bdd.is_local());
            assert_eq!(w.relations()[0].chain, vec![0, 1]);

            // exactly one initial state
            assert_eq!(w.satcount(states.bdd, 0, 0), 1);

            // the counter reaches both states
            let visited = w.par(states.bdd);
            assert_eq!(visited, Ref::TRUE);
            assert_eq!(w.satcount(visited, 0, 0), 2);
        });
    }

    #[test]
    fn test_truncated_model() {
        Cluster::new(Config::default()).run(|w| {
            let mut bytes = one_bit_counter();
            bytes.truncate(20);
            match w.load_model(&mut bytes.as_slice()) {
                Err(ModelError::Truncated) => {}
                other => panic!("expected Truncated, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_dangling_node() {
        Cluster::new(Config::default()).run(|w| {
            let mut buf = Vec::new();
            w32(&mut buf, 1);
            w32(&mut buf, 1);
            w32(&mut buf, 0);
            // stream with one node whose low edge references ordinal 7
            w64(&mut buf, 1);
            w64(&mut buf, SERIAL_COMP);
            w64(&mut buf, 7);
            match w.load_model(&mut buf.as_slice()) {
                Err(ModelError::DanglingNode(7)) => {}
                other => panic!("expected DanglingNode, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_bad_header() {
        Cluster::new(Config::default()).run(|w| {
            let mut buf = Vec::new();
            w32(&mut buf, -1);
            w32(&mut buf, 1);
            w32(&mut buf, 0);
            match w.load_model(&mut buf.as_slice()) {
                Err(ModelError::BadHeader) => {}
                other => panic!("expected BadHeader, got {:?}", other),
            }
        });
    }
}
