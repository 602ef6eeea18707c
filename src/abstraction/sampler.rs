//! Drawing concrete basic blocks from an abstract block.
//!
//! Sampling proceeds in three phases: scheme selection per position,
//! operand-class resolution under the aliasing constraints, and
//! materialization. Operand resolution collapses must-alias classes with a
//! union-find and decides infeasibility of the must-not graph by greedy
//! coloring before any randomized choice is made, so unsatisfiable
//! intermediate states fail deterministically instead of by retry
//! exhaustion.

use log::trace;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use thiserror::Error;

use crate::iwho::{
    memory_base_classes, samplable_classes, AliasClass, BasicBlock, Instruction, Operand,
    OperandKind, RegBank, SchemeContext, SchemeId, MEMORY_DISPLACEMENTS,
};

use super::aliasing::{AliasPairKey, AliasValue, OpKindTag};
use super::block::AbstractBlock;
use super::feature_manager::InsnFeatureManager;

pub mod defaults {
    /// Per-draw retries with fresh randomness before a recoverable failure.
    pub const MAX_SAMPLE_ATTEMPTS: usize = 8;
}

#[derive(Debug, Error, Clone)]
pub enum SamplingError {
    /// The abstract block has an empty concretization (bottom) or its
    /// aliasing constraints cannot be satisfied by any operand choice.
    #[error("abstract block is unsatisfiable: {0}")]
    Unsatisfiable(String),

    /// Operand resolution kept colliding; the caller may treat the abstract
    /// block as infeasible.
    #[error("failed to resolve operand constraints in {0} attempts")]
    ResolutionFailed(usize),
}

/// The kind of storage an equivalence class of operand slots needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotKind {
    Reg(RegBank),
    Mem,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        // the smaller index wins, keeping class representatives stable
        if ra < rb {
            self.parent[rb] = ra;
        } else {
            self.parent[ra] = rb;
        }
    }
}

/// Precomputed acceleration structure for sampling from one abstract block.
/// Feasible scheme sets are computed once; the feature indices stay shared
/// with the feature manager.
pub struct Sampler {
    ctx: Rc<SchemeContext>,
    feasible: Vec<Vec<SchemeId>>,
    constraints: Vec<(AliasPairKey, AliasValue)>,
}

impl Sampler {
    pub fn new(
        fm: &InsnFeatureManager,
        ab: &AbstractBlock,
        scheme_blacklist: &HashSet<SchemeId>,
    ) -> Result<Self, SamplingError> {
        if ab.aliasing.is_bot() {
            return Err(SamplingError::Unsatisfiable("aliasing is bottom".to_string()));
        }
        let mut feasible = Vec::with_capacity(ab.len());
        for (pos, insn) in ab.insns.iter().enumerate() {
            let mut schemes = fm.compute_feasible_schemes(insn);
            if !scheme_blacklist.is_empty() {
                schemes.retain(|id| !scheme_blacklist.contains(id));
            }
            if schemes.is_empty() {
                return Err(SamplingError::Unsatisfiable(format!(
                    "no feasible instruction scheme at position {}",
                    pos
                )));
            }
            feasible.push(schemes);
        }
        let constraints = ab
            .aliasing
            .components()
            .map(|(k, v)| (k.clone(), v))
            .collect();
        Ok(Sampler { ctx: fm.ctx().clone(), feasible, constraints })
    }

    /// Draw one concrete block. Given the same RNG state, the draw is
    /// deterministic.
    pub fn sample(&self, rng: &mut StdRng) -> Result<BasicBlock, SamplingError> {
        let mut last_err = None;
        for _ in 0..defaults::MAX_SAMPLE_ATTEMPTS {
            match self.try_sample(rng) {
                Ok(bb) => return Ok(bb),
                Err(e @ SamplingError::Unsatisfiable(_)) => return Err(e),
                Err(e) => {
                    trace!("sample attempt failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(SamplingError::ResolutionFailed(defaults::MAX_SAMPLE_ATTEMPTS)))
    }

    fn try_sample(&self, rng: &mut StdRng) -> Result<BasicBlock, SamplingError> {
        // phase 1: scheme selection
        let schemes: Vec<SchemeId> = self
            .feasible
            .iter()
            .map(|candidates| *candidates.choose(rng).expect("feasible sets are nonempty"))
            .collect();

        // phase 2: operand-class resolution
        let mut slots: Vec<(usize, String, SlotKind)> = Vec::new();
        let mut slot_index: HashMap<(usize, OpKindTag, String), usize> = HashMap::new();
        for (pos, &scheme_id) in schemes.iter().enumerate() {
            let scheme = self.ctx.scheme(scheme_id);
            for op_scheme in &scheme.operands {
                let (tag, kind) = match &op_scheme.kind {
                    OperandKind::Reg { bank, .. } => (OpKindTag::Reg, SlotKind::Reg(*bank)),
                    OperandKind::Mem { .. } => (OpKindTag::Mem, SlotKind::Mem),
                    _ => continue,
                };
                let slot = slots.len();
                slots.push((pos, op_scheme.name.clone(), kind));
                slot_index.insert((pos, tag, op_scheme.name.clone()), slot);
            }
        }

        let lookup = |key: &(usize, super::aliasing::OperandRef)| -> Option<usize> {
            slot_index.get(&(key.0, key.1.tag, key.1.name.clone())).copied()
        };

        let mut uf = UnionFind::new(slots.len());
        let mut must_not: Vec<(usize, usize)> = Vec::new();
        for (key, value) in &self.constraints {
            let (a, b) = match (lookup(&key.a), lookup(&key.b)) {
                (Some(a), Some(b)) => (a, b),
                // a constraint on an operand the chosen scheme does not have
                // is vacuously satisfied
                _ => continue,
            };
            match value {
                AliasValue::Must => {
                    if slots[a].2 != slots[b].2 {
                        return Err(SamplingError::ResolutionFailed(1));
                    }
                    uf.union(a, b);
                }
                AliasValue::MustNot => must_not.push((a, b)),
            }
        }

        let mut separate: Vec<(usize, usize)> = Vec::new();
        for &(a, b) in &must_not {
            let (ra, rb) = (uf.find(a), uf.find(b));
            if ra == rb {
                return Err(SamplingError::Unsatisfiable(
                    "operands must alias and must not alias at once".to_string(),
                ));
            }
            separate.push((ra.min(rb), ra.max(rb)));
        }
        separate.sort_unstable();
        separate.dedup();

        // collect the equivalence-class roots per storage kind, in stable order
        let slot_root: Vec<usize> = (0..slots.len()).map(|s| uf.find(s)).collect();
        let mut roots = slot_root.clone();
        roots.sort_unstable();
        roots.dedup();

        self.check_colorable(&slots, &roots, &separate)?;

        let assignment = self.assign_storage(rng, &slots, &roots, &separate)?;

        // phase 3: materialization
        let mut insns = Vec::with_capacity(schemes.len());
        for (pos, &scheme_id) in schemes.iter().enumerate() {
            let scheme = self.ctx.scheme(scheme_id);
            let operands = scheme
                .operands
                .iter()
                .map(|op_scheme| match &op_scheme.kind {
                    OperandKind::Reg { width, .. } => {
                        let slot = slot_index[&(pos, OpKindTag::Reg, op_scheme.name.clone())];
                        match assignment[&slot_root[slot]] {
                            Storage::Reg(class) => Operand::Reg { class, width: *width },
                            _ => unreachable!(),
                        }
                    }
                    OperandKind::Mem { width } => {
                        let slot = slot_index[&(pos, OpKindTag::Mem, op_scheme.name.clone())];
                        match assignment[&slot_root[slot]] {
                            Storage::Mem(base, displacement) => {
                                Operand::Mem { width: *width, base, displacement }
                            }
                            _ => unreachable!(),
                        }
                    }
                    OperandKind::Imm { width } => {
                        let bound = 1i64 << (*width - 1).min(31) as i64;
                        let value = Uniform::from(0..bound).sample(rng);
                        Operand::Imm { width: *width, value }
                    }
                    OperandKind::Flags => Operand::Flags,
                })
                .collect();
            insns.push(Instruction { scheme: scheme_id, operands });
        }
        Ok(BasicBlock::new(insns))
    }

    /// Deterministic feasibility decision: greedily color the must-not
    /// graph per storage kind; running out of colors means no assignment
    /// exists for this scheme selection.
    fn check_colorable(
        &self,
        slots: &[(usize, String, SlotKind)],
        roots: &[usize],
        separate: &[(usize, usize)],
    ) -> Result<(), SamplingError> {
        for kind_pool in &[
            (SlotKind::Reg(RegBank::Gpr), samplable_classes(RegBank::Gpr).len()),
            (SlotKind::Reg(RegBank::Xmm), samplable_classes(RegBank::Xmm).len()),
            (SlotKind::Mem, memory_base_classes().len() * MEMORY_DISPLACEMENTS.len()),
        ] {
            let (kind, pool_size) = kind_pool;
            let members: Vec<usize> =
                roots.iter().copied().filter(|&r| slots[r].2 == *kind).collect();
            let mut colors: HashMap<usize, usize> = HashMap::new();
            for &root in &members {
                let neighbor_colors: HashSet<usize> = separate
                    .iter()
                    .filter_map(|&(a, b)| {
                        if a == root {
                            colors.get(&b).copied()
                        } else if b == root {
                            colors.get(&a).copied()
                        } else {
                            None
                        }
                    })
                    .collect();
                let color = (0..*pool_size).find(|c| !neighbor_colors.contains(c));
                match color {
                    Some(c) => {
                        colors.insert(root, c);
                    }
                    None => {
                        return Err(SamplingError::Unsatisfiable(format!(
                            "must-not-alias constraints exceed the {:?} pool ({} slots)",
                            kind, pool_size
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn assign_storage(
        &self,
        rng: &mut StdRng,
        slots: &[(usize, String, SlotKind)],
        roots: &[usize],
        separate: &[(usize, usize)],
    ) -> Result<HashMap<usize, Storage>, SamplingError> {
        let mut assignment: HashMap<usize, Storage> = HashMap::new();
        for &root in roots {
            let mut candidates: Vec<Storage> = match slots[root].2 {
                SlotKind::Reg(bank) => {
                    samplable_classes(bank).into_iter().map(Storage::Reg).collect()
                }
                SlotKind::Mem => memory_base_classes()
                    .iter()
                    .flat_map(|&base| {
                        MEMORY_DISPLACEMENTS.iter().map(move |&d| Storage::Mem(base, d))
                    })
                    .collect(),
            };
            candidates.shuffle(rng);
            let forbidden: Vec<Storage> = separate
                .iter()
                .filter_map(|&(a, b)| {
                    if a == root {
                        assignment.get(&b).copied()
                    } else if b == root {
                        assignment.get(&a).copied()
                    } else {
                        None
                    }
                })
                .collect();
            match candidates.into_iter().find(|c| !forbidden.contains(c)) {
                Some(choice) => {
                    assignment.insert(root, choice);
                }
                None => return Err(SamplingError::ResolutionFailed(1)),
            }
        }
        Ok(assignment)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Storage {
    Reg(AliasClass),
    Mem(AliasClass, i64),
}
