//! Abstract instructions and abstract blocks: the block lattice.

use serde_json::{json, Value as Json};
use std::fmt;

use crate::iwho::{BasicBlock, SchemeId};

use super::aliasing::{AbstractAliasing, AliasPairKey};
use super::feature::{AbstractFeature, FeatureStep};
use super::feature_manager::InsnFeatureManager;
use super::AbstractionError;

/// A set of instruction schemes, represented as one abstract feature value
/// per configured feature. Concretization is the intersection of the
/// per-feature concretizations.
#[derive(Clone, Debug, PartialEq)]
pub struct AbstractInsn {
    features: Vec<AbstractFeature>,
}

impl AbstractInsn {
    pub fn top(fm: &InsnFeatureManager) -> Self {
        AbstractInsn {
            features: fm.decls().iter().map(|d| AbstractFeature::top(&d.kind)).collect(),
        }
    }

    /// Singleton lift of one scheme.
    pub fn from_scheme(fm: &InsnFeatureManager, id: SchemeId) -> Self {
        AbstractInsn {
            features: fm
                .decls()
                .iter()
                .enumerate()
                .map(|(decl_idx, d)| AbstractFeature::from_value(&d.kind, fm.extracted(id, decl_idx)))
                .collect(),
        }
    }

    pub fn feature(&self, decl_idx: usize) -> &AbstractFeature {
        &self.features[decl_idx]
    }

    pub fn is_bottom(&self) -> bool {
        self.features.iter().any(AbstractFeature::is_bottom)
    }

    pub fn is_top(&self) -> bool {
        self.features.iter().all(AbstractFeature::is_top)
    }

    pub fn subsumes(&self, other: &AbstractInsn) -> bool {
        self.features
            .iter()
            .zip(other.features.iter())
            .all(|(a, b)| a.subsumes(b))
    }

    pub fn join(&mut self, other: &AbstractInsn) {
        for (a, b) in self.features.iter_mut().zip(other.features.iter()) {
            a.join(b);
        }
    }

    fn to_json(&self, fm: &InsnFeatureManager) -> Json {
        let mut map = serde_json::Map::new();
        for (decl, feature) in fm.decls().iter().zip(self.features.iter()) {
            map.insert(decl.name.clone(), feature.to_json());
        }
        Json::Object(map)
    }

    fn from_json(fm: &InsnFeatureManager, json: &Json) -> Result<Self, AbstractionError> {
        let obj = json
            .as_object()
            .ok_or_else(|| AbstractionError::Malformed(format!("abstract insn: {}", json)))?;
        let features = fm
            .decls()
            .iter()
            .map(|decl| {
                let value = obj.get(&decl.name).ok_or_else(|| {
                    AbstractionError::Malformed(format!("missing feature '{}'", decl.name))
                })?;
                AbstractFeature::from_json(&decl.kind, value)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AbstractInsn { features })
    }
}

/// One atomic relaxation of an abstract block, labeled with the coordinate
/// it touches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expansion {
    Feature { insn_idx: usize, decl_idx: usize, step: FeatureStep },
    Aliasing { key: AliasPairKey },
}

impl fmt::Display for Expansion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expansion::Feature { insn_idx, decl_idx, step } => {
                write!(f, "insn {} feature #{}: {}", insn_idx, decl_idx, step)
            }
            Expansion::Aliasing { key } => write!(f, "aliasing {}: to top", key),
        }
    }
}

impl Expansion {
    pub fn to_json(&self, fm: &InsnFeatureManager) -> Json {
        match self {
            Expansion::Feature { insn_idx, decl_idx, step } => {
                let step_json = match step {
                    FeatureStep::ToTop => json!("to_top"),
                    FeatureStep::WidenDistance { to } => json!({ "widen_distance": to }),
                    FeatureStep::RemoveElement(e) => json!({ "remove_element": e }),
                };
                json!({
                    "insn": insn_idx,
                    "feature": fm.decls()[*decl_idx].name,
                    "step": step_json,
                })
            }
            Expansion::Aliasing { key } => json!({ "aliasing": key.to_json() }),
        }
    }

    pub fn from_json(fm: &InsnFeatureManager, json: &Json) -> Result<Self, AbstractionError> {
        let malformed = || AbstractionError::Malformed(format!("expansion: {}", json));
        let obj = json.as_object().ok_or_else(malformed)?;
        if let Some(pair) = obj.get("aliasing") {
            let key = AliasPairKey::from_json(pair)?;
            return Ok(Expansion::Aliasing { key });
        }
        let insn_idx = obj.get("insn").and_then(Json::as_u64).ok_or_else(malformed)? as usize;
        let name = obj.get("feature").and_then(Json::as_str).ok_or_else(malformed)?;
        let decl_idx = fm
            .decl_index(name)
            .ok_or_else(|| AbstractionError::UnknownFeature(name.to_string()))?;
        let step_json = obj.get("step").ok_or_else(malformed)?;
        let step = if step_json.as_str() == Some("to_top") {
            FeatureStep::ToTop
        } else if let Some(to) = step_json.get("widen_distance").and_then(Json::as_u64) {
            FeatureStep::WidenDistance { to: to as u32 }
        } else if let Some(e) = step_json.get("remove_element").and_then(Json::as_str) {
            FeatureStep::RemoveElement(e.to_string())
        } else {
            return Err(malformed());
        };
        Ok(Expansion::Feature { insn_idx, decl_idx, step })
    }
}

/// An ordered sequence of abstract instructions of fixed length plus an
/// abstract aliasing relation. Represents the set of concrete blocks of the
/// same length whose instructions and operand choices fit.
#[derive(Clone, Debug, PartialEq)]
pub struct AbstractBlock {
    pub insns: Vec<AbstractInsn>,
    pub aliasing: AbstractAliasing,
}

impl AbstractBlock {
    /// Top of the lattice over blocks of length `len`.
    pub fn make_top(fm: &InsnFeatureManager, len: usize) -> Self {
        AbstractBlock {
            insns: (0..len).map(|_| AbstractInsn::top(fm)).collect(),
            aliasing: AbstractAliasing::top(),
        }
    }

    /// Singleton lift of a concrete block.
    pub fn from_concrete(fm: &InsnFeatureManager, bb: &BasicBlock) -> Self {
        AbstractBlock {
            insns: bb
                .insns
                .iter()
                .map(|insn| AbstractInsn::from_scheme(fm, insn.scheme))
                .collect(),
            aliasing: AbstractAliasing::from_concrete(fm.ctx(), bb),
        }
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn is_bottom(&self) -> bool {
        self.aliasing.is_bot() || self.insns.iter().any(AbstractInsn::is_bottom)
    }

    /// Is every concrete block represented by `other` also represented by
    /// `self`? Pointwise on instructions and aliasing; blocks of different
    /// length are never in a subsumption relation.
    pub fn subsumes(&self, other: &AbstractBlock) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.insns
            .iter()
            .zip(other.insns.iter())
            .all(|(a, b)| a.subsumes(b))
            && self.aliasing.subsumes(&other.aliasing)
    }

    /// Least upper bound. Both blocks must have the same length.
    pub fn join(&mut self, other: &AbstractBlock) {
        assert_eq!(self.len(), other.len(), "joined abstract blocks must have equal length");
        for (a, b) in self.insns.iter_mut().zip(other.insns.iter()) {
            a.join(b);
        }
        self.aliasing.join(&other.aliasing);
    }

    /// Point-check: is the concrete block a member of this block's
    /// concretization?
    pub fn contains_concrete(&self, fm: &InsnFeatureManager, bb: &BasicBlock) -> bool {
        if bb.len() != self.len() {
            return false;
        }
        self.insns
            .iter()
            .zip(bb.insns.iter())
            .all(|(abs, insn)| fm.scheme_matches(abs, insn.scheme))
            && self.aliasing.check_concrete(fm.ctx(), bb)
    }

    /// All one-step relaxations, each labeled with the affected coordinate
    /// and an estimated benefit: an index-derived upper bound on how many
    /// schemes the step newly admits at its position. Enumeration order is
    /// deterministic (positions, then declared features, then aliasing
    /// components in key order).
    pub fn possible_expansions(&self, fm: &InsnFeatureManager) -> Vec<(Expansion, u64)> {
        let mut res = Vec::new();
        for (insn_idx, insn) in self.insns.iter().enumerate() {
            for decl_idx in 0..fm.decls().len() {
                let feature = insn.feature(decl_idx);
                let before = fm.gamma_size_bound(decl_idx, feature) as u64;
                for (step, relaxed) in feature.relax() {
                    let after = fm.gamma_size_bound(decl_idx, &relaxed) as u64;
                    let benefit = after.saturating_sub(before);
                    res.push((Expansion::Feature { insn_idx, decl_idx, step }, benefit));
                }
            }
        }
        for (key, _) in self.aliasing.components() {
            res.push((Expansion::Aliasing { key: key.clone() }, 1));
        }
        res
    }

    /// Apply an expansion produced by `possible_expansions` on this block
    /// (or a copy of it).
    pub fn apply_expansion(&mut self, expansion: &Expansion) {
        match expansion {
            Expansion::Feature { insn_idx, decl_idx, step } => {
                let feature = &self.insns[*insn_idx].features[*decl_idx];
                let relaxed = feature
                    .relax()
                    .into_iter()
                    .find(|(s, _)| s == step)
                    .unwrap_or_else(|| {
                        panic!("expansion {} is not applicable to this block", expansion)
                    })
                    .1;
                self.insns[*insn_idx].features[*decl_idx] = relaxed;
            }
            Expansion::Aliasing { key } => {
                self.aliasing.set_top(key);
            }
        }
    }

    /// Materialize the sampling acceleration structures for this block.
    /// Fails if the block is unsatisfiable.
    pub fn precompute_sampler(
        &self,
        fm: &InsnFeatureManager,
        scheme_blacklist: &std::collections::HashSet<crate::iwho::SchemeId>,
    ) -> Result<super::sampler::Sampler, super::sampler::SamplingError> {
        super::sampler::Sampler::new(fm, self, scheme_blacklist)
    }

    pub fn to_json(&self, fm: &InsnFeatureManager) -> Json {
        json!({
            "abs_insns": self.insns.iter().map(|i| i.to_json(fm)).collect::<Vec<_>>(),
            "abs_aliasing": self.aliasing.to_json(),
        })
    }

    pub fn from_json(fm: &InsnFeatureManager, json: &Json) -> Result<Self, AbstractionError> {
        let obj = json
            .as_object()
            .ok_or_else(|| AbstractionError::Malformed(format!("abstract block: {}", json)))?;
        let insns = obj
            .get("abs_insns")
            .and_then(Json::as_array)
            .ok_or_else(|| AbstractionError::Malformed("missing abs_insns".to_string()))?
            .iter()
            .map(|j| AbstractInsn::from_json(fm, j))
            .collect::<Result<Vec<_>, _>>()?;
        let aliasing = AbstractAliasing::from_json(
            obj.get("abs_aliasing")
                .ok_or_else(|| AbstractionError::Malformed("missing abs_aliasing".to_string()))?,
        )?;
        Ok(AbstractBlock { insns, aliasing })
    }

    /// Render with feature names, for logs and the interactive strategy.
    pub fn display<'a>(&'a self, fm: &'a InsnFeatureManager) -> AbstractBlockDisplay<'a> {
        AbstractBlockDisplay { block: self, fm }
    }
}

pub struct AbstractBlockDisplay<'a> {
    block: &'a AbstractBlock,
    fm: &'a InsnFeatureManager,
}

impl fmt::Display for AbstractBlockDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "AbstractInsns:")?;
        for (idx, insn) in self.block.insns.iter().enumerate() {
            writeln!(f, "  {:2}:", idx)?;
            for (decl, feature) in self.fm.decls().iter().zip(insn.features.iter()) {
                writeln!(f, "    {}: {}", decl.name, feature)?;
            }
        }
        writeln!(f, "Aliasing:")?;
        write!(f, "{}", self.block.aliasing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::feature::FeatureKind;
    use crate::abstraction::feature_manager::FeatureDecl;
    use crate::iwho::parse::parse_block;
    use crate::iwho::{InsnScheme, OperandScheme, SchemeContext};
    use std::rc::Rc;

    fn universe() -> Rc<SchemeContext> {
        Rc::new(
            SchemeContext::from_schemes(vec![
                InsnScheme::new(
                    "add",
                    vec![
                        OperandScheme::reg("reg0", 64, true, true),
                        OperandScheme::imm("imm0", 8),
                    ],
                )
                .with_attrs("BINARY", "BASE", "I86"),
                InsnScheme::new(
                    "sub",
                    vec![
                        OperandScheme::reg("reg0", 64, true, true),
                        OperandScheme::reg("reg1", 64, true, false),
                    ],
                )
                .with_attrs("BINARY", "BASE", "I86"),
                InsnScheme::new(
                    "adc",
                    vec![
                        OperandScheme::reg("reg0", 64, true, true),
                        OperandScheme::reg("reg1", 64, true, false),
                    ],
                )
                .with_attrs("BINARY", "BASE", "I86"),
            ])
            .unwrap(),
        )
    }

    fn fm() -> InsnFeatureManager {
        InsnFeatureManager::new(
            universe(),
            vec![
                FeatureDecl { name: "exact_scheme".into(), kind: FeatureKind::Singleton },
                FeatureDecl {
                    name: "mnemonic".into(),
                    kind: FeatureKind::EditDistance { max_dist: 3 },
                },
                FeatureDecl { name: "category".into(), kind: FeatureKind::Singleton },
            ],
        )
        .unwrap()
    }

    #[test]
    fn lift_subsumes_itself_and_top_subsumes_lift() {
        let fm = fm();
        let bb = parse_block(fm.ctx(), "add rax, 0x2a\nsub rbx, rax").unwrap();
        let ab = AbstractBlock::from_concrete(&fm, &bb);
        let top = AbstractBlock::make_top(&fm, 2);

        assert!(ab.subsumes(&ab));
        assert!(top.subsumes(&ab));
        assert!(!ab.subsumes(&top));
        assert!(ab.contains_concrete(&fm, &bb));
        assert!(top.contains_concrete(&fm, &bb));
    }

    #[test]
    fn join_is_an_upper_bound() {
        let fm = fm();
        let bb1 = parse_block(fm.ctx(), "add rax, 0x2a\nsub rbx, rax").unwrap();
        let bb2 = parse_block(fm.ctx(), "adc rbx, rcx\nsub rdx, rcx").unwrap();
        let ab1 = AbstractBlock::from_concrete(&fm, &bb1);
        let ab2 = AbstractBlock::from_concrete(&fm, &bb2);
        let mut joined = ab1.clone();
        joined.join(&ab2);
        assert!(joined.subsumes(&ab1));
        assert!(joined.subsumes(&ab2));
        assert!(joined.contains_concrete(&fm, &bb1));
        assert!(joined.contains_concrete(&fm, &bb2));
    }

    #[test]
    fn expansions_strictly_ascend_and_terminate() {
        let fm = fm();
        let bb = parse_block(fm.ctx(), "add rax, 0x2a\nsub rbx, rax").unwrap();
        let mut ab = AbstractBlock::from_concrete(&fm, &bb);

        let mut steps = 0;
        loop {
            let expansions = ab.possible_expansions(&fm);
            let (expansion, _benefit) = match expansions.into_iter().next() {
                None => break,
                Some(e) => e,
            };
            let prev = ab.clone();
            ab.apply_expansion(&expansion);
            assert!(ab.subsumes(&prev), "expansion {} must ascend", expansion);
            assert!(!prev.subsumes(&ab), "expansion {} must be strict", expansion);
            steps += 1;
            assert!(steps < 200, "expansion chain must terminate");
        }
        assert!(ab.insns.iter().all(AbstractInsn::is_top));
        assert!(ab.aliasing.is_top());
    }

    #[test]
    fn serialization_round_trip_is_canonical() {
        let fm = fm();
        let bb = parse_block(fm.ctx(), "add rax, 0x2a\nsub rbx, rax").unwrap();
        let mut ab = AbstractBlock::from_concrete(&fm, &bb);
        // relax a corner to cover non-trivial feature states
        let exp = ab.possible_expansions(&fm).into_iter().next().unwrap().0;
        ab.apply_expansion(&exp);

        let json = ab.to_json(&fm);
        let text = serde_json::to_string(&json).unwrap();
        let parsed = AbstractBlock::from_json(&fm, &serde_json::from_str(&text).unwrap()).unwrap();
        assert_eq!(parsed, ab);
        assert_eq!(serde_json::to_string(&parsed.to_json(&fm)).unwrap(), text);
    }
}
