//! The abstract aliasing relation of an abstract block.
//!
//! Components are keyed by unordered pairs of operand references and take
//! one of three values: must-alias, must-not-alias, or top. Only non-top
//! components are stored; a missing key means top. Keys are canonically
//! ordered (lower position first, operand name as tie-break), which makes
//! map iteration and the serialized form deterministic.

use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

use crate::iwho::{BasicBlock, Operand, OperandKind, SchemeContext};

use super::AbstractionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKindTag {
    Reg,
    Mem,
}

impl OpKindTag {
    fn as_str(self) -> &'static str {
        match self {
            OpKindTag::Reg => "R",
            OpKindTag::Mem => "M",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "R" => Some(OpKindTag::Reg),
            "M" => Some(OpKindTag::Mem),
            _ => None,
        }
    }

    pub fn of(kind: &OperandKind) -> Option<Self> {
        match kind {
            OperandKind::Reg { .. } => Some(OpKindTag::Reg),
            OperandKind::Mem { .. } => Some(OpKindTag::Mem),
            _ => None,
        }
    }
}

/// Reference to one operand slot by name, e.g. `(R, reg0)`. Ordering is by
/// name first so that serialized pairs tie-break lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperandRef {
    pub name: String,
    pub tag: OpKindTag,
}

/// Canonically ordered unordered pair of operand slots.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AliasPairKey {
    pub a: (usize, OperandRef),
    pub b: (usize, OperandRef),
}

impl AliasPairKey {
    pub fn new(x: (usize, OperandRef), y: (usize, OperandRef)) -> Self {
        if x <= y {
            AliasPairKey { a: x, b: y }
        } else {
            AliasPairKey { a: y, b: x }
        }
    }

    pub fn to_json(&self) -> Json {
        let side = |(pos, r): &(usize, OperandRef)| json!([pos, [r.tag.as_str(), r.name]]);
        json!([side(&self.a), side(&self.b)])
    }

    pub fn from_json(json: &Json) -> Result<Self, AbstractionError> {
        let malformed = || AbstractionError::Malformed(format!("aliasing pair: {}", json));
        let parse_side = |j: &Json| -> Result<(usize, OperandRef), AbstractionError> {
            let arr = j.as_array().ok_or_else(malformed)?;
            if arr.len() != 2 {
                return Err(malformed());
            }
            let pos = arr[0].as_u64().ok_or_else(malformed)? as usize;
            let opref = arr[1].as_array().ok_or_else(malformed)?;
            if opref.len() != 2 {
                return Err(malformed());
            }
            let tag = opref[0]
                .as_str()
                .and_then(OpKindTag::parse)
                .ok_or_else(malformed)?;
            let name = opref[1].as_str().ok_or_else(malformed)?.to_string();
            Ok((pos, OperandRef { name, tag }))
        };
        let arr = json.as_array().ok_or_else(malformed)?;
        if arr.len() != 2 {
            return Err(malformed());
        }
        Ok(AliasPairKey::new(parse_side(&arr[0])?, parse_side(&arr[1])?))
    }
}

impl fmt::Display for AliasPairKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}:{}",
            self.a.0, self.a.1.name, self.b.0, self.b.1.name
        )
    }
}

/// The stored (non-top) value of an aliasing component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AliasValue {
    Must,
    MustNot,
}

/// Three-valued aliasing relation over the operand slots of a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbstractAliasing {
    components: BTreeMap<AliasPairKey, AliasValue>,
    is_bot: bool,
}

/// Collect the alias-capable operand slots of a concrete block:
/// `(position, reference, operand)` triples.
fn alias_capable_operands<'a>(
    ctx: &'a SchemeContext,
    bb: &'a BasicBlock,
) -> Vec<(usize, OperandRef, &'a Operand)> {
    let mut slots = Vec::new();
    for (pos, insn) in bb.insns.iter().enumerate() {
        let scheme = ctx.scheme(insn.scheme);
        for (op_idx, op_scheme) in scheme.operands.iter().enumerate() {
            if let Some(tag) = OpKindTag::of(&op_scheme.kind) {
                let opref = OperandRef { name: op_scheme.name.clone(), tag };
                slots.push((pos, opref, &insn.operands[op_idx]));
            }
        }
    }
    slots
}

impl AbstractAliasing {
    pub fn top() -> Self {
        AbstractAliasing { components: BTreeMap::new(), is_bot: false }
    }

    /// Lift the aliasing structure of a concrete block: equal storage
    /// becomes must-alias, provably distinct storage must-not-alias. Pairs
    /// of different operand kinds stay top (the sampler keeps register and
    /// memory pools disjoint, so there is nothing to constrain).
    pub fn from_concrete(ctx: &SchemeContext, bb: &BasicBlock) -> Self {
        let slots = alias_capable_operands(ctx, bb);
        let mut components = BTreeMap::new();
        for (i, (pos_a, ref_a, op_a)) in slots.iter().enumerate() {
            for (pos_b, ref_b, op_b) in slots.iter().skip(i + 1) {
                if ref_a.tag != ref_b.tag {
                    continue;
                }
                let key = AliasPairKey::new((*pos_a, ref_a.clone()), (*pos_b, ref_b.clone()));
                if op_a.must_alias(op_b) {
                    components.insert(key, AliasValue::Must);
                } else if !op_a.may_alias(op_b) {
                    components.insert(key, AliasValue::MustNot);
                }
            }
        }
        AbstractAliasing { components, is_bot: false }
    }

    pub fn is_bot(&self) -> bool {
        self.is_bot
    }

    pub fn is_top(&self) -> bool {
        !self.is_bot && self.components.is_empty()
    }

    /// The component at `key`; `None` means top.
    pub fn get(&self, key: &AliasPairKey) -> Option<AliasValue> {
        self.components.get(key).copied()
    }

    pub fn components(&self) -> impl Iterator<Item = (&AliasPairKey, AliasValue)> {
        self.components.iter().map(|(k, v)| (k, *v))
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// Relax one component to top.
    pub fn set_top(&mut self, key: &AliasPairKey) {
        self.components.remove(key);
    }

    pub fn subsumes(&self, other: &AbstractAliasing) -> bool {
        if other.is_bot {
            return true;
        }
        if self.is_bot {
            return false;
        }
        self.components
            .iter()
            .all(|(key, v)| other.components.get(key) == Some(v))
    }

    pub fn join(&mut self, other: &AbstractAliasing) {
        if other.is_bot {
            return;
        }
        if self.is_bot {
            *self = other.clone();
            return;
        }
        let other_components = &other.components;
        self.components
            .retain(|key, v| other_components.get(key) == Some(v));
    }

    /// Check a concrete block against the relation. A constraint whose
    /// operand slot does not exist in the chosen schemes is vacuously
    /// satisfied; there is no choice that could violate it.
    pub fn check_concrete(&self, ctx: &SchemeContext, bb: &BasicBlock) -> bool {
        if self.is_bot {
            return false;
        }
        let find_operand = |pos: usize, opref: &OperandRef| -> Option<&Operand> {
            let insn = bb.insns.get(pos)?;
            let scheme = ctx.scheme(insn.scheme);
            scheme
                .operands
                .iter()
                .position(|os| os.name == opref.name && OpKindTag::of(&os.kind) == Some(opref.tag))
                .map(|idx| &insn.operands[idx])
        };
        for (key, value) in &self.components {
            let op_a = find_operand(key.a.0, &key.a.1);
            let op_b = find_operand(key.b.0, &key.b.1);
            let (op_a, op_b) = match (op_a, op_b) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };
            let ok = match value {
                AliasValue::Must => op_a.must_alias(op_b),
                AliasValue::MustNot => !op_a.may_alias(op_b),
            };
            if !ok {
                return false;
            }
        }
        true
    }

    pub fn to_json(&self) -> Json {
        let dict: Vec<Json> = self
            .components
            .iter()
            .map(|(key, value)| {
                let v = match value {
                    AliasValue::Must => json!(true),
                    AliasValue::MustNot => json!(false),
                };
                json!([key.to_json(), v])
            })
            .collect();
        json!({ "aliasing_dict": dict, "is_bot": self.is_bot })
    }

    pub fn from_json(json: &Json) -> Result<Self, AbstractionError> {
        let malformed = || AbstractionError::Malformed(format!("abstract aliasing: {}", json));
        let obj = json.as_object().ok_or_else(malformed)?;
        let is_bot = obj.get("is_bot").and_then(Json::as_bool).ok_or_else(malformed)?;
        let dict = obj
            .get("aliasing_dict")
            .and_then(Json::as_array)
            .ok_or_else(malformed)?;
        let mut components = BTreeMap::new();
        for entry in dict {
            let pair = entry.as_array().ok_or_else(malformed)?;
            if pair.len() != 2 {
                return Err(malformed());
            }
            let key = AliasPairKey::from_json(&pair[0])?;
            let value = match &pair[1] {
                Json::Bool(true) => AliasValue::Must,
                Json::Bool(false) => AliasValue::MustNot,
                _ => return Err(malformed()),
            };
            components.insert(key, value);
        }
        Ok(AbstractAliasing { components, is_bot })
    }
}

impl fmt::Display for AbstractAliasing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_bot {
            return write!(f, "  BOTTOM");
        }
        if self.components.is_empty() {
            return write!(f, "  TOP");
        }
        for (key, value) in &self.components {
            let txt = match value {
                AliasValue::Must => "must alias",
                AliasValue::MustNot => "must not alias",
            };
            writeln!(f, "  {} : {}", key, txt)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iwho::parse::parse_block;
    use crate::iwho::{InsnScheme, OperandScheme};

    fn ctx() -> SchemeContext {
        SchemeContext::from_schemes(vec![
            InsnScheme::new(
                "add",
                vec![
                    OperandScheme::reg("reg0", 64, true, true),
                    OperandScheme::imm("imm0", 8),
                ],
            ),
            InsnScheme::new(
                "sub",
                vec![
                    OperandScheme::reg("reg0", 64, true, true),
                    OperandScheme::reg("reg1", 64, true, false),
                ],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn lift_observes_register_aliasing() {
        let ctx = ctx();
        let bb = parse_block(&ctx, "add rax, 0x2a\nsub rbx, rax").unwrap();
        let aliasing = AbstractAliasing::from_concrete(&ctx, &bb);

        let must = AliasPairKey::new(
            (0, OperandRef { name: "reg0".into(), tag: OpKindTag::Reg }),
            (1, OperandRef { name: "reg1".into(), tag: OpKindTag::Reg }),
        );
        let must_not = AliasPairKey::new(
            (0, OperandRef { name: "reg0".into(), tag: OpKindTag::Reg }),
            (1, OperandRef { name: "reg0".into(), tag: OpKindTag::Reg }),
        );
        assert_eq!(aliasing.get(&must), Some(AliasValue::Must));
        assert_eq!(aliasing.get(&must_not), Some(AliasValue::MustNot));
        assert!(aliasing.check_concrete(&ctx, &bb));
    }

    #[test]
    fn join_keeps_agreeing_components() {
        let ctx = ctx();
        let bb1 = parse_block(&ctx, "add rax, 0x2a\nsub rbx, rax").unwrap();
        let bb2 = parse_block(&ctx, "add rcx, 0x2a\nsub rdx, rcx").unwrap();
        let mut a = AbstractAliasing::from_concrete(&ctx, &bb1);
        let b = AbstractAliasing::from_concrete(&ctx, &bb2);
        a.join(&b);
        assert!(a.subsumes(&b));
        assert!(!a.is_top());
        assert!(a.check_concrete(&ctx, &bb1));
        assert!(a.check_concrete(&ctx, &bb2));

        let bb3 = parse_block(&ctx, "add rcx, 0x2a\nsub rdx, rax").unwrap();
        assert!(!a.check_concrete(&ctx, &bb3));
    }

    #[test]
    fn serialization_round_trip() {
        let ctx = ctx();
        let bb = parse_block(&ctx, "add rax, 0x2a\nsub rbx, rax").unwrap();
        let aliasing = AbstractAliasing::from_concrete(&ctx, &bb);
        let json = aliasing.to_json();
        let parsed = AbstractAliasing::from_json(&json).unwrap();
        assert_eq!(parsed, aliasing);
        assert_eq!(parsed.to_json(), json);
    }
}
