//! The per-feature abstraction lattices.
//!
//! Every instruction feature is abstracted by one of four lattice kinds,
//! modeled as a tagged union with a shared capability surface: `subsumes`,
//! `join`, `relax` (one-step coarsening), point-checks against concrete
//! feature values, and the canonical JSON encoding.
//!
//! Note the direction of the subset lattice: an element is a *requirement
//! set*. A scheme is represented if its concrete value contains all required
//! elements, so the top element is the empty set, joins intersect, and
//! relaxing removes requirements.

use serde_json::{json, Value as Json};
use std::collections::BTreeSet;

use super::AbstractionError;

/// Marker used by the wire format for lattice tops.
pub const TOP_MARKER: &str = "$SV:TOP";

/// A concrete feature value extracted from an instruction scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeatureValue {
    Str(String),
    Set(BTreeSet<String>),
}

impl FeatureValue {
    pub fn set<I: IntoIterator<Item = S>, S: Into<String>>(elems: I) -> Self {
        FeatureValue::Set(elems.into_iter().map(Into::into).collect())
    }
}

/// The abstraction kind configured for a feature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeatureKind {
    Singleton,
    Subset,
    SubsetOrDefinitelyNot,
    EditDistance { max_dist: u32 },
}

/// One atomic relaxation step at a feature coordinate. Together with the
/// coordinate it identifies an expansion, so rejected expansions can be
/// blocklisted for the rest of a generalization run.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FeatureStep {
    ToTop,
    WidenDistance { to: u32 },
    RemoveElement(String),
}

impl std::fmt::Display for FeatureStep {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FeatureStep::ToTop => write!(f, "to top"),
            FeatureStep::WidenDistance { to } => write!(f, "widen distance to {}", to),
            FeatureStep::RemoveElement(e) => write!(f, "drop '{}'", e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Singleton {
    Bottom,
    Value(String),
    Top,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriBool {
    Bottom,
    Value(bool),
    Top,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subset {
    pub bottom: bool,
    /// Elements a represented scheme's value must contain. Empty means top
    /// (unless `bottom` is set).
    pub required: BTreeSet<String>,
}

impl Subset {
    fn bottom() -> Self {
        Subset { bottom: true, required: BTreeSet::new() }
    }

    fn top() -> Self {
        Subset { bottom: false, required: BTreeSet::new() }
    }

    fn from_set(set: &BTreeSet<String>) -> Self {
        Subset { bottom: false, required: set.clone() }
    }

    fn is_top(&self) -> bool {
        !self.bottom && self.required.is_empty()
    }

    fn subsumes(&self, other: &Subset) -> bool {
        if other.bottom {
            return true;
        }
        if self.bottom {
            return false;
        }
        self.required.is_subset(&other.required)
    }

    fn join(&mut self, other: &Subset) {
        if other.bottom {
            return;
        }
        if self.bottom {
            *self = other.clone();
            return;
        }
        self.required = self.required.intersection(&other.required).cloned().collect();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetOrNot {
    pub is_in: TriBool,
    pub subset: Subset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditState {
    Bottom,
    Within { base: String, dist: u32 },
    Top,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditDistance {
    pub max_dist: u32,
    pub state: EditState,
}

/// An element of one of the four feature lattices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbstractFeature {
    Singleton(Singleton),
    Subset(Subset),
    SubsetOrNot(SubsetOrNot),
    EditDistance(EditDistance),
}

impl AbstractFeature {
    pub fn bottom(kind: &FeatureKind) -> Self {
        match kind {
            FeatureKind::Singleton => AbstractFeature::Singleton(Singleton::Bottom),
            FeatureKind::Subset => AbstractFeature::Subset(Subset::bottom()),
            FeatureKind::SubsetOrDefinitelyNot => AbstractFeature::SubsetOrNot(SubsetOrNot {
                is_in: TriBool::Bottom,
                subset: Subset::bottom(),
            }),
            FeatureKind::EditDistance { max_dist } => AbstractFeature::EditDistance(EditDistance {
                max_dist: *max_dist,
                state: EditState::Bottom,
            }),
        }
    }

    pub fn top(kind: &FeatureKind) -> Self {
        match kind {
            FeatureKind::Singleton => AbstractFeature::Singleton(Singleton::Top),
            FeatureKind::Subset => AbstractFeature::Subset(Subset::top()),
            FeatureKind::SubsetOrDefinitelyNot => AbstractFeature::SubsetOrNot(SubsetOrNot {
                is_in: TriBool::Top,
                subset: Subset::top(),
            }),
            FeatureKind::EditDistance { max_dist } => AbstractFeature::EditDistance(EditDistance {
                max_dist: *max_dist,
                state: EditState::Top,
            }),
        }
    }

    /// Lift a concrete feature value. Schemes without a value for the
    /// feature lift to top, so a missing attribute never constrains.
    pub fn from_value(kind: &FeatureKind, value: Option<&FeatureValue>) -> Self {
        let value = match value {
            None => return Self::top(kind),
            Some(v) => v,
        };
        match (kind, value) {
            (FeatureKind::Singleton, FeatureValue::Str(s)) => {
                AbstractFeature::Singleton(Singleton::Value(s.clone()))
            }
            (FeatureKind::Subset, FeatureValue::Set(set)) => {
                AbstractFeature::Subset(Subset::from_set(set))
            }
            (FeatureKind::SubsetOrDefinitelyNot, FeatureValue::Set(set)) => {
                if set.is_empty() {
                    AbstractFeature::SubsetOrNot(SubsetOrNot {
                        is_in: TriBool::Value(false),
                        subset: Subset::top(),
                    })
                } else {
                    AbstractFeature::SubsetOrNot(SubsetOrNot {
                        is_in: TriBool::Value(true),
                        subset: Subset::from_set(set),
                    })
                }
            }
            (FeatureKind::EditDistance { max_dist }, FeatureValue::Str(s)) => {
                AbstractFeature::EditDistance(EditDistance {
                    max_dist: *max_dist,
                    state: EditState::Within { base: s.clone(), dist: 0 },
                })
            }
            (kind, value) => {
                panic!("feature value {:?} does not fit abstraction kind {:?}", value, kind)
            }
        }
    }

    pub fn is_top(&self) -> bool {
        match self {
            AbstractFeature::Singleton(s) => matches!(s, Singleton::Top),
            AbstractFeature::Subset(s) => s.is_top(),
            AbstractFeature::SubsetOrNot(s) => matches!(s.is_in, TriBool::Top),
            AbstractFeature::EditDistance(e) => matches!(e.state, EditState::Top),
        }
    }

    pub fn is_bottom(&self) -> bool {
        match self {
            AbstractFeature::Singleton(s) => matches!(s, Singleton::Bottom),
            AbstractFeature::Subset(s) => s.bottom,
            AbstractFeature::SubsetOrNot(s) => matches!(s.is_in, TriBool::Bottom),
            AbstractFeature::EditDistance(e) => matches!(e.state, EditState::Bottom),
        }
    }

    /// Is every concrete value represented by `other` also represented by
    /// `self`?
    pub fn subsumes(&self, other: &AbstractFeature) -> bool {
        match (self, other) {
            (AbstractFeature::Singleton(a), AbstractFeature::Singleton(b)) => match (a, b) {
                (Singleton::Top, _) | (_, Singleton::Bottom) => true,
                (Singleton::Bottom, _) | (_, Singleton::Top) => false,
                (Singleton::Value(x), Singleton::Value(y)) => x == y,
            },
            (AbstractFeature::Subset(a), AbstractFeature::Subset(b)) => a.subsumes(b),
            (AbstractFeature::SubsetOrNot(a), AbstractFeature::SubsetOrNot(b)) => {
                match (&a.is_in, &b.is_in) {
                    (TriBool::Top, _) | (_, TriBool::Bottom) => true,
                    (TriBool::Bottom, _) | (_, TriBool::Top) => false,
                    (TriBool::Value(x), TriBool::Value(y)) => {
                        x == y && (!x || a.subset.subsumes(&b.subset))
                    }
                }
            }
            (AbstractFeature::EditDistance(a), AbstractFeature::EditDistance(b)) => {
                match (&a.state, &b.state) {
                    (EditState::Top, _) | (_, EditState::Bottom) => true,
                    (EditState::Bottom, _) | (_, EditState::Top) => false,
                    (
                        EditState::Within { base: ab, dist: ad },
                        EditState::Within { base: bb, dist: bd },
                    ) => {
                        // triangle inequality: everything within bd of bb is
                        // within dist(ab, bb) + bd of ab
                        levenshtein(ab, bb) + bd <= *ad
                    }
                }
            }
            _ => panic!("mismatched abstract feature kinds"),
        }
    }

    /// Point-check: does a scheme with the given concrete value lie in the
    /// concretization of `self`?
    pub fn subsumes_value(&self, value: Option<&FeatureValue>) -> bool {
        let value = match value {
            None => return self.is_top(),
            Some(v) => v,
        };
        match (self, value) {
            (AbstractFeature::Singleton(s), FeatureValue::Str(v)) => match s {
                Singleton::Top => true,
                Singleton::Bottom => false,
                Singleton::Value(x) => x == v,
            },
            (AbstractFeature::Subset(s), FeatureValue::Set(v)) => {
                !s.bottom && s.required.is_subset(v)
            }
            (AbstractFeature::SubsetOrNot(s), FeatureValue::Set(v)) => match s.is_in {
                TriBool::Top => true,
                TriBool::Bottom => false,
                TriBool::Value(true) => !v.is_empty() && s.subset.required.is_subset(v),
                TriBool::Value(false) => v.is_empty(),
            },
            (AbstractFeature::EditDistance(e), FeatureValue::Str(v)) => match &e.state {
                EditState::Top => true,
                EditState::Bottom => false,
                EditState::Within { base, dist } => levenshtein(base, v) <= *dist,
            },
            _ => false,
        }
    }

    /// Least upper bound, in place.
    pub fn join(&mut self, other: &AbstractFeature) {
        match (self, other) {
            (AbstractFeature::Singleton(a), AbstractFeature::Singleton(b)) => match (&*a, b) {
                (_, Singleton::Bottom) => {}
                (Singleton::Bottom, _) => *a = b.clone(),
                (Singleton::Top, _) | (_, Singleton::Top) => *a = Singleton::Top,
                (Singleton::Value(x), Singleton::Value(y)) => {
                    if x != y {
                        *a = Singleton::Top;
                    }
                }
            },
            (AbstractFeature::Subset(a), AbstractFeature::Subset(b)) => a.join(b),
            (AbstractFeature::SubsetOrNot(a), AbstractFeature::SubsetOrNot(b)) => {
                match (&a.is_in, &b.is_in) {
                    (_, TriBool::Bottom) => {}
                    (TriBool::Bottom, _) => *a = b.clone(),
                    (TriBool::Top, _) | (_, TriBool::Top) => {
                        a.is_in = TriBool::Top;
                        a.subset = Subset::top();
                    }
                    (TriBool::Value(x), TriBool::Value(y)) => {
                        if x != y {
                            a.is_in = TriBool::Top;
                            a.subset = Subset::top();
                        } else if *x {
                            a.subset.join(&b.subset);
                        }
                    }
                }
            }
            (AbstractFeature::EditDistance(a), AbstractFeature::EditDistance(b)) => {
                match (&a.state, &b.state) {
                    (_, EditState::Bottom) => {}
                    (EditState::Bottom, _) => a.state = b.state.clone(),
                    (EditState::Top, _) => {}
                    (EditState::Within { .. }, EditState::Top) => a.state = EditState::Top,
                    (
                        EditState::Within { base: ab, dist: ad },
                        EditState::Within { base: bb, dist: bd },
                    ) => {
                        if ab == bb {
                            let dist = (*ad).max(*bd);
                            if dist > a.max_dist {
                                a.state = EditState::Top;
                            } else {
                                a.state = EditState::Within { base: ab.clone(), dist };
                            }
                        } else {
                            a.state = EditState::Top;
                        }
                    }
                }
            }
            _ => panic!("mismatched abstract feature kinds"),
        }
    }

    /// All immediate predecessors one relaxation step up the lattice,
    /// labeled with the step that produces them. Empty iff `self` is top.
    /// Bottom elements are not relaxed; an unsatisfiable block is discarded,
    /// not coarsened.
    pub fn relax(&self) -> Vec<(FeatureStep, AbstractFeature)> {
        match self {
            AbstractFeature::Singleton(Singleton::Value(_)) => {
                vec![(FeatureStep::ToTop, AbstractFeature::Singleton(Singleton::Top))]
            }
            AbstractFeature::Singleton(_) => vec![],
            AbstractFeature::Subset(s) => {
                if s.bottom {
                    return vec![];
                }
                s.required
                    .iter()
                    .map(|elem| {
                        let mut required = s.required.clone();
                        required.remove(elem);
                        (
                            FeatureStep::RemoveElement(elem.clone()),
                            AbstractFeature::Subset(Subset { bottom: false, required }),
                        )
                    })
                    .collect()
            }
            AbstractFeature::SubsetOrNot(s) => match &s.is_in {
                TriBool::Bottom | TriBool::Top => vec![],
                TriBool::Value(false) => vec![(
                    FeatureStep::ToTop,
                    AbstractFeature::SubsetOrNot(SubsetOrNot {
                        is_in: TriBool::Top,
                        subset: Subset::top(),
                    }),
                )],
                TriBool::Value(true) => {
                    if s.subset.is_top() {
                        vec![(
                            FeatureStep::ToTop,
                            AbstractFeature::SubsetOrNot(SubsetOrNot {
                                is_in: TriBool::Top,
                                subset: Subset::top(),
                            }),
                        )]
                    } else {
                        s.subset
                            .required
                            .iter()
                            .map(|elem| {
                                let mut required = s.subset.required.clone();
                                required.remove(elem);
                                (
                                    FeatureStep::RemoveElement(elem.clone()),
                                    AbstractFeature::SubsetOrNot(SubsetOrNot {
                                        is_in: TriBool::Value(true),
                                        subset: Subset { bottom: false, required },
                                    }),
                                )
                            })
                            .collect()
                    }
                }
            },
            AbstractFeature::EditDistance(e) => match &e.state {
                EditState::Bottom | EditState::Top => vec![],
                EditState::Within { base, dist } => {
                    if *dist >= e.max_dist {
                        vec![(
                            FeatureStep::ToTop,
                            AbstractFeature::EditDistance(EditDistance {
                                max_dist: e.max_dist,
                                state: EditState::Top,
                            }),
                        )]
                    } else {
                        vec![(
                            FeatureStep::WidenDistance { to: dist + 1 },
                            AbstractFeature::EditDistance(EditDistance {
                                max_dist: e.max_dist,
                                state: EditState::Within { base: base.clone(), dist: dist + 1 },
                            }),
                        )]
                    }
                }
            },
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            AbstractFeature::Singleton(Singleton::Top) => json!(TOP_MARKER),
            AbstractFeature::Singleton(Singleton::Value(v)) => json!(v),
            AbstractFeature::Subset(s) if !s.bottom => {
                json!(s.required.iter().collect::<Vec<_>>())
            }
            AbstractFeature::SubsetOrNot(s) => match &s.is_in {
                TriBool::Top => json!(TOP_MARKER),
                TriBool::Value(b) => json!({
                    "subfeature": s.subset.required.iter().collect::<Vec<_>>(),
                    "is_in_subfeature": b,
                }),
                TriBool::Bottom => panic!("bottom abstract features are not serializable"),
            },
            AbstractFeature::EditDistance(e) => match &e.state {
                EditState::Top => json!({
                    "top": true,
                    "base": "",
                    "curr_dist": Json::Null,
                    "max_dist": e.max_dist,
                }),
                EditState::Within { base, dist } => json!({
                    "top": false,
                    "base": base,
                    "curr_dist": dist,
                    "max_dist": e.max_dist,
                }),
                EditState::Bottom => panic!("bottom abstract features are not serializable"),
            },
            _ => panic!("bottom abstract features are not serializable"),
        }
    }

    pub fn from_json(kind: &FeatureKind, json: &Json) -> Result<Self, AbstractionError> {
        let malformed = || AbstractionError::Malformed(format!("abstract feature: {}", json));
        if json.as_str() == Some(TOP_MARKER) {
            return Ok(Self::top(kind));
        }
        match kind {
            FeatureKind::Singleton => {
                let v = json.as_str().ok_or_else(malformed)?;
                Ok(AbstractFeature::Singleton(Singleton::Value(v.to_string())))
            }
            FeatureKind::Subset => {
                let arr = json.as_array().ok_or_else(malformed)?;
                let required = arr
                    .iter()
                    .map(|e| e.as_str().map(str::to_string).ok_or_else(malformed))
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(AbstractFeature::Subset(Subset { bottom: false, required }))
            }
            FeatureKind::SubsetOrDefinitelyNot => {
                let obj = json.as_object().ok_or_else(malformed)?;
                let is_in = obj
                    .get("is_in_subfeature")
                    .and_then(Json::as_bool)
                    .ok_or_else(malformed)?;
                let arr = obj
                    .get("subfeature")
                    .and_then(Json::as_array)
                    .ok_or_else(malformed)?;
                let required = arr
                    .iter()
                    .map(|e| e.as_str().map(str::to_string).ok_or_else(malformed))
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(AbstractFeature::SubsetOrNot(SubsetOrNot {
                    is_in: TriBool::Value(is_in),
                    subset: Subset { bottom: false, required },
                }))
            }
            FeatureKind::EditDistance { max_dist } => {
                let obj = json.as_object().ok_or_else(malformed)?;
                let top = obj.get("top").and_then(Json::as_bool).ok_or_else(malformed)?;
                let base = obj.get("base").and_then(Json::as_str).ok_or_else(malformed)?;
                let stored_max = obj
                    .get("max_dist")
                    .and_then(Json::as_u64)
                    .ok_or_else(malformed)? as u32;
                if stored_max != *max_dist {
                    return Err(AbstractionError::Malformed(format!(
                        "edit distance bound mismatch: configured {}, serialized {}",
                        max_dist, stored_max
                    )));
                }
                let state = if top {
                    EditState::Top
                } else {
                    let dist = obj
                        .get("curr_dist")
                        .and_then(Json::as_u64)
                        .ok_or_else(malformed)? as u32;
                    EditState::Within { base: base.to_string(), dist }
                };
                Ok(AbstractFeature::EditDistance(EditDistance { max_dist: *max_dist, state }))
            }
        }
    }
}

impl std::fmt::Display for AbstractFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AbstractFeature::Singleton(Singleton::Top) => write!(f, "TOP"),
            AbstractFeature::Singleton(Singleton::Bottom) => write!(f, "BOT"),
            AbstractFeature::Singleton(Singleton::Value(v)) => write!(f, "{}", v),
            AbstractFeature::Subset(s) => {
                if s.bottom {
                    write!(f, "BOT")
                } else if s.required.is_empty() {
                    write!(f, "TOP")
                } else {
                    write!(f, "⊇ {{{}}}", s.required.iter().cloned().collect::<Vec<_>>().join(", "))
                }
            }
            AbstractFeature::SubsetOrNot(s) => match &s.is_in {
                TriBool::Top => write!(f, "TOP"),
                TriBool::Bottom => write!(f, "BOT"),
                TriBool::Value(false) => write!(f, "none"),
                TriBool::Value(true) => {
                    if s.subset.is_top() {
                        write!(f, "some")
                    } else {
                        write!(
                            f,
                            "⊇ {{{}}}",
                            s.subset.required.iter().cloned().collect::<Vec<_>>().join(", ")
                        )
                    }
                }
            },
            AbstractFeature::EditDistance(e) => match &e.state {
                EditState::Top => write!(f, "TOP"),
                EditState::Bottom => write!(f, "BOT"),
                EditState::Within { base, dist } => write!(f, "'{}'~{}", base, dist),
            },
        }
    }
}

/// Levenshtein distance over unicode scalars.
pub fn levenshtein(a: &str, b: &str) -> u32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<u32> = (0..=b.len() as u32).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut prev_diag = row[0];
        row[0] = i as u32 + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let val = (prev_diag + cost).min(row[j] + 1).min(row[j + 1] + 1);
            prev_diag = row[j + 1];
            row[j + 1] = val;
        }
    }
    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("add", "add"), 0);
        assert_eq!(levenshtein("add", "adc"), 1);
        assert_eq!(levenshtein("add", "sub"), 3);
        assert_eq!(levenshtein("", "vsubpd"), 6);
    }

    #[test]
    fn singleton_join_and_subsume() {
        let kind = FeatureKind::Singleton;
        let mut a = AbstractFeature::from_value(&kind, Some(&FeatureValue::Str("x".into())));
        let b = AbstractFeature::from_value(&kind, Some(&FeatureValue::Str("y".into())));
        assert!(a.subsumes(&a));
        assert!(!a.subsumes(&b));
        a.join(&b);
        assert!(a.is_top());
        assert!(a.subsumes(&b));
    }

    #[test]
    fn subset_lattice_direction() {
        let kind = FeatureKind::Subset;
        let rws = FeatureValue::set(vec!["R", "W", "S:64"]);
        let w = FeatureValue::set(vec!["W"]);
        let small = AbstractFeature::from_value(&kind, Some(&rws));
        let coarse = AbstractFeature::from_value(&kind, Some(&w));
        // requiring less represents more
        assert!(coarse.subsumes(&small));
        assert!(!small.subsumes(&coarse));
        assert!(coarse.subsumes_value(Some(&rws)));
        assert!(!small.subsumes_value(Some(&w)));

        let mut joined = small.clone();
        joined.join(&coarse);
        assert_eq!(joined, coarse);
    }

    #[test]
    fn edit_distance_relax_chain_reaches_top() {
        let kind = FeatureKind::EditDistance { max_dist: 3 };
        let mut f = AbstractFeature::from_value(&kind, Some(&FeatureValue::Str("add".into())));
        let mut steps = 0;
        while !f.is_top() {
            let preds = f.relax();
            assert_eq!(preds.len(), 1);
            assert!(preds[0].1.subsumes(&f));
            assert!(!f.subsumes(&preds[0].1));
            f = preds[0].1.clone();
            steps += 1;
        }
        assert_eq!(steps, 4);
    }

    #[test]
    fn edit_distance_triangle_subsumption() {
        let e = |base: &str, dist| {
            AbstractFeature::EditDistance(EditDistance {
                max_dist: 5,
                state: EditState::Within { base: base.to_string(), dist },
            })
        };
        assert!(e("add", 3).subsumes(&e("adc", 1)));
        assert!(!e("add", 1).subsumes(&e("adc", 1)));
    }

    #[test]
    fn subset_or_not_chain() {
        let kind = FeatureKind::SubsetOrDefinitelyNot;
        let mem = AbstractFeature::from_value(&kind, Some(&FeatureValue::set(vec!["R", "W"])));
        let none = AbstractFeature::from_value(&kind, Some(&FeatureValue::set(Vec::<String>::new())));
        assert!(!mem.subsumes(&none));
        assert!(!none.subsumes(&mem));

        // {R, W} -> {W} -> {} ("some") -> TOP
        let mut f = mem;
        let mut hops = 0;
        while !f.is_top() {
            let preds = f.relax();
            assert!(!preds.is_empty());
            f = preds[0].1.clone();
            hops += 1;
        }
        assert_eq!(hops, 3);
    }

    #[test]
    fn json_round_trip_all_kinds() {
        let cases = vec![
            (
                FeatureKind::Singleton,
                AbstractFeature::from_value(
                    &FeatureKind::Singleton,
                    Some(&FeatureValue::Str("BINARY".into())),
                ),
            ),
            (FeatureKind::Singleton, AbstractFeature::top(&FeatureKind::Singleton)),
            (
                FeatureKind::Subset,
                AbstractFeature::from_value(
                    &FeatureKind::Subset,
                    Some(&FeatureValue::set(vec!["R:R64", "W:FLAGS"])),
                ),
            ),
            (
                FeatureKind::SubsetOrDefinitelyNot,
                AbstractFeature::from_value(
                    &FeatureKind::SubsetOrDefinitelyNot,
                    Some(&FeatureValue::set(vec!["W"])),
                ),
            ),
            (
                FeatureKind::SubsetOrDefinitelyNot,
                AbstractFeature::top(&FeatureKind::SubsetOrDefinitelyNot),
            ),
            (
                FeatureKind::EditDistance { max_dist: 3 },
                AbstractFeature::from_value(
                    &FeatureKind::EditDistance { max_dist: 3 },
                    Some(&FeatureValue::Str("add".into())),
                ),
            ),
            (
                FeatureKind::EditDistance { max_dist: 3 },
                AbstractFeature::top(&FeatureKind::EditDistance { max_dist: 3 }),
            ),
        ];
        for (kind, feature) in cases {
            let json = feature.to_json();
            let parsed = AbstractFeature::from_json(&kind, &json).unwrap();
            assert_eq!(parsed, feature, "round trip failed for {}", json);
            assert_eq!(parsed.to_json(), json);
        }
    }
}
