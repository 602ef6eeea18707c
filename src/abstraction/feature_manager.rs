//! Feature extraction and the forward indices from feature values to
//! matching instruction schemes.
//!
//! The indices are built eagerly when an abstraction context is created and
//! are immutable afterwards; samplers borrow them through the manager. The
//! declaration order of features matters: feasible-scheme computation
//! intersects per-feature concretizations in that order, so selective
//! features should be listed first.

use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::iwho::{SchemeContext, SchemeId};

use super::block::AbstractInsn;
use super::feature::{AbstractFeature, FeatureKind, FeatureValue, Singleton, Subset, SubsetOrNot, TriBool};
use super::AbstractionError;

/// Bucket keys for the `subset_or_definitely_not` index.
const DEFINITELY: &str = "_definitely_";
const DEFINITELY_NOT: &str = "_definitely_not_";

/// A configured feature: its name and the lattice kind abstracting it.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureDecl {
    pub name: String,
    pub kind: FeatureKind,
}

const KNOWN_FEATURES: &[&str] = &[
    "exact_scheme",
    "mnemonic",
    "opschemes",
    "memory_usage",
    "category",
    "extension",
    "isa-set",
];

struct FeatureIndex {
    buckets: HashMap<String, Vec<SchemeId>>,
}

impl FeatureIndex {
    fn bucket(&self, key: &str) -> &[SchemeId] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Trie over mnemonic strings for edit-distance lookups. Subtrees whose
/// minimal distance already exceeds the bound are pruned during the walk.
#[derive(Default)]
struct MnemonicTrie {
    children: BTreeMap<char, MnemonicTrie>,
    word: Option<String>,
}

impl MnemonicTrie {
    fn insert(&mut self, word: &str) {
        let mut node = self;
        for c in word.chars() {
            node = node.children.entry(c).or_default();
        }
        node.word = Some(word.to_string());
    }

    fn within_distance(&self, base: &str, max_dist: u32) -> Vec<String> {
        let base: Vec<char> = base.chars().collect();
        let first_row: Vec<u32> = (0..=base.len() as u32).collect();
        let mut found = Vec::new();
        if let Some(word) = &self.word {
            if *first_row.last().unwrap() <= max_dist {
                found.push(word.clone());
            }
        }
        for (c, child) in &self.children {
            child.walk(*c, &base, &first_row, max_dist, &mut found);
        }
        found
    }

    fn walk(&self, c: char, base: &[char], prev_row: &[u32], max_dist: u32, found: &mut Vec<String>) {
        let mut row = Vec::with_capacity(base.len() + 1);
        row.push(prev_row[0] + 1);
        for (j, &bc) in base.iter().enumerate() {
            let cost = if bc == c { 0 } else { 1 };
            let val = (prev_row[j] + cost).min(prev_row[j + 1] + 1).min(row[j] + 1);
            row.push(val);
        }
        if let Some(word) = &self.word {
            if *row.last().unwrap() <= max_dist {
                found.push(word.clone());
            }
        }
        if row.iter().min().copied().unwrap_or(u32::MAX) <= max_dist {
            for (nc, child) in &self.children {
                child.walk(*nc, base, &row, max_dist, found);
            }
        }
    }
}

fn intersect_sorted(a: &[SchemeId], b: &[SchemeId]) -> Vec<SchemeId> {
    let mut res = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                res.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    res
}

/// Manages concrete and abstract instruction features for one scheme
/// universe.
pub struct InsnFeatureManager {
    ctx: Rc<SchemeContext>,
    decls: Vec<FeatureDecl>,
    /// Per declaration: the value index, absent for `exact_scheme` (which is
    /// resolved directly against the universe).
    indices: Vec<Option<FeatureIndex>>,
    tries: Vec<Option<MnemonicTrie>>,
    /// Extracted concrete values, `[scheme][decl]`.
    extracted: Vec<Vec<Option<FeatureValue>>>,
}

impl InsnFeatureManager {
    pub fn new(ctx: Rc<SchemeContext>, decls: Vec<FeatureDecl>) -> Result<Self, AbstractionError> {
        for decl in &decls {
            if !KNOWN_FEATURES.contains(&decl.name.as_str()) {
                return Err(AbstractionError::UnknownFeature(decl.name.clone()));
            }
        }

        let mut manager = InsnFeatureManager {
            ctx,
            decls,
            indices: Vec::new(),
            tries: Vec::new(),
            extracted: Vec::new(),
        };
        time_info!("building feature indices", {
            manager.build_extracted();
            manager.build_indices();
        });
        Ok(manager)
    }

    pub fn ctx(&self) -> &Rc<SchemeContext> {
        &self.ctx
    }

    pub fn decls(&self) -> &[FeatureDecl] {
        &self.decls
    }

    pub fn decl_index(&self, name: &str) -> Option<usize> {
        self.decls.iter().position(|d| d.name == name)
    }

    fn build_extracted(&mut self) {
        let num_schemes = self.ctx.num_schemes();
        let mut extracted = Vec::with_capacity(num_schemes);
        for id in 0..num_schemes as u32 {
            let row = self
                .decls
                .iter()
                .map(|decl| self.extract_feature(SchemeId(id), &decl.name))
                .collect();
            extracted.push(row);
        }
        self.extracted = extracted;
    }

    fn build_indices(&mut self) {
        let mut indices = Vec::with_capacity(self.decls.len());
        let mut tries = Vec::with_capacity(self.decls.len());
        for (decl_idx, decl) in self.decls.iter().enumerate() {
            if decl.name == "exact_scheme" {
                indices.push(None);
                tries.push(None);
                continue;
            }
            let mut buckets: HashMap<String, Vec<SchemeId>> = HashMap::new();
            for &id in self.ctx.filtered_schemes() {
                let value = match &self.extracted[id.0 as usize][decl_idx] {
                    None => continue,
                    Some(v) => v,
                };
                match (&decl.kind, value) {
                    (FeatureKind::Singleton, FeatureValue::Str(s))
                    | (FeatureKind::EditDistance { .. }, FeatureValue::Str(s)) => {
                        buckets.entry(s.clone()).or_default().push(id);
                    }
                    (FeatureKind::Subset, FeatureValue::Set(set)) => {
                        for elem in set {
                            buckets.entry(elem.clone()).or_default().push(id);
                        }
                    }
                    (FeatureKind::SubsetOrDefinitelyNot, FeatureValue::Set(set)) => {
                        for elem in set {
                            buckets.entry(elem.clone()).or_default().push(id);
                        }
                        let marker = if set.is_empty() { DEFINITELY_NOT } else { DEFINITELY };
                        buckets.entry(marker.to_string()).or_default().push(id);
                    }
                    (kind, value) => {
                        panic!("feature value {:?} does not fit abstraction kind {:?}", value, kind)
                    }
                }
            }
            let trie = if let FeatureKind::EditDistance { .. } = decl.kind {
                let mut trie = MnemonicTrie::default();
                for key in buckets.keys() {
                    trie.insert(key);
                }
                Some(trie)
            } else {
                None
            };
            debug!(
                "feature index for '{}': {} buckets over {} schemes",
                decl.name,
                buckets.len(),
                self.ctx.filtered_schemes().len()
            );
            indices.push(Some(FeatureIndex { buckets }));
            tries.push(trie);
        }
        self.indices = indices;
        self.tries = tries;
    }

    /// Extract the concrete value of a feature from a scheme. `None` means
    /// the scheme does not carry the feature.
    pub fn extract_feature(&self, id: SchemeId, name: &str) -> Option<FeatureValue> {
        let scheme = self.ctx.scheme(id);
        match name {
            "exact_scheme" => Some(FeatureValue::Str(scheme.name.clone())),
            "mnemonic" => Some(FeatureValue::Str(scheme.mnemonic.clone())),
            "opschemes" => Some(FeatureValue::Set(
                scheme.operands.iter().map(|o| o.feature_tag()).collect(),
            )),
            "memory_usage" => {
                let mut usage = std::collections::BTreeSet::new();
                for op in &scheme.operands {
                    if let crate::iwho::OperandKind::Mem { width } = &op.kind {
                        if op.read {
                            usage.insert("R".to_string());
                        }
                        if op.written {
                            usage.insert("W".to_string());
                        }
                        usage.insert(format!("S:{}", width));
                    }
                }
                Some(FeatureValue::Set(usage))
            }
            "category" => scheme.category.clone().map(FeatureValue::Str),
            "extension" => scheme.extension.clone().map(FeatureValue::Str),
            "isa-set" => scheme.isa_set.clone().map(FeatureValue::Str),
            _ => None,
        }
    }

    /// The cached concrete value of feature `decl_idx` for a scheme.
    pub fn extracted(&self, id: SchemeId, decl_idx: usize) -> Option<&FeatureValue> {
        self.extracted[id.0 as usize][decl_idx].as_ref()
    }

    /// γ of a single non-top, non-bottom abstract feature as a sorted scheme
    /// list.
    pub fn lookup(&self, decl_idx: usize, feature: &AbstractFeature) -> Vec<SchemeId> {
        assert!(!feature.is_top() && !feature.is_bottom());
        let index = self.indices[decl_idx]
            .as_ref()
            .expect("lookup on a feature without an index");
        match feature {
            AbstractFeature::Singleton(Singleton::Value(v)) => index.bucket(v).to_vec(),
            AbstractFeature::Subset(Subset { required, .. }) => {
                self.intersect_buckets(index, required)
            }
            AbstractFeature::SubsetOrNot(SubsetOrNot { is_in, subset }) => match is_in {
                TriBool::Value(false) => index.bucket(DEFINITELY_NOT).to_vec(),
                TriBool::Value(true) => {
                    if subset.required.is_empty() {
                        index.bucket(DEFINITELY).to_vec()
                    } else {
                        self.intersect_buckets(index, &subset.required)
                    }
                }
                _ => unreachable!(),
            },
            AbstractFeature::EditDistance(e) => {
                let (base, dist) = match &e.state {
                    super::feature::EditState::Within { base, dist } => (base, *dist),
                    _ => unreachable!(),
                };
                let trie = self.tries[decl_idx].as_ref().expect("edit distance without trie");
                let mut res: Vec<SchemeId> = trie
                    .within_distance(base, dist)
                    .iter()
                    .flat_map(|word| index.bucket(word).iter().copied())
                    .collect();
                res.sort_unstable();
                res.dedup();
                res
            }
            _ => unreachable!(),
        }
    }

    fn intersect_buckets(
        &self,
        index: &FeatureIndex,
        elems: &std::collections::BTreeSet<String>,
    ) -> Vec<SchemeId> {
        let mut res: Option<Vec<SchemeId>> = None;
        for elem in elems {
            let bucket = index.bucket(elem);
            res = Some(match res {
                None => bucket.to_vec(),
                Some(acc) => intersect_sorted(&acc, bucket),
            });
            if res.as_ref().map_or(false, Vec::is_empty) {
                break;
            }
        }
        res.unwrap_or_default()
    }

    /// An upper bound on |γ| of a single feature, used for expansion benefit
    /// estimates without intersecting across features.
    pub fn gamma_size_bound(&self, decl_idx: usize, feature: &AbstractFeature) -> usize {
        if feature.is_bottom() {
            return 0;
        }
        if feature.is_top() {
            return self.ctx.filtered_schemes().len();
        }
        if self.decls[decl_idx].name == "exact_scheme" {
            return 1;
        }
        self.lookup(decl_idx, feature).len()
    }

    /// All filtered schemes represented by an abstract instruction, computed
    /// by progressive intersection in declaration order.
    pub fn compute_feasible_schemes(&self, insn: &AbstractInsn) -> Vec<SchemeId> {
        // the exact scheme pins the result without index lookups
        if let Some(idx) = self.decl_index("exact_scheme") {
            if let AbstractFeature::Singleton(Singleton::Value(name)) = insn.feature(idx) {
                return match self.ctx.find_scheme(name) {
                    Some(id) if self.ctx.filtered_schemes().contains(&id) => vec![id],
                    _ => vec![],
                };
            }
        }

        let mut feasible: Option<Vec<SchemeId>> = None;
        for (decl_idx, decl) in self.decls.iter().enumerate() {
            let feature = insn.feature(decl_idx);
            if feature.is_top() || decl.name == "exact_scheme" {
                continue;
            }
            if feature.is_bottom() {
                return vec![];
            }
            let schemes = self.lookup(decl_idx, feature);
            feasible = Some(match feasible {
                None => schemes,
                Some(acc) => intersect_sorted(&acc, &schemes),
            });
            if feasible.as_ref().map_or(false, Vec::is_empty) {
                return vec![];
            }
        }
        feasible.unwrap_or_else(|| self.ctx.filtered_schemes().to_vec())
    }

    /// Point-check: is the scheme a member of the abstract instruction's
    /// concretization?
    pub fn scheme_matches(&self, insn: &AbstractInsn, id: SchemeId) -> bool {
        self.decls
            .iter()
            .enumerate()
            .all(|(decl_idx, _)| insn.feature(decl_idx).subsumes_value(self.extracted(id, decl_idx)))
    }
}
