//! Witness traces: the record of a generalization run.
//!
//! A trace starts from the seed abstract block and lists every expansion
//! that was tried, whether it was taken, and the measurement reference of
//! the batch that decided it. Replaying the taken expansions reproduces the
//! final abstract block.

use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::Graph;
use serde_json::{json, Value as Json};
use std::fs;
use std::path::Path;

use crate::abstraction::{AbstractBlock, AbstractionError, Expansion, InsnFeatureManager};

#[derive(Clone, Debug)]
pub struct Witness {
    pub expansion: Option<Expansion>,
    pub taken: bool,
    pub terminate: bool,
    pub comment: Option<String>,
    /// Measurement reference of the deciding batch evaluation.
    pub measurements: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct WitnessTrace {
    pub start: AbstractBlock,
    pub trace: Vec<Witness>,
}

impl WitnessTrace {
    pub fn new(start: AbstractBlock) -> Self {
        WitnessTrace { start, trace: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    pub fn add_taken(&mut self, expansion: Expansion, measurements: Option<u64>) {
        self.trace.push(Witness {
            expansion: Some(expansion),
            taken: true,
            terminate: false,
            comment: None,
            measurements,
        });
    }

    pub fn add_nontaken(&mut self, expansion: Expansion, measurements: Option<u64>) {
        self.trace.push(Witness {
            expansion: Some(expansion),
            taken: false,
            terminate: false,
            comment: None,
            measurements,
        });
    }

    pub fn add_termination(&mut self, comment: &str, measurements: Option<u64>) {
        self.trace.push(Witness {
            expansion: None,
            taken: false,
            terminate: true,
            comment: Some(comment.to_string()),
            measurements,
        });
    }

    /// Reconstruct the final abstract block from the taken expansions.
    pub fn replay(&self) -> AbstractBlock {
        let mut block = self.start.clone();
        for witness in &self.trace {
            if witness.terminate {
                break;
            }
            if witness.taken {
                let expansion = witness.expansion.as_ref().expect("taken entries carry expansions");
                block.apply_expansion(expansion);
            }
        }
        block
    }

    pub fn to_json(&self, fm: &InsnFeatureManager) -> Json {
        let trace: Vec<Json> = self
            .trace
            .iter()
            .map(|w| {
                json!({
                    "expansion": w.expansion.as_ref().map(|e| e.to_json(fm)),
                    "taken": w.taken,
                    "terminate": w.terminate,
                    "comment": w.comment,
                    "measurements": w.measurements,
                })
            })
            .collect();
        json!({
            "start": self.start.to_json(fm),
            "trace": trace,
        })
    }

    pub fn from_json(fm: &InsnFeatureManager, json: &Json) -> Result<Self, AbstractionError> {
        let malformed = || AbstractionError::Malformed(format!("witness trace: {}", json));
        let obj = json.as_object().ok_or_else(malformed)?;
        let start = AbstractBlock::from_json(fm, obj.get("start").ok_or_else(malformed)?)?;
        let mut res = WitnessTrace::new(start);
        for entry in obj.get("trace").and_then(Json::as_array).ok_or_else(malformed)? {
            let expansion = match entry.get("expansion") {
                None | Some(Json::Null) => None,
                Some(e) => Some(Expansion::from_json(fm, e)?),
            };
            res.trace.push(Witness {
                expansion,
                taken: entry.get("taken").and_then(Json::as_bool).ok_or_else(malformed)?,
                terminate: entry.get("terminate").and_then(Json::as_bool).ok_or_else(malformed)?,
                comment: entry
                    .get("comment")
                    .and_then(Json::as_str)
                    .map(str::to_string),
                measurements: entry.get("measurements").and_then(Json::as_u64),
            });
        }
        Ok(res)
    }

    pub fn dump_json(&self, fm: &InsnFeatureManager, path: &Path) -> std::io::Result<()> {
        fs::write(path, serde_json::to_string_pretty(&self.to_json(fm)).unwrap())
    }

    /// Render the trace as a graphviz dot graph: taken expansions form the
    /// spine, rejected ones branch off.
    pub fn to_dot(&self, fm: &InsnFeatureManager) -> String {
        let mut graph: Graph<String, &str> = Graph::new();
        let mut current = self.start.clone();
        let mut parent = graph.add_node(format!("start\n{}", current.display(fm)));

        for witness in &self.trace {
            if witness.terminate {
                let node = graph.add_node(format!(
                    "terminated: {}",
                    witness.comment.as_deref().unwrap_or("")
                ));
                graph.add_edge(parent, node, "");
                continue;
            }
            let expansion = witness.expansion.as_ref().expect("non-terminal entries carry expansions");
            if witness.taken {
                current.apply_expansion(expansion);
                let node = graph.add_node(format!("interesting\n{}", current.display(fm)));
                graph.add_edge(parent, node, "taken");
                parent = node;
            } else {
                let mut rejected = current.clone();
                rejected.apply_expansion(expansion);
                let node = graph.add_node(format!("not interesting\n{}", rejected.display(fm)));
                graph.add_edge(parent, node, "rejected");
            }
        }

        format!("{:?}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstraction::{FeatureDecl, FeatureKind, InsnFeatureManager};
    use crate::iwho::parse::parse_block;
    use crate::iwho::{InsnScheme, OperandScheme, SchemeContext};
    use std::rc::Rc;

    fn fm() -> InsnFeatureManager {
        let ctx = Rc::new(
            SchemeContext::from_schemes(vec![
                InsnScheme::new(
                    "add",
                    vec![
                        OperandScheme::reg("reg0", 64, true, true),
                        OperandScheme::reg("reg1", 64, true, false),
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
            .unwrap(),
        );
        InsnFeatureManager::new(
            ctx,
            vec![
                FeatureDecl { name: "exact_scheme".into(), kind: FeatureKind::Singleton },
                FeatureDecl {
                    name: "mnemonic".into(),
                    kind: FeatureKind::EditDistance { max_dist: 3 },
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn replay_reproduces_the_final_block() {
        let fm = fm();
        let bb = parse_block(fm.ctx(), "add rax, rbx\nsub rcx, rax").unwrap();
        let start = AbstractBlock::from_concrete(&fm, &bb);
        let mut trace = WitnessTrace::new(start.clone());

        let mut current = start;
        for round in 0..3 {
            let expansions = current.possible_expansions(&fm);
            let (expansion, _) = expansions.into_iter().next().unwrap();
            if round == 1 {
                trace.add_nontaken(expansion, Some(round));
                continue;
            }
            current.apply_expansion(&expansion);
            trace.add_taken(expansion, Some(round));
        }
        trace.add_termination("no more expansions remain", None);

        assert_eq!(trace.replay(), current);
    }

    #[test]
    fn serialization_round_trip() {
        let fm = fm();
        let bb = parse_block(fm.ctx(), "add rax, rbx").unwrap();
        let start = AbstractBlock::from_concrete(&fm, &bb);
        let mut trace = WitnessTrace::new(start.clone());
        let mut current = start;
        let (expansion, _) = current.possible_expansions(&fm).into_iter().next().unwrap();
        current.apply_expansion(&expansion);
        trace.add_taken(expansion, Some(0));
        trace.add_termination("stop requested", Some(1));

        let json = trace.to_json(&fm);
        let parsed = WitnessTrace::from_json(&fm, &json).unwrap();
        assert_eq!(parsed.to_json(&fm), json);
        assert_eq!(parsed.replay(), current);
    }
}
