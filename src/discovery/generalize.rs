//! Minimization and generalization of interesting blocks.
//!
//! Generalization lifts a concrete seed block into the coarsest abstract
//! block whose samples are still mostly interesting: it repeatedly
//! enumerates the one-step expansions of the current block, tries them in a
//! strategy-dependent order, and accepts the first one whose sample batch
//! keeps the interestingness up.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use strum::EnumString;

use crate::abstraction::{AbstractBlock, Expansion, Sampler, SamplingError};
use crate::iwho::BasicBlock;

use super::witness::WitnessTrace;
use super::{AbstractionContext, DiscoveryError};

pub mod defaults {
    /// Samples drawn around a shortened block during minimization.
    pub const MINIMIZATION_BATCH_SIZE: usize = 8;
}

/// How expansion candidates are ordered while generalizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Shuffle the candidates; the whole generalization is run `attempts`
    /// times from the seed with distinct RNG streams and the coarsest
    /// result wins.
    Random { attempts: u32 },
    /// Try candidates in descending order of estimated benefit.
    MaxBenefit,
    /// Let a callback choose.
    Interactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StrategyKind {
    Random,
    MaxBenefit,
    Interactive,
}

impl Strategy {
    pub fn from_config(kind: StrategyKind, attempts: u32) -> Self {
        match kind {
            StrategyKind::Random => Strategy::Random { attempts: attempts.max(1) },
            StrategyKind::MaxBenefit => Strategy::MaxBenefit,
            StrategyKind::Interactive => Strategy::Interactive,
        }
    }
}

/// Decision of an interactive callback.
pub enum InteractiveChoice {
    /// Index into the presented expansion list.
    Expand(usize),
    /// Keep the current abstract block as the final result.
    TerminateEarly,
}

pub type InteractiveCallback<'a> =
    dyn FnMut(&AbstractionContext, &AbstractBlock, &[(Expansion, u64)]) -> InteractiveChoice + 'a;

/// Sample up to `num` blocks from an abstract block, allowing twice as many
/// attempts. An unsatisfiable block or a mostly-failing batch is an error;
/// callers treat it as infeasibility of the abstract block, distinct from
/// "not interesting".
pub fn sample_batch(
    actx: &AbstractionContext,
    ab: &AbstractBlock,
    num: usize,
    rng: &mut StdRng,
) -> Result<Vec<BasicBlock>, SamplingError> {
    let sampler = ab.precompute_sampler(&actx.fm, &actx.scheme_blacklist)?;
    sample_batch_with(&sampler, num, rng)
}

pub fn sample_batch_with(
    sampler: &Sampler,
    num: usize,
    rng: &mut StdRng,
) -> Result<Vec<BasicBlock>, SamplingError> {
    let mut blocks = Vec::with_capacity(num);
    let mut failed = 0;
    for _ in 0..2 * num {
        if blocks.len() >= num {
            break;
        }
        match sampler.sample(rng) {
            Ok(bb) => blocks.push(bb),
            Err(e @ SamplingError::Unsatisfiable(_)) => return Err(e),
            Err(e) => {
                debug!("a sample failed: {}", e);
                failed += 1;
            }
        }
    }
    if 2 * blocks.len() < num {
        return Err(SamplingError::ResolutionFailed(failed));
    }
    Ok(blocks)
}

/// Evaluate a batch and report whether it is mostly interesting, together
/// with the measurement reference.
fn check_batch(
    actx: &mut AbstractionContext,
    blocks: &[BasicBlock],
) -> Result<(bool, u64), DiscoveryError> {
    let asms: Vec<String> = blocks.iter().map(|bb| bb.asm(&actx.iwho)).collect();
    let batch = actx.predman.evaluate(&actx.predictor_keys, &asms)?;
    let interesting = actx.metric.is_mostly_interesting(&batch.results);
    Ok((interesting, batch.result_ref))
}

/// Greedily remove instructions from an interesting block while its
/// perturbations stay mostly interesting. The result seeds generalization.
pub fn minimize(
    actx: &mut AbstractionContext,
    bb: &BasicBlock,
    rng: &mut StdRng,
) -> Result<BasicBlock, DiscoveryError> {
    let mut current = bb.clone();
    let mut order: Vec<usize> = (0..current.len()).collect();
    order.shuffle(rng);

    while let Some(idx) = order.pop() {
        if current.len() <= 1 {
            break;
        }
        let mut insns = current.insns.clone();
        insns.remove(idx);
        let candidate = BasicBlock::new(insns);

        let lifted = AbstractBlock::from_concrete(&actx.fm, &candidate);
        let blocks = match sample_batch(actx, &lifted, defaults::MINIMIZATION_BATCH_SIZE, rng) {
            Ok(blocks) => blocks,
            Err(e) => {
                debug!("skipping removal of insn {}: {}", idx, e);
                continue;
            }
        };
        let (interesting, _) = check_batch(actx, &blocks)?;
        if interesting {
            current = candidate;
            // remaining indices past the removed one shift down
            for o in order.iter_mut() {
                if *o > idx {
                    *o -= 1;
                }
            }
        }
    }
    Ok(current)
}

/// Generalize `seed` under the given strategy. Returns the coarsest block
/// reached, the witness trace, and the measurement reference of the last
/// accepting batch.
pub fn generalize(
    actx: &mut AbstractionContext,
    seed_block: &AbstractBlock,
    strategy: &Strategy,
    seed: u64,
    mut interact: Option<&mut InteractiveCallback<'_>>,
) -> Result<(AbstractBlock, WitnessTrace, Option<u64>), DiscoveryError> {
    match strategy {
        Strategy::Random { attempts } => {
            let mut results = Vec::with_capacity(*attempts as usize);
            for attempt in 0..*attempts {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(attempt as u64));
                let result =
                    generalize_once(actx, seed_block, Order::Shuffled, &mut rng, None)?;
                results.push(result);
            }
            Ok(pick_coarsest(results))
        }
        Strategy::MaxBenefit => {
            let mut rng = StdRng::seed_from_u64(seed);
            generalize_once(actx, seed_block, Order::ByBenefit, &mut rng, None)
        }
        Strategy::Interactive => {
            let callback = interact
                .take()
                .expect("the interactive strategy needs a callback");
            let mut rng = StdRng::seed_from_u64(seed);
            generalize_once(actx, seed_block, Order::ByBenefit, &mut rng, Some(callback))
        }
    }
}

enum Order {
    Shuffled,
    ByBenefit,
}

fn generalize_once(
    actx: &mut AbstractionContext,
    seed_block: &AbstractBlock,
    order: Order,
    rng: &mut StdRng,
    mut interact: Option<&mut InteractiveCallback<'_>>,
) -> Result<(AbstractBlock, WitnessTrace, Option<u64>), DiscoveryError> {
    let batch_size = actx.discovery_cfg.generalization_batch_size;
    let mut trace = WitnessTrace::new(seed_block.clone());
    let mut current = seed_block.clone();

    info!("generalizing:\n{}", current.display(&actx.fm));

    let blocks = sample_batch(actx, &current, batch_size, rng)
        .map_err(|e| DiscoveryError::SeedSamplingFailed(e.to_string()))?;
    let (interesting, result_ref) = check_batch(actx, &blocks)?;
    let mut last_ref = Some(result_ref);
    if !interesting {
        info!("samples from the seed block are not uniformly interesting");
        trace.add_termination("samples from the seed block are not interesting", Some(result_ref));
        return Ok((current, trace, last_ref));
    }

    let mut rejected: HashSet<Expansion> = HashSet::new();

    'outer: loop {
        let mut expansions: Vec<(Expansion, u64)> = current
            .possible_expansions(&actx.fm)
            .into_iter()
            .filter(|(e, _)| !rejected.contains(e))
            .collect();

        if expansions.is_empty() {
            info!("no more components left for expansion");
            trace.add_termination("no more expansions remain", None);
            break;
        }

        match order {
            Order::Shuffled => expansions.shuffle(rng),
            Order::ByBenefit => expansions.sort_by(|a, b| b.1.cmp(&a.1)),
        }

        if let Some(callback) = interact.as_mut() {
            // interactive mode: the callback picks one candidate at a time
            loop {
                match callback(actx, &current, &expansions) {
                    InteractiveChoice::TerminateEarly => {
                        trace.add_termination("terminated by interaction", None);
                        break 'outer;
                    }
                    InteractiveChoice::Expand(idx) => {
                        let (expansion, benefit) = expansions.remove(idx);
                        match try_expansion(
                            actx, &current, &expansion, benefit, batch_size, rng, &mut trace,
                        )? {
                            Some((next, result_ref)) => {
                                current = next;
                                last_ref = Some(result_ref);
                                continue 'outer;
                            }
                            None => {
                                rejected.insert(expansion);
                                if expansions.is_empty() {
                                    trace.add_termination("no more expansions remain", None);
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut accepted = false;
        for (expansion, benefit) in expansions {
            match try_expansion(actx, &current, &expansion, benefit, batch_size, rng, &mut trace)? {
                Some((next, result_ref)) => {
                    current = next;
                    last_ref = Some(result_ref);
                    accepted = true;
                    break;
                }
                None => {
                    rejected.insert(expansion);
                }
            }
        }
        if !accepted {
            info!("no expansion preserves interestingness");
            trace.add_termination("no acceptable expansion remains", None);
            break;
        }
    }

    info!("generalization done:\n{}", current.display(&actx.fm));
    Ok((current, trace, last_ref))
}

/// Apply one candidate expansion and test it. `Ok(Some(..))` is acceptance;
/// `Ok(None)` covers both infeasible and not-interesting candidates (only
/// the latter is recorded in the trace).
fn try_expansion(
    actx: &mut AbstractionContext,
    current: &AbstractBlock,
    expansion: &Expansion,
    benefit: u64,
    batch_size: usize,
    rng: &mut StdRng,
    trace: &mut WitnessTrace,
) -> Result<Option<(AbstractBlock, u64)>, DiscoveryError> {
    let mut candidate = current.clone();
    candidate.apply_expansion(expansion);

    let blocks = match sample_batch(actx, &candidate, batch_size, rng) {
        Ok(blocks) => blocks,
        Err(e) => {
            // an overconstrained intermediate state, not evidence against
            // the expansion's interestingness
            debug!("expansion {} is infeasible: {}", expansion, e);
            return Ok(None);
        }
    };
    let (interesting, result_ref) = check_batch(actx, &blocks)?;
    if interesting {
        debug!("expansion {} (benefit {}) accepted", expansion, benefit);
        trace.add_taken(expansion.clone(), Some(result_ref));
        Ok(Some((candidate, result_ref)))
    } else {
        debug!("expansion {} (benefit {}) rejected", expansion, benefit);
        trace.add_nontaken(expansion.clone(), Some(result_ref));
        Ok(None)
    }
}

/// Pick the subsumption-maximal result; ties go to the shortest trace, then
/// to the earliest attempt.
fn pick_coarsest(
    results: Vec<(AbstractBlock, WitnessTrace, Option<u64>)>,
) -> (AbstractBlock, WitnessTrace, Option<u64>) {
    assert!(!results.is_empty());
    let mut best: Option<(usize, usize)> = None; // (index, subsumed count)
    for (idx, (block, trace, _)) in results.iter().enumerate() {
        let subsumed = results
            .iter()
            .enumerate()
            .filter(|(other_idx, (other, _, _))| *other_idx != idx && block.subsumes(other))
            .count();
        let better = match best {
            None => true,
            Some((best_idx, best_subsumed)) => {
                let best_trace_len = results[best_idx].1.len();
                subsumed > best_subsumed
                    || (subsumed == best_subsumed && trace.len() < best_trace_len)
            }
        };
        if better {
            best = Some((idx, subsumed));
        }
    }
    let winner = best.unwrap().0;
    results.into_iter().nth(winner).unwrap()
}
