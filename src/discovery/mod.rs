//! The discovery loop: sample, filter, minimize, generalize, accumulate.

pub mod generalize;
pub mod witness;

pub use generalize::{
    minimize, sample_batch, InteractiveCallback, InteractiveChoice, Strategy, StrategyKind,
};
pub use witness::{Witness, WitnessTrace};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::abstraction::{AbstractBlock, InsnFeatureManager, SamplingError};
use crate::config::DiscoveryConfig;
use crate::interestingness::InterestingnessMetric;
use crate::iwho::{BasicBlock, SchemeContext, SchemeId};
use crate::predictors::{PredictorError, PredictorManager};
use crate::util::ratio;

use generalize::sample_batch_with;

/// Cooperative cancellation flag, observed at batch boundaries.
pub type StopToken = Arc<AtomicBool>;

pub fn new_stop_token() -> StopToken {
    Arc::new(AtomicBool::new(false))
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to sample from a seed abstract block: {0}")]
    SeedSamplingFailed(String),

    #[error("no satisfiable block of length {0} in the filtered universe")]
    UnsatisfiableTop(usize),

    #[error(transparent)]
    Predictor(#[from] PredictorError),

    #[error("failed to persist campaign data: {0}")]
    Persist(#[from] std::io::Error),
}

/// Everything a discovery campaign needs, bundled. Owned by one campaign
/// run; the feature indices inside are shared by reference with samplers.
pub struct AbstractionContext {
    pub iwho: Rc<SchemeContext>,
    pub fm: InsnFeatureManager,
    pub metric: InterestingnessMetric,
    pub predman: PredictorManager,
    /// Resolved keys of the predictors under test.
    pub predictor_keys: Vec<String>,
    pub discovery_cfg: DiscoveryConfig,
    /// Schemes covered by single-instruction discoveries with top aliasing;
    /// excluded from top-of-lattice sampling to avoid redrawing known
    /// patterns.
    pub scheme_blacklist: HashSet<SchemeId>,
}

/// When to end a campaign. All bounds are optional and combined; the first
/// one satisfied after a completed batch ends the campaign.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerminationCriterion {
    pub days: Option<u64>,
    pub hours: Option<u64>,
    pub minutes: Option<u64>,
    pub seconds: Option<u64>,
    pub num_batches: Option<usize>,
    pub num_discoveries: Option<usize>,
    /// Consecutive batches without a new discovery.
    pub same_num_discoveries: Option<usize>,
}

impl TerminationCriterion {
    pub fn max_duration(&self) -> Option<Duration> {
        if self.days.is_none()
            && self.hours.is_none()
            && self.minutes.is_none()
            && self.seconds.is_none()
        {
            return None;
        }
        let secs = self.days.unwrap_or(0) * 24 * 3600
            + self.hours.unwrap_or(0) * 3600
            + self.minutes.unwrap_or(0) * 60
            + self.seconds.unwrap_or(0);
        Some(Duration::from_secs(secs))
    }
}

/// One accepted generalization result.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub id: String,
    pub block: AbstractBlock,
    pub trace: WitnessTrace,
    pub result_ref: Option<u64>,
    pub remarks: Vec<String>,
}

/// The set of accepted discoveries, indexed by block length for the
/// subsumption checks of the discovery loop.
#[derive(Default)]
pub struct DiscoverySet {
    entries: Vec<Discovery>,
    by_len: HashMap<usize, Vec<usize>>,
}

impl DiscoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Discovery> {
        self.entries.iter()
    }

    pub fn insert(&mut self, discovery: Discovery) {
        let idx = self.entries.len();
        self.by_len
            .entry(discovery.block.len())
            .or_default()
            .push(idx);
        self.entries.push(discovery);
    }

    /// Concrete-in-abstract check against every discovery of equal length.
    pub fn subsumed_by_any(&self, fm: &InsnFeatureManager, bb: &BasicBlock) -> bool {
        self.by_len
            .get(&bb.len())
            .map_or(false, |idxs| {
                idxs.iter()
                    .any(|&i| self.entries[i].block.contains_concrete(fm, bb))
            })
    }

    /// Abstract-in-abstract check: is `ab` subsumed by an existing entry?
    pub fn subsumes_abstract(&self, ab: &AbstractBlock) -> bool {
        self.by_len
            .get(&ab.len())
            .map_or(false, |idxs| idxs.iter().any(|&i| self.entries[i].block.subsumes(ab)))
    }

    pub fn into_entries(self) -> Vec<Discovery> {
        self.entries
    }
}

#[derive(Serialize, Default, Clone)]
struct BatchStats {
    num_sampled: usize,
    num_interesting: usize,
    num_interesting_subsumed: usize,
    num_new_discoveries: usize,
    batch_seconds: f64,
}

#[derive(Serialize)]
struct Report {
    host: Option<String>,
    seed: u64,
    num_batches: usize,
    num_total_sampled: usize,
    num_discoveries: usize,
    seconds_passed: f64,
    per_batch_stats: Vec<BatchStats>,
}

impl Report {
    fn write(&self, out_dir: Option<&Path>) {
        let dir = match out_dir {
            None => return,
            Some(d) => d,
        };
        let path = dir.join("report.json");
        if path.exists() {
            let _ = fs::copy(&path, dir.join("report.bak.json"));
        }
        if let Err(e) = fs::write(&path, serde_json::to_string_pretty(self).unwrap()) {
            warn!("failed to write report: {}", e);
        }
    }
}

/// Why the campaign ended. Purely informational; any outcome except an
/// error is a normal end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CampaignEnd {
    BatchBound,
    DiscoveryBound,
    TimeBound,
    Stagnation,
    Stopped,
    SamplesExhausted,
}

/// Run one discovery campaign to its termination criterion.
///
/// If `out_dir` is given, discoveries, witnesses, and a running report are
/// persisted there. A set stop token ends the campaign at the next batch
/// boundary with the partial results flushed.
pub fn discover(
    actx: &mut AbstractionContext,
    termination: &TerminationCriterion,
    seed: u64,
    out_dir: Option<&Path>,
    stop: &StopToken,
) -> Result<(Vec<Discovery>, CampaignEnd), DiscoveryError> {
    let (witness_dir, discovery_dir) = match out_dir {
        Some(dir) => {
            let witness_dir = dir.join("witnesses");
            let discovery_dir = dir.join("discoveries");
            fs::create_dir_all(&witness_dir)?;
            fs::create_dir_all(&discovery_dir)?;
            (Some(witness_dir), Some(discovery_dir))
        }
        None => (None, None),
    };

    let batch_size = actx.discovery_cfg.discovery_batch_size;
    let lengths = actx.discovery_cfg.discovery_possible_block_lengths.clone();
    let strategies = actx.discovery_cfg.strategies();
    let max_duration = termination.max_duration();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut set = DiscoverySet::new();
    let start_time = Instant::now();
    let mut report = Report {
        host: std::env::var("HOSTNAME").ok(),
        seed,
        num_batches: 0,
        num_total_sampled: 0,
        num_discoveries: 0,
        seconds_passed: 0.0,
        per_batch_stats: Vec::new(),
    };
    let mut stagnant_batches = 0usize;
    let mut gen_idx = 0u64;

    info!("starting discovery loop");
    let end = loop {
        report.seconds_passed = start_time.elapsed().as_secs_f64();
        report.write(out_dir);

        if stop.load(Ordering::Relaxed) {
            info!("terminating discovery loop: stop requested");
            break CampaignEnd::Stopped;
        }
        if termination.num_batches.map_or(false, |max| report.num_batches >= max) {
            info!("terminating discovery loop: batch bound reached");
            break CampaignEnd::BatchBound;
        }
        if termination.num_discoveries.map_or(false, |max| set.len() >= max) {
            info!("terminating discovery loop: discovery bound reached");
            break CampaignEnd::DiscoveryBound;
        }
        if termination
            .same_num_discoveries
            .map_or(false, |max| stagnant_batches >= max)
        {
            info!("terminating discovery loop: discoveries stagnated");
            break CampaignEnd::Stagnation;
        }
        if max_duration.map_or(false, |max| start_time.elapsed() >= max) {
            info!("terminating discovery loop: time budget exceeded");
            break CampaignEnd::TimeBound;
        }

        let batch_idx = report.num_batches;
        info!("starting batch no. {}", batch_idx);
        let batch_start = Instant::now();
        let mut stats = BatchStats::default();
        let discoveries_before = set.len();

        // sample a batch of random blocks from the top of the lattice
        let length = *lengths.choose(&mut rng).expect("block length list is empty");
        let top = AbstractBlock::make_top(&actx.fm, length);
        let sampler = match top.precompute_sampler(&actx.fm, &actx.scheme_blacklist) {
            Ok(sampler) => sampler,
            Err(SamplingError::Unsatisfiable(_)) => {
                return Err(DiscoveryError::UnsatisfiableTop(length))
            }
            Err(e) => return Err(DiscoveryError::SeedSamplingFailed(e.to_string())),
        };
        let blocks = match sample_batch_with(&sampler, batch_size, &mut rng) {
            Ok(blocks) => blocks,
            Err(_) => Vec::new(),
        };
        if blocks.is_empty() {
            info!("terminating discovery loop: failed to sample any concrete blocks");
            break CampaignEnd::SamplesExhausted;
        }
        stats.num_sampled = blocks.len();
        report.num_total_sampled += blocks.len();

        // evaluate and split into interesting and boring blocks
        let asms: Vec<String> = blocks.iter().map(|bb| bb.asm(&actx.iwho)).collect();
        let batch = time_info!("evaluating discovery batch", {
            actx.predman.evaluate(&actx.predictor_keys, &asms)?
        });
        let interesting = actx.metric.filter_interesting(&batch.results);
        stats.num_interesting = interesting.len();
        info!(
            "{} out of {} blocks ({:.2}%) are interesting",
            interesting.len(),
            blocks.len(),
            100.0 * ratio(interesting.len(), blocks.len())
        );

        for bb_idx in interesting {
            let bb = &blocks[bb_idx];
            if set.subsumed_by_any(&actx.fm, bb) {
                debug!("an existing discovery subsumes the block");
                stats.num_interesting_subsumed += 1;
                continue;
            }

            let min_bb = minimize(actx, bb, &mut rng)?;
            let seed_ab = AbstractBlock::from_concrete(&actx.fm, &min_bb);

            for strategy in &strategies {
                let gen_seed = seed.wrapping_add(gen_idx.wrapping_mul(0x9e37_79b9));
                let id = format!("b{:03}_i{:03}_g{:03}", batch_idx, bb_idx, gen_idx);
                gen_idx += 1;

                let (block, trace, result_ref) =
                    time_info!(format!("generalization {}", id), {
                        generalize::generalize(actx, &seed_ab, strategy, gen_seed, None)?
                    });

                if set.subsumes_abstract(&block) {
                    info!("generalized to a block subsumed by an existing discovery");
                    continue;
                }

                info!("adding new discovery {}:\n{}", id, block.display(&actx.fm));
                let discovery = Discovery {
                    id,
                    block,
                    trace,
                    result_ref,
                    remarks: vec![format!(
                        "generalization strategy: {}",
                        <&'static str>::from(strategy_kind(strategy))
                    )],
                };
                accept_discovery(
                    actx,
                    &mut set,
                    discovery,
                    witness_dir.as_deref(),
                    discovery_dir.as_deref(),
                );
                stats.num_new_discoveries += 1;
            }
        }

        if set.len() == discoveries_before {
            stagnant_batches += 1;
        } else {
            stagnant_batches = 0;
        }
        report.num_discoveries = set.len();
        report.num_batches += 1;
        stats.batch_seconds = batch_start.elapsed().as_secs_f64();
        report.per_batch_stats.push(stats);
        info!("done with batch no. {}", batch_idx);
    };

    report.seconds_passed = start_time.elapsed().as_secs_f64();
    report.write(out_dir);
    Ok((set.into_entries(), end))
}

fn strategy_kind(strategy: &Strategy) -> StrategyKind {
    match strategy {
        Strategy::Random { .. } => StrategyKind::Random,
        Strategy::MaxBenefit => StrategyKind::MaxBenefit,
        Strategy::Interactive => StrategyKind::Interactive,
    }
}

fn accept_discovery(
    actx: &mut AbstractionContext,
    set: &mut DiscoverySet,
    discovery: Discovery,
    witness_dir: Option<&Path>,
    discovery_dir: Option<&Path>,
) {
    // a one-instruction discovery with unconstrained aliasing covers every
    // block containing one of its schemes
    if discovery.block.len() == 1 && discovery.block.aliasing.is_top() {
        let schemes = actx.fm.compute_feasible_schemes(&discovery.block.insns[0]);
        actx.scheme_blacklist.extend(schemes);
        info!(
            "updated scheme blacklist: now {} entries",
            actx.scheme_blacklist.len()
        );
    }

    if let Some(dir) = witness_dir {
        let path = dir.join(format!("witness_{}.json", discovery.id));
        if let Err(e) = discovery.trace.dump_json(&actx.fm, &path) {
            warn!("failed to write witness {}: {}", path.display(), e);
        }
    }
    if let Some(dir) = discovery_dir {
        let path = dir.join(format!("discovery_{}.json", discovery.id));
        let json = discovery_to_json(actx, &discovery);
        if let Err(e) = fs::write(&path, serde_json::to_string_pretty(&json).unwrap()) {
            warn!("failed to write discovery {}: {}", path.display(), e);
        }
    }

    set.insert(discovery);
}

pub fn discovery_to_json(actx: &AbstractionContext, discovery: &Discovery) -> serde_json::Value {
    serde_json::json!({
        "id": discovery.id,
        "ab": discovery.block.to_json(&actx.fm),
        "result_ref": discovery.result_ref,
        "remarks": discovery.remarks,
        "predictors": actx.predictor_keys,
    })
}

/// Load the abstract blocks of previously persisted discoveries, e.g. to
/// seed the subsumption set of a follow-up campaign.
pub fn load_discovery_block(
    fm: &InsnFeatureManager,
    path: &Path,
) -> Result<AbstractBlock, crate::abstraction::AbstractionError> {
    let text = fs::read_to_string(path).map_err(|e| {
        crate::abstraction::AbstractionError::Malformed(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))
    })?;
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        crate::abstraction::AbstractionError::Malformed(format!(
            "cannot parse {}: {}",
            path.display(),
            e
        ))
    })?;
    AbstractBlock::from_json(fm, json.get("ab").unwrap_or(&json))
}
