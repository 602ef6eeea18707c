//! End-to-end discovery and generalization scenarios with in-process
//! predictors.

mod utils;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use anica::abstraction::{AbstractBlock, Sampler};
use anica::discovery::generalize::{generalize, sample_batch_with};
use anica::discovery::{
    discover, minimize, new_stop_token, CampaignEnd, Discovery, DiscoverySet, Strategy,
    TerminationCriterion, WitnessTrace,
};
use anica::interestingness::InterestingnessConfig;
use anica::iwho::parse::parse_block;
use anica::predictors::{Predictor, PredictorOutcome};

use utils::{demo_actx, init, small_discovery_cfg, table_predictor};

/// Predictors that disagree exactly on blocks containing `imul`.
fn disagreeing_predictors() -> Vec<(&'static str, Arc<dyn Predictor>)> {
    vec![
        ("alpha.0", table_predictor(&[])),
        ("beta.0", table_predictor(&[("imul", 5.0)])),
    ]
}

#[test]
fn discovery_finds_and_generalizes_disagreements() {
    init();
    let mut cfg = small_discovery_cfg();
    cfg.discovery_batch_size = 40;
    let mut actx = demo_actx(
        disagreeing_predictors(),
        InterestingnessConfig::default(),
        cfg,
    );

    let termination = TerminationCriterion {
        num_batches: Some(10),
        num_discoveries: Some(1),
        ..Default::default()
    };
    let (discoveries, _end) =
        discover(&mut actx, &termination, 12345, None, &new_stop_token()).unwrap();

    assert!(!discoveries.is_empty(), "the predictors disagree, something must be found");

    // every discovery explains the disagreement: all its samples stay
    // interesting
    for discovery in &discoveries {
        let sampler = Sampler::new(&actx.fm, &discovery.block, &HashSet::new()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let blocks = sample_batch_with(&sampler, 20, &mut rng).unwrap();
        let asms: Vec<String> = blocks.iter().map(|bb| bb.asm(&actx.iwho)).collect();
        let keys = actx.predictor_keys.clone();
        let batch = actx.predman.evaluate(&keys, &asms).unwrap();
        assert!(
            actx.metric.is_mostly_interesting(&batch.results),
            "discovery {} does not explain a disagreement",
            discovery.id
        );
    }
}

#[test]
fn minimization_prunes_boring_instructions() {
    init();
    let mut actx = demo_actx(
        disagreeing_predictors(),
        InterestingnessConfig::default(),
        small_discovery_cfg(),
    );
    let bb = parse_block(&actx.iwho, "imul rax, rbx\nmov rcx, rdx\nxor r8, r9").unwrap();

    let mut rng = StdRng::seed_from_u64(3);
    let minimized = minimize(&mut actx, &bb, &mut rng).unwrap();
    assert_eq!(minimized.len(), 1);
    assert_eq!(actx.iwho.scheme(minimized.insns[0].scheme).mnemonic, "imul");
}

#[test]
fn generalization_coarsens_while_staying_interesting() {
    init();
    let mut actx = demo_actx(
        disagreeing_predictors(),
        InterestingnessConfig::default(),
        small_discovery_cfg(),
    );
    let bb = parse_block(&actx.iwho, "imul rax, rbx").unwrap();
    let seed_ab = AbstractBlock::from_concrete(&actx.fm, &bb);

    let (block, trace, result_ref) =
        generalize(&mut actx, &seed_ab, &Strategy::MaxBenefit, 7, None).unwrap();

    assert!(block.subsumes(&seed_ab));
    assert!(!seed_ab.subsumes(&block), "generalization must make progress here");
    assert!(result_ref.is_some());
    assert_eq!(trace.replay(), block);
}

#[test]
fn random_strategy_is_reproducible() {
    init();
    let run = || {
        let mut actx = demo_actx(
            disagreeing_predictors(),
            InterestingnessConfig::default(),
            small_discovery_cfg(),
        );
        let bb = parse_block(&actx.iwho, "imul rax, rbx").unwrap();
        let seed_ab = AbstractBlock::from_concrete(&actx.fm, &bb);
        let (block, _, _) =
            generalize(&mut actx, &seed_ab, &Strategy::Random { attempts: 2 }, 11, None).unwrap();
        block.to_json(&actx.fm).to_string()
    };
    assert_eq!(run(), run());
}

#[test]
fn discovery_set_is_idempotent_under_subsumption() {
    init();
    let mut actx = demo_actx(
        disagreeing_predictors(),
        InterestingnessConfig::default(),
        small_discovery_cfg(),
    );
    let bb = parse_block(&actx.iwho, "imul rax, rbx").unwrap();
    let seed_ab = AbstractBlock::from_concrete(&actx.fm, &bb);
    let (block, _, _) = generalize(&mut actx, &seed_ab, &Strategy::MaxBenefit, 7, None).unwrap();

    let mut set = DiscoverySet::new();
    set.insert(Discovery {
        id: "d0".to_string(),
        block: block.clone(),
        trace: WitnessTrace::new(seed_ab.clone()),
        result_ref: None,
        remarks: vec![],
    });

    // the same (and any finer) candidate is subsumed, so the loop skips it
    assert!(set.subsumes_abstract(&block));
    assert!(set.subsumes_abstract(&seed_ab));
    assert!(set.subsumed_by_any(&actx.fm, &bb));
    assert_eq!(set.len(), 1);
}

#[test]
fn inverted_interestingness_finds_nothing_among_equal_predictors() {
    init();
    // identical predictors agree everywhere; with a zero threshold every
    // block is "normally" interesting, so the inverted search never accepts
    let predictors: Vec<(&str, Arc<dyn Predictor>)> = vec![
        ("alpha.0", table_predictor(&[])),
        ("alpha.1", table_predictor(&[])),
    ];
    let interestingness = InterestingnessConfig {
        min_interestingness: 0.0,
        invert_interestingness: true,
        ..Default::default()
    };
    let mut actx = demo_actx(predictors, interestingness, small_discovery_cfg());

    let termination = TerminationCriterion {
        same_num_discoveries: Some(1),
        num_batches: Some(20),
        ..Default::default()
    };
    let (discoveries, end) =
        discover(&mut actx, &termination, 99, None, &new_stop_token()).unwrap();
    assert!(discoveries.is_empty());
    assert_eq!(end, CampaignEnd::Stagnation);
}

struct SleepyPredictor {
    inner: Arc<dyn Predictor>,
    delay: Duration,
}

impl Predictor for SleepyPredictor {
    fn evaluate(&self, asm: &str) -> PredictorOutcome {
        std::thread::sleep(self.delay);
        self.inner.evaluate(asm)
    }
}

#[test]
fn termination_by_time_ends_after_one_batch() {
    init();
    let slow: Arc<dyn Predictor> = Arc::new(SleepyPredictor {
        inner: table_predictor(&[]),
        delay: Duration::from_millis(120),
    });
    let mut cfg = small_discovery_cfg();
    cfg.discovery_batch_size = 10;
    cfg.discovery_possible_block_lengths = vec![1];
    // a single predictor never disagrees with itself, so batches only cost
    // evaluation time
    let mut actx = demo_actx(
        vec![("solo.0", slow)],
        InterestingnessConfig::default(),
        cfg,
    );

    let termination = TerminationCriterion {
        seconds: Some(1),
        num_batches: Some(50),
        ..Default::default()
    };
    let out_dir = tempfile::tempdir().unwrap();
    let (discoveries, end) = discover(
        &mut actx,
        &termination,
        5,
        Some(out_dir.path()),
        &new_stop_token(),
    )
    .unwrap();

    assert!(discoveries.is_empty());
    assert_eq!(end, CampaignEnd::TimeBound);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out_dir.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(report["num_batches"], serde_json::json!(1));
}

#[test]
fn stop_token_ends_campaign_at_batch_boundary() {
    init();
    let mut actx = demo_actx(
        disagreeing_predictors(),
        InterestingnessConfig::default(),
        small_discovery_cfg(),
    );
    let stop = new_stop_token();
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let termination = TerminationCriterion { num_batches: Some(50), ..Default::default() };
    let (discoveries, end) = discover(&mut actx, &termination, 1, None, &stop).unwrap();
    assert!(discoveries.is_empty());
    assert_eq!(end, CampaignEnd::Stopped);
}

#[test]
fn repeated_campaigns_rediscover_nothing_new() {
    init();
    let run = || {
        let mut cfg = small_discovery_cfg();
        cfg.discovery_batch_size = 40;
        let mut actx = demo_actx(
            disagreeing_predictors(),
            InterestingnessConfig::default(),
            cfg,
        );
        let termination = TerminationCriterion {
            num_batches: Some(10),
            num_discoveries: Some(1),
            ..Default::default()
        };
        discover(&mut actx, &termination, 2024, None, &new_stop_token())
            .unwrap()
            .0
    };

    let first = run();
    let second = run();
    assert!(!first.is_empty());

    let mut set = DiscoverySet::new();
    for discovery in first {
        set.insert(discovery);
    }
    for discovery in &second {
        assert!(
            set.subsumes_abstract(&discovery.block),
            "a repeated campaign must not find anything new"
        );
    }
}
