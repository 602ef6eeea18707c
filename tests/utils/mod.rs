#![allow(dead_code)]

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anica::abstraction::{FeatureDecl, FeatureKind, InsnFeatureManager};
use anica::config::DiscoveryConfig;
use anica::discovery::AbstractionContext;
use anica::interestingness::{InterestingnessConfig, InterestingnessMetric};
use anica::iwho::{InsnScheme, OperandScheme, SchemeContext};
use anica::predictors::{Predictor, PredictorManager, TablePredictor};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small x86-like scheme universe with enough variety to exercise all
/// feature kinds: several mnemonics, register/memory/immediate forms, and a
/// vector instruction.
pub fn demo_schemes() -> Vec<InsnScheme> {
    let rr = |m: &str| {
        InsnScheme::new(
            m,
            vec![
                OperandScheme::reg("reg0", 64, true, true),
                OperandScheme::reg("reg1", 64, true, false),
            ],
        )
    };
    let ri = |m: &str| {
        InsnScheme::new(
            m,
            vec![
                OperandScheme::reg("reg0", 64, true, true),
                OperandScheme::imm("imm0", 8),
            ],
        )
    };
    let mr = |m: &str| {
        InsnScheme::new(
            m,
            vec![
                OperandScheme::mem("mem0", 64, true, true),
                OperandScheme::reg("reg0", 64, true, false),
            ],
        )
    };
    let rm = |m: &str| {
        InsnScheme::new(
            m,
            vec![
                OperandScheme::reg("reg0", 64, true, true),
                OperandScheme::mem("mem0", 64, true, false),
            ],
        )
    };

    vec![
        rr("add").with_attrs("BINARY", "BASE", "I86"),
        ri("add").with_attrs("BINARY", "BASE", "I86"),
        mr("add").with_attrs("BINARY", "BASE", "I86"),
        rm("add").with_attrs("BINARY", "BASE", "I86"),
        rr("adc").with_attrs("BINARY", "BASE", "I86"),
        mr("adc").with_attrs("BINARY", "BASE", "I86"),
        rr("sub").with_attrs("BINARY", "BASE", "I86"),
        ri("sub").with_attrs("BINARY", "BASE", "I86"),
        rr("imul").with_attrs("BINARY", "BASE", "I86"),
        rr("mov").with_attrs("DATAXFER", "BASE", "I86"),
        mr("mov").with_attrs("DATAXFER", "BASE", "I86"),
        rm("mov").with_attrs("DATAXFER", "BASE", "I86"),
        rr("xor").with_attrs("LOGICAL", "BASE", "I86"),
        InsnScheme::new(
            "vsubpd",
            vec![
                OperandScheme::xmm("reg0", false, true),
                OperandScheme::xmm("reg1", true, false),
                OperandScheme::xmm("reg2", true, false),
            ],
        )
        .with_attrs("VEX", "AVX", "AVX"),
    ]
}

pub fn demo_ctx() -> Rc<SchemeContext> {
    Rc::new(SchemeContext::from_schemes(demo_schemes()).unwrap())
}

pub fn demo_decls() -> Vec<FeatureDecl> {
    vec![
        FeatureDecl { name: "exact_scheme".into(), kind: FeatureKind::Singleton },
        FeatureDecl { name: "mnemonic".into(), kind: FeatureKind::EditDistance { max_dist: 3 } },
        FeatureDecl { name: "opschemes".into(), kind: FeatureKind::Subset },
        FeatureDecl { name: "memory_usage".into(), kind: FeatureKind::SubsetOrDefinitelyNot },
        FeatureDecl { name: "category".into(), kind: FeatureKind::Singleton },
        FeatureDecl { name: "extension".into(), kind: FeatureKind::Singleton },
        FeatureDecl { name: "isa-set".into(), kind: FeatureKind::Singleton },
    ]
}

pub fn demo_fm() -> InsnFeatureManager {
    InsnFeatureManager::new(demo_ctx(), demo_decls()).unwrap()
}

/// A table predictor over the demo universe with uniform cost 1.0 and
/// per-mnemonic overrides.
pub fn table_predictor(overrides: &[(&str, f64)]) -> Arc<dyn Predictor> {
    let mut costs: HashMap<String, f64> = demo_schemes()
        .iter()
        .map(|s| (s.mnemonic.clone(), 1.0))
        .collect();
    for (mnemonic, cost) in overrides {
        costs.insert(mnemonic.to_string(), *cost);
    }
    Arc::new(TablePredictor::new(costs, None))
}

/// An abstraction context over the demo universe with in-process
/// predictors.
pub fn demo_actx(
    predictors: Vec<(&str, Arc<dyn Predictor>)>,
    interestingness: InterestingnessConfig,
    discovery_cfg: DiscoveryConfig,
) -> AbstractionContext {
    let ctx = demo_ctx();
    let fm = InsnFeatureManager::new(ctx.clone(), demo_decls()).unwrap();
    let predictor_keys: Vec<String> = predictors.iter().map(|(k, _)| k.to_string()).collect();
    let predman = PredictorManager::in_process(
        predictors.into_iter().map(|(k, p)| (k.to_string(), p)).collect(),
    );
    AbstractionContext {
        iwho: ctx,
        fm,
        metric: InterestingnessMetric::new(interestingness),
        predman,
        predictor_keys,
        discovery_cfg,
        scheme_blacklist: Default::default(),
    }
}

/// A discovery configuration scaled down for fast tests.
pub fn small_discovery_cfg() -> DiscoveryConfig {
    DiscoveryConfig {
        discovery_batch_size: 10,
        discovery_possible_block_lengths: vec![1, 2, 3],
        generalization_batch_size: 10,
        generalization_strategy: vec![("max_benefit".to_string(), 1)],
    }
}
