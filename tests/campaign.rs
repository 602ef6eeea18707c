//! Campaign plumbing: config loading, filter-file round trips, and a
//! config-file-driven discovery run against registry predictors.

mod utils;

use std::fs;
use std::path::PathBuf;

use anica::config::{prepare_campaign_dir, CampaignConfig, MeasurementDbConfig};
use anica::discovery::{discover, load_discovery_block, new_stop_token, TerminationCriterion};
use anica::iwho::UniverseFilter;

use utils::{demo_schemes, init};

/// Write a scheme database, a predictor registry with two disagreeing table
/// predictors, and a campaign config into `dir`.
fn write_campaign_inputs(dir: &std::path::Path) -> PathBuf {
    let schemes = demo_schemes();
    fs::write(
        dir.join("schemes.json"),
        serde_json::to_string_pretty(&schemes).unwrap(),
    )
    .unwrap();

    let mut alpha_costs = serde_json::Map::new();
    let mut beta_costs = serde_json::Map::new();
    for scheme in &schemes {
        alpha_costs.insert(scheme.mnemonic.clone(), serde_json::json!(1.0));
        let cost = if scheme.mnemonic == "imul" { 5.0 } else { 1.0 };
        beta_costs.insert(scheme.mnemonic.clone(), serde_json::json!(cost));
    }
    let registry = serde_json::json!({
        "alpha.0": { "kind": "table", "costs": alpha_costs },
        "beta.0": { "kind": "table", "costs": beta_costs },
    });
    fs::write(
        dir.join("pred_registry.json"),
        serde_json::to_string_pretty(&registry).unwrap(),
    )
    .unwrap();

    let config = serde_json::json!({
        "iwho": { "context_specifier": "./schemes.json", "filters": [{ "kind": "no_cf" }] },
        "predmanager": { "registry_path": "./pred_registry.json", "num_processes": null },
        "predictors": ["alpha\\.0", "beta\\.0"],
        "discovery": {
            "discovery_batch_size": 40,
            "discovery_possible_block_lengths": [1, 2],
            "generalization_batch_size": 10,
            "generalization_strategy": [["max_benefit", 1]]
        },
        "termination": { "num_batches": 10, "num_discoveries": 1 }
    });
    let config_path = dir.join("campaign.json");
    fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    config_path
}

#[test]
fn config_driven_discovery_run() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_campaign_inputs(dir.path());

    let config = CampaignConfig::load(&config_path).unwrap();
    config.validate().unwrap();
    let mut actx = config.build_context(true).unwrap();
    assert_eq!(actx.predictor_keys, vec!["alpha.0".to_string(), "beta.0".to_string()]);

    let campaign_dir = dir.path().join("out");
    let (discoveries, _) = discover(
        &mut actx,
        &config.termination,
        4711,
        Some(&campaign_dir),
        &new_stop_token(),
    )
    .unwrap();
    assert!(!discoveries.is_empty());

    // persisted discoveries parse back and subsume what was found
    for discovery in &discoveries {
        let path = campaign_dir
            .join("discoveries")
            .join(format!("discovery_{}.json", discovery.id));
        let loaded = load_discovery_block(&actx.fm, &path).unwrap();
        assert!(loaded.subsumes(&discovery.block) && discovery.block.subsumes(&loaded));

        let witness = campaign_dir
            .join("witnesses")
            .join(format!("witness_{}.json", discovery.id));
        assert!(witness.exists());
    }
    assert!(campaign_dir.join("report.json").exists());
}

#[test]
fn filter_files_round_trip_through_campaign_dirs() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_campaign_inputs(dir.path());

    let filter_content = "imul R64, R64\nvsubpd X128, X128, X128\n";
    fs::write(dir.path().join("bl.csv"), filter_content).unwrap();

    let mut config = CampaignConfig::load(&config_path).unwrap();
    config
        .iwho
        .filters
        .push(UniverseFilter::Blacklist { file_path: dir.path().join("./bl.csv") });
    config.measurement_db = Some(MeasurementDbConfig::default());

    let outdir = dir.path().join("out");
    let (campaign_dir, runtime_config) = prepare_campaign_dir(&config, &outdir, 0).unwrap();

    // the copy must be byte-identical to the input
    let copied = campaign_dir.join("filter_files").join("filter_01_bl.csv");
    assert_eq!(fs::read(&copied).unwrap(), filter_content.as_bytes());

    // the resolved config points into the campaign directory
    let stored: CampaignConfig = serde_json::from_str(
        &fs::read_to_string(campaign_dir.join("campaign_config.json")).unwrap(),
    )
    .unwrap();
    let stored_filter = stored
        .iwho
        .filters
        .iter()
        .find_map(|f| match f {
            UniverseFilter::Blacklist { file_path } => Some(file_path.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(stored_filter, PathBuf::from("./filter_files/filter_01_bl.csv"));

    // the runtime config resolves to the copied file and builds a context
    // without the blacklisted schemes
    let actx = runtime_config.build_context(true).unwrap();
    assert!(actx.iwho.find_scheme("imul R64, R64").is_some());
    assert!(!actx
        .iwho
        .filtered_schemes()
        .contains(&actx.iwho.find_scheme("imul R64, R64").unwrap()));
}

#[test]
fn check_config_surface_rejects_broken_configs() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_campaign_inputs(dir.path());

    // unknown top-level keys are config errors
    let mut raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
    raw["surprise"] = serde_json::json!(1);
    fs::write(dir.path().join("broken.json"), raw.to_string()).unwrap();
    assert!(CampaignConfig::load(&dir.path().join("broken.json")).is_err());

    // a predictor pattern matching nothing fails at context build time
    let mut config = CampaignConfig::load(&config_path).unwrap();
    config.predictors = vec!["gamma\\..*".to_string()];
    assert!(config.build_context(true).is_err());
}

#[test]
fn pair_template_expands_to_all_pairs() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_campaign_inputs(dir.path());

    let mut config = CampaignConfig::load(&config_path).unwrap();
    config.predictors = vec![anica::config::PAIR_TEMPLATE.to_string()];
    let expanded = config.expand(false).unwrap();
    assert_eq!(expanded.len(), 1); // C(2, 2)
    assert_eq!(expanded[0].predictors, vec!["alpha\\.0", "beta\\.0"]);

    let termination_unchanged = expanded
        .iter()
        .all(|c| c.termination == TerminationCriterion {
            num_batches: Some(10),
            num_discoveries: Some(1),
            ..Default::default()
        });
    assert!(termination_unchanged);
}
