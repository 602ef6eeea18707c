//! Campaign configuration: loading, validation, path resolution, template
//! expansion, and assembling an abstraction context from a config.

use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;

use crate::abstraction::{AbstractionError, FeatureDecl, FeatureKind, InsnFeatureManager};
use crate::discovery::{AbstractionContext, Strategy, StrategyKind, TerminationCriterion};
use crate::interestingness::{InterestingnessConfig, InterestingnessMetric};
use crate::iwho::{IwhoError, SchemeContext, UniverseFilter};
use crate::predictors::{PredictorError, PredictorManager};

/// Predictor-list entry that expands to all predictor pairs.
pub const PAIR_TEMPLATE: &str = "TEMPLATE:all_predictor_pairs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Iwho(#[from] IwhoError),

    #[error(transparent)]
    Abstraction(#[from] AbstractionError),

    #[error(transparent)]
    Predictor(#[from] PredictorError),

    #[error("failed to set up campaign directory: {0}")]
    Io(#[from] std::io::Error),
}

/// The abstraction kind of a feature as written in configs: a plain name or
/// a `[name, arg]` pair.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FeatureKindSpec {
    Name(String),
    Parametrized(String, u32),
}

impl FeatureKindSpec {
    fn to_kind(&self) -> Result<FeatureKind, ConfigError> {
        match self {
            FeatureKindSpec::Name(name) => match name.as_str() {
                "singleton" => Ok(FeatureKind::Singleton),
                "subset" => Ok(FeatureKind::Subset),
                "subset_or_definitely_not" => Ok(FeatureKind::SubsetOrDefinitelyNot),
                other => Err(ConfigError::Invalid(format!(
                    "unknown feature abstraction kind: {}",
                    other
                ))),
            },
            FeatureKindSpec::Parametrized(name, arg) => match name.as_str() {
                "editdistance" => Ok(FeatureKind::EditDistance { max_dist: *arg }),
                other => Err(ConfigError::Invalid(format!(
                    "unknown parametrized feature abstraction kind: {}",
                    other
                ))),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureManagerConfig {
    /// Ordered `[name, kind]` pairs; the order is the index lookup order.
    pub features: Vec<(String, FeatureKindSpec)>,
}

impl Default for FeatureManagerConfig {
    fn default() -> Self {
        let kind = |s: &str| FeatureKindSpec::Name(s.to_string());
        FeatureManagerConfig {
            features: vec![
                ("exact_scheme".to_string(), kind("singleton")),
                (
                    "mnemonic".to_string(),
                    FeatureKindSpec::Parametrized("editdistance".to_string(), 3),
                ),
                ("opschemes".to_string(), kind("subset")),
                ("memory_usage".to_string(), kind("subset_or_definitely_not")),
                ("category".to_string(), kind("singleton")),
                ("extension".to_string(), kind("singleton")),
                ("isa-set".to_string(), kind("singleton")),
            ],
        }
    }
}

impl FeatureManagerConfig {
    pub fn decls(&self) -> Result<Vec<FeatureDecl>, ConfigError> {
        self.features
            .iter()
            .map(|(name, spec)| Ok(FeatureDecl { name: name.clone(), kind: spec.to_kind()? }))
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IwhoConfig {
    /// Names the scheme universe: the path of a scheme database file.
    pub context_specifier: String,
    pub filters: Vec<UniverseFilter>,
}

impl Default for IwhoConfig {
    fn default() -> Self {
        IwhoConfig { context_specifier: "./schemes.json".to_string(), filters: vec![] }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Random blocks sampled per discovery batch.
    pub discovery_batch_size: usize,
    /// Length distribution for sampled blocks; duplicates bias it.
    pub discovery_possible_block_lengths: Vec<usize>,
    /// Samples per expansion check during generalization.
    pub generalization_batch_size: usize,
    /// `[strategy, attempts]` pairs tried per seed block.
    pub generalization_strategy: Vec<(String, u32)>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            discovery_batch_size: 20,
            discovery_possible_block_lengths: vec![1, 2, 3, 4],
            generalization_batch_size: 100,
            generalization_strategy: vec![
                ("max_benefit".to_string(), 1),
                ("random".to_string(), 3),
            ],
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_batch_size == 0 || self.generalization_batch_size == 0 {
            return Err(ConfigError::Invalid("batch sizes must be positive".to_string()));
        }
        if self.discovery_possible_block_lengths.is_empty()
            || self.discovery_possible_block_lengths.contains(&0)
        {
            return Err(ConfigError::Invalid(
                "discovery_possible_block_lengths must list positive lengths".to_string(),
            ));
        }
        for (name, _) in &self.generalization_strategy {
            let kind = StrategyKind::from_str(name).map_err(|_| {
                ConfigError::Invalid(format!("unknown generalization strategy: {}", name))
            })?;
            if kind == StrategyKind::Interactive {
                return Err(ConfigError::Invalid(
                    "the interactive strategy cannot drive a discovery campaign".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The configured strategies; `validate` must have accepted the config.
    pub fn strategies(&self) -> Vec<Strategy> {
        self.generalization_strategy
            .iter()
            .map(|(name, attempts)| {
                let kind = StrategyKind::from_str(name).expect("validated strategy name");
                Strategy::from_config(kind, *attempts)
            })
            .collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    /// Wrap sampled blocks in a simple loop where the predictor supports it.
    pub wrap_in_loop: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig { wrap_in_loop: false }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MeasurementDbConfig {
    pub db_path: PathBuf,
}

impl Default for MeasurementDbConfig {
    fn default() -> Self {
        MeasurementDbConfig { db_path: PathBuf::from("./measurements.db") }
    }
}

fn default_num_processes() -> Option<i64> {
    Some(0)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PredManagerConfig {
    pub registry_path: PathBuf,
    /// `<= 0` uses all cores, absent/null evaluates in-process.
    #[serde(default = "default_num_processes")]
    pub num_processes: Option<i64>,
}

impl Default for PredManagerConfig {
    fn default() -> Self {
        PredManagerConfig {
            registry_path: PathBuf::from("./pred_registry.json"),
            num_processes: default_num_processes(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CampaignConfig {
    pub insn_feature_manager: FeatureManagerConfig,
    pub iwho: IwhoConfig,
    pub interestingness_metric: InterestingnessConfig,
    pub discovery: DiscoveryConfig,
    pub sampling: SamplingConfig,
    pub measurement_db: Option<MeasurementDbConfig>,
    pub predmanager: PredManagerConfig,
    /// Key patterns of the predictors under test, or the pair template.
    pub predictors: Vec<String>,
    pub termination: TerminationCriterion,
}

/// Resolve a configured path: `${BASE_DIR}` expands to the directory of the
/// config file, and paths starting with `.` are taken relative to it.
pub fn resolve_path(raw: &Path, base_dir: &Path) -> PathBuf {
    let raw_str = raw.to_string_lossy();
    if raw_str.contains("${BASE_DIR}") {
        return PathBuf::from(raw_str.replace("${BASE_DIR}", &base_dir.to_string_lossy()));
    }
    if raw_str.starts_with('.') {
        return base_dir.join(raw);
    }
    raw.to_path_buf()
}

impl CampaignConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut config: CampaignConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        config.resolve_paths(&base_dir);
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base_dir: &Path) {
        let spec_path = resolve_path(Path::new(&self.iwho.context_specifier), base_dir);
        self.iwho.context_specifier = spec_path.to_string_lossy().into_owned();
        for filter in &mut self.iwho.filters {
            match filter {
                UniverseFilter::Blacklist { file_path } | UniverseFilter::Whitelist { file_path } => {
                    *file_path = resolve_path(file_path, base_dir);
                }
                _ => {}
            }
        }
        self.predmanager.registry_path = resolve_path(&self.predmanager.registry_path, base_dir);
        if let Some(db) = &mut self.measurement_db {
            db.db_path = resolve_path(&db.db_path, base_dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.discovery.validate()?;
        if self.predictors.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one predictor (or the pair template) must be configured".to_string(),
            ));
        }
        let ratio = self.interestingness_metric.mostly_interesting_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Invalid(
                "mostly_interesting_ratio must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Expand the pair template (or `--split-configs`) into one config per
    /// predictor pair.
    pub fn expand(&self, split_pairs: bool) -> Result<Vec<CampaignConfig>, ConfigError> {
        let is_template = self.predictors.len() == 1 && self.predictors[0] == PAIR_TEMPLATE;
        if !is_template && !split_pairs {
            return Ok(vec![self.clone()]);
        }

        let keys = if is_template {
            let manager =
                PredictorManager::from_registry_file(&self.predmanager.registry_path, None)?;
            manager.keys()
        } else {
            let manager =
                PredictorManager::from_registry_file(&self.predmanager.registry_path, None)?;
            manager.resolve_key_patterns(&self.predictors)?
        };
        if keys.len() < 2 {
            return Err(ConfigError::Invalid(
                "predictor pair expansion needs at least two predictors".to_string(),
            ));
        }
        Ok(keys
            .iter()
            .tuple_combinations()
            .map(|(a, b)| {
                let mut config = self.clone();
                config.predictors = vec![regex::escape(a), regex::escape(b)];
                config
            })
            .collect())
    }

    /// Build the abstraction context this config describes.
    ///
    /// With `restrict_to_supported`, the unsupported-instruction lists of
    /// the predictors under test are added as blacklist filters before the
    /// feature indices are built.
    pub fn build_context(&self, restrict_to_supported: bool) -> Result<AbstractionContext, ConfigError> {
        let mut predman = PredictorManager::from_registry_file(
            &self.predmanager.registry_path,
            self.predmanager.num_processes,
        )?;
        predman.set_wrap_in_loop(self.sampling.wrap_in_loop);
        let predictor_keys = predman.resolve_key_patterns(&self.predictors)?;
        if let Some(db) = &self.measurement_db {
            predman.open_measurement_log(&db.db_path)?;
        }

        let mut ctx = SchemeContext::from_spec_file(Path::new(&self.iwho.context_specifier))?;
        let mut filters = self.iwho.filters.clone();
        if restrict_to_supported {
            for file_path in predman.get_insn_filter_files(&predictor_keys) {
                filters.push(UniverseFilter::Blacklist { file_path });
            }
        }
        ctx.apply_filters(&filters)?;
        let ctx = Rc::new(ctx);

        let fm = InsnFeatureManager::new(ctx.clone(), self.insn_feature_manager.decls()?)?;
        let metric = InterestingnessMetric::new(self.interestingness_metric.clone());

        info!(
            "abstraction context ready: {} schemes, predictors: {}",
            ctx.filtered_schemes().len(),
            predictor_keys.join(", ")
        );
        Ok(AbstractionContext {
            iwho: ctx,
            fm,
            metric,
            predman,
            predictor_keys,
            discovery_cfg: self.discovery.clone(),
            scheme_blacklist: Default::default(),
        })
    }
}

/// Set up `campaign_<idx>_<timestamp>/` under `outdir`: referenced filter
/// lists are copied into `filter_files/` byte-for-byte, and a resolved
/// `campaign_config.json` pointing at the copies is written. Returns the
/// campaign directory and the rewritten config.
pub fn prepare_campaign_dir(
    config: &CampaignConfig,
    outdir: &Path,
    idx: usize,
) -> Result<(PathBuf, CampaignConfig), ConfigError> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let campaign_dir = outdir.join(format!("campaign_{:03}_{}", idx, timestamp));
    let filter_dir = campaign_dir.join("filter_files");
    fs::create_dir_all(&filter_dir)?;

    let mut resolved = config.clone();
    let mut filter_no = 0usize;
    for filter in &mut resolved.iwho.filters {
        let file_path = match filter {
            UniverseFilter::Blacklist { file_path } | UniverseFilter::Whitelist { file_path } => {
                file_path
            }
            _ => continue,
        };
        filter_no += 1;
        let stem = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "filter".to_string());
        let copy_name = format!("filter_{:02}_{}.csv", filter_no, stem);
        fs::copy(&*file_path, filter_dir.join(&copy_name))?;
        *file_path = PathBuf::from(format!("./filter_files/{}", copy_name));
    }

    if let Some(db) = &mut resolved.measurement_db {
        db.db_path = PathBuf::from("./measurements.db");
    }

    fs::write(
        campaign_dir.join("campaign_config.json"),
        serde_json::to_string_pretty(&resolved).unwrap(),
    )?;

    // re-anchor the rewritten relative paths at the campaign directory
    let mut runtime = resolved.clone();
    runtime.resolve_paths(&campaign_dir);
    Ok((campaign_dir, runtime))
}
