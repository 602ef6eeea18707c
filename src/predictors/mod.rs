//! Throughput predictors and the manager that evaluates blocks under them.
//!
//! Predictors are black boxes: they map the assembly text of a basic block
//! to a cycles-per-iteration estimate or a failure. The manager owns the
//! configured predictor instances, fans batch evaluations out over a thread
//! pool, enforces per-call timeouts for external tools, and appends every
//! batch to the measurement log under a monotonically increasing result
//! reference.

use log::{debug, warn};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod defaults {
    /// Wall-clock bound for one external predictor invocation.
    pub const TIMEOUT_SECS: f64 = 20.0;
}

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("unknown predictor key: {0}")]
    UnknownPredictor(String),

    #[error("invalid predictor key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("no registered predictor matches pattern '{0}'")]
    UnmatchedPattern(String),

    #[error("failed to load predictor registry from {path}: {reason}")]
    Registry { path: PathBuf, reason: String },

    #[error("failed to append to the measurement log: {0}")]
    MeasurementLog(String),
}

/// The outcome of evaluating one block under one predictor. A missing or
/// non-positive `TP` is a failure value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PredictorOutcome {
    #[serde(rename = "TP")]
    pub tp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictorOutcome {
    pub fn value(tp: f64) -> Self {
        PredictorOutcome { tp: Some(tp), error: None }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        PredictorOutcome { tp: None, error: Some(reason.into()) }
    }

    pub fn is_failure(&self) -> bool {
        self.tp.map_or(true, |v| !v.is_finite() || v <= 0.0)
    }
}

pub trait Predictor: Send + Sync {
    fn evaluate(&self, asm: &str) -> PredictorOutcome;

    /// Whether the tool can handle a block wrapped in a measurement loop.
    fn supports_loop_wrapping(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictorBackend {
    /// An external tool fed an assembly file, reporting a number on stdout
    /// (the last float token is taken).
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        supports_loop_wrap: bool,
    },
    /// In-process predictor summing per-mnemonic cycle costs. Used by tests
    /// and as a fast smoke backend for `check-predictors`.
    Table {
        costs: HashMap<String, f64>,
        #[serde(default)]
        default_cost: Option<f64>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub backend: PredictorBackend,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// CSV of instruction schemes the predictor does not support.
    #[serde(default)]
    pub filter_file: Option<PathBuf>,
}

struct CommandPredictor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    supports_loop_wrap: bool,
}

impl CommandPredictor {
    fn run(&self, asm: &str) -> Result<String, String> {
        let mut file = tempfile::Builder::new()
            .suffix(".s")
            .tempfile()
            .map_err(|e| format!("failed to create temporary file: {}", e))?;
        file.write_all(asm.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| format!("failed to write assembly: {}", e))?;
        let asm_path = file.path().to_string_lossy().to_string();

        let mut substituted = false;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.contains("{asm_file}") {
                    substituted = true;
                    a.replace("{asm_file}", &asm_path)
                } else {
                    a.clone()
                }
            })
            .collect();

        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        if !substituted {
            cmd.arg(&asm_path);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| format!("failed to spawn {}: {}", self.program, e))?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut out = String::new();
                    if let Some(stdout) = child.stdout.as_mut() {
                        let _ = stdout.read_to_string(&mut out);
                    }
                    if !status.success() {
                        return Err(format!("{} exited with {}", self.program, status));
                    }
                    return Ok(out);
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(format!("timeout after {:?}", self.timeout));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(format!("failed to wait for {}: {}", self.program, e)),
            }
        }
    }
}

impl Predictor for CommandPredictor {
    fn evaluate(&self, asm: &str) -> PredictorOutcome {
        let output = match self.run(asm) {
            Ok(out) => out,
            Err(reason) => return PredictorOutcome::failure(reason),
        };
        let parsed = output
            .split_whitespace()
            .rev()
            .find_map(|tok| tok.parse::<f64>().ok());
        match parsed {
            Some(tp) => PredictorOutcome::value(tp),
            None => PredictorOutcome::failure("no throughput value in tool output"),
        }
    }

    fn supports_loop_wrapping(&self) -> bool {
        self.supports_loop_wrap
    }
}

/// Sums configured per-mnemonic costs over the block.
pub struct TablePredictor {
    costs: HashMap<String, f64>,
    default_cost: Option<f64>,
}

impl TablePredictor {
    pub fn new(costs: HashMap<String, f64>, default_cost: Option<f64>) -> Self {
        TablePredictor { costs, default_cost }
    }
}

impl Predictor for TablePredictor {
    fn evaluate(&self, asm: &str) -> PredictorOutcome {
        let mut total = 0.0;
        for line in asm.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mnemonic = line.split_whitespace().next().unwrap();
            match self.costs.get(mnemonic).copied().or(self.default_cost) {
                Some(cost) => total += cost,
                None => {
                    return PredictorOutcome::failure(format!("unsupported mnemonic: {}", mnemonic))
                }
            }
        }
        if total <= 0.0 {
            return PredictorOutcome::failure("empty block");
        }
        PredictorOutcome::value(total)
    }
}

fn instantiate(entry: &RegistryEntry) -> Arc<dyn Predictor> {
    match &entry.backend {
        PredictorBackend::Command { program, args, supports_loop_wrap } => {
            Arc::new(CommandPredictor {
                program: program.clone(),
                args: args.clone(),
                timeout: Duration::from_secs_f64(
                    entry.timeout_secs.unwrap_or(defaults::TIMEOUT_SECS),
                ),
                supports_loop_wrap: *supports_loop_wrap,
            })
        }
        PredictorBackend::Table { costs, default_cost } => {
            Arc::new(TablePredictor::new(costs.clone(), *default_cost))
        }
    }
}

/// Positionally aligned results of one batch evaluation.
#[derive(Clone, Debug)]
pub struct BatchResult {
    pub result_ref: u64,
    /// One entry per input block, mapping predictor key to its outcome.
    pub results: Vec<BTreeMap<String, PredictorOutcome>>,
}

struct MeasurementLog {
    file: fs::File,
}

impl MeasurementLog {
    fn append(
        &mut self,
        result_ref: u64,
        asms: &[String],
        results: &[BTreeMap<String, PredictorOutcome>],
    ) -> Result<(), PredictorError> {
        let line = serde_json::json!({
            "result_ref": result_ref,
            "bbs": asms,
            "results": results,
        });
        writeln!(self.file, "{}", line).map_err(|e| PredictorError::MeasurementLog(e.to_string()))
    }
}

/// Owns the predictors under test and runs batch evaluations.
pub struct PredictorManager {
    entries: BTreeMap<String, RegistryEntry>,
    predictors: BTreeMap<String, Arc<dyn Predictor>>,
    pool: Option<rayon::ThreadPool>,
    wrap_in_loop: bool,
    next_result_ref: u64,
    log: Option<MeasurementLog>,
}

impl PredictorManager {
    /// Load a registry file. `num_processes` follows the configuration
    /// semantics: `None` evaluates in-process, a value ≤ 0 uses all cores.
    pub fn from_registry_file(
        path: &Path,
        num_processes: Option<i64>,
    ) -> Result<Self, PredictorError> {
        let content = fs::read_to_string(path).map_err(|e| PredictorError::Registry {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let entries: BTreeMap<String, RegistryEntry> =
            serde_json::from_str(&content).map_err(|e| PredictorError::Registry {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let predictors = entries
            .iter()
            .map(|(key, entry)| (key.clone(), instantiate(entry)))
            .collect();
        Ok(PredictorManager {
            entries,
            predictors,
            pool: build_pool(num_processes),
            wrap_in_loop: false,
            next_result_ref: 0,
            log: None,
        })
    }

    /// Build a manager from in-process predictor instances. Mainly for
    /// tests and embedders.
    pub fn in_process(predictors: Vec<(String, Arc<dyn Predictor>)>) -> Self {
        let predictors: BTreeMap<_, _> = predictors.into_iter().collect();
        PredictorManager {
            entries: BTreeMap::new(),
            predictors,
            pool: None,
            wrap_in_loop: false,
            next_result_ref: 0,
            log: None,
        }
    }

    pub fn set_wrap_in_loop(&mut self, wrap: bool) {
        self.wrap_in_loop = wrap;
    }

    pub fn open_measurement_log(&mut self, path: &Path) -> Result<(), PredictorError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PredictorError::MeasurementLog(e.to_string()))?;
        self.log = Some(MeasurementLog { file });
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.predictors.keys().cloned().collect()
    }

    /// Expand regex patterns to the sorted set of matching registry keys.
    /// Patterns are anchored; a pattern matching nothing is an error.
    pub fn resolve_key_patterns(&self, patterns: &[String]) -> Result<Vec<String>, PredictorError> {
        let mut keys = Vec::new();
        for pattern in patterns {
            let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                PredictorError::InvalidPattern { pattern: pattern.clone(), reason: e.to_string() }
            })?;
            let matched: Vec<_> = self
                .predictors
                .keys()
                .filter(|k| re.is_match(k))
                .cloned()
                .collect();
            if matched.is_empty() {
                return Err(PredictorError::UnmatchedPattern(pattern.clone()));
            }
            keys.extend(matched);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// The configured unsupported-instruction lists for the given keys.
    pub fn get_insn_filter_files(&self, keys: &[String]) -> Vec<PathBuf> {
        keys.iter()
            .filter_map(|k| self.entries.get(k).and_then(|e| e.filter_file.clone()))
            .collect()
    }

    pub fn filter_file_of(&self, key: &str) -> Option<&PathBuf> {
        self.entries.get(key).and_then(|e| e.filter_file.as_ref())
    }

    /// Evaluate all blocks under all given predictors. The result list is
    /// positionally aligned to the input; failures are recorded as failure
    /// values, never as errors.
    pub fn evaluate(
        &mut self,
        keys: &[String],
        asms: &[String],
    ) -> Result<BatchResult, PredictorError> {
        let mut preds = Vec::with_capacity(keys.len());
        for key in keys {
            let pred = self
                .predictors
                .get(key)
                .ok_or_else(|| PredictorError::UnknownPredictor(key.clone()))?;
            preds.push((key.clone(), pred.clone()));
        }

        let wrap = self.wrap_in_loop;
        let tasks: Vec<(usize, &str, &Arc<dyn Predictor>)> = (0..asms.len())
            .flat_map(|bb_idx| {
                preds
                    .iter()
                    .map(move |(key, pred)| (bb_idx, key.as_str(), pred))
            })
            .collect();

        let run_one = |(bb_idx, key, pred): &(usize, &str, &Arc<dyn Predictor>)| {
            let asm = &asms[*bb_idx];
            let input = if wrap && pred.supports_loop_wrapping() {
                format!("loop_head:\n{}\ndec r15\njnz loop_head", asm)
            } else {
                asm.clone()
            };
            (*bb_idx, key.to_string(), pred.evaluate(&input))
        };

        let outcomes: Vec<(usize, String, PredictorOutcome)> = match &self.pool {
            Some(pool) => pool.install(|| tasks.par_iter().map(run_one).collect()),
            None => tasks.iter().map(run_one).collect(),
        };

        let mut results: Vec<BTreeMap<String, PredictorOutcome>> =
            vec![BTreeMap::new(); asms.len()];
        for (bb_idx, key, outcome) in outcomes {
            if let Some(err) = &outcome.error {
                debug!("predictor {} failed on block {}: {}", key, bb_idx, err);
            }
            results[bb_idx].insert(key, outcome);
        }

        let result_ref = self.next_result_ref;
        self.next_result_ref += 1;

        if let Some(log) = &mut self.log {
            if let Err(e) = log.append(result_ref, asms, &results) {
                warn!("dropping measurement log entry: {}", e);
            }
        }

        Ok(BatchResult { result_ref, results })
    }
}

fn build_pool(num_processes: Option<i64>) -> Option<rayon::ThreadPool> {
    let num = num_processes?;
    let mut builder = rayon::ThreadPoolBuilder::new();
    if num > 0 {
        builder = builder.num_threads(num as usize);
    }
    Some(builder.build().expect("failed to build predictor thread pool"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(costs: &[(&str, f64)]) -> Arc<dyn Predictor> {
        Arc::new(TablePredictor::new(
            costs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            None,
        ))
    }

    #[test]
    fn evaluation_is_positionally_aligned() {
        let mut manager = PredictorManager::in_process(vec![
            ("a.0".to_string(), table(&[("add", 1.0), ("sub", 1.0)])),
            ("b.0".to_string(), table(&[("add", 2.0)])),
        ]);
        let keys = manager.keys();
        let asms = vec!["add rax, rbx".to_string(), "sub rax, rbx".to_string()];
        let batch = manager.evaluate(&keys, &asms).unwrap();

        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[0]["a.0"], PredictorOutcome::value(1.0));
        assert_eq!(batch.results[0]["b.0"], PredictorOutcome::value(2.0));
        assert_eq!(batch.results[1]["a.0"], PredictorOutcome::value(1.0));
        assert!(batch.results[1]["b.0"].is_failure());
    }

    #[test]
    fn result_refs_increase() {
        let mut manager =
            PredictorManager::in_process(vec![("a.0".to_string(), table(&[("add", 1.0)]))]);
        let keys = manager.keys();
        let asms = vec!["add rax, rbx".to_string()];
        let r1 = manager.evaluate(&keys, &asms).unwrap().result_ref;
        let r2 = manager.evaluate(&keys, &asms).unwrap().result_ref;
        assert!(r2 > r1);
    }

    #[test]
    fn patterns_resolve_anchored() {
        let manager = PredictorManager::in_process(vec![
            ("uica.0".to_string(), table(&[])),
            ("uica.1".to_string(), table(&[])),
            ("ithemal.0".to_string(), table(&[])),
        ]);
        let keys = manager.resolve_key_patterns(&["uica\\..*".to_string()]).unwrap();
        assert_eq!(keys, vec!["uica.0".to_string(), "uica.1".to_string()]);
        assert!(manager.resolve_key_patterns(&["uica".to_string()]).is_err());
    }
}
