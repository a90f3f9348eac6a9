//! Hyper-parameter grids and grid search under a quantification metric.
//!
//! The optimizer walks a fixed grid: Idle, then every configuration is
//! evaluated in parallel (each on a deep copy of the base quantifier), then
//! the minimal-score configuration is selected, optionally refit on
//! training plus protocol data, and exposed as the final model. Per-trial
//! timeouts are worker-level deadlines: a timed-out trial is recorded and
//! excluded without touching any other worker.

use std::fmt;
use std::str::FromStr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::aggregative::{Quantifier, CLASSIFIER_PARAM_PREFIX};
use crate::config::ExecutionContext;
use crate::data::LabelledCollection;
use crate::error::{Error, Result};
use crate::evaluation::{evaluate, ErrorMetric};
use crate::protocol::SamplingProtocol;

/// A hyper-parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl ParamValue {
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v as f64),
            _ => Err(Error::InvalidConfig(format!("expected a number, got {}", self))),
        }
    }

    pub fn as_usize(&self) -> Result<usize> {
        match self {
            ParamValue::Int(v) if *v >= 0 => Ok(*v as usize),
            _ => Err(Error::InvalidConfig(format!(
                "expected a non-negative integer, got {}",
                self
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ParamValue::Bool(v) => Ok(*v),
            _ => Err(Error::InvalidConfig(format!("expected a boolean, got {}", self))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            ParamValue::Str(v) => Ok(v),
            _ => Err(Error::InvalidConfig(format!("expected a string, got {}", self))),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for ParamValue {
    type Err = Error;

    /// Parses the narrowest matching type: int, float, bool, then string.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(v) = s.parse::<i64>() {
            return Ok(ParamValue::Int(v));
        }
        if let Ok(v) = s.parse::<f64>() {
            return Ok(ParamValue::Float(v));
        }
        if let Ok(v) = s.parse::<bool>() {
            return Ok(ParamValue::Bool(v));
        }
        Ok(ParamValue::Str(s.to_string()))
    }
}

/// One point of the grid: parameter names with their chosen values.
pub type ParamConfig = Vec<(String, ParamValue)>;

/// Render a configuration for logs and score tables.
pub fn format_config(config: &ParamConfig) -> String {
    if config.is_empty() {
        return "{default}".to_string();
    }
    let parts: Vec<String> = config
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

/// Candidate values per parameter name; the grid is their Cartesian product.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamGrid {
    entries: Vec<(String, Vec<ParamValue>)>,
}

impl ParamGrid {
    pub fn new() -> Self {
        ParamGrid::default()
    }

    pub fn add(mut self, name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        self.entries.push((name.into(), values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All configurations of the grid. The empty grid expands to the single
    /// empty configuration (the base quantifier's defaults).
    pub fn expand(&self) -> Vec<ParamConfig> {
        let mut configs: Vec<ParamConfig> = vec![Vec::new()];
        for (name, values) in &self.entries {
            let mut next = Vec::with_capacity(configs.len() * values.len());
            for config in &configs {
                for value in values {
                    let mut extended = config.clone();
                    extended.push((name.clone(), value.clone()));
                    next.push(extended);
                }
            }
            configs = next;
        }
        configs
    }

    /// Partition into classifier-affecting and aggregation-affecting
    /// sub-grids, so callers can avoid redundant classifier refits.
    pub fn split_classifier_params(&self) -> (ParamGrid, ParamGrid) {
        let mut classifier = ParamGrid::new();
        let mut aggregation = ParamGrid::new();
        for (name, values) in &self.entries {
            if name.starts_with(CLASSIFIER_PARAM_PREFIX) {
                classifier.entries.push((name.clone(), values.clone()));
            } else {
                aggregation.entries.push((name.clone(), values.clone()));
            }
        }
        (classifier, aggregation)
    }
}

/// What happened to one grid configuration.
#[derive(Debug, Clone)]
pub enum TrialOutcome {
    Score(f64),
    TimedOut,
    Failed(String),
}

impl TrialOutcome {
    pub fn score(&self) -> Option<f64> {
        match self {
            TrialOutcome::Score(s) => Some(*s),
            _ => None,
        }
    }
}

struct BestTrial {
    config: ParamConfig,
    score: f64,
    model: Box<dyn Quantifier>,
}

/// Grid-search optimizer for a quantifier under a sampling protocol and a
/// quantification error metric.
pub struct GridSearch {
    base: Box<dyn Quantifier>,
    grid: ParamGrid,
    protocol: Arc<dyn SamplingProtocol>,
    metric: ErrorMetric,
    refit: bool,
    timeout: Option<Duration>,
    ctx: ExecutionContext,
    best: Option<BestTrial>,
    trials: Vec<(ParamConfig, TrialOutcome)>,
}

impl GridSearch {
    pub fn new(
        base: Box<dyn Quantifier>,
        grid: ParamGrid,
        protocol: Box<dyn SamplingProtocol>,
        metric: ErrorMetric,
    ) -> Self {
        GridSearch {
            base,
            grid,
            protocol: Arc::from(protocol),
            metric,
            refit: false,
            timeout: None,
            ctx: ExecutionContext::default(),
            best: None,
            trials: Vec::new(),
        }
    }

    /// Refit the winning configuration on training plus protocol data,
    /// when the protocol exposes its underlying collection.
    pub fn with_refit(mut self, refit: bool) -> Self {
        self.refit = refit;
        self
    }

    /// Wall-clock budget per configuration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Evaluate every configuration, select the best, optionally refit.
    pub fn fit(&mut self, training: &LabelledCollection) -> Result<()> {
        let configs = self.grid.expand();
        let training = Arc::new(training.clone());
        let started = Instant::now();

        let mut results: Vec<(TrialOutcome, Option<Box<dyn Quantifier>>)> =
            self.ctx.map_indexed(configs.clone(), |index, config| {
                let model = self.base.clone();
                let worker = self.ctx.worker(index);
                let training = Arc::clone(&training);
                let protocol = Arc::clone(&self.protocol);
                match self.timeout {
                    None => run_trial(model, config, training, protocol, self.metric, worker),
                    Some(limit) => {
                        run_trial_with_deadline(model, config, training, protocol, self.metric, worker, limit)
                    }
                }
            });

        self.trials = configs
            .iter()
            .cloned()
            .zip(results.iter().map(|(outcome, _)| outcome.clone()))
            .collect();

        let mut selected: Option<(usize, f64)> = None;
        for (index, (outcome, _)) in results.iter().enumerate() {
            if let TrialOutcome::Score(score) = outcome {
                if selected.map_or(true, |(_, best)| *score < best) {
                    selected = Some((index, *score));
                }
            }
        }
        let (index, score) = selected.ok_or(Error::SelectionExhausted)?;
        let model = results[index].1.take().ok_or_else(|| {
            Error::InvalidConfig("scored configuration lost its fitted model".into())
        })?;
        let mut best = BestTrial {
            config: configs[index].clone(),
            score,
            model,
        };
        log::debug!(
            "optimization finished: best params {} (score={:.5}) [took {:.4}s]",
            format_config(&best.config),
            best.score,
            started.elapsed().as_secs_f64()
        );

        if self.refit {
            if let Some(extra) = self.protocol.labelled_collection() {
                log::debug!("refitting the best configuration on the whole development set");
                let combined = training.concat(extra)?;
                best.model.fit(&combined, &self.ctx)?;
            } else {
                log::warn!(
                    "refit was requested but the protocol does not expose its labelled data; skipping"
                );
            }
        }

        self.best = Some(best);
        Ok(())
    }

    /// Estimate with the best model found by [`GridSearch::fit`].
    pub fn quantify(&self, instances: &ndarray::Array2<f64>) -> Result<Array1<f64>> {
        self.best_model()
            .ok_or_else(|| Error::InvalidConfig("quantify called before fit".into()))?
            .quantify(instances)
    }

    pub fn best_params(&self) -> Option<&ParamConfig> {
        self.best.as_ref().map(|b| &b.config)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.score)
    }

    pub fn best_model(&self) -> Option<&dyn Quantifier> {
        self.best.as_ref().map(|b| b.model.as_ref())
    }

    /// Every configuration with its outcome; timed-out and failed entries
    /// stay distinct from scored ones.
    pub fn param_scores(&self) -> &[(ParamConfig, TrialOutcome)] {
        &self.trials
    }
}

fn run_trial(
    mut model: Box<dyn Quantifier>,
    config: ParamConfig,
    training: Arc<LabelledCollection>,
    protocol: Arc<dyn SamplingProtocol>,
    metric: ErrorMetric,
    ctx: ExecutionContext,
) -> (TrialOutcome, Option<Box<dyn Quantifier>>) {
    for (name, value) in &config {
        if let Err(err) = model.set_param(name, value) {
            return (TrialOutcome::Failed(err.to_string()), None);
        }
    }
    let started = Instant::now();
    if let Err(err) = model.fit(&training, &ctx) {
        log::debug!("configuration {} failed to fit: {}", format_config(&config), err);
        return (TrialOutcome::Failed(err.to_string()), None);
    }
    match evaluate(model.as_ref(), protocol.as_ref(), metric) {
        Ok(score) => {
            log::debug!(
                "hyperparams {} got score {:.5} [took {:.4}s]",
                format_config(&config),
                score,
                started.elapsed().as_secs_f64()
            );
            (TrialOutcome::Score(score), Some(model))
        }
        Err(err) => (TrialOutcome::Failed(err.to_string()), None),
    }
}

/// Run the trial on its own thread and give up on it at the deadline. The
/// abandoned worker finishes in the background; its result is discarded and
/// no other trial is affected.
fn run_trial_with_deadline(
    model: Box<dyn Quantifier>,
    config: ParamConfig,
    training: Arc<LabelledCollection>,
    protocol: Arc<dyn SamplingProtocol>,
    metric: ErrorMetric,
    ctx: ExecutionContext,
    limit: Duration,
) -> (TrialOutcome, Option<Box<dyn Quantifier>>) {
    let (tx, rx) = mpsc::channel();
    let thread_config = config.clone();
    let spawned = thread::Builder::new()
        .name("grid-trial".into())
        .spawn(move || {
            let outcome = run_trial(model, thread_config, training, protocol, metric, ctx);
            let _ = tx.send(outcome);
        });
    match spawned {
        Err(err) => (
            TrialOutcome::Failed(format!("could not spawn trial worker: {}", err)),
            None,
        ),
        Ok(_join_handle) => match rx.recv_timeout(limit) {
            Ok(outcome) => outcome,
            Err(_) => {
                log::warn!(
                    "configuration {} exceeded its {:.1}s budget and was excluded from selection",
                    format_config(&config),
                    limit.as_secs_f64()
                );
                (TrialOutcome::TimedOut, None)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_grid_expands_to_the_default_configuration() {
        let configs = ParamGrid::new().expand();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].is_empty());
    }

    #[test]
    fn expansion_is_the_cartesian_product() {
        let grid = ParamGrid::new()
            .add("a", vec![ParamValue::Int(1), ParamValue::Int(2)])
            .add("b", vec![ParamValue::Bool(true), ParamValue::Bool(false)])
            .add("c", vec![ParamValue::Str("x".into())]);
        let configs = grid.expand();
        assert_eq!(configs.len(), 4);
        for config in &configs {
            assert_eq!(config.len(), 3);
            assert_eq!(config[0].0, "a");
            assert_eq!(config[2].0, "c");
        }
    }

    #[test]
    fn classifier_params_split_off_by_prefix() {
        let grid = ParamGrid::new()
            .add("classifier__temperature", vec![ParamValue::Float(1.0)])
            .add("n_bins", vec![ParamValue::Int(8), ParamValue::Int(16)]);
        let (classifier, aggregation) = grid.split_classifier_params();
        assert_eq!(classifier.expand().len(), 1);
        assert_eq!(aggregation.expand().len(), 2);
        assert!(classifier.expand()[0][0].0.starts_with("classifier__"));
    }

    #[test]
    fn param_value_parses_narrowest_type() {
        assert_eq!("3".parse::<ParamValue>().unwrap(), ParamValue::Int(3));
        assert_eq!("0.5".parse::<ParamValue>().unwrap(), ParamValue::Float(0.5));
        assert_eq!("true".parse::<ParamValue>().unwrap(), ParamValue::Bool(true));
        assert_eq!(
            "topsoe".parse::<ParamValue>().unwrap(),
            ParamValue::Str("topsoe".into())
        );
    }

    #[test]
    fn format_config_is_stable_and_readable() {
        let config: ParamConfig = vec![
            ("n_bins".into(), ParamValue::Int(8)),
            ("divergence".into(), ParamValue::Str("HD".into())),
        ];
        assert_eq!(format_config(&config), "{n_bins=8, divergence=HD}");
        assert_eq!(format_config(&Vec::new()), "{default}");
    }

    #[test]
    fn accessor_type_mismatches_are_errors() {
        assert!(ParamValue::Str("x".into()).as_f64().is_err());
        assert!(ParamValue::Int(-1).as_usize().is_err());
        assert!(ParamValue::Float(0.5).as_bool().is_err());
        assert_eq!(ParamValue::Int(3).as_f64().unwrap(), 3.0);
    }
}
