//! Integration tests for grid search, trial outcomes and config types.

use std::time::Duration;

use ndarray::{Array1, Array2};

use preval_quantifiers::aggregative::{Quantifier, PACC};
use preval_quantifiers::classifier::CentroidClassifier;
use preval_quantifiers::config::{Backend, ExecutionContext};
use preval_quantifiers::data::LabelledCollection;
use preval_quantifiers::error::Error;
use preval_quantifiers::evaluation::{evaluate, ErrorMetric};
use preval_quantifiers::model_selection::{
    format_config, GridSearch, ParamGrid, ParamValue, TrialOutcome,
};
use preval_quantifiers::protocol::{ArtificialPrevalenceProtocol, SamplingProtocol};

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn toy_binary(n_per_class: usize) -> LabelledCollection {
    let total = n_per_class * 2;
    let mut rows = Vec::with_capacity(total * 2);
    let mut labels = Vec::with_capacity(total);
    for i in 0..total {
        let label = usize::from(i % 2 == 0);
        rows.push(label as f64 * 4.0 + (i as f64 % 7.0) * 0.1);
        rows.push(label as f64 * 4.0);
        labels.push(label);
    }
    let x = Array2::from_shape_vec((total, 2), rows).unwrap();
    LabelledCollection::new(x, labels, 2).unwrap()
}

/// A stub quantifier with a controllable constant estimate and an optional
/// artificial fit delay, so trial outcomes can be forced deterministically.
#[derive(Clone)]
struct StubQuantifier {
    positive: f64,
    fit_delay: Duration,
}

impl StubQuantifier {
    fn new() -> Self {
        StubQuantifier {
            positive: 0.0,
            fit_delay: Duration::ZERO,
        }
    }
}

impl Quantifier for StubQuantifier {
    fn fit(
        &mut self,
        _data: &LabelledCollection,
        _ctx: &ExecutionContext,
    ) -> preval_quantifiers::Result<()> {
        if !self.fit_delay.is_zero() {
            std::thread::sleep(self.fit_delay);
        }
        Ok(())
    }

    fn quantify(&self, _instances: &Array2<f64>) -> preval_quantifiers::Result<Array1<f64>> {
        Ok(Array1::from_vec(vec![1.0 - self.positive, self.positive]))
    }

    fn set_param(
        &mut self,
        name: &str,
        value: &ParamValue,
    ) -> preval_quantifiers::Result<()> {
        match name {
            "positive" => {
                self.positive = value.as_f64()?;
                Ok(())
            }
            "delay_ms" => {
                self.fit_delay = Duration::from_millis(value.as_usize()? as u64);
                Ok(())
            }
            _ => Err(Error::InvalidConfig(format!("unknown parameter '{}'", name))),
        }
    }

    fn clone_box(&self) -> Box<dyn Quantifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

fn stub_protocol() -> ArtificialPrevalenceProtocol {
    ArtificialPrevalenceProtocol::new(toy_binary(60), 30, 5).with_grid(5, 2)
}

// ---------------------------------------------------------------------------
// selection
// ---------------------------------------------------------------------------

#[test]
fn grid_search_selects_the_minimal_score() {
    // the protocol sweeps prevalences symmetrically over [0, 1], so the
    // constant estimate 0.5 beats 0.2 under mean absolute error
    let grid = ParamGrid::new().add(
        "positive",
        vec![ParamValue::Float(0.2), ParamValue::Float(0.5)],
    );
    let mut search = GridSearch::new(
        Box::new(StubQuantifier::new()),
        grid,
        Box::new(stub_protocol()),
        ErrorMetric::Mae,
    )
    .with_context(ExecutionContext::sequential(1));

    search.fit(&toy_binary(40)).unwrap();

    let best = search.best_params().unwrap();
    assert_eq!(best[0], ("positive".to_string(), ParamValue::Float(0.5)));
    assert!(search.best_score().unwrap() < 0.35);
    assert_eq!(search.param_scores().len(), 2);
    assert!(search
        .param_scores()
        .iter()
        .all(|(_, outcome)| outcome.score().is_some()));
}

#[test]
fn timed_out_trials_are_recorded_and_excluded() {
    // four configurations: two complete and score, two sleep past the
    // per-trial budget
    let grid = ParamGrid::new()
        .add(
            "positive",
            vec![ParamValue::Float(0.2), ParamValue::Float(0.5)],
        )
        .add("delay_ms", vec![ParamValue::Int(0), ParamValue::Int(2000)]);

    let mut search = GridSearch::new(
        Box::new(StubQuantifier::new()),
        grid,
        Box::new(stub_protocol()),
        ErrorMetric::Mae,
    )
    .with_timeout(Duration::from_millis(250))
    .with_context(ExecutionContext::sequential(1));

    search.fit(&toy_binary(40)).unwrap();

    let outcomes = search.param_scores();
    assert_eq!(outcomes.len(), 4);
    let timed_out = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, TrialOutcome::TimedOut))
        .count();
    let scored = outcomes
        .iter()
        .filter(|(_, o)| o.score().is_some())
        .count();
    assert_eq!(timed_out, 2);
    assert_eq!(scored, 2);

    // the winner is the best *completed* configuration
    let best = search.best_params().unwrap();
    assert!(best.contains(&("positive".to_string(), ParamValue::Float(0.5))));
    assert!(best.contains(&("delay_ms".to_string(), ParamValue::Int(0))));
}

#[test]
fn all_trials_timing_out_is_a_fatal_error() {
    let grid = ParamGrid::new().add("delay_ms", vec![ParamValue::Int(2000)]);
    let mut search = GridSearch::new(
        Box::new(StubQuantifier::new()),
        grid,
        Box::new(stub_protocol()),
        ErrorMetric::Mae,
    )
    .with_timeout(Duration::from_millis(100))
    .with_context(ExecutionContext::sequential(1));

    let err = search.fit(&toy_binary(40)).unwrap_err();
    assert!(matches!(err, Error::SelectionExhausted), "{}", err);
}

#[test]
fn failing_configurations_are_recorded_distinctly() {
    let grid = ParamGrid::new().add(
        "no_such_param",
        vec![ParamValue::Int(1), ParamValue::Int(2)],
    );
    let mut search = GridSearch::new(
        Box::new(StubQuantifier::new()),
        grid,
        Box::new(stub_protocol()),
        ErrorMetric::Mae,
    );
    let err = search.fit(&toy_binary(40)).unwrap_err();
    assert!(matches!(err, Error::SelectionExhausted));
    assert!(search
        .param_scores()
        .iter()
        .all(|(_, o)| matches!(o, TrialOutcome::Failed(_))));
}

#[test]
fn quantify_before_fit_is_an_error() {
    let search = GridSearch::new(
        Box::new(StubQuantifier::new()),
        ParamGrid::new(),
        Box::new(stub_protocol()),
        ErrorMetric::Mae,
    );
    assert!(search.quantify(&Array2::zeros((2, 2))).is_err());
}

// ---------------------------------------------------------------------------
// end-to-end search over a real quantifier
// ---------------------------------------------------------------------------

#[test]
fn grid_search_tunes_a_real_quantifier_and_refits() {
    let training = toy_binary(60);
    let held_out = toy_binary(40);
    let protocol = ArtificialPrevalenceProtocol::new(held_out, 30, 11).with_grid(5, 2);

    let grid = ParamGrid::new().add(
        "classifier__temperature",
        vec![ParamValue::Float(0.5), ParamValue::Float(2.0)],
    );
    let base = PACC::new(Box::new(CentroidClassifier::default()));
    let mut search = GridSearch::new(Box::new(base), grid, Box::new(protocol), ErrorMetric::Mae)
        .with_refit(true)
        .with_context(ExecutionContext::new(2, Backend::Rayon, 23));

    search.fit(&training).unwrap();
    assert!(search.best_score().is_some());

    let estimate = search.quantify(toy_binary(20).instances()).unwrap();
    assert!((estimate.sum() - 1.0).abs() < 1e-9);
}

#[test]
fn evaluate_averages_over_the_protocol() {
    let protocol = stub_protocol();
    let mut model = StubQuantifier::new();
    model
        .set_param("positive", &ParamValue::Float(0.5))
        .unwrap();
    let score = evaluate(&model, &protocol, ErrorMetric::Mae).unwrap();
    // constant 0.5 against the symmetric grid {0, .25, .5, .75, 1}
    assert!(score > 0.0 && score < 0.5, "score {}", score);

    let samples = protocol.iterate().count();
    assert_eq!(samples, 10);
}

// ---------------------------------------------------------------------------
// serde round-trips (grid and context survive the journey to disk)
// ---------------------------------------------------------------------------

#[test]
fn param_grid_round_trips_through_json() {
    let grid = ParamGrid::new()
        .add("n_bins", vec![ParamValue::Int(8), ParamValue::Int(16)])
        .add("divergence", vec![ParamValue::Str("HD".into())]);
    let json = serde_json::to_string(&grid).unwrap();
    let back: ParamGrid = serde_json::from_str(&json).unwrap();
    assert_eq!(back.expand().len(), grid.expand().len());
    assert_eq!(
        format_config(&back.expand()[0]),
        format_config(&grid.expand()[0])
    );
}

#[test]
fn execution_context_round_trips_through_json() {
    let ctx = ExecutionContext::new(4, Backend::Rayon, 99);
    let json = serde_json::to_string(&ctx).unwrap();
    assert!(json.contains("rayon"));
    let back: ExecutionContext = serde_json::from_str(&json).unwrap();
    assert_eq!(back.n_workers, 4);
    assert_eq!(back.seed, 99);
}

#[test]
fn error_metric_round_trips_through_json() {
    let json = serde_json::to_string(&ErrorMetric::Mrae).unwrap();
    assert_eq!(json, "\"mrae\"");
    let back: ErrorMetric = serde_json::from_str(&json).unwrap();
    assert_eq!(back, ErrorMetric::Mrae);
}
