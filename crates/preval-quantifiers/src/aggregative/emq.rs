//! Expectation-maximization quantification (the Saerens-Latinne-Decaestecker
//! algorithm), with optional posterior recalibration.

use std::str::FromStr;

use ndarray::{Array1, Array2, Axis};

use crate::aggregative::{
    fit_pipeline, stage_set_param, unknown_param, AggregativeQuantifier, ClassifierStage,
    FittedPredictions, Predictions, Quantifier, ValidationPolicy,
};
use crate::classifier::{Classifier, PredictionKind};
use crate::config::ExecutionContext;
use crate::data::LabelledCollection;
use crate::error::{Error, Result};
use crate::model_selection::ParamValue;
use crate::prevalence;

const MAX_ITERATIONS: usize = 1000;
const MIN_ITERATIONS: usize = 10;
const DEFAULT_TOLERANCE: f64 = 1e-4;
const LOG_FLOOR: f64 = 1e-12;

/// Posterior recalibration transform applied before the EM loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recalibration {
    /// No-bias vector scaling: a weight per class, no bias.
    Nbvs,
    /// Bias-corrected temperature scaling: one shared weight plus a bias
    /// per class (the default).
    Bcts,
    /// Temperature scaling: a single shared weight.
    Ts,
    /// Vector scaling: a weight and a bias per class.
    Vs,
}

impl Recalibration {
    fn shared_weight(&self) -> bool {
        matches!(self, Recalibration::Bcts | Recalibration::Ts)
    }

    fn has_bias(&self) -> bool {
        matches!(self, Recalibration::Bcts | Recalibration::Vs)
    }
}

impl Default for Recalibration {
    fn default() -> Self {
        Recalibration::Bcts
    }
}

impl FromStr for Recalibration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nbvs" => Ok(Recalibration::Nbvs),
            "bcts" => Ok(Recalibration::Bcts),
            "ts" => Ok(Recalibration::Ts),
            "vs" => Ok(Recalibration::Vs),
            _ => Err(Error::UnknownRecalibration(s.to_string())),
        }
    }
}

/// Fitted affine transform on log-posteriors: `z_c = w_c ln(p_c) + b_c`,
/// mapped back through a softmax.
#[derive(Debug, Clone)]
struct AffineRecalibration {
    weights: Array1<f64>,
    biases: Array1<f64>,
}

impl AffineRecalibration {
    /// Fit by minimizing the negative log-likelihood on held-out
    /// posteriors, via plain gradient descent. The objective is smooth and
    /// low-dimensional, so a fixed schedule is enough.
    fn fit(
        kind: Recalibration,
        posteriors: &Array2<f64>,
        labels: &[usize],
        n_classes: usize,
    ) -> Self {
        let n = posteriors.nrows().max(1) as f64;
        let log_p = posteriors.mapv(|v| v.max(LOG_FLOOR).ln());
        let mut weights = Array1::<f64>::from_elem(n_classes, 1.0);
        let mut biases = Array1::<f64>::zeros(n_classes);

        let learning_rate = 0.1;
        for _ in 0..300 {
            let mut grad_w = Array1::<f64>::zeros(n_classes);
            let mut grad_b = Array1::<f64>::zeros(n_classes);
            for (i, row) in log_p.outer_iter().enumerate() {
                // softmax of the current transform for this instance
                let z: Vec<f64> = (0..n_classes)
                    .map(|c| weights[c] * row[c] + biases[c])
                    .collect();
                let z_max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let exp: Vec<f64> = z.iter().map(|&v| (v - z_max).exp()).collect();
                let total: f64 = exp.iter().sum();
                for c in 0..n_classes {
                    let q = exp[c] / total;
                    let delta = q - if labels[i] == c { 1.0 } else { 0.0 };
                    grad_w[c] += delta * row[c];
                    grad_b[c] += delta;
                }
            }
            if kind.shared_weight() {
                let shared = grad_w.sum();
                grad_w.fill(shared);
            }
            for c in 0..n_classes {
                weights[c] -= learning_rate * grad_w[c] / n;
                if kind.has_bias() {
                    biases[c] -= learning_rate * grad_b[c] / n;
                }
            }
        }
        AffineRecalibration { weights, biases }
    }

    fn apply(&self, posteriors: &Array2<f64>) -> Array2<f64> {
        let mut out = posteriors.mapv(|v| v.max(LOG_FLOOR).ln());
        for mut row in out.outer_iter_mut() {
            let mut z_max = f64::NEG_INFINITY;
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.weights[c] * *v + self.biases[c];
                z_max = z_max.max(*v);
            }
            let mut total = 0.0;
            for v in row.iter_mut() {
                *v = (*v - z_max).exp();
                total += *v;
            }
            for v in row.iter_mut() {
                *v /= total;
            }
        }
        out
    }
}

/// EMQ: iteratively re-estimates prevalence and posteriors from a starting
/// prevalence until the estimate stabilizes.
///
/// The plain variant starts from the true training prevalence. The
/// recalibrated variant ([`EMQ::recalibrated`]) first learns a posterior
/// recalibration transform on cross-validated predictions and starts from
/// an estimated training prevalence instead.
#[derive(Clone)]
pub struct EMQ {
    stage: ClassifierStage,
    recalib: Option<Recalibration>,
    exact_train_prev: bool,
    tolerance: f64,
    train_prevalence: Option<Array1<f64>>,
    calibration: Option<AffineRecalibration>,
}

impl EMQ {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        EMQ {
            stage: ClassifierStage::new(classifier, ValidationPolicy::None),
            recalib: None,
            exact_train_prev: true,
            tolerance: DEFAULT_TOLERANCE,
            train_prevalence: None,
            calibration: None,
        }
    }

    /// The recalibrated variant: cross-validated predictions feed the
    /// selected recalibration transform, and the training prevalence is
    /// estimated from the recalibrated posteriors.
    pub fn recalibrated(classifier: Box<dyn Classifier>, recalib: Recalibration) -> Self {
        EMQ {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            recalib: Some(recalib),
            exact_train_prev: false,
            tolerance: DEFAULT_TOLERANCE,
            train_prevalence: None,
            calibration: None,
        }
    }

    /// The expectation-maximization fixed point.
    ///
    /// Alternates reweighting each instance's posterior by the ratio of the
    /// running estimate to the training prevalence (E-step) with taking the
    /// mean of the reweighted posteriors as the next estimate (M-step).
    /// Convergence requires the mean absolute change to drop below
    /// `tolerance` *and* at least ten completed iterations; at the
    /// iteration cap the last estimate is returned with a warning.
    pub fn em(
        train_prevalence: &Array1<f64>,
        posteriors: &Array2<f64>,
        tolerance: f64,
    ) -> (Array1<f64>, Array2<f64>) {
        let n_classes = train_prevalence.len();
        let mut running = train_prevalence.clone();
        let mut reweighted = posteriors.clone();
        let mut previous: Option<Array1<f64>> = None;
        let mut converged = false;

        let mut iteration = 0usize;
        while !converged && iteration < MAX_ITERATIONS {
            // E-step
            for (row_in, mut row_out) in posteriors.outer_iter().zip(reweighted.outer_iter_mut())
            {
                let mut total = 0.0;
                for c in 0..n_classes {
                    let ratio = running[c] / train_prevalence[c].max(LOG_FLOOR);
                    row_out[c] = row_in[c] * ratio;
                    total += row_out[c];
                }
                if total > 0.0 {
                    for c in 0..n_classes {
                        row_out[c] /= total;
                    }
                } else {
                    for c in 0..n_classes {
                        row_out[c] = 1.0 / n_classes as f64;
                    }
                }
            }

            // M-step
            let next = reweighted
                .mean_axis(Axis(0))
                .unwrap_or_else(|| prevalence::uniform(n_classes));

            iteration += 1;
            if let Some(prev) = &previous {
                let change = next
                    .iter()
                    .zip(prev.iter())
                    .map(|(a, b)| (a - b).abs())
                    .sum::<f64>()
                    / n_classes as f64;
                if change < tolerance && iteration >= MIN_ITERATIONS {
                    converged = true;
                }
            }
            previous = Some(next.clone());
            running = next;
        }

        if !converged {
            log::warn!(
                "expectation-maximization reached the iteration cap ({}); the estimate might not have converged",
                MAX_ITERATIONS
            );
        }
        (running, reweighted)
    }

    /// EM-corrected posteriors for the sample's instances.
    pub fn posteriors(&self, instances: &Array2<f64>) -> Result<Array2<f64>> {
        let train_prevalence = self.train_prevalence()?;
        let predictions = AggregativeQuantifier::classify(self, instances)?;
        let (_, corrected) = EMQ::em(train_prevalence, predictions.as_soft()?, self.tolerance);
        Ok(corrected)
    }

    fn train_prevalence(&self) -> Result<&Array1<f64>> {
        self.train_prevalence
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("EMQ aggregate called before fit".into()))
    }
}

impl Quantifier for EMQ {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()> {
        fit_pipeline(self, data, ctx)
    }

    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>> {
        let predictions = AggregativeQuantifier::classify(self, instances)?;
        self.aggregate(&predictions)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        if stage_set_param(&mut self.stage, name, value)? {
            return Ok(());
        }
        match name {
            "exact_train_prev" => {
                self.exact_train_prev = value.as_bool()?;
                Ok(())
            }
            "recalib" => {
                let text = value.as_str()?;
                self.recalib = if text.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(text.parse()?)
                };
                Ok(())
            }
            "tolerance" => {
                self.tolerance = value.as_f64()?;
                Ok(())
            }
            _ => Err(unknown_param(self.name(), name)),
        }
    }

    fn clone_box(&self) -> Box<dyn Quantifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "EMQ"
    }
}

impl AggregativeQuantifier for EMQ {
    fn stage(&self) -> &ClassifierStage {
        &self.stage
    }

    fn stage_mut(&mut self) -> &mut ClassifierStage {
        &mut self.stage
    }

    fn prediction_kind(&self) -> PredictionKind {
        PredictionKind::Soft
    }

    fn aggregation_fit(
        &mut self,
        fitted: Option<&FittedPredictions>,
        data: &LabelledCollection,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        if let Some(recalib) = self.recalib {
            let fitted = fitted.ok_or_else(|| {
                Error::InvalidConfig(
                    "recalibrated EMQ needs evaluation predictions; configure a validation split"
                        .into(),
                )
            })?;
            let posteriors = fitted.predictions.as_soft()?;
            self.calibration = Some(AffineRecalibration::fit(
                recalib,
                posteriors,
                &fitted.labels,
                data.n_classes(),
            ));
        }

        self.train_prevalence = Some(if self.exact_train_prev {
            data.prevalence()
        } else {
            // expected value of the (possibly recalibrated) posteriors of
            // the training instances
            let predictions = AggregativeQuantifier::classify(self, data.instances())?;
            prevalence::from_posteriors(predictions.as_soft()?)
        });
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        let train_prevalence = self.train_prevalence()?;
        let (estimate, _) = EMQ::em(train_prevalence, predictions.as_soft()?, self.tolerance);
        Ok(estimate)
    }

    /// Posteriors pass through the recalibration transform when one was
    /// trained.
    fn classify(&self, instances: &Array2<f64>) -> Result<Predictions> {
        let mut posteriors = self.stage.classifier.predict_proba(instances)?;
        if let Some(calibration) = &self.calibration {
            posteriors = calibration.apply(&posteriors);
        }
        Ok(Predictions::Soft(posteriors))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn em_is_stationary_at_a_consistent_starting_point() {
        // posteriors whose column means equal the training prevalence make
        // the starting point a fixed point of the iteration
        let train_prev = Array1::from_vec(vec![0.3, 0.7]);
        let posteriors = Array2::from_shape_vec(
            (4, 2),
            vec![0.3, 0.7, 0.3, 0.7, 0.3, 0.7, 0.3, 0.7],
        )
        .unwrap();
        let (estimate, corrected) = EMQ::em(&train_prev, &posteriors, DEFAULT_TOLERANCE);
        assert!(prevalence::is_valid(&estimate, 1e-9));
        assert!((estimate[0] - 0.3).abs() < 1e-6);
        assert!((estimate[1] - 0.7).abs() < 1e-6);
        assert_eq!(corrected.nrows(), 4);
    }

    #[test]
    fn em_shifts_toward_the_dominant_class() {
        let train_prev = Array1::from_vec(vec![0.5, 0.5]);
        // a sample where almost every posterior leans to class 1
        let posteriors = Array2::from_shape_vec(
            (5, 2),
            vec![0.2, 0.8, 0.1, 0.9, 0.3, 0.7, 0.2, 0.8, 0.6, 0.4],
        )
        .unwrap();
        let (estimate, _) = EMQ::em(&train_prev, &posteriors, DEFAULT_TOLERANCE);
        assert!(prevalence::is_valid(&estimate, 1e-9));
        assert!(estimate[1] > 0.7);
    }

    #[test]
    fn recalibration_names_parse() {
        assert_eq!("bcts".parse::<Recalibration>().unwrap(), Recalibration::Bcts);
        assert_eq!("NBVS".parse::<Recalibration>().unwrap(), Recalibration::Nbvs);
        assert!("platt".parse::<Recalibration>().is_err());
    }

    #[test]
    fn affine_recalibration_outputs_row_stochastic_posteriors() {
        let posteriors = Array2::from_shape_vec(
            (4, 2),
            vec![0.8, 0.2, 0.6, 0.4, 0.3, 0.7, 0.1, 0.9],
        )
        .unwrap();
        let labels = vec![0, 0, 1, 1];
        let cal = AffineRecalibration::fit(Recalibration::Bcts, &posteriors, &labels, 2);
        let out = cal.apply(&posteriors);
        for row in out.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
        // calibration must not flip the ordering on well-ordered data
        assert!(out[[0, 0]] > out[[0, 1]]);
        assert!(out[[3, 1]] > out[[3, 0]]);
    }
}
