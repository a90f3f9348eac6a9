//! The threshold-optimization family of adjusted-count quantifiers.
//!
//! All variants share the same machinery: enumerate every distinct
//! classifier score as a candidate decision threshold, measure the true and
//! false positive rates at each, and keep the candidate(s) whose rates make
//! the adjusted-count denominator most stable. The variants differ only in
//! the selection criterion, captured by [`ThresholdPolicy`].

use ndarray::{Array1, Array2};

use crate::aggregative::{
    fit_pipeline, quantify_pipeline, stage_set_param, unknown_param, AggregativeQuantifier,
    ClassifierStage, FittedPredictions, Predictions, Quantifier, ValidationPolicy,
};
use crate::classifier::{Classifier, PredictionKind};
use crate::config::ExecutionContext;
use crate::data::LabelledCollection;
use crate::error::{Error, Result};
use crate::model_selection::ParamValue;
use crate::prevalence;
use crate::stats;

/// Criterion used to score and retain candidate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdPolicy {
    /// Keep the threshold whose tpr is closest to 0.5.
    T50,
    /// Keep the threshold maximizing tpr - fpr.
    Max,
    /// Keep the threshold where tpr + fpr is closest to 1.
    X,
    /// Keep every surviving threshold and report the median estimate.
    MedianSweep,
    /// Median sweep restricted to thresholds with tpr - fpr > 0.25.
    MedianSweep2,
}

impl ThresholdPolicy {
    /// Score to minimize; the median-sweep variants defer entirely to the
    /// median rule and score every candidate alike.
    fn condition(&self, tpr: f64, fpr: f64) -> f64 {
        match self {
            ThresholdPolicy::T50 => (tpr - 0.5).abs(),
            ThresholdPolicy::Max => fpr - tpr,
            ThresholdPolicy::X => (1.0 - (tpr + fpr)).abs(),
            ThresholdPolicy::MedianSweep | ThresholdPolicy::MedianSweep2 => 1.0,
        }
    }

    fn discard(&self, tpr: f64, fpr: f64) -> bool {
        match self {
            ThresholdPolicy::MedianSweep2 => tpr - fpr <= 0.25,
            _ => tpr == fpr,
        }
    }

    fn keeps_all(&self) -> bool {
        matches!(
            self,
            ThresholdPolicy::MedianSweep | ThresholdPolicy::MedianSweep2
        )
    }
}

/// A surviving candidate threshold with its measured rates.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCandidate {
    pub tpr: f64,
    pub fpr: f64,
    pub threshold: f64,
    pub score: f64,
}

/// Adjusted-count quantifier over an optimized decision threshold.
///
/// The positive-class posterior serves as the decision score; the adjusted
/// count (rate - fpr) / (tpr - fpr) is computed at the retained
/// threshold(s), clipped into [0, 1], and median-combined for the sweep
/// variants.
#[derive(Clone)]
pub struct ThresholdOptimization {
    stage: ClassifierStage,
    policy: ThresholdPolicy,
    retained: Vec<ThresholdCandidate>,
}

impl ThresholdOptimization {
    pub fn new(classifier: Box<dyn Classifier>, policy: ThresholdPolicy) -> Self {
        ThresholdOptimization {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            policy,
            retained: Vec::new(),
        }
    }

    pub fn t50(classifier: Box<dyn Classifier>) -> Self {
        Self::new(classifier, ThresholdPolicy::T50)
    }

    pub fn max(classifier: Box<dyn Classifier>) -> Self {
        Self::new(classifier, ThresholdPolicy::Max)
    }

    pub fn x(classifier: Box<dyn Classifier>) -> Self {
        Self::new(classifier, ThresholdPolicy::X)
    }

    pub fn median_sweep(classifier: Box<dyn Classifier>) -> Self {
        Self::new(classifier, ThresholdPolicy::MedianSweep)
    }

    pub fn median_sweep2(classifier: Box<dyn Classifier>) -> Self {
        Self::new(classifier, ThresholdPolicy::MedianSweep2)
    }

    pub fn policy(&self) -> ThresholdPolicy {
        self.policy
    }

    /// Retained candidate(s) after fitting, best first.
    pub fn retained(&self) -> &[ThresholdCandidate] {
        &self.retained
    }

    /// Measure rates at every distinct score, discard degenerate
    /// candidates, and rank the survivors by the policy criterion.
    fn eval_candidate_thresholds(
        policy: ThresholdPolicy,
        scores: &[f64],
        labels: &[usize],
    ) -> Vec<ThresholdCandidate> {
        let mut distinct: Vec<f64> = scores.to_vec();
        distinct.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        distinct.dedup();

        let mut candidates = Vec::new();
        for &threshold in &distinct {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            let mut tn = 0usize;
            for (&score, &label) in scores.iter().zip(labels.iter()) {
                let predicted_positive = score >= threshold;
                match (label == 1, predicted_positive) {
                    (true, true) => tp += 1,
                    (true, false) => fn_ += 1,
                    (false, true) => fp += 1,
                    (false, false) => tn += 1,
                }
            }
            let tpr = if tp + fn_ == 0 {
                1.0
            } else {
                tp as f64 / (tp + fn_) as f64
            };
            let fpr = if fp + tn == 0 {
                0.0
            } else {
                fp as f64 / (fp + tn) as f64
            };
            if !policy.discard(tpr, fpr) {
                candidates.push(ThresholdCandidate {
                    tpr,
                    fpr,
                    threshold,
                    score: policy.condition(tpr, fpr),
                });
            }
        }

        if candidates.is_empty() {
            // nothing survived: fall back to plain counting, which is the
            // adjusted count at tpr=1, fpr=0, threshold=0
            candidates.push(ThresholdCandidate {
                tpr: 1.0,
                fpr: 0.0,
                threshold: 0.0,
                score: 0.0,
            });
        }

        candidates.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }

    fn adjusted_count(candidate: &ThresholdCandidate, scores: &[f64]) -> f64 {
        let rate = if scores.is_empty() {
            0.0
        } else {
            scores.iter().filter(|&&s| s >= candidate.threshold).count() as f64
                / scores.len() as f64
        };
        let spread = candidate.tpr - candidate.fpr;
        let estimate = if spread.abs() < 1e-12 {
            rate
        } else {
            (rate - candidate.fpr) / spread
        };
        estimate.clamp(0.0, 1.0)
    }
}

impl Quantifier for ThresholdOptimization {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()> {
        fit_pipeline(self, data, ctx)
    }

    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>> {
        quantify_pipeline(self, instances)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        if stage_set_param(&mut self.stage, name, value)? {
            Ok(())
        } else {
            Err(unknown_param(self.name(), name))
        }
    }

    fn clone_box(&self) -> Box<dyn Quantifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        match self.policy {
            ThresholdPolicy::T50 => "T50",
            ThresholdPolicy::Max => "MAX",
            ThresholdPolicy::X => "X",
            ThresholdPolicy::MedianSweep => "MS",
            ThresholdPolicy::MedianSweep2 => "MS2",
        }
    }
}

impl AggregativeQuantifier for ThresholdOptimization {
    fn stage(&self) -> &ClassifierStage {
        &self.stage
    }

    fn stage_mut(&mut self) -> &mut ClassifierStage {
        &mut self.stage
    }

    fn prediction_kind(&self) -> PredictionKind {
        PredictionKind::Soft
    }

    fn binary_only(&self) -> bool {
        true
    }

    fn aggregation_fit(
        &mut self,
        fitted: Option<&FittedPredictions>,
        _data: &LabelledCollection,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        let fitted = fitted.ok_or_else(|| {
            Error::InvalidConfig(
                "threshold optimization needs evaluation predictions; configure a validation split"
                    .into(),
            )
        })?;
        let posteriors = fitted.predictions.as_soft()?;
        let scores: Vec<f64> = posteriors.column(1).to_vec();
        let candidates =
            Self::eval_candidate_thresholds(self.policy, &scores, &fitted.labels);
        self.retained = if self.policy.keeps_all() {
            candidates
        } else {
            candidates.into_iter().take(1).collect()
        };
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        if self.retained.is_empty() {
            return Err(Error::InvalidConfig(
                "threshold aggregate called before fit".into(),
            ));
        }
        let posteriors = predictions.as_soft()?;
        let scores: Vec<f64> = posteriors.column(1).to_vec();
        let mut estimates: Vec<f64> = self
            .retained
            .iter()
            .map(|candidate| Self::adjusted_count(candidate, &scores))
            .collect();
        let positive = stats::median(&mut estimates);
        Ok(prevalence::as_binary(positive, true))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t50_selects_the_threshold_with_half_tpr() {
        // at threshold 0.8, exactly 2 of 4 positives are kept (tpr = 0.5)
        let scores = vec![0.9, 0.8, 0.4, 0.3, 0.2, 0.1];
        let labels = vec![1, 1, 1, 1, 0, 0];
        let candidates =
            ThresholdOptimization::eval_candidate_thresholds(ThresholdPolicy::T50, &scores, &labels);
        let best = candidates[0];
        assert_eq!(best.threshold, 0.8);
        assert_eq!(best.tpr, 0.5);
        assert_eq!(best.score, 0.0);
    }

    #[test]
    fn degenerate_candidates_are_discarded() {
        // every score on one side: tpr == fpr == 1 at the lowest threshold
        let scores = vec![0.5, 0.5];
        let labels = vec![1, 0];
        let candidates =
            ThresholdOptimization::eval_candidate_thresholds(ThresholdPolicy::Max, &scores, &labels);
        // the only distinct threshold is degenerate, so the default kicks in
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].tpr, 1.0);
        assert_eq!(candidates[0].fpr, 0.0);
        assert_eq!(candidates[0].threshold, 0.0);
    }

    #[test]
    fn median_sweep2_discards_weak_separations() {
        let policy = ThresholdPolicy::MedianSweep2;
        assert!(policy.discard(0.6, 0.4));
        assert!(policy.discard(0.5, 0.25));
        assert!(!policy.discard(0.9, 0.1));
    }

    #[test]
    fn adjusted_count_clips_into_the_unit_interval() {
        let candidate = ThresholdCandidate {
            tpr: 0.8,
            fpr: 0.3,
            threshold: 0.5,
            score: 0.0,
        };
        // observed rate below fpr drives the raw adjustment negative
        let estimate = ThresholdOptimization::adjusted_count(&candidate, &[0.1, 0.2, 0.3]);
        assert_eq!(estimate, 0.0);

        let estimate = ThresholdOptimization::adjusted_count(&candidate, &[0.9, 0.9, 0.9]);
        assert_eq!(estimate, 1.0);
    }

    #[test]
    fn median_sweep_keeps_all_survivors() {
        let scores = vec![0.9, 0.7, 0.6, 0.3, 0.2, 0.1];
        let labels = vec![1, 1, 1, 0, 0, 0];
        let candidates = ThresholdOptimization::eval_candidate_thresholds(
            ThresholdPolicy::MedianSweep,
            &scores,
            &labels,
        );
        assert!(candidates.len() > 1);
    }
}
