//! The count-based quantifiers: CC, ACC and their probabilistic analogues.

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

/// Misclassification matrix from crisp predictions: entry `(i, j)` estimates
/// P(predicted = i | true = j). Columns are normalized to sum to one; a
/// class never seen in the evaluation set keeps an identity column.
pub(crate) fn confusion_from_crisp(
    n_classes: usize,
    true_labels: &[usize],
    predicted: &[usize],
) -> Array2<f64> {
    let mut conf = Array2::<f64>::zeros((n_classes, n_classes));
    for (&truth, &pred) in true_labels.iter().zip(predicted.iter()) {
        conf[[pred, truth]] += 1.0;
    }
    for j in 0..n_classes {
        let total: f64 = (0..n_classes).map(|i| conf[[i, j]]).sum();
        if total == 0.0 {
            conf[[j, j]] = 1.0;
        } else {
            for i in 0..n_classes {
                conf[[i, j]] /= total;
            }
        }
    }
    conf
}

/// Misclassification matrix from posteriors: column `j` is the mean
/// posterior vector of the evaluation instances whose true class is `j`.
/// Classes without instances keep an identity column.
pub(crate) fn confusion_from_soft(
    n_classes: usize,
    true_labels: &[usize],
    posteriors: &Array2<f64>,
) -> Array2<f64> {
    let mut conf = Array2::<f64>::eye(n_classes);
    for j in 0..n_classes {
        let members: Vec<usize> = true_labels
            .iter()
            .enumerate()
            .filter_map(|(i, &y)| (y == j).then_some(i))
            .collect();
        if members.is_empty() {
            continue;
        }
        for i in 0..n_classes {
            let mean = members.iter().map(|&m| posteriors[[m, i]]).sum::<f64>()
                / members.len() as f64;
            conf[[i, j]] = mean;
        }
    }
    conf
}

/// Invert the classifier bias: solve `confusion * x = raw`, clip into [0, 1]
/// and renormalize. A singular system leaves the raw estimate untouched.
pub(crate) fn solve_adjustment(confusion: &Array2<f64>, raw: &Array1<f64>) -> Array1<f64> {
    match stats::solve_linear(confusion, raw) {
        Some(adjusted) => prevalence::normalize(adjusted),
        None => raw.clone(),
    }
}

/// Classify & Count: the normalized histogram of predicted labels.
#[derive(Clone)]
pub struct CC {
    stage: ClassifierStage,
}

impl CC {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        CC {
            stage: ClassifierStage::new(classifier, ValidationPolicy::None),
        }
    }
}

impl Quantifier for CC {
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
        "CC"
    }
}

impl AggregativeQuantifier for CC {
    fn stage(&self) -> &ClassifierStage {
        &self.stage
    }

    fn stage_mut(&mut self) -> &mut ClassifierStage {
        &mut self.stage
    }

    fn prediction_kind(&self) -> PredictionKind {
        PredictionKind::Crisp
    }

    fn aggregation_fit(
        &mut self,
        _fitted: Option<&FittedPredictions>,
        _data: &LabelledCollection,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        // nothing to learn: counting needs no correction state
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        let labels = predictions.as_crisp()?;
        Ok(prevalence::from_labels(
            labels,
            self.stage.classifier.n_classes(),
        ))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

/// Adjusted Classify & Count: corrects the CC estimate through the
/// estimated misclassification rates.
#[derive(Clone)]
pub struct ACC {
    stage: ClassifierStage,
    confusion: Option<Array2<f64>>,
}

impl ACC {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        ACC {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            confusion: None,
        }
    }

    pub fn with_validation(classifier: Box<dyn Classifier>, validation: ValidationPolicy) -> Self {
        ACC {
            stage: ClassifierStage::new(classifier, validation),
            confusion: None,
        }
    }

    /// The fitted misclassification estimate, when available.
    pub fn confusion(&self) -> Option<&Array2<f64>> {
        self.confusion.as_ref()
    }
}

impl Quantifier for ACC {
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
        "ACC"
    }
}

impl AggregativeQuantifier for ACC {
    fn stage(&self) -> &ClassifierStage {
        &self.stage
    }

    fn stage_mut(&mut self) -> &mut ClassifierStage {
        &mut self.stage
    }

    fn prediction_kind(&self) -> PredictionKind {
        PredictionKind::Crisp
    }

    fn aggregation_fit(
        &mut self,
        fitted: Option<&FittedPredictions>,
        data: &LabelledCollection,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        let fitted = fitted.ok_or_else(|| {
            Error::InvalidConfig("ACC needs evaluation predictions to estimate misclassification".into())
        })?;
        let predicted = fitted.predictions.as_crisp()?;
        self.confusion = Some(confusion_from_crisp(
            data.n_classes(),
            &fitted.labels,
            predicted,
        ));
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        let confusion = self
            .confusion
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("ACC aggregate called before fit".into()))?;
        let raw = prevalence::from_labels(predictions.as_crisp()?, confusion.nrows());
        Ok(solve_adjustment(confusion, &raw))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

/// Probabilistic Classify & Count: the mean posterior across instances.
#[derive(Clone)]
pub struct PCC {
    stage: ClassifierStage,
}

impl PCC {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        PCC {
            stage: ClassifierStage::new(classifier, ValidationPolicy::None),
        }
    }
}

impl Quantifier for PCC {
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
        "PCC"
    }
}

impl AggregativeQuantifier for PCC {
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
        _fitted: Option<&FittedPredictions>,
        _data: &LabelledCollection,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        Ok(prevalence::from_posteriors(predictions.as_soft()?))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

/// Probabilistic Adjusted Classify & Count: the PCC estimate corrected
/// through posterior-conditioned misclassification rates.
#[derive(Clone)]
pub struct PACC {
    stage: ClassifierStage,
    confusion: Option<Array2<f64>>,
}

impl PACC {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        PACC {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            confusion: None,
        }
    }

    pub fn with_validation(classifier: Box<dyn Classifier>, validation: ValidationPolicy) -> Self {
        PACC {
            stage: ClassifierStage::new(classifier, validation),
            confusion: None,
        }
    }
}

impl Quantifier for PACC {
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
        "PACC"
    }
}

impl AggregativeQuantifier for PACC {
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
        let fitted = fitted.ok_or_else(|| {
            Error::InvalidConfig("PACC needs evaluation predictions to estimate misclassification".into())
        })?;
        let posteriors = fitted.predictions.as_soft()?;
        self.confusion = Some(confusion_from_soft(
            data.n_classes(),
            &fitted.labels,
            posteriors,
        ));
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        let confusion = self
            .confusion
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("PACC aggregate called before fit".into()))?;
        let raw = prevalence::from_posteriors(predictions.as_soft()?);
        Ok(solve_adjustment(confusion, &raw))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crisp_confusion_is_column_stochastic() {
        let truth = vec![0, 0, 0, 1, 1, 1];
        let pred = vec![0, 0, 1, 1, 1, 0];
        let conf = confusion_from_crisp(2, &truth, &pred);
        for j in 0..2 {
            let col: f64 = (0..2).map(|i| conf[[i, j]]).sum();
            assert!((col - 1.0).abs() < 1e-12);
        }
        assert!((conf[[0, 0]] - 2.0 / 3.0).abs() < 1e-12);
        assert!((conf[[1, 1]] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn crisp_confusion_empty_column_becomes_identity() {
        // class 2 never appears among the true labels
        let truth = vec![0, 1];
        let pred = vec![0, 1];
        let conf = confusion_from_crisp(3, &truth, &pred);
        assert_eq!(conf[[2, 2]], 1.0);
        assert_eq!(conf[[0, 2]], 0.0);
    }

    #[test]
    fn soft_confusion_uses_posterior_column_means() {
        let truth = vec![0, 0, 1, 1];
        let posteriors = Array2::from_shape_vec(
            (4, 2),
            vec![
                0.9, 0.1, //
                0.7, 0.3, //
                0.2, 0.8, //
                0.4, 0.6, //
            ],
        )
        .unwrap();
        let conf = confusion_from_soft(2, &truth, &posteriors);
        assert!((conf[[0, 0]] - 0.8).abs() < 1e-12);
        assert!((conf[[1, 0]] - 0.2).abs() < 1e-12);
        assert!((conf[[0, 1]] - 0.3).abs() < 1e-12);
        assert!((conf[[1, 1]] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn identity_confusion_leaves_the_raw_estimate_unchanged() {
        let raw = Array1::from_vec(vec![0.25, 0.75]);
        let adjusted = solve_adjustment(&Array2::eye(2), &raw);
        assert!((adjusted[0] - 0.25).abs() < 1e-9);
        assert!((adjusted[1] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn singular_confusion_falls_back_to_the_raw_estimate() {
        let singular = Array2::from_shape_vec((2, 2), vec![0.5, 0.5, 0.5, 0.5]).unwrap();
        let raw = Array1::from_vec(vec![0.4, 0.6]);
        let adjusted = solve_adjustment(&singular, &raw);
        assert_eq!(adjusted, raw);
    }

    #[test]
    fn adjustment_clips_and_renormalizes_overshoot() {
        // a strongly biased confusion can push the solution out of [0,1]
        let conf = Array2::from_shape_vec((2, 2), vec![0.9, 0.6, 0.1, 0.4]).unwrap();
        let raw = Array1::from_vec(vec![0.95, 0.05]);
        let adjusted = solve_adjustment(&conf, &raw);
        assert!(crate::prevalence::is_valid(&adjusted, 1e-9));
    }
}
