//! Aggregative quantifiers: prevalence estimators built on classifier output.
//!
//! Every method in this family follows the same two-phase contract. Fitting
//! first runs the classifier stage (optionally training the classifier and
//! producing predictions on an evaluation subset chosen by a
//! [`ValidationPolicy`]), then learns the correction function from those
//! predictions. At inference, `classify` produces per-instance predictions
//! in the declared [`PredictionKind`] and `aggregate` reduces them to a
//! prevalence vector.

mod count;
mod distribution;
mod emq;
mod meta;
mod threshold;

pub use count::{ACC, CC, PACC, PCC};
pub use distribution::{DMy, DyS, HDy, SMM};
pub use emq::{Recalibration, EMQ};
pub use meta::{MedianEnsemble, OneVsAll};
pub use threshold::{ThresholdOptimization, ThresholdPolicy};

use ndarray::{Array1, Array2};

use crate::classifier::{CalibratedClassifier, Classifier, PredictionKind};
use crate::config::ExecutionContext;
use crate::data::LabelledCollection;
use crate::error::{Error, Result};
use crate::model_selection::ParamValue;

/// Per-instance classifier output consumed by `aggregate`.
#[derive(Debug, Clone)]
pub enum Predictions {
    Crisp(Vec<usize>),
    Soft(Array2<f64>),
}

impl Predictions {
    pub fn len(&self) -> usize {
        match self {
            Predictions::Crisp(labels) => labels.len(),
            Predictions::Soft(posteriors) => posteriors.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_crisp(&self) -> Result<&[usize]> {
        match self {
            Predictions::Crisp(labels) => Ok(labels),
            Predictions::Soft(_) => Err(Error::InvalidConfig(
                "expected crisp-label predictions, got posteriors".into(),
            )),
        }
    }

    pub fn as_soft(&self) -> Result<&Array2<f64>> {
        match self {
            Predictions::Soft(posteriors) => Ok(posteriors),
            Predictions::Crisp(_) => Err(Error::InvalidConfig(
                "expected posterior predictions, got crisp labels".into(),
            )),
        }
    }
}

/// Predictions from the classifier stage paired with the true labels of the
/// instances they were issued on.
#[derive(Debug, Clone)]
pub struct FittedPredictions {
    pub predictions: Predictions,
    pub labels: Vec<usize>,
}

/// How the evaluation subset for the aggregation fit is chosen.
#[derive(Debug, Clone)]
pub enum ValidationPolicy {
    /// No predictions are needed (e.g. plain classify-and-count).
    None,
    /// Hold out this fraction of the training data, stratified.
    Holdout(f64),
    /// Predict on an explicit pre-built collection.
    Collection(LabelledCollection),
    /// Predict the whole training set via k-fold cross-validation, then
    /// refit the classifier on the full set.
    KFold(usize),
}

/// The classifier phase shared by every aggregative quantifier: owns the
/// classifier, the validation policy, and the calibration permission.
#[derive(Clone)]
pub struct ClassifierStage {
    pub classifier: Box<dyn Classifier>,
    pub validation: ValidationPolicy,
    pub fit_classifier: bool,
    pub allow_calibration: bool,
}

impl ClassifierStage {
    pub fn new(classifier: Box<dyn Classifier>, validation: ValidationPolicy) -> Self {
        ClassifierStage {
            classifier,
            validation,
            fit_classifier: true,
            allow_calibration: false,
        }
    }

    /// Enforce the declared prediction contract, wrapping the classifier in
    /// the calibration adapter when that is explicitly permitted.
    fn ensure_capability(&mut self, kind: PredictionKind) -> Result<()> {
        if kind == PredictionKind::Soft && !self.classifier.supports_proba() {
            if self.allow_calibration && self.fit_classifier {
                log::warn!(
                    "classifier '{}' is not probabilistic; wrapping it in a 5-fold calibration adapter",
                    self.classifier.name()
                );
                let inner = self.classifier.clone_box();
                self.classifier = Box::new(CalibratedClassifier::new(inner));
            } else {
                return Err(Error::CapabilityMismatch {
                    classifier: self.classifier.name().to_string(),
                    required: kind.describe(),
                });
            }
        }
        Ok(())
    }

    /// Issue predictions in the requested contract.
    pub fn classify(&self, instances: &Array2<f64>, kind: PredictionKind) -> Result<Predictions> {
        match kind {
            PredictionKind::Crisp => Ok(Predictions::Crisp(self.classifier.predict(instances))),
            PredictionKind::Soft => Ok(Predictions::Soft(self.classifier.predict_proba(instances)?)),
        }
    }

    /// Phase (a) of the two-phase fit: train the classifier as requested
    /// and produce evaluation predictions per the validation policy.
    pub fn fit_predict(
        &mut self,
        data: &LabelledCollection,
        kind: PredictionKind,
        ctx: &ExecutionContext,
    ) -> Result<Option<FittedPredictions>> {
        self.ensure_capability(kind)?;

        match self.validation.clone() {
            ValidationPolicy::None => {
                if self.fit_classifier {
                    self.classifier.fit(data.instances(), data.labels())?;
                }
                Ok(None)
            }
            ValidationPolicy::Holdout(p) => {
                if !self.fit_classifier {
                    return Err(Error::InvalidConfig(
                        "a holdout proportion needs classifier fitting; with fit_classifier \
                         disabled, pass an explicit evaluation collection instead"
                            .into(),
                    ));
                }
                if !(0.0 < p && p < 1.0) {
                    return Err(Error::InvalidConfig(format!(
                        "holdout proportion {} out of range, must be in (0,1)",
                        p
                    )));
                }
                let mut rng = ctx.rng();
                let (train, held) = data.split_stratified(1.0 - p, &mut rng)?;
                self.classifier.fit(train.instances(), train.labels())?;
                let predictions = self.classify(held.instances(), kind)?;
                Ok(Some(FittedPredictions {
                    predictions,
                    labels: held.labels().to_vec(),
                }))
            }
            ValidationPolicy::Collection(val) => {
                if val.n_classes() != data.n_classes() {
                    return Err(Error::InvalidConfig(format!(
                        "evaluation collection has {} classes but the training data has {}",
                        val.n_classes(),
                        data.n_classes()
                    )));
                }
                if self.fit_classifier {
                    self.classifier.fit(data.instances(), data.labels())?;
                }
                let predictions = self.classify(val.instances(), kind)?;
                Ok(Some(FittedPredictions {
                    predictions,
                    labels: val.labels().to_vec(),
                }))
            }
            ValidationPolicy::KFold(k) => {
                if !self.fit_classifier {
                    return Err(Error::InvalidConfig(
                        "cross-validated predictions need classifier fitting; with \
                         fit_classifier disabled, pass an explicit evaluation collection instead"
                            .into(),
                    ));
                }
                let mut rng = ctx.rng();
                let folds = data.kfold(k, &mut rng)?;
                let predictions = self.cross_val_predict(data, folds, kind, ctx)?;
                self.classifier.fit(data.instances(), data.labels())?;
                Ok(Some(FittedPredictions {
                    predictions,
                    labels: data.labels().to_vec(),
                }))
            }
        }
    }

    /// Out-of-fold predictions for every training instance, assembled back
    /// into original order. Folds run in parallel on classifier copies.
    fn cross_val_predict(
        &self,
        data: &LabelledCollection,
        folds: Vec<(Vec<usize>, Vec<usize>)>,
        kind: PredictionKind,
        ctx: &ExecutionContext,
    ) -> Result<Predictions> {
        let per_fold: Vec<Result<(Vec<usize>, Predictions)>> =
            ctx.map_indexed(folds, |_, (train_idx, test_idx)| {
                let train = data.select(&train_idx);
                let test = data.select(&test_idx);
                let mut fold_clf = self.classifier.clone_box();
                fold_clf.fit(train.instances(), train.labels())?;
                let stage = ClassifierStage {
                    classifier: fold_clf,
                    validation: ValidationPolicy::None,
                    fit_classifier: false,
                    allow_calibration: false,
                };
                let preds = stage.classify(test.instances(), kind)?;
                Ok((test_idx, preds))
            });

        let n = data.len();
        match kind {
            PredictionKind::Crisp => {
                let mut assembled = vec![0usize; n];
                for fold in per_fold {
                    let (test_idx, preds) = fold?;
                    let labels = preds.as_crisp()?;
                    for (&i, &label) in test_idx.iter().zip(labels.iter()) {
                        assembled[i] = label;
                    }
                }
                Ok(Predictions::Crisp(assembled))
            }
            PredictionKind::Soft => {
                let mut assembled = Array2::<f64>::zeros((n, data.n_classes()));
                for fold in per_fold {
                    let (test_idx, preds) = fold?;
                    let posteriors = preds.as_soft()?;
                    for (pos, &i) in test_idx.iter().enumerate() {
                        for c in 0..posteriors.ncols().min(assembled.ncols()) {
                            assembled[[i, c]] = posteriors[[pos, c]];
                        }
                    }
                }
                Ok(Predictions::Soft(assembled))
            }
        }
    }
}

/// A fitted (or fittable) prevalence estimator.
pub trait Quantifier: Send + Sync {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()>;

    /// Class prevalence estimate for the sample's instances.
    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>>;

    /// Apply a hyper-parameter; unknown names are a configuration error.
    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()>;

    fn clone_box(&self) -> Box<dyn Quantifier>;

    fn name(&self) -> &'static str;
}

impl Clone for Box<dyn Quantifier> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The aggregative contract on top of [`Quantifier`].
pub trait AggregativeQuantifier: Quantifier {
    fn stage(&self) -> &ClassifierStage;

    fn stage_mut(&mut self) -> &mut ClassifierStage;

    /// Which prediction contract this method consumes.
    fn prediction_kind(&self) -> PredictionKind;

    /// Whether the method is restricted to two-class problems.
    fn binary_only(&self) -> bool {
        false
    }

    /// Phase (b) of the two-phase fit: learn the correction function from
    /// the evaluation predictions and the training data.
    fn aggregation_fit(
        &mut self,
        fitted: Option<&FittedPredictions>,
        data: &LabelledCollection,
        ctx: &ExecutionContext,
    ) -> Result<()>;

    /// Reduce per-instance predictions to a prevalence vector.
    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>>;

    /// Per-instance predictions in this method's contract.
    fn classify(&self, instances: &Array2<f64>) -> Result<Predictions> {
        self.stage().classify(instances, self.prediction_kind())
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier>;
}

impl Clone for Box<dyn AggregativeQuantifier> {
    fn clone(&self) -> Self {
        self.clone_aggregative()
    }
}

/// Shared `fit` implementation: binary check, classifier stage, aggregation.
pub(crate) fn fit_pipeline(
    quantifier: &mut dyn AggregativeQuantifier,
    data: &LabelledCollection,
    ctx: &ExecutionContext,
) -> Result<()> {
    if quantifier.binary_only() && data.n_classes() != 2 {
        return Err(Error::NonBinaryData {
            method: quantifier.name(),
            n_classes: data.n_classes(),
        });
    }
    let kind = quantifier.prediction_kind();
    let fitted = quantifier.stage_mut().fit_predict(data, kind, ctx)?;
    quantifier.aggregation_fit(fitted.as_ref(), data, ctx)
}

/// Shared `quantify` implementation: classify, then aggregate.
pub(crate) fn quantify_pipeline(
    quantifier: &dyn AggregativeQuantifier,
    instances: &Array2<f64>,
) -> Result<Array1<f64>> {
    let predictions = quantifier.classify(instances)?;
    quantifier.aggregate(&predictions)
}

/// Hyper-parameter names prefixed with this address the classifier.
pub const CLASSIFIER_PARAM_PREFIX: &str = "classifier__";

pub(crate) fn unknown_param(method: &str, name: &str) -> Error {
    Error::InvalidConfig(format!("unknown parameter '{}' for {}", name, method))
}

/// Apply stage-level parameters shared by every aggregative quantifier.
/// Returns true when the parameter was consumed.
pub(crate) fn stage_set_param(
    stage: &mut ClassifierStage,
    name: &str,
    value: &ParamValue,
) -> Result<bool> {
    if let Some(rest) = name.strip_prefix(CLASSIFIER_PARAM_PREFIX) {
        stage.classifier.set_param(rest, value)?;
        return Ok(true);
    }
    match name {
        "val_split" => {
            stage.validation = match value {
                ParamValue::Float(p) => ValidationPolicy::Holdout(*p),
                ParamValue::Int(k) => ValidationPolicy::KFold((*k).max(0) as usize),
                _ => {
                    return Err(Error::InvalidConfig(
                        "val_split must be a float proportion or an integer fold count".into(),
                    ))
                }
            };
            Ok(true)
        }
        "fit_classifier" => {
            stage.fit_classifier = value.as_bool()?;
            Ok(true)
        }
        "allow_calibration" => {
            stage.allow_calibration = value.as_bool()?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
