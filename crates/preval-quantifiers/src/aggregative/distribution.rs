//! Distribution-matching quantifiers: HDy, DyS, SMM and the generic DMy.
//!
//! These methods model quantification as the search for the mixture of
//! class-conditional score distributions that best matches the distribution
//! observed on the test sample.

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
use crate::stats::{self, Divergence};

/// Positive-class posteriors split by true label.
fn positive_scores_by_class(
    fitted: &FittedPredictions,
    method: &'static str,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let posteriors = fitted.predictions.as_soft()?;
    if posteriors.ncols() != 2 {
        return Err(Error::NonBinaryData {
            method,
            n_classes: posteriors.ncols(),
        });
    }
    let mut positive = Vec::new();
    let mut negative = Vec::new();
    for (i, &label) in fitted.labels.iter().enumerate() {
        let score = posteriors[[i, 1]];
        if label == 1 {
            positive.push(score);
        } else {
            negative.push(score);
        }
    }
    Ok((positive, negative))
}

fn positive_column(predictions: &Predictions) -> Result<Vec<f64>> {
    let posteriors = predictions.as_soft()?;
    Ok(posteriors.column(1).to_vec())
}

/// HDy: Hellinger-distance matching over a sweep of bin counts.
///
/// The estimate for each bin count comes from a linear scan of candidate
/// prevalence values at 1% steps; the final estimate is the median across
/// the eleven bin counts (10, 20, ..., 110).
#[derive(Clone)]
pub struct HDy {
    stage: ClassifierStage,
    bin_counts: Vec<usize>,
    positive_densities: Vec<Array1<f64>>,
    negative_densities: Vec<Array1<f64>>,
}

impl HDy {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        HDy {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            bin_counts: (1..=11).map(|b| b * 10).collect(),
            positive_densities: Vec::new(),
            negative_densities: Vec::new(),
        }
    }
}

impl Quantifier for HDy {
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
        "HDy"
    }
}

impl AggregativeQuantifier for HDy {
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
            Error::InvalidConfig("HDy needs evaluation predictions; configure a validation split".into())
        })?;
        let (positive, negative) = positive_scores_by_class(fitted, self.name())?;
        self.positive_densities = self
            .bin_counts
            .iter()
            .map(|&bins| stats::histogram(&positive, bins, false))
            .collect();
        self.negative_densities = self
            .bin_counts
            .iter()
            .map(|&bins| stats::histogram(&negative, bins, false))
            .collect();
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        if self.positive_densities.is_empty() {
            return Err(Error::InvalidConfig("HDy aggregate called before fit".into()));
        }
        let scores = positive_column(predictions)?;
        let candidates = prevalence::grid(101);

        let mut estimates: Vec<f64> = Vec::with_capacity(self.bin_counts.len());
        for (slot, &bins) in self.bin_counts.iter().enumerate() {
            let test_density = stats::histogram(&scores, bins, false);
            let positive = &self.positive_densities[slot];
            let negative = &self.negative_densities[slot];

            let mut best = (0.0, f64::INFINITY);
            for &candidate in &candidates {
                let mixture = positive * candidate + negative * (1.0 - candidate);
                let distance = Divergence::Hellinger.compute(&mixture, &test_density);
                if distance < best.1 {
                    best = (candidate, distance);
                }
            }
            estimates.push(best.0);
        }
        Ok(prevalence::as_binary(stats::median(&mut estimates), false))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

/// DyS: distribution matching with a single bin count and a ternary search
/// for the divergence minimizer.
#[derive(Clone)]
pub struct DyS {
    stage: ClassifierStage,
    n_bins: usize,
    divergence: Divergence,
    tolerance: f64,
    positive_density: Option<Array1<f64>>,
    negative_density: Option<Array1<f64>>,
}

impl DyS {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        DyS {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            n_bins: 8,
            divergence: Divergence::Hellinger,
            tolerance: 1e-5,
            positive_density: None,
            negative_density: None,
        }
    }

    pub fn with_divergence(mut self, divergence: Divergence) -> Self {
        self.divergence = divergence;
        self
    }
}

impl Quantifier for DyS {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()> {
        fit_pipeline(self, data, ctx)
    }

    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>> {
        quantify_pipeline(self, instances)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        if stage_set_param(&mut self.stage, name, value)? {
            return Ok(());
        }
        match name {
            "n_bins" => {
                self.n_bins = value.as_usize()?;
                Ok(())
            }
            "divergence" => {
                self.divergence = value.as_str()?.parse()?;
                Ok(())
            }
            "tol" => {
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
        "DyS"
    }
}

impl AggregativeQuantifier for DyS {
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
            Error::InvalidConfig("DyS needs evaluation predictions; configure a validation split".into())
        })?;
        let (positive, negative) = positive_scores_by_class(fitted, self.name())?;
        self.positive_density = Some(stats::histogram(&positive, self.n_bins, false));
        self.negative_density = Some(stats::histogram(&negative, self.n_bins, false));
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        let positive = self
            .positive_density
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("DyS aggregate called before fit".into()))?;
        let negative = self.negative_density.as_ref().ok_or_else(|| {
            Error::InvalidConfig("DyS aggregate called before fit".into())
        })?;
        let scores = positive_column(predictions)?;
        let test_density = stats::histogram(&scores, self.n_bins, false);

        let objective = |candidate: f64| {
            let mixture = positive * candidate + negative * (1.0 - candidate);
            self.divergence.compute(&mixture, &test_density)
        };
        let estimate = stats::ternary_search(objective, 0.0, 1.0, self.tolerance);
        Ok(prevalence::as_binary(estimate, false))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

/// SMM: distribution matching on the class-conditional posterior means,
/// which admits a closed-form solution.
#[derive(Clone)]
pub struct SMM {
    stage: ClassifierStage,
    positive_mean: Option<f64>,
    negative_mean: Option<f64>,
}

impl SMM {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        SMM {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            positive_mean: None,
            negative_mean: None,
        }
    }
}

impl Quantifier for SMM {
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
        "SMM"
    }
}

impl AggregativeQuantifier for SMM {
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
            Error::InvalidConfig("SMM needs evaluation predictions; configure a validation split".into())
        })?;
        let (positive, negative) = positive_scores_by_class(fitted, self.name())?;
        // an unrepresented class falls back to its ideal rate, as in the
        // degenerate-threshold convention
        let mean = |values: &[f64], default: f64| {
            if values.is_empty() {
                default
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };
        self.positive_mean = Some(mean(&positive, 1.0));
        self.negative_mean = Some(mean(&negative, 0.0));
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        let positive_mean = self
            .positive_mean
            .ok_or_else(|| Error::InvalidConfig("SMM aggregate called before fit".into()))?;
        let negative_mean = self
            .negative_mean
            .ok_or_else(|| Error::InvalidConfig("SMM aggregate called before fit".into()))?;
        let scores = positive_column(predictions)?;
        let sample_mean = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        let spread = positive_mean - negative_mean;
        let estimate = if spread.abs() < 1e-12 {
            // no separation between the class-conditional means: the
            // adjustment is undefined, keep the uncorrected rate
            sample_mean
        } else {
            (sample_mean - negative_mean) / spread
        };
        Ok(prevalence::as_binary(estimate, true))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}

/// DMy: generic distribution matching over posterior histograms, for binary
/// and multiclass problems alike.
///
/// The reference distributions have one channel per class dimension (binary
/// problems collapse to a single channel by symmetry); the estimate is the
/// mixture on the probability simplex minimizing the mean divergence across
/// channels.
#[derive(Clone)]
pub struct DMy {
    stage: ClassifierStage,
    n_bins: usize,
    divergence: Divergence,
    cdf: bool,
    reference: Vec<Array2<f64>>,
}

impl DMy {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        DMy {
            stage: ClassifierStage::new(classifier, ValidationPolicy::KFold(5)),
            n_bins: 8,
            divergence: Divergence::Hellinger,
            cdf: false,
            reference: Vec::new(),
        }
    }

    fn channels(n_classes: usize) -> usize {
        if n_classes == 2 {
            1
        } else {
            n_classes
        }
    }

    /// Per-channel histograms of a posterior matrix: `(channels, bins)`.
    fn distributions(&self, posteriors: &Array2<f64>) -> Array2<f64> {
        let channels = DMy::channels(posteriors.ncols());
        let mut out = Array2::<f64>::zeros((channels, self.n_bins));
        for channel in 0..channels {
            let values = posteriors.column(channel).to_vec();
            let hist = stats::histogram(&values, self.n_bins, self.cdf);
            for (b, &v) in hist.iter().enumerate() {
                out[[channel, b]] = v;
            }
        }
        out
    }
}

impl Quantifier for DMy {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()> {
        fit_pipeline(self, data, ctx)
    }

    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>> {
        quantify_pipeline(self, instances)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        if stage_set_param(&mut self.stage, name, value)? {
            return Ok(());
        }
        match name {
            "n_bins" => {
                self.n_bins = value.as_usize()?;
                Ok(())
            }
            "divergence" => {
                self.divergence = value.as_str()?.parse()?;
                Ok(())
            }
            "cdf" => {
                self.cdf = value.as_bool()?;
                Ok(())
            }
            _ => Err(unknown_param(self.name(), name)),
        }
    }

    fn clone_box(&self) -> Box<dyn Quantifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "DMy"
    }
}

impl AggregativeQuantifier for DMy {
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
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let fitted = fitted.ok_or_else(|| {
            Error::InvalidConfig("DMy needs evaluation predictions; configure a validation split".into())
        })?;
        let posteriors = fitted.predictions.as_soft()?;
        let n_classes = data.n_classes();

        // per-class posterior groups, reduced to histograms in parallel
        let groups: Vec<Array2<f64>> = (0..n_classes)
            .map(|class| {
                let members: Vec<usize> = fitted
                    .labels
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &y)| (y == class).then_some(i))
                    .collect();
                let mut group = Array2::<f64>::zeros((members.len(), posteriors.ncols()));
                for (row, &m) in members.iter().enumerate() {
                    for c in 0..posteriors.ncols() {
                        group[[row, c]] = posteriors[[m, c]];
                    }
                }
                group
            })
            .collect();
        self.reference = ctx.map_indexed(groups, |_, group| self.distributions(&group));
        Ok(())
    }

    fn aggregate(&self, predictions: &Predictions) -> Result<Array1<f64>> {
        if self.reference.is_empty() {
            return Err(Error::InvalidConfig("DMy aggregate called before fit".into()));
        }
        let posteriors = predictions.as_soft()?;
        let test = self.distributions(posteriors);
        let n_classes = self.reference.len();
        let channels = test.nrows();

        let objective = |candidate: &Array1<f64>| {
            let mut total = 0.0;
            for channel in 0..channels {
                let mut mixture = Array1::<f64>::zeros(self.n_bins);
                for class in 0..n_classes {
                    for b in 0..self.n_bins {
                        mixture[b] += candidate[class] * self.reference[class][[channel, b]];
                    }
                }
                let observed = test.row(channel).to_owned();
                total += self.divergence.compute(&observed, &mixture);
            }
            total / channels as f64
        };
        Ok(stats::minimize_on_simplex(objective, n_classes))
    }

    fn clone_aggregative(&self) -> Box<dyn AggregativeQuantifier> {
        Box::new(self.clone())
    }
}
