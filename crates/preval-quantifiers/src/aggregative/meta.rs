//! Meta-quantifiers: the one-vs-all generalizer and the median ensemble.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::aggregative::{
    fit_pipeline, quantify_pipeline, AggregativeQuantifier, FittedPredictions, Quantifier,
};
use crate::config::ExecutionContext;
use crate::data::LabelledCollection;
use crate::error::{Error, Result};
use crate::model_selection::{ParamConfig, ParamGrid, ParamValue};
use crate::prevalence;
use crate::stats;

/// One-vs-all generalization of a binary quantifier to multiclass data.
///
/// One copy of the base quantifier is trained per class (in parallel) on a
/// binarized view of the data; at inference the concatenated positive-class
/// estimates are L1-normalized into a prevalence vector.
#[derive(Clone)]
pub struct OneVsAll {
    base: Box<dyn AggregativeQuantifier>,
    members: Vec<Box<dyn AggregativeQuantifier>>,
}

impl OneVsAll {
    pub fn new(base: Box<dyn AggregativeQuantifier>) -> Self {
        OneVsAll {
            base,
            members: Vec::new(),
        }
    }

    /// Two-class view of `data` where `class` is positive (label 1).
    fn binarize(data: &LabelledCollection, class: usize) -> Result<LabelledCollection> {
        let labels: Vec<usize> = data
            .labels()
            .iter()
            .map(|&y| usize::from(y == class))
            .collect();
        LabelledCollection::new(data.instances().clone(), labels, 2)
    }

    pub fn members(&self) -> &[Box<dyn AggregativeQuantifier>] {
        &self.members
    }
}

impl Quantifier for OneVsAll {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()> {
        let n_classes = data.n_classes();
        if n_classes < 2 {
            return Err(Error::InvalidConfig(
                "one-vs-all needs at least two classes".into(),
            ));
        }
        let fitted: Vec<Result<Box<dyn AggregativeQuantifier>>> =
            ctx.map_indexed((0..n_classes).collect(), |i, class| {
                let binary = OneVsAll::binarize(data, class)?;
                let mut member = self.base.clone_aggregative();
                fit_pipeline(member.as_mut(), &binary, &ctx.worker(i))?;
                Ok(member)
            });
        self.members = fitted.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>> {
        if self.members.is_empty() {
            return Err(Error::InvalidConfig(
                "one-vs-all quantify called before fit".into(),
            ));
        }
        let mut positives = Array1::<f64>::zeros(self.members.len());
        for (class, member) in self.members.iter().enumerate() {
            let estimate = quantify_pipeline(member.as_ref(), instances)?;
            positives[class] = estimate[1];
        }
        Ok(prevalence::normalize(positives))
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        self.base.set_param(name, value)
    }

    fn clone_box(&self) -> Box<dyn Quantifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "OneVsAll"
    }
}

/// Median ensemble over a hyper-parameter grid of a binary base quantifier.
///
/// One member is trained per grid point. Classifier-affecting parameters
/// are grouped so each distinct classifier configuration is fit (and its
/// evaluation predictions produced) exactly once, shared across all
/// aggregation-only variations. The ensemble estimate is the elementwise
/// median of the members' estimates, which is itself a valid prevalence
/// vector in the binary case.
#[derive(Clone)]
pub struct MedianEnsemble {
    base: Box<dyn AggregativeQuantifier>,
    grid: ParamGrid,
    members: Vec<Box<dyn AggregativeQuantifier>>,
}

impl MedianEnsemble {
    pub fn new(base: Box<dyn AggregativeQuantifier>, grid: ParamGrid) -> Self {
        MedianEnsemble {
            base,
            grid,
            members: Vec::new(),
        }
    }

    pub fn members(&self) -> &[Box<dyn AggregativeQuantifier>] {
        &self.members
    }

    fn apply_config(
        quantifier: &mut dyn AggregativeQuantifier,
        config: &ParamConfig,
    ) -> Result<()> {
        for (name, value) in config {
            quantifier.set_param(name, value)?;
        }
        Ok(())
    }
}

impl Quantifier for MedianEnsemble {
    fn fit(&mut self, data: &LabelledCollection, ctx: &ExecutionContext) -> Result<()> {
        if data.n_classes() != 2 {
            return Err(Error::NonBinaryData {
                method: self.name(),
                n_classes: data.n_classes(),
            });
        }
        let (classifier_grid, aggregation_grid) = self.grid.split_classifier_params();
        let classifier_configs = classifier_grid.expand();
        let aggregation_configs = aggregation_grid.expand();

        // phase 1: one classifier fit (plus evaluation predictions) per
        // distinct classifier configuration
        type Prepared = (Box<dyn AggregativeQuantifier>, Arc<Option<FittedPredictions>>);
        let prepared: Vec<Result<Prepared>> =
            ctx.map_indexed(classifier_configs, |i, config| {
                let mut model = self.base.clone_aggregative();
                MedianEnsemble::apply_config(model.as_mut(), &config)?;
                let kind = model.prediction_kind();
                let fitted = model.stage_mut().fit_predict(data, kind, &ctx.worker(i))?;
                Ok((model, Arc::new(fitted)))
            });
        let prepared = prepared.into_iter().collect::<Result<Vec<Prepared>>>()?;

        // phase 2: the aggregation fit for every (classifier, aggregation)
        // pair, reusing the shared predictions
        let pairs: Vec<(usize, ParamConfig)> = (0..prepared.len())
            .flat_map(|m| {
                aggregation_configs
                    .iter()
                    .cloned()
                    .map(move |config| (m, config))
            })
            .collect();
        let members: Vec<Result<Box<dyn AggregativeQuantifier>>> =
            ctx.map_indexed(pairs, |i, (m, config)| {
                let (model, fitted) = &prepared[m];
                let shared: Option<&FittedPredictions> = (**fitted).as_ref();
                let mut member = model.clone_aggregative();
                MedianEnsemble::apply_config(member.as_mut(), &config)?;
                member.aggregation_fit(shared, data, &ctx.worker(i))?;
                Ok(member)
            });
        self.members = members.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn quantify(&self, instances: &Array2<f64>) -> Result<Array1<f64>> {
        if self.members.is_empty() {
            return Err(Error::InvalidConfig(
                "median ensemble quantify called before fit".into(),
            ));
        }
        let estimates: Vec<Array1<f64>> = self
            .members
            .iter()
            .map(|member| quantify_pipeline(member.as_ref(), instances))
            .collect::<Result<Vec<_>>>()?;

        let n_classes = estimates[0].len();
        let mut combined = Array1::<f64>::zeros(n_classes);
        for class in 0..n_classes {
            let mut values: Vec<f64> = estimates.iter().map(|e| e[class]).collect();
            combined[class] = stats::median(&mut values);
        }
        Ok(combined)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        self.base.set_param(name, value)
    }

    fn clone_box(&self) -> Box<dyn Quantifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "MedianEnsemble"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn binarize_maps_the_positive_class_to_one() {
        let x = Array2::zeros((4, 1));
        let data = LabelledCollection::new(x, vec![0, 1, 2, 1], 3).unwrap();
        let binary = OneVsAll::binarize(&data, 1).unwrap();
        assert_eq!(binary.labels(), &[0, 1, 0, 1]);
        assert_eq!(binary.n_classes(), 2);
    }

    #[test]
    fn quantify_before_fit_is_an_error() {
        let base = crate::aggregative::CC::new(Box::new(
            crate::classifier::CentroidClassifier::default(),
        ));
        let ova = OneVsAll::new(Box::new(base));
        let x = Array2::zeros((2, 1));
        assert!(ova.quantify(&x).is_err());
    }
}
