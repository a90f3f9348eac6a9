use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::classifier::Classifier;
use crate::data::LabelledCollection;
use crate::error::{Error, Result};
use crate::model_selection::ParamValue;

/// Probability-calibration adapter for crisp-only classifiers.
///
/// Under the two-capability contract the only signal a crisp classifier
/// produces is its predicted label, so calibration estimates the
/// conditional table P(true class | predicted class) by 5-fold internal
/// cross-validation and answers `predict_proba` with the predicted label's
/// row. The inner classifier is refit on the full data afterwards.
#[derive(Clone)]
pub struct CalibratedClassifier {
    inner: Box<dyn Classifier>,
    folds: usize,
    table: Option<Array2<f64>>,
}

impl CalibratedClassifier {
    pub fn new(inner: Box<dyn Classifier>) -> Self {
        CalibratedClassifier {
            inner,
            folds: 5,
            table: None,
        }
    }
}

impl Classifier for CalibratedClassifier {
    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<()> {
        let data = LabelledCollection::from_labels(x.clone(), y.to_vec())?;
        let n_classes = data.n_classes();
        let folds = self.folds.min(data.len());
        if folds <= 1 {
            return Err(Error::InvalidConfig(
                "calibration needs at least two instances".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(0);
        let mut counts = Array2::<f64>::zeros((n_classes, n_classes));
        for (train_idx, test_idx) in data.kfold(folds, &mut rng)? {
            let train = data.select(&train_idx);
            let test = data.select(&test_idx);
            let mut fold_clf = self.inner.clone_box();
            fold_clf.fit(train.instances(), train.labels())?;
            for (pred, &truth) in fold_clf
                .predict(test.instances())
                .into_iter()
                .zip(test.labels().iter())
            {
                counts[[pred, truth]] += 1.0;
            }
        }

        // row p becomes P(true | predicted = p); a never-predicted label
        // keeps full confidence in itself
        for p in 0..n_classes {
            let total: f64 = (0..n_classes).map(|t| counts[[p, t]]).sum();
            if total > 0.0 {
                for t in 0..n_classes {
                    counts[[p, t]] /= total;
                }
            } else {
                counts[[p, p]] = 1.0;
            }
        }
        self.table = Some(counts);
        self.inner.fit(x, y)
    }

    fn predict(&self, x: &Array2<f64>) -> Vec<usize> {
        self.inner.predict(x)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let table = self.table.as_ref().ok_or_else(|| {
            Error::InvalidConfig("calibrated classifier used before fit".into())
        })?;
        let n_classes = table.nrows();
        let preds = self.inner.predict(x);
        let mut out = Array2::<f64>::zeros((preds.len(), n_classes));
        for (i, pred) in preds.into_iter().enumerate() {
            for t in 0..n_classes {
                out[[i, t]] = table[[pred, t]];
            }
        }
        Ok(out)
    }

    fn supports_proba(&self) -> bool {
        true
    }

    fn n_classes(&self) -> usize {
        self.table
            .as_ref()
            .map(|t| t.nrows())
            .unwrap_or_else(|| self.inner.n_classes())
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        self.inner.set_param(name, value)
    }

    fn clone_box(&self) -> Box<dyn Classifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &str {
        "calibrated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Crisp-only stub: predicts by thresholding the first feature.
    #[derive(Clone)]
    struct Stump;

    impl Classifier for Stump {
        fn fit(&mut self, _x: &Array2<f64>, _y: &[usize]) -> Result<()> {
            Ok(())
        }

        fn predict(&self, x: &Array2<f64>) -> Vec<usize> {
            x.outer_iter().map(|r| usize::from(r[0] > 0.5)).collect()
        }

        fn n_classes(&self) -> usize {
            2
        }

        fn clone_box(&self) -> Box<dyn Classifier> {
            Box::new(self.clone())
        }

        fn name(&self) -> &str {
            "stump"
        }
    }

    #[test]
    fn calibration_produces_row_stochastic_posteriors() {
        let x = Array2::from_shape_vec(
            (10, 1),
            vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.6, 0.7, 0.8, 0.9, 1.0],
        )
        .unwrap();
        let y = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1];

        assert!(!Stump.supports_proba());
        let mut calibrated = CalibratedClassifier::new(Box::new(Stump));
        calibrated.fit(&x, &y).unwrap();
        assert!(calibrated.supports_proba());

        let probs = calibrated.predict_proba(&x).unwrap();
        assert_eq!(probs.nrows(), 10);
        for row in probs.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        // the stump is perfect on this data, so confidence is total
        assert!(probs[[0, 0]] > 0.99);
        assert!(probs[[9, 1]] > 0.99);
    }

    #[test]
    fn predict_proba_before_fit_is_an_error() {
        let calibrated = CalibratedClassifier::new(Box::new(Stump));
        let x = Array2::zeros((1, 1));
        assert!(calibrated.predict_proba(&x).is_err());
    }
}
