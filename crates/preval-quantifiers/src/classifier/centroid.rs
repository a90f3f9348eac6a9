use ndarray::{Array2, Axis};

use crate::classifier::Classifier;
use crate::error::{Error, Result};
use crate::model_selection::ParamValue;

/// Nearest-centroid classifier with softmax posteriors.
///
/// A deliberately small model: it exists so the quantification pipeline can
/// be exercised end to end (demos, tests) without an external learner. The
/// `temperature` parameter scales the squared distances before the softmax,
/// trading sharp against smooth posteriors.
#[derive(Debug, Clone)]
pub struct CentroidClassifier {
    temperature: f64,
    centroids: Option<Array2<f64>>,
}

impl CentroidClassifier {
    pub fn new(temperature: f64) -> Self {
        CentroidClassifier {
            temperature,
            centroids: None,
        }
    }

    fn distances(&self, x: &Array2<f64>) -> Array2<f64> {
        let centroids = self
            .centroids
            .as_ref()
            .expect("CentroidClassifier used before fit");
        let n = x.nrows();
        let k = centroids.nrows();
        let mut out = Array2::<f64>::zeros((n, k));
        for (i, row) in x.outer_iter().enumerate() {
            for (c, centroid) in centroids.outer_iter().enumerate() {
                let d2: f64 = row
                    .iter()
                    .zip(centroid.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                out[[i, c]] = d2;
            }
        }
        out
    }
}

impl Default for CentroidClassifier {
    fn default() -> Self {
        CentroidClassifier::new(1.0)
    }
}

impl Classifier for CentroidClassifier {
    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<()> {
        if x.nrows() != y.len() || y.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "cannot fit on {} rows with {} labels",
                x.nrows(),
                y.len()
            )));
        }
        let n_classes = y.iter().max().map(|&m| m + 1).unwrap_or(0);
        let n_features = x.ncols();
        let mut sums = Array2::<f64>::zeros((n_classes, n_features));
        let mut counts = vec![0usize; n_classes];
        for (row, &label) in x.outer_iter().zip(y.iter()) {
            for (f, &v) in row.iter().enumerate() {
                sums[[label, f]] += v;
            }
            counts[label] += 1;
        }
        let global_mean = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| ndarray::Array1::zeros(n_features));
        for c in 0..n_classes {
            if counts[c] == 0 {
                log::debug!("class {} has no training instances; centroid set to the global mean", c);
                for f in 0..n_features {
                    sums[[c, f]] = global_mean[f];
                }
            } else {
                for f in 0..n_features {
                    sums[[c, f]] /= counts[c] as f64;
                }
            }
        }
        self.centroids = Some(sums);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Vec<usize> {
        let dists = self.distances(x);
        dists
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(c, _)| c)
                    .unwrap_or(0)
            })
            .collect()
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut scores = self.distances(x);
        let temp = self.temperature.max(1e-9);
        for mut row in scores.outer_iter_mut() {
            let min = row.iter().copied().fold(f64::INFINITY, f64::min);
            let mut total = 0.0;
            for v in row.iter_mut() {
                *v = (-(*v - min) / temp).exp();
                total += *v;
            }
            for v in row.iter_mut() {
                *v /= total;
            }
        }
        Ok(scores)
    }

    fn supports_proba(&self) -> bool {
        true
    }

    fn n_classes(&self) -> usize {
        self.centroids.as_ref().map(|c| c.nrows()).unwrap_or(0)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        match name {
            "temperature" => {
                self.temperature = value.as_f64()?;
                Ok(())
            }
            _ => Err(Error::InvalidConfig(format!(
                "classifier 'centroid' has no parameter '{}'",
                name
            ))),
        }
    }

    fn clone_box(&self) -> Box<dyn Classifier> {
        Box::new(self.clone())
    }

    fn name(&self) -> &str {
        "centroid"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable() -> (Array2<f64>, Vec<usize>) {
        let x = Array2::from_shape_vec(
            (6, 2),
            vec![
                0.0, 0.0, //
                0.1, 0.0, //
                0.0, 0.1, //
                5.0, 5.0, //
                5.1, 5.0, //
                5.0, 5.1, //
            ],
        )
        .unwrap();
        (x, vec![0, 0, 0, 1, 1, 1])
    }

    #[test]
    fn recovers_separable_labels() {
        let (x, y) = separable();
        let mut clf = CentroidClassifier::default();
        clf.fit(&x, &y).unwrap();
        assert_eq!(clf.predict(&x), y);
        assert_eq!(clf.n_classes(), 2);
    }

    #[test]
    fn posteriors_are_row_stochastic() {
        let (x, y) = separable();
        let mut clf = CentroidClassifier::default();
        clf.fit(&x, &y).unwrap();
        let probs = clf.predict_proba(&x).unwrap();
        for row in probs.outer_iter() {
            let total: f64 = row.sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
        // the first instance is near the class-0 centroid
        assert!(probs[[0, 0]] > probs[[0, 1]]);
    }

    #[test]
    fn temperature_is_settable() {
        let mut clf = CentroidClassifier::default();
        clf.set_param("temperature", &ParamValue::Float(4.0)).unwrap();
        assert!(clf.set_param("depth", &ParamValue::Int(3)).is_err());
    }
}
