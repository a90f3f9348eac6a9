//! Quantification error metrics and protocol-based evaluation.

use std::str::FromStr;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::aggregative::Quantifier;
use crate::error::{Error, Result};
use crate::protocol::SamplingProtocol;

/// Error between a true and an estimated prevalence vector; lower is better.
///
/// The ratio-based metrics (MRAE, KLD) smooth both vectors with the usual
/// additive factor `1 / (2 * sample_size)` to stay finite at zero
/// prevalence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMetric {
    /// Mean absolute error.
    Mae,
    /// Mean relative absolute error, smoothed.
    Mrae,
    /// Mean squared error.
    Mse,
    /// Kullback-Leibler divergence, smoothed.
    Kld,
}

impl FromStr for ErrorMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mae" | "ae" => Ok(ErrorMetric::Mae),
            "mrae" | "rae" => Ok(ErrorMetric::Mrae),
            "mse" | "se" => Ok(ErrorMetric::Mse),
            "kld" => Ok(ErrorMetric::Kld),
            _ => Err(Error::InvalidConfig(format!(
                "unknown error metric '{}'; available ones are mae, mrae, mse, and kld",
                s
            ))),
        }
    }
}

fn smooth(prevalence: &Array1<f64>, eps: f64) -> Array1<f64> {
    let denom = 1.0 + eps * prevalence.len() as f64;
    prevalence.mapv(|v| (v + eps) / denom)
}

impl ErrorMetric {
    /// Error of `estimate` against `truth`. `sample_size` feeds the
    /// smoothing factor of the ratio-based metrics; absent, a small fixed
    /// epsilon is used.
    pub fn compute(
        &self,
        truth: &Array1<f64>,
        estimate: &Array1<f64>,
        sample_size: Option<usize>,
    ) -> f64 {
        debug_assert_eq!(truth.len(), estimate.len());
        let n = truth.len() as f64;
        match self {
            ErrorMetric::Mae => {
                truth
                    .iter()
                    .zip(estimate.iter())
                    .map(|(t, e)| (t - e).abs())
                    .sum::<f64>()
                    / n
            }
            ErrorMetric::Mse => {
                truth
                    .iter()
                    .zip(estimate.iter())
                    .map(|(t, e)| (t - e) * (t - e))
                    .sum::<f64>()
                    / n
            }
            ErrorMetric::Mrae => {
                let eps = sample_size.map(|s| 1.0 / (2.0 * s as f64)).unwrap_or(1e-8);
                let t = smooth(truth, eps);
                let e = smooth(estimate, eps);
                t.iter()
                    .zip(e.iter())
                    .map(|(t, e)| (t - e).abs() / t)
                    .sum::<f64>()
                    / n
            }
            ErrorMetric::Kld => {
                let eps = sample_size.map(|s| 1.0 / (2.0 * s as f64)).unwrap_or(1e-8);
                let t = smooth(truth, eps);
                let e = smooth(estimate, eps);
                t.iter()
                    .zip(e.iter())
                    .map(|(t, e)| t * (t / e).ln())
                    .sum::<f64>()
            }
        }
    }
}

/// Average metric of a fitted quantifier over every sample the protocol
/// generates.
pub fn evaluate(
    model: &dyn Quantifier,
    protocol: &dyn SamplingProtocol,
    metric: ErrorMetric,
) -> Result<f64> {
    let mut total = 0.0;
    let mut count = 0usize;
    for (sample, truth) in protocol.iterate() {
        let estimate = model.quantify(&sample)?;
        total += metric.compute(&truth, &estimate, Some(sample.nrows()));
        count += 1;
    }
    if count == 0 {
        return Err(Error::InvalidConfig(
            "the sampling protocol generated no samples".into(),
        ));
    }
    Ok(total / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mae_of_identical_vectors_is_zero() {
        let p = Array1::from_vec(vec![0.2, 0.8]);
        assert_eq!(ErrorMetric::Mae.compute(&p, &p, None), 0.0);
    }

    #[test]
    fn mae_matches_hand_computation() {
        let t = Array1::from_vec(vec![0.3, 0.7]);
        let e = Array1::from_vec(vec![0.5, 0.5]);
        assert!((ErrorMetric::Mae.compute(&t, &e, None) - 0.2).abs() < 1e-12);
        assert!((ErrorMetric::Mse.compute(&t, &e, None) - 0.04).abs() < 1e-12);
    }

    #[test]
    fn ratio_metrics_stay_finite_at_zero_prevalence() {
        let t = Array1::from_vec(vec![0.0, 1.0]);
        let e = Array1::from_vec(vec![0.5, 0.5]);
        let mrae = ErrorMetric::Mrae.compute(&t, &e, Some(100));
        let kld = ErrorMetric::Kld.compute(&t, &e, Some(100));
        assert!(mrae.is_finite());
        assert!(kld.is_finite());
        assert!(mrae > 0.0);
        assert!(kld > 0.0);
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("mae".parse::<ErrorMetric>().unwrap(), ErrorMetric::Mae);
        assert_eq!("KLD".parse::<ErrorMetric>().unwrap(), ErrorMetric::Kld);
        assert!("accuracy".parse::<ErrorMetric>().is_err());
    }
}
