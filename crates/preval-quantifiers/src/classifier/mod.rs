//! Classifier abstraction consumed by the aggregative quantifiers.
//!
//! The underlying learner is an external capability: quantifiers only need
//! training, one of two fixed prediction contracts (crisp labels or
//! posterior probabilities), and the ordered class list. Which contract a
//! quantifier consumes is declared once via [`PredictionKind`] and checked
//! at fit time, never discovered dynamically.

mod calibration;
mod centroid;

pub use calibration::CalibratedClassifier;
pub use centroid::CentroidClassifier;

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::model_selection::ParamValue;

/// The prediction contract a quantifier consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionKind {
    /// One label per instance.
    Crisp,
    /// One posterior-probability row per instance, summing to one.
    Soft,
}

impl PredictionKind {
    pub fn describe(&self) -> &'static str {
        match self {
            PredictionKind::Crisp => "crisp-label",
            PredictionKind::Soft => "posterior-probability",
        }
    }
}

/// An externally trained (or trainable) classifier.
///
/// Implementations must be cheap to deep-copy via [`Classifier::clone_box`]:
/// parallel workers always operate on their own copy.
pub trait Classifier: Send + Sync {
    /// Train on a feature matrix and integer labels.
    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<()>;

    /// Crisp label predictions, one per row of `x`.
    fn predict(&self, x: &Array2<f64>) -> Vec<usize>;

    /// Posterior probabilities of shape `(n_instances, n_classes)`.
    ///
    /// The default signals that the classifier lacks the capability.
    fn predict_proba(&self, _x: &Array2<f64>) -> Result<Array2<f64>> {
        Err(Error::CapabilityMismatch {
            classifier: self.name().to_string(),
            required: PredictionKind::Soft.describe(),
        })
    }

    /// Whether [`Classifier::predict_proba`] is available.
    fn supports_proba(&self) -> bool {
        false
    }

    /// Number of classes seen at fit time.
    fn n_classes(&self) -> usize;

    /// Ordered class labels, aligned with posterior columns.
    fn classes(&self) -> Vec<usize> {
        (0..self.n_classes()).collect()
    }

    /// Apply a hyper-parameter; unknown names are a configuration error.
    fn set_param(&mut self, name: &str, _value: &ParamValue) -> Result<()> {
        Err(Error::InvalidConfig(format!(
            "classifier '{}' has no parameter '{}'",
            self.name(),
            name
        )))
    }

    fn clone_box(&self) -> Box<dyn Classifier>;

    /// Human readable name for log and error messages.
    fn name(&self) -> &str {
        "classifier"
    }
}

impl Clone for Box<dyn Classifier> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
