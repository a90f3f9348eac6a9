//! Helpers for building and repairing class-prevalence vectors.
//!
//! A prevalence vector has one entry per class, each in [0, 1], summing to
//! one. Every correction procedure in the crate funnels its raw estimate
//! through [`normalize`] so that the invariant holds even for numerically
//! degenerate inputs.

use itertools_num::linspace;
use ndarray::{Array1, Array2, Axis};

/// Normalized class counts of a label sequence over `n_classes` classes.
pub fn from_labels(labels: &[usize], n_classes: usize) -> Array1<f64> {
    let mut counts = Array1::<f64>::zeros(n_classes);
    for &y in labels {
        counts[y] += 1.0;
    }
    normalize(counts)
}

/// Expected prevalence under a posterior matrix: the per-class column mean.
pub fn from_posteriors(posteriors: &Array2<f64>) -> Array1<f64> {
    match posteriors.mean_axis(Axis(0)) {
        Some(means) => normalize(means),
        None => uniform(posteriors.ncols()),
    }
}

/// Clip entries into [0, 1] and rescale so they sum to one.
///
/// An all-zero (or fully negative) input has no mass to distribute and maps
/// to the uniform vector.
pub fn normalize(mut prevalence: Array1<f64>) -> Array1<f64> {
    prevalence.mapv_inplace(|v| v.clamp(0.0, 1.0));
    let total: f64 = prevalence.sum();
    if total <= 0.0 || !total.is_finite() {
        return uniform(prevalence.len());
    }
    prevalence / total
}

/// The uniform prevalence over `n_classes` classes.
pub fn uniform(n_classes: usize) -> Array1<f64> {
    if n_classes == 0 {
        return Array1::zeros(0);
    }
    Array1::from_elem(n_classes, 1.0 / n_classes as f64)
}

/// Binary prevalence vector `[1 - p, p]` from a positive-class estimate.
///
/// With `clip` set, out-of-range estimates are clamped into [0, 1] first;
/// this is the recovery path for adjusted counts whose correction overshoots.
pub fn as_binary(positive: f64, clip: bool) -> Array1<f64> {
    let p = if clip { positive.clamp(0.0, 1.0) } else { positive };
    Array1::from_vec(vec![1.0 - p, p])
}

/// Evenly spaced candidate prevalence values in [0, 1].
pub fn grid(n_points: usize) -> Vec<f64> {
    linspace(0.0f64, 1.0, n_points).collect()
}

/// Whether `prevalence` is a valid probability vector within `tol`.
pub fn is_valid(prevalence: &Array1<f64>, tol: f64) -> bool {
    prevalence.iter().all(|&v| (-tol..=1.0 + tol).contains(&v))
        && (prevalence.sum() - 1.0).abs() <= tol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_labels_counts_and_normalizes() {
        let prev = from_labels(&[0, 0, 1, 2], 3);
        assert!((prev[0] - 0.5).abs() < 1e-12);
        assert!((prev[1] - 0.25).abs() < 1e-12);
        assert!((prev[2] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn from_labels_keeps_absent_classes() {
        let prev = from_labels(&[1, 1], 3);
        assert_eq!(prev.len(), 3);
        assert_eq!(prev[0], 0.0);
        assert_eq!(prev[2], 0.0);
        assert!((prev.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn normalize_clips_then_rescales() {
        let prev = normalize(Array1::from_vec(vec![-0.2, 0.5, 1.5]));
        assert!(is_valid(&prev, 1e-9));
        assert_eq!(prev[0], 0.0);
        // 1.5 clamps to 1.0 before rescaling
        assert!((prev[2] - 1.0 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn normalize_degenerate_input_is_uniform() {
        let prev = normalize(Array1::from_vec(vec![0.0, 0.0, 0.0, 0.0]));
        for v in prev.iter() {
            assert!((v - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn binary_helper_clips_when_asked() {
        let prev = as_binary(1.7, true);
        assert_eq!(prev[1], 1.0);
        assert_eq!(prev[0], 0.0);
    }

    #[test]
    fn grid_spans_the_unit_interval() {
        let g = grid(101);
        assert_eq!(g.len(), 101);
        assert!((g[0] - 0.0).abs() < 1e-12);
        assert!((g[100] - 1.0).abs() < 1e-12);
        assert!((g[50] - 0.5).abs() < 1e-12);
    }
}
