//! Numeric routines shared by the quantification methods.
//!
//! Divergence measures and histograms for the distribution-matching family,
//! a ternary search and a simplex minimizer for mixture-weight fitting, and
//! a small dense linear solver for the confusion-matrix adjustment.

use std::str::FromStr;

use ndarray::{Array1, Array2};

use crate::error::Error;

const EPS: f64 = 1e-20;

/// Divergence measure between two discrete distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Hellinger distance, normalized into [0, 1].
    Hellinger,
    /// Topsoe divergence (symmetrized Kullback-Leibler variant).
    Topsoe,
}

impl Divergence {
    pub fn compute(&self, p: &Array1<f64>, q: &Array1<f64>) -> f64 {
        debug_assert_eq!(p.len(), q.len());
        match self {
            Divergence::Hellinger => {
                let acc: f64 = p
                    .iter()
                    .zip(q.iter())
                    .map(|(&a, &b)| {
                        let d = a.max(0.0).sqrt() - b.max(0.0).sqrt();
                        d * d
                    })
                    .sum();
                (0.5 * acc).sqrt()
            }
            Divergence::Topsoe => p
                .iter()
                .zip(q.iter())
                .map(|(&a, &b)| {
                    a * ((2.0 * a + EPS) / (a + b + EPS)).ln()
                        + b * ((2.0 * b + EPS) / (a + b + EPS)).ln()
                })
                .sum(),
        }
    }
}

impl FromStr for Divergence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hd" | "hellinger" => Ok(Divergence::Hellinger),
            "topsoe" => Ok(Divergence::Topsoe),
            _ => Err(Error::UnknownDivergence(s.to_string())),
        }
    }
}

/// Normalized histogram of `values` over `bins` equal-width bins in [0, 1].
///
/// Values outside the range land in the boundary bins. With `cumulative`
/// set, the running sum is returned (a discrete CDF). An empty input maps
/// to the flat histogram so downstream divergences stay finite.
pub fn histogram(values: &[f64], bins: usize, cumulative: bool) -> Array1<f64> {
    let mut counts = Array1::<f64>::zeros(bins);
    if values.is_empty() {
        counts.fill(1.0 / bins as f64);
    } else {
        for &v in values {
            let idx = ((v.clamp(0.0, 1.0) * bins as f64) as usize).min(bins - 1);
            counts[idx] += 1.0;
        }
        counts /= values.len() as f64;
    }
    if cumulative {
        let mut acc = 0.0;
        counts.mapv_inplace(|v| {
            acc += v;
            acc
        });
    }
    counts
}

/// Minimum of a unimodal function over `[left, right]` by ternary search.
pub fn ternary_search<F: Fn(f64) -> f64>(f: F, mut left: f64, mut right: f64, tol: f64) -> f64 {
    while (right - left).abs() >= tol {
        let left_third = left + (right - left) / 3.0;
        let right_third = right - (right - left) / 3.0;
        if f(left_third) > f(right_third) {
            left = left_third;
        } else {
            right = right_third;
        }
    }
    (left + right) / 2.0
}

/// Solve `a * x = b` by Gaussian elimination with partial pivoting.
///
/// Returns `None` when the system is (numerically) singular; callers fall
/// back to their uncorrected estimate in that case.
pub fn solve_linear(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return None;
    }
    let mut m = a.clone();
    let mut rhs = b.clone();

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_abs = m[[col, col]].abs();
        for row in col + 1..n {
            let candidate = m[[row, col]].abs();
            if candidate > pivot_abs {
                pivot_abs = candidate;
                pivot_row = row;
            }
        }
        if pivot_abs < 1e-10 {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                let tmp = m[[col, k]];
                m[[col, k]] = m[[pivot_row, k]];
                m[[pivot_row, k]] = tmp;
            }
            rhs.swap(col, pivot_row);
        }
        for row in col + 1..n {
            let factor = m[[row, col]] / m[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                m[[row, k]] -= factor * m[[col, k]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for k in row + 1..n {
            acc -= m[[row, k]] * x[k];
        }
        x[row] = acc / m[[row, row]];
    }
    Some(x)
}

/// Median of a sample; the average of the two middle values for even sizes.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Softmax over `z` extended with an implicit trailing zero logit.
fn softmax_extended(z: &[f64]) -> Array1<f64> {
    let max = z.iter().copied().fold(0.0f64, f64::max);
    let mut out: Vec<f64> = z.iter().map(|&v| (v - max).exp()).collect();
    out.push((-max).exp());
    let total: f64 = out.iter().sum();
    Array1::from_vec(out.into_iter().map(|v| v / total).collect())
}

/// Minimize `loss` over the probability simplex of dimension `n_classes`.
///
/// Deterministic Nelder-Mead over an unconstrained softmax parameterization
/// (n_classes - 1 free logits). Good enough for the smooth, low-dimensional
/// mixture-matching objectives it serves; not a general-purpose optimizer.
pub fn minimize_on_simplex<F>(loss: F, n_classes: usize) -> Array1<f64>
where
    F: Fn(&Array1<f64>) -> f64,
{
    if n_classes <= 1 {
        return Array1::from_elem(n_classes.max(1), 1.0);
    }
    let dim = n_classes - 1;
    let eval = |z: &[f64]| loss(&softmax_extended(z));

    // initial simplex around the uniform prevalence
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(dim + 1);
    simplex.push(vec![0.0; dim]);
    for i in 0..dim {
        let mut vertex = vec![0.0; dim];
        vertex[i] = 0.5;
        simplex.push(vertex);
    }
    let mut scores: Vec<f64> = simplex.iter().map(|z| eval(z)).collect();

    let max_iter = 200 * dim.max(1);
    for _ in 0..max_iter {
        let mut order: Vec<usize> = (0..simplex.len()).collect();
        order.sort_by(|&a, &b| {
            scores[a]
                .partial_cmp(&scores[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        scores = order.iter().map(|&i| scores[i]).collect();

        if (scores[dim] - scores[0]).abs() < 1e-10 {
            break;
        }

        let centroid: Vec<f64> = (0..dim)
            .map(|k| simplex[..dim].iter().map(|v| v[k]).sum::<f64>() / dim as f64)
            .collect();
        let worst = simplex[dim].clone();

        let reflect: Vec<f64> = (0..dim)
            .map(|k| centroid[k] + (centroid[k] - worst[k]))
            .collect();
        let reflect_score = eval(&reflect);

        if reflect_score < scores[0] {
            let expand: Vec<f64> = (0..dim)
                .map(|k| centroid[k] + 2.0 * (centroid[k] - worst[k]))
                .collect();
            let expand_score = eval(&expand);
            if expand_score < reflect_score {
                simplex[dim] = expand;
                scores[dim] = expand_score;
            } else {
                simplex[dim] = reflect;
                scores[dim] = reflect_score;
            }
        } else if reflect_score < scores[dim - 1] {
            simplex[dim] = reflect;
            scores[dim] = reflect_score;
        } else {
            let contract: Vec<f64> = (0..dim)
                .map(|k| centroid[k] + 0.5 * (worst[k] - centroid[k]))
                .collect();
            let contract_score = eval(&contract);
            if contract_score < scores[dim] {
                simplex[dim] = contract;
                scores[dim] = contract_score;
            } else {
                // shrink toward the best vertex
                let best = simplex[0].clone();
                for i in 1..=dim {
                    for k in 0..dim {
                        simplex[i][k] = best[k] + 0.5 * (simplex[i][k] - best[k]);
                    }
                    scores[i] = eval(&simplex[i]);
                }
            }
        }
    }

    let best = scores
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);
    softmax_extended(&simplex[best])
}
