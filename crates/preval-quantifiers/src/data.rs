//! Labelled instance collections and their sampling operations.
//!
//! A [`LabelledCollection`] pairs a feature matrix (opaque to the
//! quantification core) with integer labels over a class set that is fixed
//! at construction. Collections are read-only after creation: every
//! operation returns a new collection or plain index sets.

use ndarray::{concatenate, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::prevalence;

#[derive(Debug, Clone)]
pub struct LabelledCollection {
    instances: Array2<f64>,
    labels: Vec<usize>,
    n_classes: usize,
}

impl LabelledCollection {
    /// Build a collection over the ordered class set `0..n_classes`.
    ///
    /// Every label must belong to the class set; the set itself never
    /// changes after construction, even if some class has no instances.
    pub fn new(instances: Array2<f64>, labels: Vec<usize>, n_classes: usize) -> Result<Self> {
        if instances.nrows() != labels.len() {
            return Err(Error::InvalidConfig(format!(
                "feature matrix has {} rows but {} labels were given",
                instances.nrows(),
                labels.len()
            )));
        }
        if n_classes == 0 {
            return Err(Error::InvalidConfig("the class set cannot be empty".into()));
        }
        if let Some(&bad) = labels.iter().find(|&&y| y >= n_classes) {
            return Err(Error::InvalidConfig(format!(
                "label {} outside the class set 0..{}",
                bad, n_classes
            )));
        }
        Ok(LabelledCollection {
            instances,
            labels,
            n_classes,
        })
    }

    /// Build a collection inferring the class set from the labels seen.
    pub fn from_labels(instances: Array2<f64>, labels: Vec<usize>) -> Result<Self> {
        let n_classes = labels.iter().max().map(|&m| m + 1).unwrap_or(0);
        Self::new(instances, labels, n_classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn instances(&self) -> &Array2<f64> {
        &self.instances
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Per-class instance counts, indexed by class.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_classes];
        for &y in &self.labels {
            counts[y] += 1;
        }
        counts
    }

    /// Normalized class-count vector; sums to one.
    pub fn prevalence(&self) -> Array1<f64> {
        prevalence::from_labels(&self.labels, self.n_classes)
    }

    /// New collection containing the given rows, in the given order.
    pub fn select(&self, indices: &[usize]) -> LabelledCollection {
        LabelledCollection {
            instances: self.instances.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            n_classes: self.n_classes,
        }
    }

    fn indices_by_class(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.n_classes];
        for (i, &y) in self.labels.iter().enumerate() {
            groups[y].push(i);
        }
        groups
    }

    /// Split into two disjoint collections, preserving class ratios.
    ///
    /// `train_prop` is the fraction kept in the first collection.
    pub fn split_stratified(
        &self,
        train_prop: f64,
        rng: &mut StdRng,
    ) -> Result<(LabelledCollection, LabelledCollection)> {
        if !(0.0..1.0).contains(&train_prop) || train_prop == 0.0 {
            return Err(Error::InvalidConfig(format!(
                "split proportion {} out of range, must be in (0,1)",
                train_prop
            )));
        }
        let mut train_idx = Vec::new();
        let mut held_idx = Vec::new();
        for mut group in self.indices_by_class() {
            group.shuffle(rng);
            let n_train = (group.len() as f64 * train_prop).round() as usize;
            let n_train = n_train.min(group.len());
            train_idx.extend_from_slice(&group[..n_train]);
            held_idx.extend_from_slice(&group[n_train..]);
        }
        train_idx.sort_unstable();
        held_idx.sort_unstable();
        Ok((self.select(&train_idx), self.select(&held_idx)))
    }

    /// Stratified k-fold partition as (train, test) index pairs.
    ///
    /// Instances of each class are dealt round-robin over the folds, so
    /// every instance appears in exactly one test fold.
    pub fn kfold(&self, k: usize, rng: &mut StdRng) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
        if k <= 1 {
            return Err(Error::InvalidConfig(format!(
                "invalid fold count {}; specify an integer > 1 for cross-validation",
                k
            )));
        }
        if k > self.len() {
            return Err(Error::InvalidConfig(format!(
                "cannot build {} folds out of {} instances",
                k,
                self.len()
            )));
        }
        let mut fold_of = vec![0usize; self.len()];
        for mut group in self.indices_by_class() {
            group.shuffle(rng);
            for (pos, idx) in group.into_iter().enumerate() {
                fold_of[idx] = pos % k;
            }
        }
        let folds = (0..k)
            .map(|fold| {
                let mut train = Vec::new();
                let mut test = Vec::new();
                for (idx, &assigned) in fold_of.iter().enumerate() {
                    if assigned == fold {
                        test.push(idx);
                    } else {
                        train.push(idx);
                    }
                }
                (train, test)
            })
            .collect();
        Ok(folds)
    }

    /// Concatenate two collections with identical class sets.
    pub fn concat(&self, other: &LabelledCollection) -> Result<LabelledCollection> {
        if self.n_classes != other.n_classes {
            return Err(Error::InvalidConfig(format!(
                "cannot concatenate collections over {} and {} classes",
                self.n_classes, other.n_classes
            )));
        }
        if self.instances.ncols() != other.instances.ncols() {
            return Err(Error::InvalidConfig(format!(
                "cannot concatenate collections with {} and {} features",
                self.instances.ncols(),
                other.instances.ncols()
            )));
        }
        let instances = concatenate(Axis(0), &[self.instances.view(), other.instances.view()])
            .map_err(|e| Error::InvalidConfig(format!("concatenation failed: {}", e)))?;
        let mut labels = self.labels.clone();
        labels.extend_from_slice(&other.labels);
        Ok(LabelledCollection {
            instances,
            labels,
            n_classes: self.n_classes,
        })
    }

    /// Draw a sample of `size` instances at (approximately) the requested
    /// prevalence, returning the sample and the prevalence actually drawn.
    ///
    /// Per-class quotas follow the largest-remainder rule. Classes with
    /// fewer instances than their quota are drawn with replacement; classes
    /// absent from this collection contribute nothing and the remaining
    /// quotas are renormalized through the achieved prevalence.
    pub fn sample_at_prevalence(
        &self,
        size: usize,
        target: &Array1<f64>,
        rng: &mut StdRng,
    ) -> (Array2<f64>, Array1<f64>) {
        let groups = self.indices_by_class();
        let mut quotas = vec![0usize; self.n_classes];
        let mut remainders: Vec<(usize, f64)> = Vec::with_capacity(self.n_classes);
        let mut assigned = 0usize;
        for c in 0..self.n_classes {
            if groups[c].is_empty() {
                remainders.push((c, -1.0));
                continue;
            }
            let exact = target.get(c).copied().unwrap_or(0.0).max(0.0) * size as f64;
            quotas[c] = exact.floor() as usize;
            assigned += quotas[c];
            remainders.push((c, exact - exact.floor()));
        }
        remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut leftover = size.saturating_sub(assigned);
        for &(c, frac) in &remainders {
            if leftover == 0 {
                break;
            }
            if frac >= 0.0 {
                quotas[c] += 1;
                leftover -= 1;
            }
        }

        let mut drawn: Vec<usize> = Vec::with_capacity(size);
        for c in 0..self.n_classes {
            let group = &groups[c];
            if group.is_empty() || quotas[c] == 0 {
                continue;
            }
            if quotas[c] <= group.len() {
                drawn.extend(group.choose_multiple(rng, quotas[c]).copied());
            } else {
                for _ in 0..quotas[c] {
                    drawn.push(group[rng.gen_range(0..group.len())]);
                }
            }
        }
        drawn.shuffle(rng);

        let sample = self.instances.select(Axis(0), &drawn);
        let labels: Vec<usize> = drawn.iter().map(|&i| self.labels[i]).collect();
        let achieved = prevalence::from_labels(&labels, self.n_classes);
        (sample, achieved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy(n_per_class: &[usize]) -> LabelledCollection {
        let total: usize = n_per_class.iter().sum();
        let mut rows = Vec::with_capacity(total * 2);
        let mut labels = Vec::with_capacity(total);
        for (c, &n) in n_per_class.iter().enumerate() {
            for i in 0..n {
                rows.push(c as f64);
                rows.push(i as f64);
                labels.push(c);
            }
        }
        let x = Array2::from_shape_vec((total, 2), rows).unwrap();
        LabelledCollection::new(x, labels, n_per_class.len()).unwrap()
    }

    #[test]
    fn rejects_labels_outside_the_class_set() {
        let x = Array2::zeros((3, 2));
        let err = LabelledCollection::new(x, vec![0, 1, 5], 2).unwrap_err();
        assert!(err.to_string().contains("outside the class set"));
    }

    #[test]
    fn prevalence_sums_to_one() {
        let data = toy(&[30, 10, 60]);
        let prev = data.prevalence();
        assert!((prev.sum() - 1.0).abs() < 1e-9);
        assert!((prev[0] - 0.3).abs() < 1e-9);
        assert!((prev[2] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn stratified_split_preserves_class_ratios() {
        let data = toy(&[40, 60]);
        let mut rng = StdRng::seed_from_u64(1);
        let (train, held) = data.split_stratified(0.5, &mut rng).unwrap();
        assert_eq!(train.len(), 50);
        assert_eq!(held.len(), 50);
        assert!((train.prevalence()[0] - 0.4).abs() < 1e-9);
        assert!((held.prevalence()[1] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn split_rejects_out_of_range_proportion() {
        let data = toy(&[5, 5]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(data.split_stratified(0.0, &mut rng).is_err());
        assert!(data.split_stratified(1.0, &mut rng).is_err());
    }

    #[test]
    fn kfold_covers_every_instance_exactly_once() {
        let data = toy(&[12, 8]);
        let mut rng = StdRng::seed_from_u64(3);
        let folds = data.kfold(4, &mut rng).unwrap();
        assert_eq!(folds.len(), 4);
        let mut seen = vec![0usize; data.len()];
        for (train, test) in &folds {
            assert_eq!(train.len() + test.len(), data.len());
            for &i in test {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn kfold_rejects_degenerate_k() {
        let data = toy(&[4, 4]);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(data.kfold(1, &mut rng).is_err());
    }

    #[test]
    fn concat_requires_matching_class_sets() {
        let a = toy(&[3, 3]);
        let b = toy(&[2, 2, 2]);
        assert!(a.concat(&b).is_err());

        let c = toy(&[1, 5]);
        let joined = a.concat(&c).unwrap();
        assert_eq!(joined.len(), 12);
        assert_eq!(joined.n_classes(), 2);
    }

    #[test]
    fn sampling_hits_the_requested_prevalence() {
        let data = toy(&[100, 100]);
        let mut rng = StdRng::seed_from_u64(11);
        let target = Array1::from_vec(vec![0.3, 0.7]);
        let (sample, achieved) = data.sample_at_prevalence(50, &target, &mut rng);
        assert_eq!(sample.nrows(), 50);
        assert!((achieved[0] - 0.3).abs() < 1e-9);
        assert!((achieved[1] - 0.7).abs() < 1e-9);
    }

    #[test]
    fn sampling_draws_with_replacement_when_short() {
        let data = toy(&[2, 50]);
        let mut rng = StdRng::seed_from_u64(11);
        let target = Array1::from_vec(vec![0.5, 0.5]);
        let (sample, achieved) = data.sample_at_prevalence(40, &target, &mut rng);
        assert_eq!(sample.nrows(), 40);
        assert!((achieved.sum() - 1.0).abs() < 1e-9);
        assert!(achieved[0] > 0.4);
    }
}
