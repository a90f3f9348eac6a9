//! Execution configuration for parallel work.
//!
//! All parallel fan-out in the crate (one-vs-all fits, ensemble members,
//! grid-search trials, per-class histogram construction) goes through an
//! explicit [`ExecutionContext`] passed into the call, never through ambient
//! process-wide state. The context also carries the random seed from which
//! per-worker seeds are derived, so parallel runs are reproducible.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Worker-pool backend used for parallel sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Run units of work on a rayon thread pool.
    Rayon,
    /// Run units of work in the calling thread, in order.
    Sequential,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rayon" | "threads" => Ok(Backend::Rayon),
            "sequential" | "none" => Ok(Backend::Sequential),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

/// Execution context for parallel sections: worker count, backend and seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Number of worker threads; 0 means the pool default.
    pub n_workers: usize,
    pub backend: Backend,
    /// Base seed; workers derive their own seed as `seed + unit index`.
    pub seed: u64,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext {
            n_workers: 0,
            backend: Backend::Rayon,
            seed: 0,
        }
    }
}

impl ExecutionContext {
    pub fn new(n_workers: usize, backend: Backend, seed: u64) -> Self {
        ExecutionContext {
            n_workers,
            backend,
            seed,
        }
    }

    /// A context that runs everything in the calling thread.
    pub fn sequential(seed: u64) -> Self {
        ExecutionContext {
            n_workers: 1,
            backend: Backend::Sequential,
            seed,
        }
    }

    pub fn with_seed(&self, seed: u64) -> Self {
        ExecutionContext { seed, ..self.clone() }
    }

    /// Context handed to the unit of work at `index`: sequential (a worker
    /// must not fan out again) with a per-worker derived seed.
    pub fn worker(&self, index: usize) -> Self {
        ExecutionContext {
            n_workers: 1,
            backend: Backend::Sequential,
            seed: self.seed.wrapping_add(index as u64),
        }
    }

    /// A seeded generator for this context.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Map `op` over `items`, possibly in parallel, preserving input order.
    ///
    /// The result at position `i` always corresponds to `items[i]`: results
    /// are associated by index, not by completion order. `op` receives the
    /// item index so callers can derive per-worker seeds from it.
    pub fn map_indexed<T, R, F>(&self, items: Vec<T>, op: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T) -> R + Send + Sync,
    {
        match self.backend {
            Backend::Sequential => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| op(i, item))
                .collect(),
            Backend::Rayon => {
                if self.n_workers == 0 {
                    return items
                        .into_par_iter()
                        .enumerate()
                        .map(|(i, item)| op(i, item))
                        .collect();
                }
                match rayon::ThreadPoolBuilder::new()
                    .num_threads(self.n_workers)
                    .build()
                {
                    Ok(pool) => pool.install(|| {
                        items
                            .into_par_iter()
                            .enumerate()
                            .map(|(i, item)| op(i, item))
                            .collect()
                    }),
                    Err(err) => {
                        log::warn!("could not build a worker pool ({}); running sequentially", err);
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(i, item)| op(i, item))
                            .collect()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_indexed_preserves_order() {
        let ctx = ExecutionContext::default();
        let out = ctx.map_indexed((0..64).collect::<Vec<usize>>(), |i, v| {
            assert_eq!(i, v);
            v * 2
        });
        assert_eq!(out, (0..64).map(|v| v * 2).collect::<Vec<usize>>());
    }

    #[test]
    fn sequential_backend_runs_in_order() {
        let ctx = ExecutionContext::sequential(7);
        let out = ctx.map_indexed(vec!['a', 'b', 'c'], |i, c| format!("{}{}", i, c));
        assert_eq!(out, vec!["0a", "1b", "2c"]);
    }

    #[test]
    fn worker_contexts_get_derived_seeds() {
        let ctx = ExecutionContext::new(4, Backend::Rayon, 100);
        let w = ctx.worker(3);
        assert_eq!(w.seed, 103);
        assert_eq!(w.backend, Backend::Sequential);
    }

    #[test]
    fn backend_parses_from_str() {
        assert_eq!("rayon".parse::<Backend>().unwrap(), Backend::Rayon);
        assert_eq!("sequential".parse::<Backend>().unwrap(), Backend::Sequential);
        assert!("fibers".parse::<Backend>().is_err());
    }
}
