//! preval-quantifiers: aggregative quantification methods for class-prevalence estimation.
//!
//! Quantification is the task of estimating the fraction of each class in an
//! unlabeled sample, rather than labelling individual instances. This crate
//! provides the aggregative family of quantifiers (methods that correct the
//! aggregated per-instance outputs of a classifier), the data structures they
//! operate on, evaluation protocols and error metrics, and a grid-search
//! optimizer that selects hyper-parameters under a quantification metric.
//!
//! The design favors small, testable modules: the underlying classifier is an
//! opaque capability behind the [`classifier::Classifier`] trait, and all
//! parallel work is driven by an explicit [`config::ExecutionContext`] rather
//! than ambient global state.
pub mod aggregative;
pub mod classifier;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod model_selection;
pub mod prevalence;
pub mod protocol;
pub mod stats;

pub use error::{Error, Result};
