use std::error::Error as StdError;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by quantifier construction, fitting and model selection.
///
/// Numeric degeneracies (singular confusion matrices, empty histogram bins,
/// zero-range threshold denominators) are deliberately *not* represented
/// here: they are recovered locally by falling back to an uncorrected or
/// default estimate.
#[derive(Debug)]
pub enum Error {
    /// An invalid parameter or an inconsistent fit request (bad validation
    /// split, k <= 1, unknown hyper-parameter, malformed data).
    InvalidConfig(String),
    /// The classifier does not expose the prediction capability the
    /// quantifier requires, and adaptation was not permitted.
    CapabilityMismatch {
        classifier: String,
        required: &'static str,
    },
    /// A binary-only method was given data with more or fewer than two classes.
    NonBinaryData {
        method: &'static str,
        n_classes: usize,
    },
    /// The divergence name is not one of the supported measures.
    UnknownDivergence(String),
    /// The posterior recalibration name is not one of the supported transforms.
    UnknownRecalibration(String),
    /// Every grid-search configuration timed out or failed, leaving nothing
    /// to select from.
    SelectionExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::CapabilityMismatch {
                classifier,
                required,
            } => write!(
                f,
                "classifier '{}' does not provide {} predictions and cannot be adapted",
                classifier, required
            ),
            Error::NonBinaryData { method, n_classes } => write!(
                f,
                "{} is a binary-only method but the data has {} classes",
                method, n_classes
            ),
            Error::UnknownDivergence(name) => write!(
                f,
                "unknown divergence '{}'; available ones are \"HD\" and \"topsoe\"",
                name
            ),
            Error::UnknownRecalibration(name) => write!(
                f,
                "unknown recalibration '{}'; available ones are \"nbvs\", \"bcts\", \"ts\", and \"vs\"",
                name
            ),
            Error::SelectionExhausted => {
                write!(f, "all configurations timed out or failed during model selection")
            }
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_offending_name() {
        let err = Error::UnknownDivergence("wasserstein".to_string());
        assert!(err.to_string().contains("wasserstein"));

        let err = Error::NonBinaryData {
            method: "HDy",
            n_classes: 3,
        };
        assert!(err.to_string().contains("HDy"));
        assert!(err.to_string().contains('3'));
    }
}
