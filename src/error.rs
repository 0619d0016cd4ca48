//! Crate-level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! - [`Error`]: configuration, telemetry bootstrap, and embedding failures
//! - [`crate::distribution::DistributionError`]: every failure of the control
//!   core itself, with the classification helpers the supervision loop keys
//!   its restart policy on
//!
//! [`crate::distribution::DistributionError`] converts into [`Error`] via
//! `From`, so embedders can surface a single error type.

use std::result;

use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced to the embedding process.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid configuration supplied by the embedder or the operator.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging/telemetry bootstrap failed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// A control-core failure escaped the supervision loop.
    #[error("Distribution error: {0}")]
    Distribution(#[from] crate::distribution::DistributionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::DistributionError;

    #[test]
    fn test_error_display() {
        let err = Error::Config("bad team size".to_string());
        assert!(err.to_string().contains("bad team size"));
    }

    #[test]
    fn test_distribution_error_converts() {
        let err: Error = DistributionError::MoveKeysConflict.into();
        match err {
            Error::Distribution(DistributionError::MoveKeysConflict) => {}
            other => panic!("unexpected conversion: {other:?}"),
        }
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(Error::Telemetry("init".to_string()));
        assert!(err.to_string().contains("init"));
    }
}
