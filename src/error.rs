//! Crate-level error types
//!
//! Only construction, setup and configuration paths return errors. Runtime
//! connection failures are recorded by the reconnector and never propagate.

use crate::config::ConfigError;
use crate::identity::IdentityError;
use thiserror::Error;

/// Main error type for cloud link operations
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Clock not synchronised")]
    ClockNotReady,
}

impl CloudError {
    /// True for errors the operator fixes by editing configuration or keys
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CloudError::Config(_) | CloudError::Identity(IdentityError::InvalidKey(_))
        )
    }
}

/// Result type for cloud link operations
pub type CloudResult<T> = Result<T, CloudError>;
