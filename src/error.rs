//! Error types shared by the master and node controllers.

use thiserror::Error;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Bad cluster range, prefix length or other startup configuration.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid node IP: {0}")]
    AddressInvalid(String),

    #[error("no subnets available in {0}")]
    PoolExhausted(String),

    /// The registry refused a write because the stored object changed or
    /// already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to apply rules: {0}")]
    RuleApplyFailed(String),

    #[error("failed to get subnet for host {name} after {attempts} attempts")]
    StartupTimeout { name: String, attempts: u32 },

    #[error("failed to resolve address: {0}")]
    Resolve(String),

    #[error("error parsing subnet {subnet:?}: {reason}")]
    SubnetParse { subnet: String, reason: String },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
