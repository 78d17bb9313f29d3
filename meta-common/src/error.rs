use thiserror::Error;

use crate::store::StoreError;

/// Error codes surfaced at the meta service boundary.
#[derive(Error, Debug)]
pub enum MetaError {
    /// Nothing to do; the space is already balanced.
    #[error("space is already balanced")]
    Balanced,
    #[error("space or data not found")]
    NotFound,
    /// The meta store leader moved; the caller should re-dispatch.
    #[error("meta store leader changed")]
    LeaderChanged,
    #[error("meta store failure: {0}")]
    StoreFailure(String),
    /// A move was refused because it would break the write quorum, or no
    /// target host satisfies the placement constraints.
    #[error("no valid host: {0}")]
    NoValidHost(String),
    #[error("bad balance plan: {0}")]
    BadBalancePlan(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MetaError {
    /// Stable code string used in API responses and job records.
    pub fn code(&self) -> &'static str {
        match self {
            MetaError::Balanced => "E_BALANCED",
            MetaError::NotFound => "E_NOT_FOUND",
            MetaError::LeaderChanged => "E_LEADER_CHANGED",
            MetaError::StoreFailure(_) => "E_STORE_FAILURE",
            MetaError::NoValidHost(_) => "E_NO_VALID_HOST",
            MetaError::BadBalancePlan(_) => "E_BAD_BALANCE_PLAN",
            MetaError::InvalidParameter(_) => "E_INVALID_PARM",
            MetaError::Unknown(_) => "E_UNKNOWN",
        }
    }
}

impl From<StoreError> for MetaError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::KeyNotFound => MetaError::NotFound,
            StoreError::LeaderChanged => MetaError::LeaderChanged,
            StoreError::Internal(message) => MetaError::StoreFailure(message),
        }
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(error: serde_json::Error) -> Self {
        MetaError::StoreFailure(format!("corrupt record: {error}"))
    }
}
