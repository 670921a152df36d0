//! Setup-time error types
//!
//! None of these are produced on the RPC path; adapters always hand back the
//! wrapped call's own result.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Invalid histogram buckets: {0}")]
    InvalidBuckets(String),

    #[error("Invalid metrics configuration: {0}")]
    InvalidConfig(String),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Default {0} metrics already initialized")]
    AlreadyInitialized(&'static str),
}

pub type MetricsResult<T> = Result<T, MetricsError>;
