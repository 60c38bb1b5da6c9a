//! Admission control for new sessions.
//!
//! Two gates apply to every session request: a process-wide cap on
//! concurrent sessions (enforced by the session registry) and a per-client
//! token bucket. Both rejections look the same to the client.

pub mod bucket;
pub mod limiter;

use thiserror::Error;

pub use bucket::TokenBucket;
pub use limiter::RateLimiter;

/// Why a session request was turned away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The client spent its token bucket.
    #[error("rate limit exceeded for client {identity}")]
    RateLimited {
        /// The rejected client.
        identity: String,
    },

    /// The daemon already runs the maximum number of sessions.
    #[error("session limit of {max} reached")]
    AtCapacity {
        /// Configured maximum.
        max: usize,
    },
}
