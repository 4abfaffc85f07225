pub mod client;

pub use client::BackendClient;

use std::fmt;

use async_trait::async_trait;

/// Why a single backend attempt failed. Timeouts, transport errors, and
/// non-success statuses are all equivalent to the retry loop; the variants
/// exist for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// The attempt exceeded the per-attempt deadline.
    Timeout,
    /// The backend answered with a non-success status.
    Status(u16),
    /// Connection or protocol failure before a status arrived.
    Transport(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Timeout => write!(f, "backend attempt timed out"),
            AttemptError::Status(code) => write!(f, "backend returned status {}", code),
            AttemptError::Transport(detail) => write!(f, "transport error: {}", detail),
        }
    }
}

impl std::error::Error for AttemptError {}

/// Seam between the proxy executor and the backend. Production uses
/// [`BackendClient`]; tests script outcomes.
#[async_trait]
pub trait BackendCall: Send + Sync {
    /// One attempt against the backend, bounded by the caller's configured
    /// per-attempt timeout.
    async fn call(&self) -> Result<(), AttemptError>;
}
