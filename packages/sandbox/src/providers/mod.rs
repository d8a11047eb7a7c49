// ABOUTME: Provider trait for the isolated execution backend
// ABOUTME: Defines phase specs, resource limits and the streamed phase output contract

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

/// Infrastructure faults. A user program exiting nonzero is never one of these;
/// that is reported through [`PhaseEvent::Exited`].
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Timed out after {0:?} waiting for the container to report its exit status")]
    WaitTimeout(Duration),

    #[error("Execution timed out after {} seconds", .0.as_secs())]
    PhaseTimeout(Duration),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Which step of a session an execution unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource policy applied to every execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// CFS accounting period in microseconds
    pub cpu_period: i64,
    /// CFS quota per period in microseconds (quota / period = share of one core)
    pub cpu_quota: i64,
    pub network_disabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            cpu_period: 100_000,
            cpu_quota: 50_000,
            network_disabled: true,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }
}

/// Everything the backend needs to run one phase of one session
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub session_id: String,
    pub phase: Phase,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory mounted read-write as the unit's working directory
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    /// Bound on the wait for the exit status once output has closed
    pub wait_timeout: Duration,
    /// Optional wall-clock limit for the whole phase
    pub phase_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub enum PhaseEvent {
    Output(OutputChunk),
    /// Final item of a well-formed phase stream
    Exited(i64),
}

/// Ordered, lazily produced output of one phase, terminated by `PhaseEvent::Exited`
pub type PhaseStream = BoxStream<'static, Result<PhaseEvent>>;

/// Isolated execution backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the backend daemon is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Check if an image exists locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create an execution unit for the phase, start it and stream its output.
    ///
    /// The unit is torn down by the time the stream yields `Exited`, and on
    /// every other path once the stream is dropped.
    async fn run_phase(&self, spec: PhaseSpec) -> Result<PhaseStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes(), 256 * 1024 * 1024);
        assert_eq!((limits.cpu_period, limits.cpu_quota), (100_000, 50_000));
        assert!(limits.network_disabled);
    }

    #[test]
    fn test_phase_timeout_message() {
        let err = ProviderError::PhaseTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Execution timed out after 30 seconds");
    }
}
