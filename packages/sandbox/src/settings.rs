// ABOUTME: Sandbox settings shared by every session of a process
// ABOUTME: Workspace root, resource ceilings, timeouts and compile-failure policy

use crate::providers::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_WORKSPACE_ROOT: &str = "/tmp/code_execution";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Parent of every session workspace
    pub workspace_root: PathBuf,
    pub limits: ResourceLimits,
    /// How long to wait for the exit status after output closes
    pub wait_timeout: Duration,
    /// Wall-clock limit per phase; `None` lets a phase run until it exits
    pub phase_timeout: Option<Duration>,
    /// Skip the run phase when compilation exits nonzero
    pub abort_on_compile_failure: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            limits: ResourceLimits::default(),
            wait_timeout: Duration::from_secs(10),
            phase_timeout: None,
            abort_on_compile_failure: false,
        }
    }
}

impl SandboxSettings {
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }
}
