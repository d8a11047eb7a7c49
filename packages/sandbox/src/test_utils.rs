// ABOUTME: Scripted in-memory provider for exercising sessions without a Docker daemon
// ABOUTME: Records every phase invocation and the workspace contents it observed

use crate::providers::{
    OutputChunk, Phase, PhaseEvent, PhaseSpec, PhaseStream, Provider, ProviderError,
    ResourceLimits, Result, StreamType,
};
use async_stream::try_stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a scripted phase ends
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Exit(i64),
    /// `run_phase` itself fails, before any unit exists
    CreateFails(String),
    /// Output stream breaks after the scripted output
    StreamFails(String),
    WaitTimeout,
    PhaseTimeout(Duration),
    /// Stream closes without an exit status
    NoExit,
}

#[derive(Debug, Clone)]
pub struct ScriptedPhase {
    pub output: Vec<Vec<u8>>,
    pub outcome: ScriptedOutcome,
}

impl ScriptedPhase {
    pub fn exit(code: i64, output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|s| s.as_bytes().to_vec()).collect(),
            outcome: ScriptedOutcome::Exit(code),
        }
    }

    pub fn outcome(outcome: ScriptedOutcome) -> Self {
        Self {
            output: Vec::new(),
            outcome,
        }
    }
}

/// What the provider saw when a phase was started
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub session_id: String,
    pub phase: Phase,
    pub image: String,
    pub command: Vec<String>,
    pub workspace: PathBuf,
    pub limits: ResourceLimits,
    pub workspace_files: Vec<String>,
    /// Bytes of every workspace file, keyed by file name
    pub workspace_contents: BTreeMap<String, Vec<u8>>,
    /// Units alive (including this one) when the phase started
    pub active_units: usize,
}

#[derive(Default)]
pub struct FakeProvider {
    scripts: Mutex<HashMap<Phase, ScriptedPhase>>,
    unavailable: bool,
    missing_images: Mutex<HashSet<String>>,
    pulled: Mutex<Vec<String>>,
    records: Mutex<Vec<PhaseRecord>>,
    active: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_phase(self, phase: Phase, script: ScriptedPhase) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(phase, script);
        self
    }

    pub fn with_missing_image(self, image: &str) -> Self {
        self.missing_images
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(image.to_string());
        self
    }

    pub fn records(&self) -> Vec<PhaseRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.pulled.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn active_units(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveUnit(Arc<AtomicUsize>);

impl Drop for ActiveUnit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| {
                    let contents = std::fs::read(e.path()).unwrap_or_default();
                    (e.file_name().to_string_lossy().into_owned(), contents)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Provider for FakeProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(!self.unavailable)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(!self
            .missing_images
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.missing_images
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(image);
        self.pulled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(image.to_string());
        Ok(())
    }

    async fn run_phase(&self, spec: PhaseSpec) -> Result<PhaseStream> {
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&spec.phase)
            .cloned()
            .unwrap_or_else(|| ScriptedPhase::exit(0, &[]));

        if let ScriptedOutcome::CreateFails(message) = &script.outcome {
            return Err(ProviderError::ContainerError(message.clone()));
        }

        let active_units = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let unit = ActiveUnit(self.active.clone());
        let workspace_contents = snapshot(&spec.workspace);

        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PhaseRecord {
                session_id: spec.session_id.clone(),
                phase: spec.phase,
                image: spec.image.clone(),
                command: spec.command.clone(),
                workspace: spec.workspace.clone(),
                limits: spec.limits.clone(),
                workspace_files: workspace_contents.keys().cloned().collect(),
                workspace_contents,
                active_units,
            });

        let wait_timeout = spec.wait_timeout;
        let stream = try_stream! {
            let unit = unit;
            for data in script.output {
                tokio::task::yield_now().await;
                yield PhaseEvent::Output(OutputChunk {
                    timestamp: chrono::Utc::now(),
                    stream: StreamType::Stdout,
                    data,
                });
            }

            match script.outcome {
                ScriptedOutcome::Exit(code) => {
                    drop(unit);
                    yield PhaseEvent::Exited(code);
                }
                ScriptedOutcome::StreamFails(message) => {
                    Err::<(), _>(ProviderError::StreamError(message))?;
                }
                ScriptedOutcome::WaitTimeout => {
                    Err::<(), _>(ProviderError::WaitTimeout(wait_timeout))?;
                }
                ScriptedOutcome::PhaseTimeout(limit) => {
                    Err::<(), _>(ProviderError::PhaseTimeout(limit))?;
                }
                ScriptedOutcome::NoExit | ScriptedOutcome::CreateFails(_) => {}
            }
        };

        Ok(Box::pin(stream))
    }
}
