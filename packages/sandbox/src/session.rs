// ABOUTME: Execution session manager driving one submission from workspace to teardown
// ABOUTME: Owns the session state machine, phase sequencing and the single error boundary

use crate::events::{
    EventSink, ExecutionEvent, Utf8Chunker, STATUS_COMPILING, STATUS_COMPLETE, STATUS_RUNNING,
    STATUS_STARTING,
};
use crate::providers::{Phase, PhaseEvent, PhaseSpec, Provider, ProviderError, ResourceLimits};
use crate::settings::SandboxSettings;
use crate::workspace::Workspace;
use crate::{LanguageProfile, LanguageRegistry};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Compilation exited with code {0}")]
    CompileFailure(i64),

    #[error("Process exited with code {0}")]
    RunFailure(i64),

    #[error("Docker error: {0}")]
    Backend(ProviderError),

    #[error("Timed out after {0:?} waiting for the process exit status")]
    TerminalWaitTimeout(Duration),

    #[error("Execution timed out after {} seconds", .0.as_secs())]
    PhaseTimeout(Duration),

    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("Invalid session state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl From<ProviderError> for SessionError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::WaitTimeout(timeout) => SessionError::TerminalWaitTimeout(timeout),
            ProviderError::PhaseTimeout(limit) => SessionError::PhaseTimeout(limit),
            other => SessionError::Backend(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Initiation message of an execution channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Submitted source, written to the workspace byte for byte
    #[serde(default)]
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "python".to_string()
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
        }
    }
}

/// Session lifecycle. Declaration order is the only direction a session moves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Provisioned,
    Compiling,
    Running,
    Completed,
    Failed,
    CleanedUp,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (CleanedUp, _) => false,
            (Completed | Failed, CleanedUp) => true,
            (Completed | Failed, _) => false,
            (_, CleanedUp) => false,
            (Running, Completed) => true,
            (_, Completed) => false,
            (_, Failed) => true,
            (from, to) => to > from,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub compile_started_at: Option<DateTime<Utc>>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One end-to-end lifecycle instance, owned by the manager for its whole life
#[derive(Debug)]
pub struct ExecutionSession {
    id: String,
    profile: LanguageProfile,
    limits: ResourceLimits,
    state: SessionState,
    workspace: Option<Workspace>,
    timestamps: PhaseTimestamps,
    compile_exit_code: Option<i64>,
    exit_code: Option<i64>,
    error: Option<String>,
}

impl ExecutionSession {
    pub fn new(id: String, profile: LanguageProfile, limits: ResourceLimits) -> Self {
        Self {
            id,
            profile,
            limits,
            state: SessionState::Created,
            workspace: None,
            timestamps: PhaseTimestamps {
                created_at: Some(Utc::now()),
                ..Default::default()
            },
            compile_exit_code: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &LanguageProfile {
        &self.profile
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn timestamps(&self) -> &PhaseTimestamps {
        &self.timestamps
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(Workspace::path)
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let now = Some(Utc::now());
        match next {
            SessionState::Compiling => self.timestamps.compile_started_at = now,
            SessionState::Running => self.timestamps.run_started_at = now,
            SessionState::Completed | SessionState::Failed => self.timestamps.finished_at = now,
            _ => {}
        }

        debug!(from = ?self.state, to = ?next, "Session state transition");
        self.state = next;
        Ok(())
    }

    async fn provision(&mut self, root: &Path) -> Result<()> {
        self.workspace = Some(Workspace::allocate(root, &self.id).await?);
        self.transition(SessionState::Provisioned)
    }

    fn workspace(&self) -> Result<&Workspace> {
        self.workspace.as_ref().ok_or_else(|| {
            SessionError::Workspace(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "session has no workspace",
            ))
        })
    }

    fn fail(&mut self, error: &SessionError) {
        self.error = Some(error.to_string());
        if !self.state.is_terminal() {
            // Failed is reachable from every non-terminal state
            let _ = self.transition(SessionState::Failed);
        }
    }

    /// Remove the workspace, if any, and finish the lifecycle
    async fn cleanup(&mut self) -> std::io::Result<()> {
        let removal = match self.workspace.take() {
            Some(workspace) => workspace.remove().await,
            None => Ok(()),
        };
        if !self.state.is_terminal() {
            let _ = self.transition(SessionState::Failed);
        }
        let _ = self.transition(SessionState::CleanedUp);
        removal
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            language: self.profile.id.clone(),
            state: self.state,
            compile_exit_code: self.compile_exit_code,
            exit_code: self.exit_code,
            error: self.error.clone(),
            timestamps: self.timestamps.clone(),
        }
    }
}

/// What a finished session looked like, for logging and tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub language: String,
    pub state: SessionState,
    pub compile_exit_code: Option<i64>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub timestamps: PhaseTimestamps,
}

impl SessionSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Deliver one event, waiting while the client's queue is full.
async fn emit(events: &EventSink, event: ExecutionEvent) {
    if events.send(event).await.is_err() {
        trace!("Event receiver closed, session continues");
    }
}

/// Orchestrates execution sessions over a shared registry and backend.
///
/// Sessions share nothing but these two read-only handles; every session gets
/// its own workspace and its own execution units.
pub struct SessionManager {
    registry: Arc<LanguageRegistry>,
    provider: Arc<dyn Provider>,
    settings: SandboxSettings,
}

impl SessionManager {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        provider: Arc<dyn Provider>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            registry,
            provider,
            settings,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Run one submission end to end.
    ///
    /// Every fault is reported as a single `Error` event on `events`; the
    /// workspace is gone by the time this returns. `events` is dropped on
    /// return, which is how the receiving side learns the session is over.
    pub async fn start(&self, request: ExecutionRequest, events: EventSink) -> SessionSummary {
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("session", session_id = %session_id, language = %request.language);

        self.run_session(session_id, request, events)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        session_id: String,
        request: ExecutionRequest,
        events: EventSink,
    ) -> SessionSummary {
        let Some(profile) = self.registry.resolve(&request.language).cloned() else {
            let error = SessionError::UnsupportedLanguage(request.language.clone());
            warn!("Rejected session: {}", error);
            emit(&events, ExecutionEvent::error(error.to_string())).await;
            return SessionSummary {
                session_id,
                language: request.language,
                state: SessionState::Failed,
                compile_exit_code: None,
                exit_code: None,
                error: Some(error.to_string()),
                timestamps: PhaseTimestamps::default(),
            };
        };

        info!("Session started");
        let mut session = ExecutionSession::new(session_id, profile, self.settings.limits.clone());

        if let Err(error) = self.drive(&mut session, request.code.as_bytes(), &events).await {
            warn!("Session failed: {}", error);
            emit(&events, ExecutionEvent::error(error.to_string())).await;
            session.fail(&error);
        }

        if let Err(e) = session.cleanup().await {
            warn!("Failed to remove workspace: {}", e);
        }

        let summary = session.summary();
        info!(
            state = ?summary.state,
            exit_code = ?summary.exit_code,
            "Session finished"
        );
        summary
    }

    async fn drive(
        &self,
        session: &mut ExecutionSession,
        code: &[u8],
        events: &EventSink,
    ) -> Result<()> {
        session.provision(&self.settings.workspace_root).await?;
        session
            .workspace()?
            .write_source(&session.profile.source_file, code)
            .await?;
        emit(events, ExecutionEvent::status(STATUS_STARTING)).await;

        if let Some(compile) = session.profile.compile.clone() {
            session.transition(SessionState::Compiling)?;
            emit(events, ExecutionEvent::status(STATUS_COMPILING)).await;

            let exit_code = self
                .run_phase(session, Phase::Compile, compile, events)
                .await?;
            session.compile_exit_code = Some(exit_code);

            if exit_code != 0 {
                let failure = SessionError::CompileFailure(exit_code);
                if self.settings.abort_on_compile_failure {
                    return Err(failure);
                }
                // The run phase still goes ahead and reports its own outcome
                warn!("{}", failure);
                emit(events, ExecutionEvent::error(failure.to_string())).await;
            }
        }

        session.transition(SessionState::Running)?;
        emit(events, ExecutionEvent::status(STATUS_RUNNING)).await;

        let run = session.profile.run.clone();
        let exit_code = self.run_phase(session, Phase::Run, run, events).await?;
        session.exit_code = Some(exit_code);

        if exit_code != 0 {
            return Err(SessionError::RunFailure(exit_code));
        }

        session.transition(SessionState::Completed)?;
        emit(events, ExecutionEvent::status(STATUS_COMPLETE)).await;
        Ok(())
    }

    /// Run one phase to completion, relaying its output. The phase's unit is
    /// gone when this returns.
    async fn run_phase(
        &self,
        session: &ExecutionSession,
        phase: Phase,
        command: Vec<String>,
        events: &EventSink,
    ) -> Result<i64> {
        let spec = PhaseSpec {
            session_id: session.id.clone(),
            phase,
            image: session.profile.image.clone(),
            command,
            workspace: session.workspace()?.path().to_path_buf(),
            limits: session.limits.clone(),
            wait_timeout: self.settings.wait_timeout,
            phase_timeout: self.settings.phase_timeout,
        };

        debug!(phase = %phase, "Starting phase");
        let mut stream = self.provider.run_phase(spec).await?;
        let mut decoder = Utf8Chunker::new();
        let mut exit_code = None;

        while let Some(event) = stream.next().await {
            match event? {
                PhaseEvent::Output(chunk) => {
                    let text = decoder.push(&chunk.data);
                    if !text.is_empty() {
                        emit(events, ExecutionEvent::Output(text)).await;
                    }
                }
                PhaseEvent::Exited(code) => {
                    exit_code = Some(code);
                    break;
                }
            }
        }
        drop(stream);

        let tail = decoder.finish();
        if !tail.is_empty() {
            emit(events, ExecutionEvent::Output(tail)).await;
        }

        let exit_code = exit_code.ok_or_else(|| {
            ProviderError::ProtocolError(format!(
                "{} phase output ended without an exit status",
                phase
            ))
        })?;
        debug!(phase = %phase, exit_code, "Phase finished");
        Ok(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Created.can_transition_to(Provisioned));
        assert!(Provisioned.can_transition_to(Compiling));
        assert!(Provisioned.can_transition_to(Running));
        assert!(Compiling.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Completed.can_transition_to(CleanedUp));
        assert!(Failed.can_transition_to(CleanedUp));
    }

    #[test]
    fn test_states_are_never_revisited() {
        assert!(!Running.can_transition_to(Compiling));
        assert!(!Running.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!CleanedUp.can_transition_to(Created));
        assert!(!Compiling.can_transition_to(Completed));
        assert!(!Running.can_transition_to(CleanedUp));
    }

    #[test]
    fn test_failure_reachable_from_any_live_state() {
        for state in [Created, Provisioned, Compiling, Running] {
            assert!(state.can_transition_to(Failed), "{:?} -> Failed", state);
        }
    }

    #[test]
    fn test_session_records_phase_timestamps() {
        let profile = LanguageRegistry::new().unwrap().resolve("cpp").cloned().unwrap();
        let mut session = ExecutionSession::new("s".to_string(), profile, ResourceLimits::default());
        session.transition(Provisioned).unwrap();
        session.transition(Compiling).unwrap();
        session.transition(Running).unwrap();
        session.transition(Completed).unwrap();

        let ts = session.timestamps();
        assert!(ts.compile_started_at.is_some());
        assert!(ts.run_started_at.is_some());
        assert!(ts.finished_at.is_some());
        assert!(matches!(
            session.transition(Running),
            Err(SessionError::InvalidTransition { from: Completed, to: Running })
        ));
    }

    #[test]
    fn test_provider_timeouts_map_to_distinct_kinds() {
        let wait: SessionError = ProviderError::WaitTimeout(Duration::from_secs(10)).into();
        assert!(matches!(wait, SessionError::TerminalWaitTimeout(_)));

        let phase: SessionError = ProviderError::PhaseTimeout(Duration::from_secs(5)).into();
        assert_eq!(phase.to_string(), "Execution timed out after 5 seconds");

        let backend: SessionError = ProviderError::ConnectionError("refused".to_string()).into();
        assert_eq!(backend.to_string(), "Docker error: Connection error: refused");
    }

    #[test]
    fn test_request_defaults() {
        let request: ExecutionRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.language, "python");
        assert_eq!(request.code, "");
    }
}
