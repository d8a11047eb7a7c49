// ABOUTME: Language profile registry and public surface of the execution sandbox
// ABOUTME: Loads language definitions from config/languages.json or a caller-supplied table

pub mod events;
pub mod health;
pub mod providers;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod workspace;

pub use events::{EventSink, ExecutionEvent, Utf8Chunker, EVENT_BUFFER};
pub use health::{ImagePreparer, Readiness, ReadinessState};
pub use providers::{
    DockerProvider, OutputChunk, Phase, PhaseEvent, PhaseSpec, PhaseStream, Provider,
    ProviderError, ResourceLimits, StreamType,
};
pub use session::{
    ExecutionRequest, ExecutionSession, SessionError, SessionManager, SessionState,
    SessionSummary,
};
pub use settings::SandboxSettings;
pub use workspace::Workspace;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to load languages config: {0}")]
    LoadError(String),
    #[error("Invalid language configuration: {0}")]
    InvalidConfig(String),
}

type Result<T> = std::result::Result<T, RegistryError>;

/// Execution recipe for one supported language.
///
/// Commands are argument vectors handed to the container runtime as-is; they
/// are never spliced into a shell string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: String,
    pub image: String,
    pub source_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

impl LanguageProfile {
    pub fn has_compile_step(&self) -> bool {
        self.compile.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                "language id must not be empty".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(format!(
                "language '{}' has no image",
                self.id
            )));
        }
        if !is_bare_file_name(&self.source_file) {
            return Err(RegistryError::InvalidConfig(format!(
                "language '{}' source_file must be a plain file name, got '{}'",
                self.id, self.source_file
            )));
        }
        if self.run.is_empty() {
            return Err(RegistryError::InvalidConfig(format!(
                "language '{}' has an empty run command",
                self.id
            )));
        }
        if matches!(&self.compile, Some(cmd) if cmd.is_empty()) {
            return Err(RegistryError::InvalidConfig(format!(
                "language '{}' has an empty compile command",
                self.id
            )));
        }
        Ok(())
    }
}

fn is_bare_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
        && !name.contains('\\')
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesConfig {
    version: String,
    languages: Vec<LanguageProfile>,
}

/// Immutable catalog of language profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: Vec<LanguageProfile>,
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    /// Load the built-in table shipped with the crate
    pub fn new() -> Result<Self> {
        Self::from_json(include_str!("../config/languages.json"))
    }

    /// Load a table from a JSON document with the same shape as config/languages.json
    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: LanguagesConfig = serde_json::from_str(config_json)
            .map_err(|e| RegistryError::LoadError(e.to_string()))?;
        Self::from_profiles(config.languages)
    }

    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self> {
        let mut index = HashMap::new();
        for (position, profile) in profiles.iter().enumerate() {
            profile.validate()?;
            if index.insert(profile.id.clone(), position).is_some() {
                return Err(RegistryError::InvalidConfig(format!(
                    "duplicate language id '{}'",
                    profile.id
                )));
            }
        }

        Ok(Self { profiles, index })
    }

    pub fn resolve(&self, id: &str) -> Option<&LanguageProfile> {
        self.index.get(id).map(|&position| &self.profiles[position])
    }

    /// Language identifiers in declaration order
    pub fn ids(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.id.as_str()).collect()
    }

    /// Distinct images referenced by the catalog, in declaration order
    pub fn images(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.profiles
            .iter()
            .map(|p| p.image.as_str())
            .filter(|image| seen.insert(*image))
            .collect()
    }

    pub fn profiles(&self) -> &[LanguageProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, source_file: &str) -> LanguageProfile {
        LanguageProfile {
            id: id.to_string(),
            image: "alpine:latest".to_string(),
            source_file: source_file.to_string(),
            compile: None,
            run: vec!["sh".to_string(), source_file.to_string()],
        }
    }

    #[test]
    fn test_load_builtin_languages() {
        let registry = LanguageRegistry::new().unwrap();
        assert_eq!(registry.ids(), vec!["python", "cpp", "java"]);
    }

    #[test]
    fn test_resolve_language() {
        let registry = LanguageRegistry::new().unwrap();
        let python = registry.resolve("python").unwrap();
        assert_eq!(python.source_file, "main.py");
        assert!(!python.has_compile_step());

        let cpp = registry.resolve("cpp").unwrap();
        assert!(cpp.has_compile_step());
        assert_eq!(cpp.run, vec!["./program".to_string()]);
    }

    #[test]
    fn test_resolve_unknown_language() {
        let registry = LanguageRegistry::new().unwrap();
        assert!(registry.resolve("brainfuck").is_none());
        assert!(registry.resolve("Python").is_none());
    }

    #[test]
    fn test_images_are_deduplicated() {
        let mut a = profile("a", "a.sh");
        let mut b = profile("b", "b.sh");
        a.image = "shared:1".to_string();
        b.image = "shared:1".to_string();
        let registry = LanguageRegistry::from_profiles(vec![a, b, profile("c", "c.sh")]).unwrap();
        assert_eq!(registry.images(), vec!["shared:1", "alpine:latest"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = LanguageRegistry::from_profiles(vec![profile("sh", "a.sh"), profile("sh", "b.sh")]);
        assert!(matches!(result, Err(RegistryError::InvalidConfig(_))));
    }

    #[test]
    fn test_source_file_must_be_bare_name() {
        for bad in ["../main.py", "dir/main.py", "/etc/passwd", "..", ".", ""] {
            let result = LanguageRegistry::from_profiles(vec![profile("sh", bad)]);
            assert!(result.is_err(), "'{}' should be rejected", bad);
        }
    }

    #[test]
    fn test_empty_commands_rejected() {
        let mut no_run = profile("sh", "main.sh");
        no_run.run.clear();
        assert!(LanguageRegistry::from_profiles(vec![no_run]).is_err());

        let mut empty_compile = profile("sh", "main.sh");
        empty_compile.compile = Some(vec![]);
        assert!(LanguageRegistry::from_profiles(vec![empty_compile]).is_err());
    }

    #[test]
    fn test_from_json_reports_load_error() {
        let result = LanguageRegistry::from_json("{ not json");
        assert!(matches!(result, Err(RegistryError::LoadError(_))));
    }
}
