// ABOUTME: Server configuration loaded from environment variables and an optional .env file
// ABOUTME: Produces the listen address, CORS origin and the sandbox settings for sessions

use coderun_sandbox::{LanguageRegistry, RegistryError, ResourceLimits, SandboxSettings};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("{key} must be greater than zero")]
    MustBePositive { key: &'static str },
    #[error("Failed to read languages file {path}: {source}")]
    LanguagesFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub cors_origin: String,
    pub workspace_root: PathBuf,
    pub limits: ResourceLimits,
    pub wait_timeout: Duration,
    pub phase_timeout: Option<Duration>,
    pub pull_timeout: Duration,
    /// Delay after each output frame sent to a client
    pub output_pacing: Duration,
    pub abort_on_compile_failure: bool,
    /// Replaces the built-in language table when set
    pub languages_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let settings = SandboxSettings::default();
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8000,
            cors_origin: "http://localhost:3000".to_string(),
            workspace_root: settings.workspace_root,
            limits: settings.limits,
            wait_timeout: settings.wait_timeout,
            phase_timeout: settings.phase_timeout,
            pull_timeout: Duration::from_secs(600),
            output_pacing: Duration::from_millis(10),
            abort_on_compile_failure: settings.abort_on_compile_failure,
            languages_file: None,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = lookup("HOST") {
            config.host = parse("HOST", &host)?;
        }

        if let Some(port) = lookup("PORT") {
            config.port = parse("PORT", &port)?;
            if config.port == 0 {
                return Err(ConfigError::PortOutOfRange(config.port));
            }
        }

        if let Some(origin) = lookup("CORS_ORIGIN") {
            config.cors_origin = origin;
        }

        if let Some(root) = lookup("CODERUN_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }

        if let Some(memory) = lookup("CODERUN_MEMORY_MB") {
            config.limits.memory_mb = parse("CODERUN_MEMORY_MB", &memory)?;
            if config.limits.memory_mb == 0 {
                return Err(ConfigError::MustBePositive {
                    key: "CODERUN_MEMORY_MB",
                });
            }
        }

        if let Some(period) = lookup("CODERUN_CPU_PERIOD") {
            config.limits.cpu_period = parse("CODERUN_CPU_PERIOD", &period)?;
            if config.limits.cpu_period <= 0 {
                return Err(ConfigError::MustBePositive {
                    key: "CODERUN_CPU_PERIOD",
                });
            }
        }

        if let Some(quota) = lookup("CODERUN_CPU_QUOTA") {
            config.limits.cpu_quota = parse("CODERUN_CPU_QUOTA", &quota)?;
            if config.limits.cpu_quota <= 0 {
                return Err(ConfigError::MustBePositive {
                    key: "CODERUN_CPU_QUOTA",
                });
            }
        }

        if let Some(secs) = lookup("CODERUN_WAIT_TIMEOUT_SECS") {
            config.wait_timeout = Duration::from_secs(parse("CODERUN_WAIT_TIMEOUT_SECS", &secs)?);
            if config.wait_timeout.is_zero() {
                return Err(ConfigError::MustBePositive {
                    key: "CODERUN_WAIT_TIMEOUT_SECS",
                });
            }
        }

        if let Some(secs) = lookup("CODERUN_PHASE_TIMEOUT_SECS") {
            let secs: u64 = parse("CODERUN_PHASE_TIMEOUT_SECS", &secs)?;
            // 0 disables the limit
            config.phase_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = lookup("CODERUN_PULL_TIMEOUT_SECS") {
            config.pull_timeout = Duration::from_secs(parse("CODERUN_PULL_TIMEOUT_SECS", &secs)?);
        }

        if let Some(ms) = lookup("CODERUN_OUTPUT_PACING_MS") {
            config.output_pacing = Duration::from_millis(parse("CODERUN_OUTPUT_PACING_MS", &ms)?);
        }

        if let Some(flag) = lookup("CODERUN_ABORT_ON_COMPILE_FAILURE") {
            config.abort_on_compile_failure =
                parse("CODERUN_ABORT_ON_COMPILE_FAILURE", &flag.to_lowercase())?;
        }

        if let Some(path) = lookup("CODERUN_LANGUAGES_FILE") {
            config.languages_file = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            workspace_root: self.workspace_root.clone(),
            limits: self.limits.clone(),
            wait_timeout: self.wait_timeout,
            phase_timeout: self.phase_timeout,
            abort_on_compile_failure: self.abort_on_compile_failure,
        }
    }

    /// The configured language table, or the built-in one
    pub fn load_registry(&self) -> Result<LanguageRegistry, ConfigError> {
        match &self.languages_file {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::LanguagesFile {
                        path: path.clone(),
                        source,
                    }
                })?;
                Ok(LanguageRegistry::from_json(&json)?)
            }
            None => Ok(LanguageRegistry::new()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_sandbox::settings::DEFAULT_WORKSPACE_ROOT;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8000");
        assert_eq!(config.cors_origin, "http://localhost:3000");
        assert_eq!(config.workspace_root, PathBuf::from(DEFAULT_WORKSPACE_ROOT));
        assert_eq!(config.limits, ResourceLimits::default());
        assert_eq!(config.wait_timeout, Duration::from_secs(10));
        assert_eq!(config.phase_timeout, None);
        assert_eq!(config.output_pacing, Duration::from_millis(10));
        assert!(!config.abort_on_compile_failure);
        assert_eq!(config.sandbox_settings(), SandboxSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("CORS_ORIGIN", "https://example.com"),
            ("CODERUN_WORKSPACE_ROOT", "/var/lib/coderun"),
            ("CODERUN_MEMORY_MB", "512"),
            ("CODERUN_PHASE_TIMEOUT_SECS", "30"),
            ("CODERUN_OUTPUT_PACING_MS", "0"),
            ("CODERUN_ABORT_ON_COMPILE_FAILURE", "TRUE"),
        ])
        .unwrap();

        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.cors_origin, "https://example.com");

        let settings = config.sandbox_settings();
        assert_eq!(settings.workspace_root, PathBuf::from("/var/lib/coderun"));
        assert_eq!(settings.limits.memory_mb, 512);
        assert_eq!(settings.phase_timeout, Some(Duration::from_secs(30)));
        assert!(settings.abort_on_compile_failure);
        assert_eq!(config.output_pacing, Duration::ZERO);
    }

    #[test]
    fn test_zero_phase_timeout_disables_limit() {
        let config = config_from(&[("CODERUN_PHASE_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.phase_timeout, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            config_from(&[("PORT", "eighty")]),
            Err(ConfigError::InvalidValue { key: "PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("PORT", "0")]),
            Err(ConfigError::PortOutOfRange(0))
        ));
        assert!(matches!(
            config_from(&[("CODERUN_MEMORY_MB", "0")]),
            Err(ConfigError::MustBePositive { .. })
        ));
        assert!(matches!(
            config_from(&[("CODERUN_CPU_QUOTA", "-1")]),
            Err(ConfigError::MustBePositive { .. })
        ));
        assert!(matches!(
            config_from(&[("CODERUN_WAIT_TIMEOUT_SECS", "0")]),
            Err(ConfigError::MustBePositive {
                key: "CODERUN_WAIT_TIMEOUT_SECS"
            })
        ));
        assert!(config_from(&[("CODERUN_ABORT_ON_COMPILE_FAILURE", "maybe")]).is_err());
    }

    #[test]
    fn test_wait_timeout_override() {
        let config = config_from(&[("CODERUN_WAIT_TIMEOUT_SECS", "3")]).unwrap();
        assert_eq!(config.sandbox_settings().wait_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_languages_file_replaces_builtin_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        std::fs::write(
            &path,
            r#"{"version":"1.0","languages":[
                {"id":"sh","image":"alpine:3.19","source_file":"main.sh","run":["sh","main.sh"]}
            ]}"#,
        )
        .unwrap();

        let config = config_from(&[("CODERUN_LANGUAGES_FILE", path.to_str().unwrap())]).unwrap();
        let registry = config.load_registry().unwrap();
        assert_eq!(registry.ids(), vec!["sh"]);
    }

    #[test]
    fn test_missing_languages_file() {
        let config = config_from(&[("CODERUN_LANGUAGES_FILE", "/nonexistent/languages.json")])
            .unwrap();
        assert!(matches!(
            config.load_registry(),
            Err(ConfigError::LanguagesFile { .. })
        ));
    }
}
