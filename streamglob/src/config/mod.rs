//! Application configuration.
//!
//! Loaded from an optional JSON file, then overridden from the environment
//! (a `.env` file is honoured through `dotenvy`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::program::{ProgramSpec, SessionHints};
use crate::utils::filename::UnicodeForm;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:streamglob.db?mode=rwc";
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub tasks: TasksConfig,
    pub output: OutputConfig,
    pub programs: ProgramsConfig,
    pub session: SessionHints,
    /// Per-provider overrides keyed by provider id.
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from("logs"),
            tasks: TasksConfig::default(),
            output: OutputConfig::default(),
            programs: ProgramsConfig::default(),
            session: SessionHints::default(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub max_concurrent_tasks: usize,
    /// Pause between download stages.
    pub stage_delay_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            stage_delay_ms: 0,
        }
    }
}

impl TasksConfig {
    pub fn stage_delay(&self) -> Duration {
        Duration::from_millis(self.stage_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory downloads land in.
    pub path: PathBuf,
    /// Filename template; the built-in default applies when unset.
    pub template: Option<String>,
    pub unicode_normalization: Option<UnicodeForm>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            template: None,
            unicode_normalization: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramsConfig {
    pub players: Vec<ProgramSpec>,
    pub downloaders: Vec<ProgramSpec>,
    pub postprocessors: Vec<ProgramSpec>,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            players: ProgramSpec::default_players(),
            downloaders: ProgramSpec::default_downloaders(),
            postprocessors: Vec::new(),
        }
    }
}

/// Provider-specific overrides of the global settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub output: Option<OutputConfig>,
    pub postprocessors: Option<Vec<String>>,
    pub player: Option<String>,
    pub downloader: Option<String>,
    pub session: Option<SessionHints>,
}

impl AppConfig {
    /// Load from `path` (defaults when it is absent or missing), apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| Error::io_path("reading config", path, e))?;
                info!(path = %path.display(), "Loaded configuration file");
                Self::from_json(&text)?
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply overrides looked up through `lookup` (the environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(value) = lookup("STREAMGLOB_MAX_CONCURRENT_TASKS") {
            self.tasks.max_concurrent_tasks = value.trim().parse().map_err(|_| {
                Error::config(format!(
                    "STREAMGLOB_MAX_CONCURRENT_TASKS must be a positive integer, got {:?}",
                    value
                ))
            })?;
        }
        if let Some(dir) = lookup("STREAMGLOB_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("STREAMGLOB_OUTPUT_PATH") {
            self.output.path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.max_concurrent_tasks == 0 {
            return Err(Error::config("tasks.max_concurrent_tasks must be at least 1"));
        }
        for (kind, specs) in [
            ("player", &self.programs.players),
            ("downloader", &self.programs.downloaders),
            ("postprocessor", &self.programs.postprocessors),
        ] {
            let mut seen = HashSet::new();
            for spec in specs {
                if spec.command.trim().is_empty() {
                    return Err(Error::config(format!(
                        "{} {:?} has an empty command",
                        kind, spec.name
                    )));
                }
                if !seen.insert(spec.name.as_str()) {
                    return Err(Error::config(format!(
                        "duplicate {} name {:?}",
                        kind, spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_id)
    }

    /// Output settings for a provider, falling back to the global ones.
    pub fn output_for(&self, provider_id: &str) -> &OutputConfig {
        self.provider(provider_id)
            .and_then(|p| p.output.as_ref())
            .unwrap_or(&self.output)
    }

    /// Session hints for a provider layered over the global ones.
    pub fn session_for(&self, provider_id: &str) -> SessionHints {
        match self.provider(provider_id).and_then(|p| p.session.as_ref()) {
            Some(overlay) => self.session.merged(overlay),
            None => self.session.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.tasks.max_concurrent_tasks, 4);
        assert_eq!(config.output.path, PathBuf::from("."));
        assert_eq!(config.programs.players[0].name, "mpv");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "tasks": {"max_concurrent_tasks": 2},
                "output": {"template": "{listing.title}.{index}.{ext}", "unicode_normalization": "NFC"},
                "providers": {"bam": {"postprocessors": ["remux"], "output": {"path": "/media/bam"}}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.tasks.max_concurrent_tasks, 2);
        assert_eq!(config.tasks.stage_delay_ms, 0);
        assert_eq!(config.output.unicode_normalization, Some(UnicodeForm::Nfc));
        assert_eq!(config.output_for("bam").path, PathBuf::from("/media/bam"));
        assert_eq!(config.output_for("other").path, PathBuf::from("."));
        assert_eq!(config.programs.downloaders.len(), 2);
    }

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "sqlite::memory:"),
            ("STREAMGLOB_MAX_CONCURRENT_TASKS", "8"),
            ("STREAMGLOB_OUTPUT_PATH", "/tmp/out"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.tasks.max_concurrent_tasks, 8);
        assert_eq!(config.output.path, PathBuf::from("/tmp/out"));
        assert_eq!(config.log_dir, PathBuf::from("logs"));

        let err = config
            .apply_overrides(|key| (key == "STREAMGLOB_MAX_CONCURRENT_TASKS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.tasks.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config
            .programs
            .players
            .push(ProgramSpec::new("mpv", "mpv"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_for_provider() {
        let mut config = AppConfig::default();
        config.session.proxy = Some("http://global".into());
        config.providers.insert(
            "bam".into(),
            ProviderConfig {
                session: Some(SessionHints {
                    cookies: Some("k=v".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let hints = config.session_for("bam");
        assert_eq!(hints.proxy.as_deref(), Some("http://global"));
        assert_eq!(hints.cookies.as_deref(), Some("k=v"));
        assert!(config.session_for("other").cookies.is_none());
    }
}
