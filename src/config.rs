//! Pipeline Configuration
//!
//! Agent launch settings, cancellation grace period and playback rate.
//! Loaded from TOML; every field has a default so a missing file is fine.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV_VAR: &str = "TABSTREAM_CONFIG";

/// Agent executable and its fixed launch arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program name (looked up on PATH) or absolute path
    pub program: String,
    /// Arguments passed on every spawn
    pub args: Vec<String>,
    /// Extra environment applied before per-session env
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// What counts as one display unit during playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackUnit {
    /// One character
    Char,
    /// One styled span
    Token,
}

impl Default for PlaybackUnit {
    fn default() -> Self {
        Self::Char
    }
}

/// Typewriter playback rate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Milliseconds between ticks
    pub tick_ms: u64,
    /// Display units emitted per tick
    pub units_per_tick: usize,
    pub unit: PlaybackUnit,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_ms: 16,
            units_per_tick: 4,
            unit: PlaybackUnit::Char,
        }
    }
}

impl PlaybackConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatterConfig {
    /// Plain-text lines longer than this are committed without waiting for a newline
    pub max_line_bytes: usize,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 8192,
        }
    }
}

/// How the terminal host writes display events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// ANSI-styled text
    Ansi,
    /// One JSON event per line
    Json,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Ansi
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub agent: AgentConfig,
    /// Wait between interrupt and forced kill during cancel
    pub grace_period_ms: u64,
    /// Maximum concurrently registered sessions
    pub max_sessions: usize,
    pub playback: PlaybackConfig,
    pub formatter: FormatterConfig,
    /// Terminal host output
    pub output: OutputFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            grace_period_ms: 100,
            max_sessions: 32,
            playback: PlaybackConfig::default(),
            formatter: FormatterConfig::default(),
            output: OutputFormat::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded pipeline config from {:?}", path);
        Ok(config)
    }

    /// Load from `$TABSTREAM_CONFIG` or the user config directory
    pub fn load() -> PipelineResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Resolve the config file location
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
            return Some(PathBuf::from(explicit));
        }
        dirs::config_dir().map(|dir| dir.join("tabstream").join("config.toml"))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.agent.program.trim().is_empty() {
            return Err(PipelineError::Config("agent.program must not be empty".to_string()));
        }
        if self.playback.units_per_tick == 0 {
            return Err(PipelineError::Config(
                "playback.units_per_tick must be at least 1".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(PipelineError::Config("max_sessions must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.grace_period(), Duration::from_millis(100));
        assert_eq!(config.playback.unit, PlaybackUnit::Char);
        assert_eq!(config.agent.program, "claude");
    }

    #[test]
    fn test_partial_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            grace_period_ms = 250

            [agent]
            program = "/usr/local/bin/agent"
            args = ["--interactive"]

            output = "json"

            [playback]
            units_per_tick = 10
            unit = "token"
            "#,
        )
        .unwrap();

        assert_eq!(config.grace_period_ms, 250);
        assert_eq!(config.agent.args, vec!["--interactive".to_string()]);
        assert_eq!(config.playback.units_per_tick, 10);
        assert_eq!(config.playback.unit, PlaybackUnit::Token);
        assert_eq!(config.playback.tick_ms, 16);
        assert_eq!(config.formatter.max_line_bytes, 8192);
        assert_eq!(config.output, OutputFormat::Json);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = PipelineConfig::from_toml_str("[playback]\nunits_per_tick = 0\n");
        assert!(matches!(result, Err(PipelineError::Config(_))));

        let result = PipelineConfig::from_toml_str("grace_period_ms = \"soon\"\n");
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_sessions, 32);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_sessions = 3\n").unwrap();

        let config = PipelineConfig::load_from(&path).unwrap();
        assert_eq!(config.max_sessions, 3);
    }
}
