//! Engine configuration.
//!
//! Sources are merged in precedence order: CLI flags, environment variables,
//! an optional TOML config file, compiled-in defaults. The binary builds a
//! [`CliOverrides`] from its parsed flags and hands it to
//! [`EngineConfig::resolve`]; library users usually just take
//! [`EngineConfig::default`] and tweak fields.
//!
//! Recognised environment variables: `INFERENCE_HOST`, `HTTP_HOST`,
//! `HTTP_PORT`, `LOG_LEVEL`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::taskweave::error::{EngineError, EngineResult};

/// Default local model endpoint (Ollama's standard port).
pub const DEFAULT_INFERENCE_HOST: &str = "http://localhost:11434";

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the local inference endpoint.
    pub inference_host: String,
    /// Interface the HTTP front-end binds to.
    pub http_host: String,
    /// Port the HTTP front-end binds to.
    pub http_port: u16,
    /// Log filter passed to the logger (e.g. `info`, `debug`).
    pub log_level: String,
    /// Directory holding the persona library, workflow memory, and sessions.
    pub data_dir: PathBuf,
    /// Maximum concurrent inference requests (worker-pool size).
    pub max_concurrent: usize,
    /// Per-workflow deadline in seconds.
    pub workflow_timeout_secs: u64,
    /// Fail startup when the inference backend is unreachable.
    pub strict_startup: bool,
    /// Short-term conversation window, in turns.
    pub memory_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inference_host: DEFAULT_INFERENCE_HOST.to_string(),
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            log_level: "info".to_string(),
            data_dir: PathBuf::from("taskweave_data"),
            max_concurrent: 4,
            workflow_timeout_secs: 600,
            strict_startup: false,
            memory_window: 20,
        }
    }
}

/// Flag values collected by the binary. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub inference_host: Option<String>,
    pub http_host: Option<String>,
    pub http_port: Option<u16>,
    pub log_level: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub strict: bool,
}

impl EngineConfig {
    /// Merge defaults, the optional config file, environment variables, and
    /// CLI flags into a final configuration (lowest to highest precedence).
    pub fn resolve(cli: &CliOverrides) -> EngineResult<Self> {
        let mut cfg = EngineConfig::default();

        if let Some(path) = &cli.config_file {
            cfg.apply_file(path)?;
        } else {
            let default_path = Path::new("taskweave.toml");
            if default_path.exists() {
                cfg.apply_file(default_path)?;
            }
        }

        cfg.apply_env();

        if let Some(v) = &cli.inference_host {
            cfg.inference_host = v.clone();
        }
        if let Some(v) = &cli.http_host {
            cfg.http_host = v.clone();
        }
        if let Some(v) = cli.http_port {
            cfg.http_port = v;
        }
        if let Some(v) = &cli.log_level {
            cfg.log_level = v.clone();
        }
        if let Some(v) = &cli.data_dir {
            cfg.data_dir = v.clone();
        }
        if cli.strict {
            cfg.strict_startup = true;
        }

        if cfg.max_concurrent == 0 {
            return Err(EngineError::Validation(
                "max_concurrent must be at least 1".into(),
            ));
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("INFERENCE_HOST") {
            if !v.is_empty() {
                self.inference_host = v;
            }
        }
        if let Ok(v) = std::env::var("HTTP_HOST") {
            if !v.is_empty() {
                self.http_host = v;
            }
        }
        if let Ok(v) = std::env::var("HTTP_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.http_port = port;
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = v;
            }
        }
    }

    fn apply_file(&mut self, path: &Path) -> EngineResult<()> {
        let raw = fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let value: toml::Value = raw.parse().map_err(|e| {
            EngineError::Validation(format!("invalid config file {}: {}", path.display(), e))
        })?;

        if let Some(v) = value.get("inference_host").and_then(|v| v.as_str()) {
            self.inference_host = v.to_string();
        }
        if let Some(v) = value.get("http_host").and_then(|v| v.as_str()) {
            self.http_host = v.to_string();
        }
        if let Some(v) = value.get("http_port").and_then(|v| v.as_integer()) {
            self.http_port = v as u16;
        }
        if let Some(v) = value.get("log_level").and_then(|v| v.as_str()) {
            self.log_level = v.to_string();
        }
        if let Some(v) = value.get("data_dir").and_then(|v| v.as_str()) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = value.get("max_concurrent").and_then(|v| v.as_integer()) {
            self.max_concurrent = v.max(0) as usize;
        }
        if let Some(v) = value.get("workflow_timeout_secs").and_then(|v| v.as_integer()) {
            self.workflow_timeout_secs = v.max(0) as u64;
        }
        if let Some(v) = value.get("strict_startup").and_then(|v| v.as_bool()) {
            self.strict_startup = v;
        }
        if let Some(v) = value.get("memory_window").and_then(|v| v.as_integer()) {
            self.memory_window = v.max(1) as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.http_host, "0.0.0.0");
        assert_eq!(cfg.max_concurrent, 4);
        assert_eq!(cfg.workflow_timeout_secs, 600);
        assert_eq!(cfg.inference_host, DEFAULT_INFERENCE_HOST);
    }

    #[test]
    fn test_cli_overrides_win() {
        let cli = CliOverrides {
            http_port: Some(9999),
            strict: true,
            ..Default::default()
        };
        let cfg = EngineConfig::resolve(&cli).unwrap();
        assert_eq!(cfg.http_port, 9999);
        assert!(cfg.strict_startup);
    }
}
