//! Configuration for the run engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AGENTKIT_DATA, AGENTKIT_HOST, AGENTKIT_PORT)
//! 2. Config file ($AGENTKIT_CONFIG, or .agentkit/config.yaml)
//! 3. Defaults (~/.agentkit)
//!
//! Config file discovery:
//! - Searches current directory and parents for .agentkit/config.yaml
//! - Paths in config file are relative to the directory containing .agentkit/

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineSection>,
    #[serde(default)]
    pub inputs: Option<InputsSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Data directory (relative to the project root)
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    pub subscriber_buffer: Option<usize>,
    pub max_active_runs: Option<usize>,
    pub run_timeout_seconds: Option<u64>,
    pub shutdown_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputsSection {
    pub required: Option<Vec<String>>,
    pub max_input_bytes: Option<u64>,
    pub denylist_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding the event logs, database and uploads
    pub data_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Engine tuning
    pub engine: EngineSettings,
    /// Input validation
    pub inputs: InputSettings,
    /// HTTP listener
    pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Live events buffered per subscriber before it is evicted
    pub subscriber_buffer: usize,
    /// Concurrent non-terminal runs allowed (0 = unlimited)
    pub max_active_runs: usize,
    pub run_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            max_active_runs: 64,
            run_timeout_seconds: 3600,
            shutdown_grace_seconds: 30,
        }
    }
}

impl EngineSettings {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct InputSettings {
    /// Fields that must be present and non-empty
    pub required: Vec<String>,
    pub max_input_bytes: u64,
    /// Glob patterns uploads may not match
    pub denylist_patterns: Vec<String>,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            max_input_bytes: 1_048_576, // 1MB
            denylist_patterns: default_denylist(),
        }
    }
}

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Configuration rooted at an explicit data directory, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_file: None,
            engine: EngineSettings::default(),
            inputs: InputSettings::default(),
            server: ServerSettings::default(),
        }
    }

    /// Directory holding one subdirectory per run
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    /// Directory holding uploaded files
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// SQLite database with run metadata and uploads
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("agentkit.db")
    }

    /// Lock file guarding the data directory against a second engine process
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("engine.lock")
    }

    /// Socket address string for the HTTP listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Find config file: $AGENTKIT_CONFIG, else search current directory and parents
fn find_config_file() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("AGENTKIT_CONFIG") {
        return Some(PathBuf::from(explicit));
    }

    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".agentkit").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Merge a parsed config file over the defaults
fn resolve(file: ConfigFile, config_path: &Path, default_data: PathBuf) -> Config {
    // Project root is the parent of .agentkit/ (i.e., grandparent of config.yaml)
    let base_dir = config_path
        .parent()
        .and_then(|p| p.parent())
        .unwrap_or(Path::new("."));

    let data_dir = file
        .paths
        .data
        .as_deref()
        .map(|data| resolve_path(base_dir, data))
        .unwrap_or(default_data);

    let mut engine = EngineSettings::default();
    if let Some(section) = file.engine {
        engine.subscriber_buffer = section.subscriber_buffer.unwrap_or(engine.subscriber_buffer);
        engine.max_active_runs = section.max_active_runs.unwrap_or(engine.max_active_runs);
        engine.run_timeout_seconds = section
            .run_timeout_seconds
            .unwrap_or(engine.run_timeout_seconds);
        engine.shutdown_grace_seconds = section
            .shutdown_grace_seconds
            .unwrap_or(engine.shutdown_grace_seconds);
    }

    let mut inputs = InputSettings::default();
    if let Some(section) = file.inputs {
        inputs.required = section.required.unwrap_or(inputs.required);
        inputs.max_input_bytes = section.max_input_bytes.unwrap_or(inputs.max_input_bytes);
        inputs.denylist_patterns = section
            .denylist_patterns
            .unwrap_or(inputs.denylist_patterns);
    }

    let mut server = ServerSettings::default();
    if let Some(section) = file.server {
        server.host = section.host.unwrap_or(server.host);
        server.port = section.port.unwrap_or(server.port);
    }

    Config {
        data_dir,
        config_file: Some(config_path.to_path_buf()),
        engine,
        inputs,
        server,
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<Config> {
    let default_data = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".agentkit");

    let mut config = match find_config_file() {
        Some(config_path) => {
            let file = load_config_file(&config_path)?;
            resolve(file, &config_path, default_data)
        }
        None => Config::with_data_dir(default_data),
    };

    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(data) = std::env::var("AGENTKIT_DATA") {
        config.data_dir = PathBuf::from(data);
    }
    if let Ok(host) = std::env::var("AGENTKIT_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = std::env::var("AGENTKIT_PORT") {
        config.server.port = port
            .parse()
            .with_context(|| format!("AGENTKIT_PORT is not a valid port: {}", port))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let agentkit_dir = temp.path().join(".agentkit");
        std::fs::create_dir_all(&agentkit_dir).unwrap();

        let config_path = agentkit_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  data: ./data
engine:
  subscriber_buffer: 8
  run_timeout_seconds: 5
inputs:
  required: [task]
server:
  port: 9000
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version, "1");
        assert_eq!(parsed.paths.data, Some("./data".to_string()));

        let config = resolve(parsed, &config_path, PathBuf::from("/unused"));
        assert_eq!(config.data_dir, temp.path().join("./data"));
        assert_eq!(config.engine.subscriber_buffer, 8);
        assert_eq!(config.engine.run_timeout(), Duration::from_secs(5));
        // Unset values keep their defaults
        assert_eq!(config.engine.max_active_runs, 64);
        assert_eq!(config.inputs.required, vec!["task".to_string()]);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join(".agentkit").join("config.yaml");
        let parsed: ConfigFile = serde_yaml::from_str("version: \"1\"\n").unwrap();

        let config = resolve(parsed, &config_path, PathBuf::from("/home/u/.agentkit"));
        assert_eq!(config.data_dir, PathBuf::from("/home/u/.agentkit"));
        assert_eq!(config.engine.subscriber_buffer, 256);
        assert!(config.inputs.required.is_empty());
        assert_eq!(config.inputs.denylist_patterns.len(), 5);
    }

    #[test]
    fn test_data_layout() {
        let config = Config::with_data_dir("/srv/agentkit");
        assert_eq!(config.runs_dir(), PathBuf::from("/srv/agentkit/runs"));
        assert_eq!(config.uploads_dir(), PathBuf::from("/srv/agentkit/uploads"));
        assert_eq!(config.database_path(), PathBuf::from("/srv/agentkit/agentkit.db"));
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./data"),
            PathBuf::from("/home/user/project/./data")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
