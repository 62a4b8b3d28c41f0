// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var that points at a YAML runtime config file.
pub const CONFIG_PATH_ENV: &str = "DD_PROCSUP_CONFIG";
/// Env var naming a discovery directory tried before the built-in candidates.
pub const DISCOVERY_DIR_ENV: &str = "DD_PROCSUP_DISCOVERY_DIR";

const DISCOVERY_FOLDER_NAME: &str = "dd-procsup-ports";

fn default_cache_ttl_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_send_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}

fn default_address() -> String {
    ":0".to_string()
}

fn default_graceful_shutdown_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_max_header_bytes() -> usize {
    10240
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Candidate directories, highest priority first. Empty means the built-in list.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl DiscoveryConfig {
    /// Discovery config rooted at a single directory, used by tests and tools.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dirs: vec![dir.into()],
            ..Self::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// The candidate list, in the order they are tried.
    pub fn candidates(&self) -> Vec<PathBuf> {
        if !self.dirs.is_empty() {
            return self.dirs.clone();
        }
        let mut bases = vec![PathBuf::from("/var/tmp"), PathBuf::from("/var/run")];
        if let Some(home) = std::env::var_os("HOME") {
            bases.push(PathBuf::from(home).join(".config"));
        }
        bases.push(std::env::temp_dir());
        bases
            .into_iter()
            .map(|base| base.join(DISCOVERY_FOLDER_NAME))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            send_retries: default_send_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl TransportConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address: `host:port`, `:port` or a bare port number.
    #[serde(default = "default_address")]
    pub address: String,
    /// Seconds `shutdown` waits for in-flight requests before forcing close.
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: u64,
    pub read_header_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            read_header_timeout_ms: None,
            keep_alive: true,
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout)
    }
}

impl RuntimeConfig {
    /// Load from `DD_PROCSUP_CONFIG` if set, otherwise defaults; then apply env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: RuntimeConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        debug!("loaded runtime config from {}", path.display());
        Ok(config)
    }

    /// `DD_PROCSUP_DISCOVERY_DIR` goes in front of whatever candidates are configured.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = std::env::var_os(DISCOVERY_DIR_ENV).filter(|d| !d.is_empty()) {
            let mut candidates = self.discovery.candidates();
            candidates.insert(0, PathBuf::from(dir));
            self.discovery.dirs = candidates;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
discovery:
  dirs:
    - /tmp/ports-a
    - /tmp/ports-b
  cache_ttl_ms: 250
transport:
  queue_capacity: 16
  send_retries: 5
  retry_interval_ms: 10
  connect_timeout_ms: 500
  max_frame_len: 4096
server:
  address: "127.0.0.1:8080"
  graceful_shutdown_timeout: 2
  read_header_timeout_ms: 1500
  keep_alive: false
  max_header_bytes: 20000
"#;
        let path = dir.path().join("procsup.yaml");
        fs::write(&path, yaml).unwrap();

        let cfg = RuntimeConfig::load(&path).unwrap();
        assert_eq!(
            cfg.discovery.candidates(),
            vec![PathBuf::from("/tmp/ports-a"), PathBuf::from("/tmp/ports-b")]
        );
        assert_eq!(cfg.discovery.cache_ttl(), Duration::from_millis(250));
        assert_eq!(cfg.transport.queue_capacity, 16);
        assert_eq!(cfg.transport.send_retries, 5);
        assert_eq!(cfg.transport.retry_interval(), Duration::from_millis(10));
        assert_eq!(cfg.transport.connect_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.transport.max_frame_len, 4096);
        assert_eq!(cfg.server.address, "127.0.0.1:8080");
        assert_eq!(cfg.server.graceful_shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.server.read_header_timeout_ms, Some(1500));
        assert!(!cfg.server.keep_alive);
        assert_eq!(cfg.server.max_header_bytes, 20000);
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");
        fs::write(&path, "{}\n").unwrap();

        let cfg = RuntimeConfig::load(&path).unwrap();
        assert_eq!(cfg.transport.queue_capacity, 10_000);
        assert_eq!(cfg.transport.send_retries, 3);
        assert_eq!(cfg.server.address, ":0");
        assert!(cfg.server.keep_alive);
        assert_eq!(cfg.server.graceful_shutdown_timeout, 5);
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "transport: [not, a, map").unwrap();
        assert!(RuntimeConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(RuntimeConfig::load(Path::new("/nonexistent/procsup.yaml")).is_err());
    }

    #[test]
    fn test_default_candidates_priority() {
        let candidates = DiscoveryConfig::default().candidates();
        assert_eq!(candidates[0], PathBuf::from("/var/tmp").join(DISCOVERY_FOLDER_NAME));
        assert_eq!(candidates[1], PathBuf::from("/var/run").join(DISCOVERY_FOLDER_NAME));
        assert_eq!(
            candidates.last().unwrap(),
            &std::env::temp_dir().join(DISCOVERY_FOLDER_NAME)
        );
    }

    #[test]
    fn test_env_override_prepends_discovery_dir() {
        temp_env::with_var(DISCOVERY_DIR_ENV, Some("/tmp/override"), || {
            let mut cfg = RuntimeConfig::default();
            cfg.discovery.dirs = vec![PathBuf::from("/tmp/configured")];
            cfg.apply_env_overrides();
            assert_eq!(
                cfg.discovery.dirs,
                vec![PathBuf::from("/tmp/override"), PathBuf::from("/tmp/configured")]
            );
        });
    }
}
