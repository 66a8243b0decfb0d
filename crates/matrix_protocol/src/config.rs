//! Worker server configuration.
//!
//! Loaded from YAML or JSON; zero values are replaced by the canonical
//! defaults so a minimal config file stays minimal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::defaults;
use crate::envelope::SecretAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkMode {
    Development,
    #[default]
    Production,
}

impl WorkMode {
    pub fn is_development(&self) -> bool {
        matches!(self, WorkMode::Development)
    }
}

/// Process-wide configuration of a worker server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerServerConfig {
    pub server_id: String,
    pub work_mode: WorkMode,

    pub public_host: String,
    pub public_port: u16,
    pub intranet_host: String,
    pub intranet_port: u16,

    /// Pre-shared secret for payload envelopes and event signing.
    pub intranet_secret: String,
    /// `NONE`, `AES-128`, `AES-192` or `AES-256`.
    pub intranet_secret_algor: String,

    pub intranet_client_max_idle_conns_per_host: usize,
    /// Seconds before an idle pooled connection expires.
    pub intranet_client_connection_expired: u64,
    pub intranet_client_write_timeout: u64,
    /// Snappy-compress outbound intranet bodies.
    pub intranet_compress: bool,

    // Field names keep the historical `max_men` spelling; existing config
    // files depend on it.
    pub default_cache_max_men: u64,
    pub default_cache_ttl: u64,
    pub domain_cache_max_men: u64,
    pub domain_cache_ttl: u64,

    pub heartbeat_report_gap: u64,
    /// `host:port` of the Gateway's intranet listener.
    pub gateway_intranet_endpoint: String,
    pub not_accept_update_record_event_from_gateway: bool,

    pub max_in_process_task: usize,
    /// SQLite database path backing tasks, logs and records.
    pub database_path: String,
}

impl WorkerServerConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file and apply defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON config: {}", path.display()))?,
            _ => serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid YAML config: {}", path.display()))?,
        };
        config.apply_defaults();
        Ok(config)
    }

    /// Replace zero values with the canonical defaults.
    pub fn apply_defaults(&mut self) {
        if self.public_host.is_empty() {
            self.public_host = defaults::DEFAULT_PUBLIC_HOST.to_string();
        }
        if self.public_port == 0 {
            self.public_port = defaults::DEFAULT_PUBLIC_PORT;
        }
        if self.intranet_host.is_empty() {
            self.intranet_host = defaults::DEFAULT_INTRANET_HOST.to_string();
        }
        if self.intranet_port == 0 {
            self.intranet_port = defaults::DEFAULT_INTRANET_PORT;
        }
        if self.intranet_client_max_idle_conns_per_host == 0 {
            self.intranet_client_max_idle_conns_per_host =
                defaults::DEFAULT_MAX_IDLE_CONNS_PER_HOST;
        }
        if self.intranet_client_connection_expired == 0 {
            self.intranet_client_connection_expired = defaults::DEFAULT_CONNECTION_EXPIRED_SECS;
        }
        if self.intranet_client_write_timeout == 0 {
            self.intranet_client_write_timeout = defaults::DEFAULT_WRITE_TIMEOUT_SECS;
        }
        if self.default_cache_max_men == 0 {
            self.default_cache_max_men = defaults::DEFAULT_CACHE_MAX_MEN_MIB;
        }
        if self.default_cache_ttl == 0 {
            self.default_cache_ttl = defaults::DEFAULT_CACHE_TTL_SECS;
        }
        if self.domain_cache_max_men == 0 {
            self.domain_cache_max_men = defaults::DEFAULT_CACHE_MAX_MEN_MIB;
        }
        if self.domain_cache_ttl == 0 {
            self.domain_cache_ttl = defaults::DEFAULT_CACHE_TTL_SECS;
        }
        if self.heartbeat_report_gap == 0 {
            self.heartbeat_report_gap = defaults::DEFAULT_HEARTBEAT_REPORT_GAP_SECS;
        }
        if self.max_in_process_task == 0 {
            self.max_in_process_task = defaults::DEFAULT_MAX_IN_PROCESS_TASKS;
        }
        if self.database_path.is_empty() {
            self.database_path = "event_matrix.db".to_string();
        }
    }

    /// Parsed secret algorithm; unknown values fall back to `NONE`.
    pub fn secret_algorithm(&self) -> SecretAlgorithm {
        SecretAlgorithm::from_str(&self.intranet_secret_algor).unwrap_or_default()
    }

    pub fn intranet_addr(&self) -> String {
        format!("{}:{}", self.intranet_host, self.intranet_port)
    }

    pub fn public_addr(&self) -> String {
        format!("{}:{}", self.public_host, self.public_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_zero_values() {
        let mut config = WorkerServerConfig::default();
        config.apply_defaults();

        assert_eq!(config.public_port, defaults::DEFAULT_PUBLIC_PORT);
        assert_eq!(
            config.intranet_client_max_idle_conns_per_host,
            defaults::DEFAULT_MAX_IDLE_CONNS_PER_HOST
        );
        assert_eq!(config.domain_cache_ttl, defaults::DEFAULT_CACHE_TTL_SECS);
        assert_eq!(
            config.max_in_process_task,
            defaults::DEFAULT_MAX_IN_PROCESS_TASKS
        );
    }

    #[test]
    fn test_explicit_values_survive() {
        let mut config = WorkerServerConfig {
            public_port: 9000,
            domain_cache_ttl: 60,
            ..Default::default()
        };
        config.apply_defaults();
        assert_eq!(config.public_port, 9000);
        assert_eq!(config.domain_cache_ttl, 60);
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "server_id: srv-1\nintranet_secret: s3cret\nintranet_secret_algor: AES-256\nwork_mode: development"
        )
        .unwrap();

        let config = WorkerServerConfig::load(file.path()).unwrap();
        assert_eq!(config.server_id, "srv-1");
        assert_eq!(config.secret_algorithm(), SecretAlgorithm::Aes256);
        assert!(config.work_mode.is_development());
        // Defaults applied on load.
        assert_eq!(config.intranet_port, defaults::DEFAULT_INTRANET_PORT);
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"server_id": "srv-2", "public_port": 8888}}"#
        )
        .unwrap();

        let config = WorkerServerConfig::load(file.path()).unwrap();
        assert_eq!(config.server_id, "srv-2");
        assert_eq!(config.public_port, 8888);
    }
}
