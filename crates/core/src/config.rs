use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use crate::error::{CampaignError, CampaignResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_AUTOMATION__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub flow: FlowConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            flow: FlowConfig::default(),
        }
    }
}

// ─── Flow Engine Config ─────────────────────────────────────────────────
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// How often the scheduler polls for due cursors.
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
    /// Maximum cursors pulled per scheduler tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum cursors executing at once within a tick.
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
    /// How long seen idempotency keys are remembered.
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: u64,
    /// Cursor snapshot file. Persistence is disabled when unset.
    #[serde(default)]
    pub snapshot_path: Option<String>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// fsync every journal append, not just flush it to the OS.
    #[serde(default = "default_journal_fsync")]
    pub journal_fsync: bool,
}

fn default_scheduler_interval_ms() -> u64 { 1000 }
fn default_batch_size() -> usize { 500 }
fn default_dispatch_concurrency() -> usize { 32 }
fn default_max_send_retries() -> u32 { 5 }
fn default_retry_base_secs() -> u64 { 60 }
fn default_retry_max_secs() -> u64 { 3600 }
fn default_idempotency_ttl_hours() -> u64 { 168 }
fn default_snapshot_interval_secs() -> u64 { 30 }
fn default_journal_fsync() -> bool { true }

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_ms: default_scheduler_interval_ms(),
            batch_size: default_batch_size(),
            dispatch_concurrency: default_dispatch_concurrency(),
            max_send_retries: default_max_send_retries(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            idempotency_ttl_hours: default_idempotency_ttl_hours(),
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
            journal_fsync: default_journal_fsync(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> CampaignResult<Self> {
        Self::from_builder(config::Config::builder().add_source(
            config::Environment::with_prefix("CAMPAIGN_AUTOMATION")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        ))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> CampaignResult<Self> {
        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| CampaignError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api.http_port, 8080);
        assert_eq!(config.flow.batch_size, 500);
        assert_eq!(config.flow.max_send_retries, 5);
        assert!(config.flow.snapshot_path.is_none());
    }

    #[test]
    fn test_partial_flow_section_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "flow": { "batch_size": 10 }
        }))
        .unwrap();
        assert_eq!(config.flow.batch_size, 10);
        assert_eq!(config.flow.retry_base_secs, 60);
        assert_eq!(config.node_id, "node-01");
        assert!(config.flow.journal_fsync);
    }

    #[test]
    fn test_malformed_source_is_a_config_error() {
        let source = |raw: &str| {
            config::Config::builder()
                .add_source(config::File::from_str(raw, config::FileFormat::Json))
        };

        let loaded = AppConfig::from_builder(source(r#"{"flow": {"batch_size": 10}}"#)).unwrap();
        assert_eq!(loaded.flow.batch_size, 10);

        let err = AppConfig::from_builder(source(r#"{"flow": {"batch_size": "many"}}"#)).unwrap_err();
        assert!(matches!(err, CampaignError::Config(_)));
    }
}
