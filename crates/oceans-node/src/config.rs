//! Node configuration types
//!
//! Values come from an optional TOML file overlaid with `OCEANS_*`
//! environment variables, using `__` between section and key:
//!
//! ```text
//! OCEANS_SOURCES__VOTE_API_ENDPOINT=https://votes.example/api
//! OCEANS_EPOCH__ELIGIBLE_TARGETS=1,3,8
//! ```

use crate::publisher::{ConfirmationPolicy, RetryPolicy};
use oceans_core::{eligible_set, OceansError, Result, Target, TargetId};
use oceans_observer::ObserverConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "OCEANS";

/// Vote endpoint value that switches to placeholder votes
pub const OFFLINE_ENDPOINT: &str = "offline";

/// Complete node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity and data location
    #[serde(default)]
    pub node: NodeSettings,

    /// Epoch schedule and budget
    #[serde(default)]
    pub epoch: EpochSettings,

    /// External source endpoints
    #[serde(default)]
    pub sources: SourceSettings,

    /// Position observer tuning
    #[serde(default)]
    pub observer: ObserverSettings,

    /// Publication retry and confirmation
    #[serde(default)]
    pub publisher: PublisherSettings,

    /// Epoch record storage
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl NodeConfig {
    /// Load from `path` (if given) and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("epoch.eligible_targets"),
        );

        let config: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| OceansError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(OceansError::Config(msg.to_string()));

        if self.epoch.length_blocks == 0 {
            return fail("epoch.length_blocks must be positive");
        }
        if self.epoch.block_time_secs == 0 {
            return fail("epoch.block_time_secs must be positive");
        }
        if self.epoch.collection_deadline_secs == 0 {
            return fail("epoch.collection_deadline_secs must be positive");
        }
        if self.eligible_targets().is_empty() {
            return fail("epoch.eligible_targets must name at least one non-root target");
        }
        if self.observer.max_concurrency == 0 {
            return fail("observer.max_concurrency must be positive");
        }
        if self.observer.read_timeout_secs == 0 || self.sources.request_timeout_secs == 0 {
            return fail("read timeouts must be positive");
        }
        if self.publisher.max_attempts == 0 {
            return fail("publisher.max_attempts must be positive");
        }
        if self.publisher.publish_deadline_secs == 0
            || self.publisher.max_confirm_polls == 0
            || self.publisher.confirm_poll_timeout_secs == 0
        {
            return fail("publisher deadlines must be positive");
        }
        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(OceansError::Config(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(OceansError::Config(format!(
                "unknown log format '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Eligible target set; root is never included
    pub fn eligible_targets(&self) -> BTreeSet<TargetId> {
        eligible_set(self.epoch.eligible_targets.iter().map(|id| Target {
            id: TargetId(*id),
            eligible: true,
        }))
    }

    pub fn emission_budget(&self) -> u128 {
        self.epoch.emission_budget as u128
    }

    pub fn collection_deadline(&self) -> Duration {
        Duration::from_secs(self.epoch.collection_deadline_secs)
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.epoch.block_time_secs)
    }

    pub fn observer_config(&self) -> ObserverConfig {
        ObserverConfig {
            max_concurrency: self.observer.max_concurrency,
            read_timeout: Duration::from_secs(self.observer.read_timeout_secs),
            staleness_window_blocks: self.observer.staleness_window_blocks,
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.sources.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publisher.max_attempts,
            initial_backoff: Duration::from_millis(self.publisher.initial_backoff_ms),
            backoff_factor: self.publisher.backoff_factor,
            deadline: Duration::from_secs(self.publisher.publish_deadline_secs),
        }
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            depth: self.publisher.confirmation_depth,
            poll_interval: Duration::from_secs(self.publisher.confirm_poll_secs),
            max_polls: self.publisher.max_confirm_polls,
            poll_timeout: Duration::from_secs(self.publisher.confirm_poll_timeout_secs),
        }
    }

    /// Directory epoch records are persisted to, if any
    pub fn storage_dir(&self) -> Option<PathBuf> {
        if !self.storage.persist {
            return None;
        }
        Some(match &self.storage.dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.node.data_dir).join("epochs"),
        })
    }

    pub fn publish_dir(&self) -> PathBuf {
        match &self.publisher.output_dir {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.node.data_dir).join("published"),
        }
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OceansError::Serialization(e.to_string()))
    }
}

/// Basic node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node name used in logs
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_node_name() -> String {
    "oceans-validator".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            data_dir: default_data_dir(),
        }
    }
}

/// Epoch schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochSettings {
    /// Blocks per epoch
    #[serde(default = "default_length_blocks")]
    pub length_blocks: u64,

    /// Expected block time in seconds
    #[serde(default = "default_block_time")]
    pub block_time_secs: u64,

    /// Targets eligible for weight
    #[serde(default = "default_eligible_targets")]
    pub eligible_targets: Vec<u16>,

    /// Emission budget per epoch in base units
    #[serde(default = "default_emission_budget")]
    pub emission_budget: u64,

    /// Hard deadline for snapshot collection
    #[serde(default = "default_collection_deadline")]
    pub collection_deadline_secs: u64,
}

fn default_length_blocks() -> u64 {
    360
}

fn default_block_time() -> u64 {
    12
}

fn default_eligible_targets() -> Vec<u16> {
    vec![1]
}

fn default_emission_budget() -> u64 {
    1_000_000_000 // 1 unit at 9 decimals
}

fn default_collection_deadline() -> u64 {
    120
}

impl Default for EpochSettings {
    fn default() -> Self {
        Self {
            length_blocks: default_length_blocks(),
            block_time_secs: default_block_time(),
            eligible_targets: default_eligible_targets(),
            emission_budget: default_emission_budget(),
            collection_deadline_secs: default_collection_deadline(),
        }
    }
}

/// External source settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Vote API base URL, or `offline`
    #[serde(default = "default_vote_endpoint")]
    pub vote_api_endpoint: String,

    /// Stake API base URL; stakes come from the vote payload when unset
    #[serde(default)]
    pub stake_api_endpoint: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Attempts per HTTP request
    #[serde(default = "default_http_retries")]
    pub max_retries: u32,

    /// JSON registry fixture
    #[serde(default)]
    pub registry_file: Option<String>,

    /// JSON position fixture
    #[serde(default)]
    pub positions_file: Option<String>,

    /// JSON quote fixture
    #[serde(default)]
    pub quotes_file: Option<String>,

    /// Fixed chain head; simulated from wall-clock time when unset
    #[serde(default)]
    pub chain_head: Option<u64>,

    /// Unix time of block zero for the simulated head
    #[serde(default = "default_genesis_unix")]
    pub genesis_unix: i64,
}

fn default_vote_endpoint() -> String {
    OFFLINE_ENDPOINT.to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_http_retries() -> u32 {
    5
}

fn default_genesis_unix() -> i64 {
    1_700_000_000
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            vote_api_endpoint: default_vote_endpoint(),
            stake_api_endpoint: None,
            request_timeout_secs: default_request_timeout(),
            max_retries: default_http_retries(),
            registry_file: None,
            positions_file: None,
            quotes_file: None,
            chain_head: None,
            genesis_unix: default_genesis_unix(),
        }
    }
}

/// Position observer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObserverSettings {
    /// Maximum concurrent chain reads
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout of a single chain or oracle read
    #[serde(default = "default_request_timeout")]
    pub read_timeout_secs: u64,

    /// Oldest acceptable quote in blocks
    #[serde(default = "default_staleness_window")]
    pub staleness_window_blocks: u64,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_staleness_window() -> u64 {
    30
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            read_timeout_secs: default_request_timeout(),
            staleness_window_blocks: default_staleness_window(),
        }
    }
}

/// Publisher settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublisherSettings {
    /// Directory the local publisher writes to
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Submission attempts per epoch
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff multiplier between attempts
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,

    /// Total time allowed for submission
    #[serde(default = "default_publish_deadline")]
    pub publish_deadline_secs: u64,

    /// Blocks a publication must be buried under
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,

    /// Interval between confirmation polls
    #[serde(default = "default_block_time")]
    pub confirm_poll_secs: u64,

    /// Polls before giving up on confirmation
    #[serde(default = "default_max_confirm_polls")]
    pub max_confirm_polls: u32,

    /// Timeout of one confirmation read
    #[serde(default = "default_confirm_poll_timeout")]
    pub confirm_poll_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2_000
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_publish_deadline() -> u64 {
    300
}

fn default_confirmation_depth() -> u64 {
    3
}

fn default_max_confirm_polls() -> u32 {
    10
}

fn default_confirm_poll_timeout() -> u64 {
    10
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            output_dir: None,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_factor: default_backoff_factor(),
            publish_deadline_secs: default_publish_deadline(),
            confirmation_depth: default_confirmation_depth(),
            confirm_poll_secs: default_block_time(),
            max_confirm_polls: default_max_confirm_polls(),
            confirm_poll_timeout_secs: default_confirm_poll_timeout(),
        }
    }
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Persist epoch records to disk
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Record directory; `<data_dir>/epochs` when unset
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            persist: true,
            dir: None,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`text` or `json`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Serve `/metrics` and `/health`
    #[serde(default)]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9615".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.epoch.length_blocks, 360);
        assert_eq!(config.observer.max_concurrency, 5);
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.confirmation_policy().poll_timeout, Duration::from_secs(10));
        assert_eq!(config.emission_budget(), 1_000_000_000);
    }

    #[test]
    fn test_root_is_never_eligible() {
        let mut config = NodeConfig::default();
        config.epoch.eligible_targets = vec![0, 4, 2];
        let eligible: Vec<_> = config.eligible_targets().into_iter().collect();
        assert_eq!(eligible, vec![TargetId(2), TargetId(4)]);

        config.epoch.eligible_targets = vec![0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.observer.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.publisher.confirm_poll_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[epoch]\nlength_blocks = 100\neligible_targets = [3, 5]\n\n[observer]\nmax_concurrency = 2\n"
        )
        .unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.epoch.length_blocks, 100);
        assert_eq!(config.observer.max_concurrency, 2);
        assert_eq!(config.eligible_targets().len(), 2);
        // Untouched sections keep their defaults
        assert_eq!(config.publisher.confirmation_depth, 3);
    }

    #[test]
    fn test_toml_output_parses_back() {
        let config = NodeConfig::default();
        let rendered = config.to_toml().unwrap();
        let back: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.epoch.emission_budget, config.epoch.emission_budget);
        assert_eq!(back.sources.vote_api_endpoint, OFFLINE_ENDPOINT);
    }

    #[test]
    fn test_storage_dir_follows_data_dir() {
        let mut config = NodeConfig::default();
        config.node.data_dir = "/var/lib/oceans".into();
        assert_eq!(
            config.storage_dir(),
            Some(PathBuf::from("/var/lib/oceans/epochs"))
        );
        config.storage.persist = false;
        assert_eq!(config.storage_dir(), None);
    }
}
