//! Configuration loading and resolution
//!
//! Resolution priority for the config file and the database path:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file in the platform config directory
//! 4. Compiled default (fallback)
//!
//! A missing config file is not an error: a warning is logged and compiled
//! defaults are used. All caps and thresholds that shape classification,
//! spam detection and ranking live here rather than in the logic.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "TAGRANK_CONFIG";

/// Environment variable naming the database file
pub const DATABASE_ENV_VAR: &str = "TAGRANK_DATABASE";

/// Top-level configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    /// Database file path (overridden by CLI / environment)
    pub database_path: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub classifier: ClassifierConfig,
    pub metrics: MetricsConfig,
    pub taxonomy: TaxonomyConfig,
    pub ranking: RankingConfig,
    pub batch: BatchConfig,
    pub publish: PublishConfig,
    pub server: ServerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Prominence classifier tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Maximum primary relationship tags per work
    pub primary_relationship_cap: usize,
    /// A relationship tag is a primary candidate only when the work has at most this many
    pub relationship_primary_candidate_max: usize,
    /// Word threshold for primary when no rule names the tag
    pub default_min_word_threshold: i64,
    /// Works with more tags than this get no automatic primary tags
    pub auto_primary_max_total_tags: usize,
    pub primary_score: f64,
    pub secondary_score: f64,
    pub micro_score: f64,
    /// Score multiplier for tags whose rule requires manual review
    pub manual_review_confidence: f64,
    /// Lowercase words marking a relationship as a background mention
    pub incidental_markers: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            primary_relationship_cap: 3,
            relationship_primary_candidate_max: 3,
            default_min_word_threshold: 500,
            auto_primary_max_total_tags: 20,
            primary_score: 1.0,
            secondary_score: 0.6,
            micro_score: 0.2,
            manual_review_confidence: 0.8,
            incidental_markers: ["background", "side", "minor", "mention", "past", "implied"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Tag metrics / spam detection tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Spam requires strictly more tags than this
    pub spam_tag_count_threshold: i64,
    /// Spam requires strictly more tags per 1000 words than this
    pub spam_tags_per_1k_threshold: f64,
    /// Works with more tags than this need author review
    pub review_tag_count_threshold: i64,
    /// Whether micro-prominence fandom tags count toward unique_fandom_count
    pub micro_counts_toward_fandoms: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            spam_tag_count_threshold: 20,
            spam_tags_per_1k_threshold: 10.0,
            review_tag_count_threshold: 25,
            micro_counts_toward_fandoms: true,
        }
    }
}

/// Taxonomy walk configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// Maximum parent_child hops when searching for a universe family
    pub max_ancestor_depth: usize,
    /// Name suffix identifying universe-family tags
    pub universe_family_suffix: String,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            max_ancestor_depth: 2,
            universe_family_suffix: " Universe Family".to_string(),
        }
    }
}

/// Ranking engine weights and normalization constants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankingConfig {
    pub engagement_weight: f64,
    pub comment_weight: f64,
    pub discovery_weight: f64,
    pub precision_weight: f64,
    /// Weighted engagement per hit that maps to a full engagement_rate
    pub engagement_saturation: f64,
    /// Comments per hit that maps to a full comment_quality
    pub comment_density_saturation: f64,
    /// comment_quality multiplier for works flagged as tag spam
    pub tag_spam_penalty: f64,
    /// Tags a work may carry before discovery_boost starts to decay
    pub tag_volume_allowance: i64,
    /// Precision credited to works with no relationship tags at all
    pub gen_work_precision: f64,
    /// Cached scores older than this are recomputed even when versions match
    pub max_staleness_secs: i64,
    /// Upper bound on cache entries one refresh pass recomputes
    pub max_refresh_per_pass: i64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            engagement_weight: 0.35,
            comment_weight: 0.20,
            discovery_weight: 0.25,
            precision_weight: 0.20,
            engagement_saturation: 1.0,
            comment_density_saturation: 0.05,
            tag_spam_penalty: 0.85,
            tag_volume_allowance: 15,
            gen_work_precision: 0.5,
            max_staleness_secs: 3600,
            max_refresh_per_pass: 500,
        }
    }
}

/// Migration batch runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: i64,
    /// A batch is failed when errors / attempted works exceeds this
    pub max_error_rate: f64,
    /// Strategy label recorded with each batch
    pub strategy: String,
    /// Upper bound on lock-retry time per work
    pub max_lock_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_error_rate: 0.05,
            strategy: "rule_table_prominence".to_string(),
            max_lock_wait_ms: 5000,
        }
    }
}

/// Search index publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    /// HTTP endpoint receiving score documents; publishing is disabled when unset
    pub endpoint: Option<String>,
    pub max_attempts: i64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: 8,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            poll_interval_ms: 1000,
            request_timeout_ms: 5000,
        }
    }
}

/// HTTP server binding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5740,
        }
    }
}

impl TomlConfig {
    /// Parse configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration following the priority order
    ///
    /// An explicitly named file (CLI or environment) must exist; the
    /// platform default file is optional.
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_path {
            info!("Loading config from command line: {}", path.display());
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            info!("Loading config from {}: {}", CONFIG_ENV_VAR, path);
            return Self::load(Path::new(&path));
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                info!("Loading config from {}", path.display());
                return Self::load(&path);
            }
        }

        warn!("No config file found, using compiled defaults");
        Ok(Self::default())
    }

    /// Resolve the database path: CLI → environment → config file → default
    pub fn resolve_database_path(&self, cli_path: Option<&Path>) -> PathBuf {
        if let Some(path) = cli_path {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        default_database_path()
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        let c = &self.classifier;
        if c.primary_relationship_cap == 0 {
            return Err(Error::Config("classifier.primary_relationship_cap must be at least 1".to_string()));
        }
        for (name, value) in [
            ("classifier.primary_score", c.primary_score),
            ("classifier.secondary_score", c.secondary_score),
            ("classifier.micro_score", c.micro_score),
            ("classifier.manual_review_confidence", c.manual_review_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }

        let m = &self.metrics;
        if m.spam_tags_per_1k_threshold < 0.0 || m.spam_tag_count_threshold < 0 {
            return Err(Error::Config("metrics thresholds must be non-negative".to_string()));
        }
        // Automatic primaries above the spam tag count would let new tags clear the spam flag
        if c.auto_primary_max_total_tags as i64 > m.spam_tag_count_threshold {
            return Err(Error::Config(format!(
                "classifier.auto_primary_max_total_tags ({}) must not exceed metrics.spam_tag_count_threshold ({})",
                c.auto_primary_max_total_tags, m.spam_tag_count_threshold
            )));
        }

        if self.taxonomy.max_ancestor_depth == 0 {
            return Err(Error::Config("taxonomy.max_ancestor_depth must be at least 1".to_string()));
        }

        let r = &self.ranking;
        let weights = [r.engagement_weight, r.comment_weight, r.discovery_weight, r.precision_weight];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(Error::Config("ranking weights must be non-negative and not all zero".to_string()));
        }
        if r.engagement_saturation <= 0.0 || r.comment_density_saturation <= 0.0 {
            return Err(Error::Config("ranking saturation constants must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&r.tag_spam_penalty) || !(0.0..=1.0).contains(&r.gen_work_precision) {
            return Err(Error::Config("ranking penalties must be within [0, 1]".to_string()));
        }
        if r.tag_volume_allowance <= 0 {
            return Err(Error::Config("ranking.tag_volume_allowance must be positive".to_string()));
        }
        if r.max_refresh_per_pass <= 0 {
            return Err(Error::Config("ranking.max_refresh_per_pass must be positive".to_string()));
        }

        let b = &self.batch;
        if b.batch_size <= 0 {
            return Err(Error::Config("batch.batch_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&b.max_error_rate) {
            return Err(Error::Config("batch.max_error_rate must be within [0, 1]".to_string()));
        }

        if self.publish.max_attempts <= 0 {
            return Err(Error::Config("publish.max_attempts must be positive".to_string()));
        }

        Ok(())
    }
}

/// Platform config file: ~/.config/tagrank/config.toml (or OS equivalent)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tagrank").join("config.toml"))
}

/// Platform default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("tagrank"))
        .unwrap_or_else(|| PathBuf::from("./tagrank_data"))
        .join("tagrank.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        TomlConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            [metrics]
            spam_tags_per_1k_threshold = 25.0
            "#,
        )
        .unwrap();

        assert_eq!(config.metrics.spam_tags_per_1k_threshold, 25.0);
        assert_eq!(config.metrics.spam_tag_count_threshold, 20);
        assert_eq!(config.classifier.primary_relationship_cap, 3);
    }

    #[test]
    fn test_auto_primary_limit_bounded_by_spam_threshold() {
        let err = TomlConfig::from_toml_str(
            r#"
            [classifier]
            auto_primary_max_total_tags = 30
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("auto_primary_max_total_tags"));
    }

    #[test]
    fn test_rejects_zero_cap() {
        let err = TomlConfig::from_toml_str(
            r#"
            [classifier]
            primary_relationship_cap = 0
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }
}
