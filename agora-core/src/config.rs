//! Configuration types for Agora

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AgoraError, Result};

/// Main configuration for the coordination core
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AgoraConfig {
    /// Agent memory configuration
    pub memory: MemoryConfig,

    /// Message bus configuration
    pub bus: BusConfig,

    /// Task router configuration
    pub router: RouterConfig,

    /// Consensus coordinator configuration
    pub consensus: ConsensusConfig,
}

/// Agent memory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum entry count of each short-term store
    pub short_term_max_size: usize,

    /// TTL applied when `store` is called without one
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<Duration>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_max_size: 1000,
            default_ttl: None,
        }
    }
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Buffer size of the broadcast tap handed out by `MessageBus::subscribe`
    pub tap_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { tap_capacity: 256 }
    }
}

/// Task router configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Bus endpoint the router receives RESPONSE messages on
    pub endpoint_id: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            endpoint_id: "task-router".to_string(),
        }
    }
}

/// Consensus coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Sender id used for CONSENSUS_REACHED broadcasts
    pub coordinator_id: String,

    /// Fraction of registered agents that must have voted (inclusive)
    pub quorum: Ratio,

    /// Fraction of approving voters that must be exceeded (exclusive)
    pub approval: Ratio,

    /// Agent count the quorum is measured against
    pub quorum_basis: QuorumBasis,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            coordinator_id: "consensus-coordinator".to_string(),
            quorum: Ratio::new(2, 3),
            approval: Ratio::new(1, 2),
            quorum_basis: QuorumBasis::Live,
        }
    }
}

/// Agent count used when checking quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuorumBasis {
    /// Recompute against the agents registered when each vote lands
    #[default]
    Live,

    /// Freeze the agent count when the proposal is recorded
    Snapshot,
}

/// Exact rational threshold.
///
/// Comparisons cross-multiply so that `2/3 * 3` is exactly `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    /// Create a new ratio
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// `count >= self * total`
    pub fn is_met_by(&self, count: usize, total: usize) -> bool {
        (count as u128) * (self.denominator as u128) >= (self.numerator as u128) * (total as u128)
    }

    /// `count > self * total`
    pub fn is_exceeded_by(&self, count: usize, total: usize) -> bool {
        (count as u128) * (self.denominator as u128) > (self.numerator as u128) * (total as u128)
    }

    /// Floating point value, for logging
    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }
}

/// Builder for creating configurations programmatically
pub struct ConfigBuilder {
    config: AgoraConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder with defaults
    pub fn new() -> Self {
        Self {
            config: AgoraConfig::default(),
        }
    }

    /// Set the short-term memory bound
    pub fn short_term_max_size(mut self, max_size: usize) -> Self {
        self.config.memory.short_term_max_size = max_size;
        self
    }

    /// Set the default memory TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.memory.default_ttl = Some(ttl);
        self
    }

    /// Set the broadcast tap capacity
    pub fn tap_capacity(mut self, capacity: usize) -> Self {
        self.config.bus.tap_capacity = capacity;
        self
    }

    /// Set the router endpoint id
    pub fn router_endpoint(mut self, id: impl Into<String>) -> Self {
        self.config.router.endpoint_id = id.into();
        self
    }

    /// Set the quorum ratio
    pub fn quorum(mut self, numerator: u64, denominator: u64) -> Self {
        self.config.consensus.quorum = Ratio::new(numerator, denominator);
        self
    }

    /// Set the approval ratio
    pub fn approval(mut self, numerator: u64, denominator: u64) -> Self {
        self.config.consensus.approval = Ratio::new(numerator, denominator);
        self
    }

    /// Set the quorum basis
    pub fn quorum_basis(mut self, basis: QuorumBasis) -> Self {
        self.config.consensus.quorum_basis = basis;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<AgoraConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgoraConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (agora.toml, then the path in AGORA_CONFIG_PATH)
    /// 3. Environment variable overrides (`AGORA_CONSENSUS__QUORUM_BASIS=snapshot`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(AgoraConfig::default()))
            .merge(Toml::file("agora.toml"));

        if let Ok(path) = std::env::var("AGORA_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: AgoraConfig = figment
            .merge(Env::prefixed("AGORA_").ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| AgoraError::Configuration(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: AgoraConfig = Figment::from(Serialized::defaults(AgoraConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                AgoraError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a size is zero or a ratio is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.memory.short_term_max_size == 0 {
            return Err(AgoraError::Configuration(
                "memory.short_term_max_size must be at least 1".to_string(),
            ));
        }
        if self.bus.tap_capacity == 0 {
            return Err(AgoraError::Configuration(
                "bus.tap_capacity must be at least 1".to_string(),
            ));
        }
        if self.router.endpoint_id.is_empty() || self.consensus.coordinator_id.is_empty() {
            return Err(AgoraError::Configuration(
                "router.endpoint_id and consensus.coordinator_id must not be empty".to_string(),
            ));
        }
        for (name, ratio) in [
            ("consensus.quorum", self.consensus.quorum),
            ("consensus.approval", self.consensus.approval),
        ] {
            if ratio.denominator == 0 || ratio.numerator > ratio.denominator {
                return Err(AgoraError::Configuration(format!(
                    "{} must be a fraction between 0 and 1, got {}/{}",
                    name, ratio.numerator, ratio.denominator
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgoraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consensus.quorum, Ratio::new(2, 3));
        assert_eq!(config.consensus.quorum_basis, QuorumBasis::Live);
    }

    #[test]
    fn test_ratio_is_exact() {
        let two_thirds = Ratio::new(2, 3);
        assert!(two_thirds.is_met_by(2, 3));
        assert!(!two_thirds.is_met_by(1, 3));
        assert!(two_thirds.is_met_by(0, 0));

        let half = Ratio::new(1, 2);
        assert!(!half.is_exceeded_by(1, 2));
        assert!(half.is_exceeded_by(2, 3));
    }

    #[test]
    fn test_builder_rejects_bad_ratio() {
        let result = ConfigBuilder::new().quorum(3, 2).build();
        assert!(matches!(result, Err(AgoraError::Configuration(_))));

        let result = ConfigBuilder::new().short_term_max_size(0).build();
        assert!(matches!(result, Err(AgoraError::Configuration(_))));
    }

    #[test]
    fn test_from_file_merges_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[memory]
short_term_max_size = 16
default_ttl = "5m"

[consensus]
quorum_basis = "snapshot"
quorum = {{ numerator = 3, denominator = 4 }}
"#
        )
        .unwrap();

        let config = AgoraConfig::from_file(file.path()).unwrap();
        assert_eq!(config.memory.short_term_max_size, 16);
        assert_eq!(config.memory.default_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.consensus.quorum_basis, QuorumBasis::Snapshot);
        assert_eq!(config.consensus.quorum, Ratio::new(3, 4));
        assert_eq!(config.router.endpoint_id, "task-router");
    }
}
