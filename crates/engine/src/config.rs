//! Ledger configuration via `ledger.toml`
//!
//! On first start a default `ledger.toml` with comments is written next to
//! the ledger data. To change settings, edit the file and restart.

use ledger_core::{LedgerError, LedgerResult};
use ledger_merge::{BackoffConfig, MergePolicyKind, ResolverConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the ledger directory
pub const CONFIG_FILE_NAME: &str = "ledger.toml";

/// Ledger configuration loaded from `ledger.toml`
///
/// # Example
///
/// ```toml
/// default_merge_policy = "last_one_wins"
/// custom_diff_chunk_size = 64
/// sync_enabled = true
///
/// [backoff]
/// initial_delay_ms = 50
/// max_delay_ms = 60000
/// factor = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Policy for pages whose application installed no resolver factory
    #[serde(default = "default_policy_str")]
    pub default_merge_policy: String,
    /// Backoff between merges of merge commits and after failed merges
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Changed keys handed to a conflict resolver per call
    #[serde(default = "default_chunk_size")]
    pub custom_diff_chunk_size: usize,
    /// Whether pages start the configured sync component
    #[serde(default = "default_sync_enabled")]
    pub sync_enabled: bool,
}

fn default_policy_str() -> String {
    MergePolicyKind::LastOneWins.as_str().to_string()
}

fn default_chunk_size() -> usize {
    64
}

fn default_sync_enabled() -> bool {
    true
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_merge_policy: default_policy_str(),
            backoff: BackoffConfig::default(),
            custom_diff_chunk_size: default_chunk_size(),
            sync_enabled: default_sync_enabled(),
        }
    }
}

impl LedgerConfig {
    /// Parse the default merge policy
    ///
    /// # Errors
    ///
    /// `Config` if the value names no known policy.
    pub fn merge_policy(&self) -> LedgerResult<MergePolicyKind> {
        self.default_merge_policy.parse().map_err(|_| {
            LedgerError::Config(format!(
                "Invalid default_merge_policy '{}' in ledger.toml. Expected \"none\", \
                 \"last_one_wins\", \"automatic_with_fallback\" or \"custom\".",
                self.default_merge_policy
            ))
        })
    }

    /// Check every field
    pub fn validate(&self) -> LedgerResult<()> {
        self.merge_policy()?;
        if self.custom_diff_chunk_size == 0 {
            return Err(LedgerError::Config(
                "custom_diff_chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(LedgerError::Config(format!(
                "backoff.initial_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.initial_delay_ms, self.backoff.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Resolver tuning derived from the backoff table
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            storm_backoff: self.backoff.clone(),
            failure_backoff: self.backoff.clone(),
        }
    }

    /// Returns the default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# Ledger configuration
#
# Merge policy for pages without an application conflict resolver factory:
#   "none"                    = leave conflicting heads in place
#   "last_one_wins"           = newer commit wins overlapping keys (default)
#   "automatic_with_fallback" = merge disjoint changes, ask the factory's resolver otherwise
#   "custom"                  = ask the factory's resolver for every changed key
default_merge_policy = "last_one_wins"

# Number of changed keys handed to a conflict resolver per call.
custom_diff_chunk_size = 64

# Start the sync component of each page, if one is configured.
sync_enabled = true

# Backoff applied when two merge commits received from peers conflict,
# and between retries of a failed merge.
[backoff]
initial_delay_ms = 50
max_delay_ms = 60000
factor = 2
"#
    }

    /// Read, parse, and validate config from a file path
    ///
    /// # Errors
    ///
    /// `Config` if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> LedgerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: LedgerConfig = toml::from_str(&content).map_err(|e| {
            LedgerError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist
    pub fn write_default_if_missing(path: &Path) -> LedgerResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                LedgerError::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path
    pub fn write_to_file(&self, path: &Path) -> LedgerResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| LedgerError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            LedgerError::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
