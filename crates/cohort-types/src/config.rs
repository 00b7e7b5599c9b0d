//! Group configuration
//!
//! Every member of a group must agree on the group size. Sources are merged in
//! order: defaults, then an optional TOML file, then `COHORT_*` environment
//! variables. The merged result is validated before use.
//!
//! ```toml
//! group_size = 3
//! registry_dir = "/tmp/cohort"
//! lock_attempts = 50
//! lock_retry_delay_ms = 20
//!
//! [token]
//! bootstrap_delay_ms = 200
//! idle_hop_delay_ms = 0
//! ```

use crate::errors::{CohortError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable holding the group size
pub const ENV_GROUP_SIZE: &str = "COHORT_GROUP_SIZE";
/// Environment variable overriding the identity registry directory
pub const ENV_REGISTRY_DIR: &str = "COHORT_REGISTRY_DIR";
/// Environment variable overriding the lock attempt budget
pub const ENV_LOCK_ATTEMPTS: &str = "COHORT_LOCK_ATTEMPTS";
/// Environment variable overriding the token bootstrap delay, in milliseconds
pub const ENV_TOKEN_BOOTSTRAP_MS: &str = "COHORT_TOKEN_BOOTSTRAP_MS";
/// Environment variable overriding the idle token hop delay, in milliseconds
pub const ENV_TOKEN_IDLE_HOP_MS: &str = "COHORT_TOKEN_IDLE_HOP_MS";

/// Token ring timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Grace period before the coordinator originates the first token
    #[serde(rename = "bootstrap_delay_ms", with = "duration_ms")]
    pub bootstrap_delay: Duration,
    /// Pause before forwarding a token nobody here asked for; zero forwards immediately
    #[serde(rename = "idle_hop_delay_ms", with = "duration_ms")]
    pub idle_hop_delay: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            bootstrap_delay: Duration::from_millis(200),
            idle_hop_delay: Duration::ZERO,
        }
    }
}

/// Shared configuration of one process group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Number of members (N); must be identical on every member
    pub group_size: usize,
    /// Directory holding the shared id counter and its lock file
    pub registry_dir: PathBuf,
    /// Attempts to take the id counter lock before giving up
    pub lock_attempts: u32,
    /// Pause between lock attempts
    #[serde(rename = "lock_retry_delay_ms", with = "duration_ms")]
    pub lock_retry_delay: Duration,
    /// Token ring timings
    pub token: TokenConfig,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            group_size: 0,
            registry_dir: std::env::temp_dir(),
            lock_attempts: 50,
            lock_retry_delay: Duration::from_millis(20),
            token: TokenConfig::default(),
        }
    }
}

impl GroupConfig {
    /// Configuration for a group of `group_size` with default timings
    pub fn with_group_size(group_size: usize) -> Self {
        Self {
            group_size,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CohortError::configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: GroupConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from defaults, an optional file, and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    CohortError::configuration(format!("Failed to read {}: {e}", path.display()))
                })?;
                toml::from_str(&content)?
            }
            None => Self::default(),
        };
        config.merge_with_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults plus a key lookup (environment-shaped)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.merge_with_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields with any `COHORT_*` keys the lookup knows
    pub fn merge_with_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_GROUP_SIZE) {
            self.group_size = parse_field(ENV_GROUP_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_REGISTRY_DIR) {
            self.registry_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_LOCK_ATTEMPTS) {
            self.lock_attempts = parse_field(ENV_LOCK_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_TOKEN_BOOTSTRAP_MS) {
            self.token.bootstrap_delay =
                Duration::from_millis(parse_field(ENV_TOKEN_BOOTSTRAP_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_TOKEN_IDLE_HOP_MS) {
            self.token.idle_hop_delay =
                Duration::from_millis(parse_field(ENV_TOKEN_IDLE_HOP_MS, &value)?);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(CohortError::configuration("group size is missing or zero"));
        }
        if self.group_size > u32::MAX as usize {
            return Err(CohortError::configuration(format!(
                "group size {} exceeds the id space",
                self.group_size
            )));
        }
        if self.lock_attempts == 0 {
            return Err(CohortError::configuration("lock_attempts must be at least 1"));
        }
        Ok(())
    }
}

fn parse_field<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CohortError::configuration(format!("{key}={value:?}: {e}")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
