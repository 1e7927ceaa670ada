//! Kernel configuration.
//!
//! Settings load in three layers: built-in defaults, an optional
//! `.aqua/config.yaml`, and `AQUA_*` environment variables. Later layers
//! win. Every key is optional; a missing file is not an error, a malformed
//! file or override is.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Tunable kernel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Leadership lease duration in seconds.
    #[serde(default = "default_leader_lease")]
    pub leader_lease_seconds: u64,

    /// Spacing between leader-driven recovery sweeps.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Heartbeat age beyond which an agent is a death candidate.
    #[serde(default = "default_dead_threshold")]
    pub agent_dead_threshold_seconds: u64,

    /// Claim age beyond which a task is treated as stuck.
    #[serde(default = "default_claim_timeout")]
    pub task_claim_timeout_seconds: u64,

    /// Priority assigned to tasks added without an explicit one.
    #[serde(default = "default_priority")]
    pub default_priority: i64,

    /// Per-task retry ceiling.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
}

const fn default_leader_lease() -> u64 {
    30
}

const fn default_heartbeat_interval() -> u64 {
    10
}

const fn default_dead_threshold() -> u64 {
    300
}

const fn default_claim_timeout() -> u64 {
    1800
}

const fn default_priority() -> i64 {
    5
}

const fn default_max_retries() -> i64 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leader_lease_seconds: default_leader_lease(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            agent_dead_threshold_seconds: default_dead_threshold(),
            task_claim_timeout_seconds: default_claim_timeout(),
            default_priority: default_priority(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    /// Loads configuration for a project: defaults, then
    /// `<aqua_dir>/config.yaml` if present, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file is present but
    /// unparseable, or an `AQUA_*` override is not a valid integer.
    pub fn load(aqua_dir: &Path) -> crate::Result<Self> {
        let mut config = Self::default();

        let path = aqua_dir.join("config.yaml");
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            config = serde_yaml::from_str(&text)
                .map_err(|e| crate::Error::Config(format!("{}: {e}", path.display())))?;
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `AQUA_*` environment overrides in place.
    fn apply_env_overrides(&mut self) -> crate::Result<()> {
        override_u64("AQUA_LEADER_LEASE_SECONDS", &mut self.leader_lease_seconds)?;
        override_u64(
            "AQUA_HEARTBEAT_INTERVAL_SECONDS",
            &mut self.heartbeat_interval_seconds,
        )?;
        override_u64(
            "AQUA_AGENT_DEAD_THRESHOLD_SECONDS",
            &mut self.agent_dead_threshold_seconds,
        )?;
        override_u64(
            "AQUA_TASK_CLAIM_TIMEOUT_SECONDS",
            &mut self.task_claim_timeout_seconds,
        )?;
        override_i64("AQUA_DEFAULT_PRIORITY", &mut self.default_priority)?;
        override_i64("AQUA_MAX_RETRIES", &mut self.max_retries)?;
        Ok(())
    }
}

fn override_u64(var: &str, slot: &mut u64) -> crate::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .parse()
            .map_err(|_| crate::Error::Config(format!("{var}={raw} is not a valid integer")))?;
    }
    Ok(())
}

fn override_i64(var: &str, slot: &mut i64) -> crate::Result<()> {
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .parse()
            .map_err(|_| crate::Error::Config(format!("{var}={raw} is not a valid integer")))?;
    }
    Ok(())
}

/// Whether machine-readable output was requested via `AQUA_JSON`.
///
/// Any value other than empty, `0`, or `false` counts as truthy.
#[must_use]
pub fn json_output_requested() -> bool {
    std::env::var("AQUA_JSON")
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}
