use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::models::Persona;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Minimum gap between AI-initiated responses to one user, in minutes.
    #[serde(default = "default_bombardment_window_mins")]
    pub bombardment_window_mins: u32,

    /// Entries shorter than this never get a response.
    #[serde(default = "default_min_entry_chars")]
    pub min_entry_chars: usize,

    /// Trailing window within which a user counts as active, in days.
    #[serde(default = "default_active_window_days")]
    pub active_window_days: u32,

    #[serde(default = "default_persona")]
    pub default_persona: Persona,

    /// Upper bound on personas responding to one entry (premium/beta).
    #[serde(default = "default_max_personas_per_entry")]
    pub max_personas_per_entry: usize,

    /// Stagger between two personas on the same entry, minutes.
    #[serde(default = "default_stagger_min_mins")]
    pub stagger_min_mins: u32,
    #[serde(default = "default_stagger_max_mins")]
    pub stagger_max_mins: u32,

    /// Delivery jitter for webhook/follow-up jobs, minutes.
    #[serde(default = "default_immediate_jitter_min_mins")]
    pub immediate_jitter_min_mins: u32,
    #[serde(default = "default_immediate_jitter_max_mins")]
    pub immediate_jitter_max_mins: u32,

    /// Upper bound on the sweep-path delivery window, hours.
    #[serde(default = "default_sweep_window_hours")]
    pub sweep_window_hours: u32,

    #[serde(default = "default_immediate_cycle_secs")]
    pub immediate_cycle_secs: u64,
    #[serde(default = "default_main_cycle_secs")]
    pub main_cycle_secs: u64,
    #[serde(default = "default_analytics_cycle_secs")]
    pub analytics_cycle_secs: u64,

    /// Local hour (0-23) at which the daily cleanup cycle runs.
    #[serde(default = "default_cleanup_hour_local")]
    pub cleanup_hour_local: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// PENDING jobs older than this are expired to SKIPPED.
    #[serde(default = "default_pending_ttl_hours")]
    pub pending_ttl_hours: u32,

    /// A GENERATING lease older than this is considered abandoned.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,

    #[serde(default = "default_analytics_retention_days")]
    pub analytics_retention_days: u32,

    /// How far back the main-cycle sweep looks for unanswered entries, hours.
    #[serde(default = "default_sweep_lookback_hours")]
    pub sweep_lookback_hours: u32,

    #[serde(default = "default_llm_api_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

fn default_database_path() -> String {
    "penpal_scheduler.db".to_string()
}

fn default_bombardment_window_mins() -> u32 {
    120
}

fn default_min_entry_chars() -> usize {
    20
}

fn default_active_window_days() -> u32 {
    7
}

fn default_persona() -> Persona {
    Persona::Pulse
}

fn default_max_personas_per_entry() -> usize {
    2
}

fn default_stagger_min_mins() -> u32 {
    2
}

fn default_stagger_max_mins() -> u32 {
    10
}

fn default_immediate_jitter_min_mins() -> u32 {
    5
}

fn default_immediate_jitter_max_mins() -> u32 {
    60
}

fn default_sweep_window_hours() -> u32 {
    12
}

fn default_immediate_cycle_secs() -> u64 {
    60
}

fn default_main_cycle_secs() -> u64 {
    300
}

fn default_analytics_cycle_secs() -> u64 {
    900
}

fn default_cleanup_hour_local() -> u32 {
    0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_pending_ttl_hours() -> u32 {
    24
}

fn default_lease_timeout_secs() -> u64 {
    120
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_analytics_retention_days() -> u32 {
    30
}

fn default_sweep_lookback_hours() -> u32 {
    48
}

fn default_llm_api_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.1".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            bombardment_window_mins: default_bombardment_window_mins(),
            min_entry_chars: default_min_entry_chars(),
            active_window_days: default_active_window_days(),
            default_persona: default_persona(),
            max_personas_per_entry: default_max_personas_per_entry(),
            stagger_min_mins: default_stagger_min_mins(),
            stagger_max_mins: default_stagger_max_mins(),
            immediate_jitter_min_mins: default_immediate_jitter_min_mins(),
            immediate_jitter_max_mins: default_immediate_jitter_max_mins(),
            sweep_window_hours: default_sweep_window_hours(),
            immediate_cycle_secs: default_immediate_cycle_secs(),
            main_cycle_secs: default_main_cycle_secs(),
            analytics_cycle_secs: default_analytics_cycle_secs(),
            cleanup_hour_local: default_cleanup_hour_local(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            pending_ttl_hours: default_pending_ttl_hours(),
            lease_timeout_secs: default_lease_timeout_secs(),
            generation_timeout_secs: default_generation_timeout_secs(),
            analytics_retention_days: default_analytics_retention_days(),
            sweep_lookback_hours: default_sweep_lookback_hours(),
            llm_api_url: default_llm_api_url(),
            llm_api_key: None,
            llm_model: default_llm_model(),
        }
    }
}

impl SchedulerConfig {
    pub fn config_path() -> PathBuf {
        env::var("PENPAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("penpal.toml"))
    }

    /// Load config from the TOML file if present, else defaults. A malformed
    /// file is an error rather than a silent fallback.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        if let Ok(key) = env::var("PENPAL_LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, raw)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn bombardment_window_secs(&self) -> i64 {
        self.bombardment_window_mins as i64 * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SchedulerConfig::default();
        assert_eq!(config.bombardment_window_mins, 120);
        assert_eq!(config.max_attempts, 3);
        assert!(config.stagger_min_mins < config.stagger_max_mins);
        assert!(config.immediate_jitter_min_mins < config.immediate_jitter_max_mins);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: SchedulerConfig =
            toml::from_str("bombardment_window_mins = 30\nmin_entry_chars = 5\n")
                .expect("parse partial config");
        assert_eq!(config.bombardment_window_mins, 30);
        assert_eq!(config.min_entry_chars, 5);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.default_persona, Persona::Pulse);
    }
}
