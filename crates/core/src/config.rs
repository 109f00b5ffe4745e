use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `PULSE__` and passed explicitly into the engines.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub journey: JourneyConfig,
}

/// Tunables for the journey executor and scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct JourneyConfig {
    /// Minimum interval between rate-limit node traversals, per journey
    /// per user.
    #[serde(default = "default_rate_limit_interval_secs")]
    pub rate_limit_interval_secs: u64,
    /// Scheduler sweep period.
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    /// Platform reference timezone for local-time delays, as a fixed offset
    /// from UTC in minutes.
    #[serde(default = "default_reference_utc_offset_minutes")]
    pub reference_utc_offset_minutes: i32,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_rate_limit_interval_secs() -> u64 {
    3600
}
fn default_scheduler_tick_ms() -> u64 {
    1000
}
fn default_reference_utc_offset_minutes() -> i32 {
    0
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            rate_limit_interval_secs: default_rate_limit_interval_secs(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            reference_utc_offset_minutes: default_reference_utc_offset_minutes(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            journey: JourneyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.journey.rate_limit_interval_secs, 3600);
        assert_eq!(cfg.journey.reference_utc_offset_minutes, 0);
    }
}
