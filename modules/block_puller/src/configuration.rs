use std::time::Duration;

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PullerConfig {
    pub stall_timeout_secs: u64,
    pub stall_sweep_interval_secs: u64,
    pub max_in_flight_per_peer: usize,
    pub penalty_limit: u32,
    pub event_queue_size: usize,
}

impl PullerConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn stall_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stall_sweep_interval_secs.max(1))
    }
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 10,
            stall_sweep_interval_secs: 1,
            max_in_flight_per_peer: 16,
            penalty_limit: 3,
            event_queue_size: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_embedded_file() {
        let loaded = PullerConfig::try_load(&Config::default()).unwrap();
        assert_eq!(loaded, PullerConfig::default());
    }

    #[test]
    fn overrides_take_precedence() {
        let config = Config::builder().set_override("penalty-limit", 7).unwrap().build().unwrap();
        let loaded = PullerConfig::try_load(&config).unwrap();
        assert_eq!(loaded.penalty_limit, 7);
        assert_eq!(loaded.max_in_flight_per_peer, 16);
    }
}
