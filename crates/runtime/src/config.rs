//! Engine configuration, loadable from TOML the way this workspace's
//! compiler config has always been.

use serde::{Deserialize, Serialize};

use gab_compiler::limits;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads running fibers, not counting the
    /// dedicated collector worker. `cGAB_DEFAULT_NJOBS` is 8.
    pub worker_count: usize,
    /// How many idle spins a worker takes before parking when its local
    /// queue and the global work channel are both empty.
    pub worker_idle_tries: u32,
    /// Inline send-cache length; must be a power of two, at least 4.
    pub send_cache_len: usize,
    pub frames_max: usize,
    pub stack_max: usize,
    /// Capacity of each worker's local job queue ring buffer.
    pub worker_localqueue_max: usize,
    /// Capacity of each worker's per-epoch GC increment/decrement/stack
    /// buffers before a collection cycle is forced early.
    pub gc_buffer_max: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: limits::GAB_DEFAULT_NJOBS,
            worker_idle_tries: 1,
            send_cache_len: limits::GAB_SEND_CACHE_LEN,
            frames_max: limits::GAB_FRAMES_MAX,
            stack_max: limits::GAB_STACK_MAX,
            worker_localqueue_max: limits::GAB_WORKER_LOCALQUEUE_MAX,
            gc_buffer_max: limits::GAB_STACK_MAX * limits::GAB_WORKER_LOCALQUEUE_MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid engine configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(src).map_err(|e| ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_cache_len < 4 || !self.send_cache_len.is_power_of_two() {
            return Err(ConfigError(format!(
                "send_cache_len must be a power of two >= 4, got {}",
                self.send_cache_len
            )));
        }
        if self.worker_count == 0 {
            return Err(ConfigError("worker_count must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_cache_len() {
        let mut config = EngineConfig::default();
        config.send_cache_len = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_from_toml() {
        let config = EngineConfig::from_toml_str("worker_count = 4\n").unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.send_cache_len, EngineConfig::default().send_cache_len);
    }
}
