//! Engine configuration (SPEC_FULL.md §2c).
//!
//! Grounded on the teacher's `config.rs` TOML-backed settings struct, kept
//! for the knobs this engine actually has: a PARALLEL concurrency cap, the
//! default event-channel capacity, and a ceiling on SLEEP/FOR numeric-mode
//! durations so a misconfigured flow can't block a run indefinitely.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently-running PARALLEL branches, enforced by a
    /// `tokio::sync::Semaphore` each branch acquires before dispatching its
    /// task (`actions::parallel`). `0` means unbounded.
    pub max_parallel_concurrency: usize,
    /// Capacity of each run's `EventBus` broadcast channel, passed through
    /// by `Engine::new`.
    pub event_channel_capacity: usize,
    /// Longest duration a SLEEP task or an EVALUATE branch's `sleep` may
    /// request, in seconds, enforced by `RunContext::enforce_sleep_ceiling`.
    /// `None` means no ceiling.
    pub max_sleep_seconds: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_concurrency: 0,
            event_channel_capacity: 256,
            max_sleep_seconds: None,
        }
    }
}

impl EngineConfig {
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowError::Config {
                reason: format!("reading {}: {e}", path.display()),
            })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FlowError::Config {
            reason: e.to_string(),
        })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FlowError::Config {
            reason: e.to_string(),
        })
    }

    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let rendered = self.to_toml_string()?;
        tokio::fs::write(path.as_ref(), rendered)
            .await
            .map_err(|e| FlowError::Config {
                reason: format!("writing {}: {e}", path.as_ref().display()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = EngineConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.event_channel_capacity, config.event_channel_capacity);
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = EngineConfig::from_toml_str("not = [valid").unwrap_err();
        assert!(matches!(err, FlowError::Config { .. }));
    }

    #[tokio::test]
    async fn saves_and_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowk.toml");
        let mut config = EngineConfig::default();
        config.max_parallel_concurrency = 4;
        config.save_to_file(&path).await.unwrap();

        let loaded = EngineConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.max_parallel_concurrency, 4);
    }
}
