use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::stabilize::Stabilizer;
use crate::state::Limits;
use crate::types::{
    LABEL_MAX_CHARS, MAX_ATTEMPTS_PER_STEP, MAX_STEPS_PER_TASK, MAX_TASK_DURATION_SECS,
    PAGE_TEXT_MAX_CHARS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub limits: LimitsConfig,
    pub oracle: OracleConfig,
    pub inventory_cap: usize,
    pub label_cap: usize,
    pub page_text_cap: usize,
    pub snapshot_freshness_secs: u64,
    pub rate_limit_cooldown_ms: u64,
    pub after_action: StabilizationConfig,
    pub after_resume: StabilizationConfig,
    pub timing: ExecutorTiming,
    /// Where snapshots and saved keys live. Defaults to the local data dir.
    pub state_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            oracle: OracleConfig::default(),
            inventory_cap: 100,
            label_cap: LABEL_MAX_CHARS,
            page_text_cap: PAGE_TEXT_MAX_CHARS,
            snapshot_freshness_secs: 300,
            rate_limit_cooldown_ms: 5000,
            after_action: StabilizationConfig {
                min_wait_ms: 500,
                max_wait_ms: 3000,
                debounce_ms: 300,
            },
            after_resume: StabilizationConfig {
                min_wait_ms: 1000,
                max_wait_ms: 10_000,
                debounce_ms: 500,
            },
            timing: ExecutorTiming::default(),
            state_file: None,
        }
    }
}

impl AgentConfig {
    pub fn task_limits(&self) -> Limits {
        Limits {
            max_steps: self.limits.max_steps,
            max_attempts: self.limits.max_attempts,
            max_duration: Duration::from_secs(self.limits.max_duration_secs),
            min_call_delay: Duration::from_millis(self.limits.min_call_delay_ms),
        }
    }

    pub fn snapshot_freshness(&self) -> Duration {
        Duration::from_secs(self.snapshot_freshness_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("page-agent")
                .join("state.json")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_steps: u32,
    pub max_attempts: u32,
    pub max_duration_secs: u64,
    pub min_call_delay_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS_PER_TASK,
            max_attempts: MAX_ATTEMPTS_PER_STEP,
            max_duration_secs: MAX_TASK_DURATION_SECS,
            min_call_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    /// Environment variable consulted before the key-value store.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.1,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StabilizationConfig {
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub debounce_ms: u64,
}

impl StabilizationConfig {
    pub fn stabilizer(&self) -> Stabilizer {
        Stabilizer::new(
            Duration::from_millis(self.min_wait_ms),
            Duration::from_millis(self.max_wait_ms),
            Duration::from_millis(self.debounce_ms),
        )
    }
}

/// Fixed delays inside the executor, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorTiming {
    /// Between highlighting the target and the first synthetic event.
    pub settle_ms: u64,
    /// Between the approach sequence and the press.
    pub press_delay_ms: u64,
    pub click_follow_ms: u64,
    /// Left for hover-triggered UI to render.
    pub hover_follow_ms: u64,
    pub force_open_follow_ms: u64,
    pub default_wait_ms: u64,
    /// Upper bound on an oracle-requested wait.
    pub max_wait_ms: u64,
}

impl Default for ExecutorTiming {
    fn default() -> Self {
        Self {
            settle_ms: 300,
            press_delay_ms: 100,
            click_follow_ms: 250,
            hover_follow_ms: 700,
            force_open_follow_ms: 500,
            default_wait_ms: 2000,
            max_wait_ms: 10_000,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from default locations:
    /// 1. ./page-agent.yaml
    /// 2. ~/.page-agent/config.yaml
    /// 3. Default configuration
    pub async fn load_default() -> Result<AgentConfig, ConfigError> {
        let local_config = PathBuf::from("./page-agent.yaml");
        if local_config.exists() {
            return Self::load_from(&local_config).await;
        }

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".page-agent").join("config.yaml");
            if home_config.exists() {
                return Self::load_from(&home_config).await;
            }
        }

        Ok(AgentConfig::default())
    }

    pub async fn load_from(path: &Path) -> Result<AgentConfig, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AgentConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = AgentConfig::default();
        let limits = config.task_limits();
        assert_eq!(limits.max_steps, 25);
        assert_eq!(limits.max_attempts, 3);
        assert_eq!(limits.max_duration, Duration::from_secs(300));
        assert_eq!(config.inventory_cap, 100);
        assert_eq!(config.rate_limit_cooldown(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn partial_yaml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page-agent.yaml");
        std::fs::write(
            &path,
            "inventory_cap: 250\nlimits:\n  max_steps: 40\noracle:\n  model: gpt-4o-mini\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from(&path).await.unwrap();
        assert_eq!(config.inventory_cap, 250);
        assert_eq!(config.limits.max_steps, 40);
        assert_eq!(config.limits.max_attempts, 3);
        assert_eq!(config.oracle.model, "gpt-4o-mini");
        assert_eq!(config.after_resume.max_wait_ms, 10_000);
    }
}
