use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "dataloop.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_level: String,
    /// Also append log lines here.
    pub log_file: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub llm: LlmConfig,
    #[serde(rename = "loop")]
    pub run_loop: LoopConfig,
    pub checkpoint: CheckpointConfig,
    pub claim: ClaimConfig,
    pub retry: RetryPolicy,
    pub backends: BackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub api_version: String,
    pub stream: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub tool_timeout_secs: u64,
    pub max_rows_in_result: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    pub staleness_secs: u64,
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub sql_url: Option<String>,
    pub cypher_url: Option<String>,
    pub docs_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            database_path: None,
            llm: LlmConfig::default(),
            run_loop: LoopConfig::default(),
            checkpoint: CheckpointConfig::default(),
            claim: ClaimConfig::default(),
            retry: RetryPolicy::default(),
            backends: BackendConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            api_version: "2023-06-01".to_string(),
            stream: true,
            timeout_secs: 120,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            tool_timeout_secs: 60,
            max_rows_in_result: 50,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { timeout_ms: 2_000 }
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 120,
            heartbeat_secs: 30,
        }
    }
}

impl ClaimConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl LoopConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using default configuration.", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded config: model={}, max_iterations={}, staleness={}s",
            config.llm.model, config.run_loop.max_iterations, config.claim.staleness_secs
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.llm.base_url)
            .with_context(|| format!("invalid llm.base_url '{}'", self.llm.base_url))?;
        for backend in [&self.backends.sql_url, &self.backends.cypher_url]
            .into_iter()
            .flatten()
        {
            url::Url::parse(backend).with_context(|| format!("invalid backend url '{}'", backend))?;
        }
        if self.run_loop.max_iterations == 0 {
            bail!("loop.max_iterations must be at least 1");
        }
        if self.claim.heartbeat_secs == 0 || self.claim.heartbeat_secs >= self.claim.staleness_secs
        {
            bail!(
                "claim.heartbeat_secs ({}) must be non-zero and shorter than claim.staleness_secs ({})",
                self.claim.heartbeat_secs,
                self.claim.staleness_secs
            );
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dataloop")
                .join("runs.db")
        })
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}
