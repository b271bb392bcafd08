//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::knowledge::SkillEdgePolicy;

/// Triage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub workflow: WorkflowConfig,
    pub graph: GraphConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Additional attempts after the first one fails with a retriable error
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub step_timeout_secs: u64,
    pub similar_tickets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub skill_edge_policy: SkillEdgePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub from: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            default_model: "google/gemini-2.0-flash-lite-001".to_string(),
            fallback_models: vec!["openai/gpt-4o-mini".to_string()],
            temperature: 0.2,
            max_tokens: 2048,
            timeout_secs: 60,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "google/text-embedding-004".to_string(),
            dimensions: crate::embedding::EMBEDDING_DIMENSIONS,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_base_ms: 1000,
            step_timeout_secs: 120,
            similar_tickets: 3,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            skill_edge_policy: SkillEdgePolicy::Accumulate,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: "NOREPLY Triage".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            workflow: WorkflowConfig::default(),
            graph: GraphConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("TRIAGE_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        Ok(self.resolved_api_key()?.map(|key| redact_key(&key)))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

/// Last four characters of `key`, or nothing when it is that short
fn redact_key(key: &str) -> String {
    let count = key.chars().count();
    if count <= 4 {
        return "***".to_string();
    }
    let suffix: String = key.chars().skip(count - 4).collect();
    format!("***{}", suffix)
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("TRIAGE_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("triage")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or fall back to defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;
        if self.embedding.dimensions == 0 {
            return Err(anyhow!("embedding.dimensions must be greater than zero"));
        }
        if self.workflow.similar_tickets == 0 {
            return Err(anyhow!("workflow.similar_tickets must be greater than zero"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "llm.base_url" => Ok(self.llm.base_url.clone()),
            "llm.default_model" => Ok(self.llm.default_model.clone()),
            "llm.fallback_models" => Ok(self.llm.fallback_models.join(", ")),
            "llm.temperature" => Ok(self.llm.temperature.to_string()),
            "llm.max_tokens" => Ok(self.llm.max_tokens.to_string()),
            "llm.timeout_secs" => Ok(self.llm.timeout_secs.to_string()),

            "embedding.model" => Ok(self.embedding.model.clone()),
            "embedding.dimensions" => Ok(self.embedding.dimensions.to_string()),

            "workflow.retries" => Ok(self.workflow.retries.to_string()),
            "workflow.backoff_base_ms" => Ok(self.workflow.backoff_base_ms.to_string()),
            "workflow.step_timeout_secs" => Ok(self.workflow.step_timeout_secs.to_string()),
            "workflow.similar_tickets" => Ok(self.workflow.similar_tickets.to_string()),

            "graph.skill_edge_policy" => Ok(self.graph.skill_edge_policy.as_str().to_string()),

            "mail.from" => Ok(self.mail.from.clone()),

            // API key (special handling - show redacted)
            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok("(not set - use TRIAGE_API_KEY or OPENROUTER_API_KEY env var)".to_string()),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `triage config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "llm.base_url" => {
                self.llm.base_url = value.trim_end_matches('/').to_string();
            }
            "llm.default_model" => {
                self.llm.default_model = value.to_string();
            }
            "llm.fallback_models" => {
                self.llm.fallback_models = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "llm.temperature" => {
                let temp: f32 = value
                    .parse()
                    .with_context(|| format!("Invalid temperature value: {}", value))?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                self.llm.temperature = temp;
            }
            "llm.max_tokens" => {
                self.llm.max_tokens = value
                    .parse()
                    .with_context(|| format!("Invalid max_tokens value: {}", value))?;
            }
            "llm.timeout_secs" => {
                self.llm.timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout_secs value: {}", value))?;
            }

            "embedding.model" => {
                self.embedding.model = value.to_string();
            }
            "embedding.dimensions" => {
                let dims: usize = value
                    .parse()
                    .with_context(|| format!("Invalid dimensions value: {}", value))?;
                if dims == 0 {
                    return Err(anyhow!("Embedding dimensions must be greater than zero"));
                }
                self.embedding.dimensions = dims;
            }

            "workflow.retries" => {
                self.workflow.retries = value
                    .parse()
                    .with_context(|| format!("Invalid retries value: {}", value))?;
            }
            "workflow.backoff_base_ms" => {
                self.workflow.backoff_base_ms = value
                    .parse()
                    .with_context(|| format!("Invalid backoff_base_ms value: {}", value))?;
            }
            "workflow.step_timeout_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid step_timeout_secs value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("Step timeout must be at least one second"));
                }
                self.workflow.step_timeout_secs = secs;
            }
            "workflow.similar_tickets" => {
                let k: usize = value
                    .parse()
                    .with_context(|| format!("Invalid similar_tickets value: {}", value))?;
                if k == 0 {
                    return Err(anyhow!("similar_tickets must be greater than zero"));
                }
                self.workflow.similar_tickets = k;
            }

            "graph.skill_edge_policy" => {
                self.graph.skill_edge_policy = SkillEdgePolicy::parse(value).ok_or_else(|| {
                    anyhow!(
                        "Invalid skill edge policy: {}. Valid options: accumulate, replace",
                        value
                    )
                })?;
            }

            "mail.from" => {
                self.mail.from = value.to_string();
            }

            // API key cannot be set via config
            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the TRIAGE_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `triage config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "llm.base_url",
            "llm.default_model",
            "llm.fallback_models",
            "llm.temperature",
            "llm.max_tokens",
            "llm.timeout_secs",
            "llm.api_key",
            "embedding.model",
            "embedding.dimensions",
            "workflow.retries",
            "workflow.backoff_base_ms",
            "workflow.step_timeout_secs",
            "workflow.similar_tickets",
            "graph.skill_edge_policy",
            "mail.from",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
