use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use claim_flow::rig_model::DEFAULT_MODEL;
use claim_flow::{ConversationConfig, OutputStrategy};

/// Everything the service reads from the environment, once, at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    /// `pretty` for humans, anything else logs JSON.
    pub log_format: String,
    /// Absent means in-memory store and directory.
    pub database_url: Option<String>,
    pub openrouter_api_key: String,
    pub model: String,
    pub conversation: ConversationConfig,
    /// YAML seed for the in-memory directory; the bundled one otherwise.
    pub directory_seed: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(openrouter_api_key) = var("OPENROUTER_API_KEY") else {
            bail!("OPENROUTER_API_KEY not set");
        };

        let port = match var("PORT") {
            Some(raw) => raw.parse::<u16>().with_context(|| format!("invalid PORT {raw:?}"))?,
            None => 3000,
        };

        let defaults = ConversationConfig::default();
        let max_tool_rounds = match var("CLAIMS_MAX_TOOL_ROUNDS") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid CLAIMS_MAX_TOOL_ROUNDS {raw:?}"))?,
            None => defaults.max_tool_rounds,
        };
        if max_tool_rounds == 0 {
            bail!("CLAIMS_MAX_TOOL_ROUNDS must be at least 1");
        }
        let model_timeout = match var("CLAIMS_MODEL_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .with_context(|| format!("invalid CLAIMS_MODEL_TIMEOUT_SECS {raw:?}"))?,
            ),
            None => defaults.model_timeout,
        };
        let strategy = match var("CLAIMS_OUTPUT_STRATEGY") {
            Some(raw) => match OutputStrategy::parse(&raw) {
                Some(strategy) => strategy,
                None => bail!(
                    "unknown CLAIMS_OUTPUT_STRATEGY {raw:?} (tool_calling | json_envelope)"
                ),
            },
            None => defaults.strategy,
        };

        Ok(Self {
            port,
            log_format: var("LOG_FORMAT").unwrap_or_else(|| "json".to_string()),
            database_url: var("DATABASE_URL"),
            openrouter_api_key,
            model: var("CLAIMS_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            conversation: ConversationConfig {
                max_tool_rounds,
                model_timeout,
                strategy,
            },
            directory_seed: var("CLAIMS_DIRECTORY_SEED").map(PathBuf::from),
        })
    }
}
