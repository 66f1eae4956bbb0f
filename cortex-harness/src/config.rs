//! Environment-driven configuration.
//!
//! The harness reads a small set of `CORTEX_*` variables plus the provider
//! key. Anything per-run (task, domain, flags) travels in
//! [`crate::agent::AgentRunConfig`] instead.

use crate::error::{Error, Result};

/// Default executor/critic model tier.
pub const DEFAULT_MODEL: &str = "claude-haiku-4-5";
/// Mid-tier model used by escalation.
pub const SONNET_MODEL: &str = "claude-sonnet-4-5";
/// Top-tier model used by escalation and the judge.
pub const OPUS_MODEL: &str = "claude-opus-4-6";

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct CortexConfig {
    pub anthropic_api_key: String,
    pub model_executor: String,
    pub model_critic: String,
    /// Judge model; derived one tier above the executor when unset.
    pub model_judge: Option<String>,
    pub enable_prompt_caching: bool,
}

impl CortexConfig {
    /// Load from environment variables.
    ///
    /// * `ANTHROPIC_API_KEY` — required
    /// * `CORTEX_MODEL_EXECUTOR`, `CORTEX_MODEL_CRITIC`, `CORTEX_MODEL_JUDGE`
    ///   — optional overrides
    /// * `CORTEX_ENABLE_PROMPT_CACHING` — boolean, default on
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::Configuration("ANTHROPIC_API_KEY is missing".into()))?;

        let model_executor = env_or("CORTEX_MODEL_EXECUTOR", DEFAULT_MODEL);
        let model_critic = env_or("CORTEX_MODEL_CRITIC", DEFAULT_MODEL);
        let model_judge = std::env::var("CORTEX_MODEL_JUDGE")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let enable_prompt_caching = !matches!(
            std::env::var("CORTEX_ENABLE_PROMPT_CACHING")
                .unwrap_or_else(|_| "1".into())
                .trim(),
            "" | "0" | "false" | "False"
        );

        Ok(CortexConfig {
            anthropic_api_key: api_key,
            model_executor,
            model_critic,
            model_judge,
            enable_prompt_caching,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn missing_api_key_is_a_configuration_error() {
        // Env manipulation requires the serial guard.
        unsafe { std::env::remove_var("ANTHROPIC_API_KEY") };
        assert!(CortexConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn overrides_and_caching_flag_are_honored() {
        unsafe {
            std::env::set_var("ANTHROPIC_API_KEY", "test-key");
            std::env::set_var("CORTEX_MODEL_EXECUTOR", "claude-sonnet-4-5");
            std::env::set_var("CORTEX_ENABLE_PROMPT_CACHING", "0");
        }
        let config = CortexConfig::from_env().unwrap();
        assert_eq!(config.model_executor, "claude-sonnet-4-5");
        assert_eq!(config.model_critic, DEFAULT_MODEL);
        assert!(!config.enable_prompt_caching);
        unsafe {
            std::env::remove_var("ANTHROPIC_API_KEY");
            std::env::remove_var("CORTEX_MODEL_EXECUTOR");
            std::env::remove_var("CORTEX_ENABLE_PROMPT_CACHING");
        }
    }
}
