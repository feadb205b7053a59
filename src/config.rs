//! Configuration management for plangraph.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required by the binary. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. Model for planning and joining. Defaults to `openai/gpt-4o-mini`.
//! - `PLANGRAPH_MAX_WORKERS` - Optional. Concurrent task limit. Defaults to `4`.
//! - `PLANGRAPH_MAX_ROUNDS` - Optional. Planning rounds per run. Defaults to `3`.
//! - `PLANGRAPH_MAX_PLAN_ATTEMPTS` - Optional. Plan regenerations after a parse error. Defaults to `3`.
//! - `PLANGRAPH_TASK_TIMEOUT_SECS` - Optional. Per-task timeout. Defaults to `60`.
//! - `PLANGRAPH_ROUND_TIMEOUT_SECS` - Optional. Per-round timeout. Defaults to `120`.
//! - `PLANGRAPH_CAPABILITY_TIMEOUT_SECS` - Optional. Limit on each planner or synthesizer call. Defaults to `120`.
//! - `PLANGRAPH_TASK_ATTEMPTS` - Optional. Attempts per task, first included. Defaults to `2`.
//! - `PLANGRAPH_FAILURE_POLICY` - Optional. `fail-fast` or `best-effort`. Defaults to `fail-fast`.
//! - `PLANGRAPH_ON_EXHAUSTION` - Optional. `partial` or `fail`. Defaults to `partial`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// What happens to dependents of a failed or skipped task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Dependents are skipped and never run
    #[default]
    FailFast,
    /// Dependents run with `null` in place of the missing result
    BestEffort,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "failfast" => Ok(FailurePolicy::FailFast),
            "best-effort" | "best_effort" | "besteffort" => Ok(FailurePolicy::BestEffort),
            other => Err(format!("expected fail-fast or best-effort, got '{}'", other)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => f.write_str("fail-fast"),
            FailurePolicy::BestEffort => f.write_str("best-effort"),
        }
    }
}

/// What a run returns once `max_rounds` replans are used up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Synthesize a partial answer from every round's successful results, if any
    #[default]
    PartialAnswer,
    /// Fail the run
    Fail,
}

impl FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partial" | "partial-answer" | "partial_answer" => Ok(ExhaustionPolicy::PartialAnswer),
            "fail" => Ok(ExhaustionPolicy::Fail),
            other => Err(format!("expected partial or fail, got '{}'", other)),
        }
    }
}

/// Engine limits and policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size (W)
    pub max_workers: usize,
    /// Planning rounds per run, the first included
    pub max_rounds: u32,
    /// Planner calls per round before a parse error fails the run
    pub max_plan_attempts: u32,
    pub task_timeout: Duration,
    pub round_timeout: Duration,
    /// Limit on a single planner or synthesizer call
    pub capability_timeout: Duration,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub exhaustion_policy: ExhaustionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_rounds: 3,
            max_plan_attempts: 3,
            task_timeout: Duration::from_secs(60),
            round_timeout: Duration::from_secs(120),
            capability_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::FailFast,
            exhaustion_policy: ExhaustionPolicy::PartialAnswer,
        }
    }
}

impl EngineConfig {
    /// Load engine settings from `PLANGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load engine settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_workers: usize = parse_var(&lookup, "PLANGRAPH_MAX_WORKERS", defaults.max_workers)?;
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "PLANGRAPH_MAX_WORKERS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let max_rounds: u32 = parse_var(&lookup, "PLANGRAPH_MAX_ROUNDS", defaults.max_rounds)?;
        if max_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "PLANGRAPH_MAX_ROUNDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let task_attempts: u32 =
            parse_var(&lookup, "PLANGRAPH_TASK_ATTEMPTS", defaults.retry.max_attempts)?;

        Ok(Self {
            max_workers,
            max_rounds,
            max_plan_attempts: parse_var(
                &lookup,
                "PLANGRAPH_MAX_PLAN_ATTEMPTS",
                defaults.max_plan_attempts,
            )?
            .max(1),
            task_timeout: Duration::from_secs(parse_var(
                &lookup,
                "PLANGRAPH_TASK_TIMEOUT_SECS",
                defaults.task_timeout.as_secs(),
            )?),
            round_timeout: Duration::from_secs(parse_var(
                &lookup,
                "PLANGRAPH_ROUND_TIMEOUT_SECS",
                defaults.round_timeout.as_secs(),
            )?),
            capability_timeout: Duration::from_secs(parse_var(
                &lookup,
                "PLANGRAPH_CAPABILITY_TIMEOUT_SECS",
                defaults.capability_timeout.as_secs(),
            )?),
            retry: RetryPolicy {
                max_attempts: task_attempts.max(1),
                ..defaults.retry
            },
            failure_policy: parse_var(&lookup, "PLANGRAPH_FAILURE_POLICY", defaults.failure_policy)?,
            exhaustion_policy: parse_var(
                &lookup,
                "PLANGRAPH_ON_EXHAUSTION",
                defaults.exhaustion_policy,
            )?,
        })
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_max_plan_attempts(mut self, attempts: u32) -> Self {
        self.max_plan_attempts = attempts.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    pub fn with_capability_timeout(mut self, timeout: Duration) -> Self {
        self.capability_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

/// Binary configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// LLM model identifier (OpenRouter format) for planner and joiner
    pub default_model: String,

    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        Ok(Self {
            api_key,
            default_model,
            engine: EngineConfig::from_env()?,
        })
    }
}
