//! Configuration management for prismd.
//!
//! Loads settings from $PRISM_CONFIG, /etc/prism/config.toml or
//! /var/lib/prism/config.toml, falling back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = prism_shared::CONFIG_PATH;

/// Default config file path for fallback
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/prism/config.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV: &str = "PRISM_CONFIG";

/// Shortest adaptation period accepted
const MIN_PERIOD_MS: u64 = 1_000;

/// Adaptation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// How strongly the loop adapts, 0..1. Cycles are skipped below 0.1.
    #[serde(default = "default_adaptation_level")]
    pub adaptation_level: f64,

    /// Quantum event intensity, 0..1
    #[serde(default = "default_quantum_randomness")]
    pub quantum_randomness: f64,

    /// Period between timer-driven cycles when the mode does not override it
    #[serde(default = "default_adaptation_period")]
    pub adaptation_period_ms: u64,

    /// Idle time after which the user counts as passive
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_ms: u64,

    /// Interactions per minute considered fully engaged
    #[serde(default = "default_threshold_frequency")]
    pub threshold_frequency: f64,

    /// Mode entered at startup
    #[serde(default = "default_initial_mode")]
    pub initial_mode: String,

    /// Seed for decision and quantum randomness (random when unset)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_adaptation_level() -> f64 {
    0.5
}

fn default_quantum_randomness() -> f64 {
    0.3
}

fn default_adaptation_period() -> u64 {
    30_000
}

fn default_idle_threshold() -> u64 {
    60_000
}

fn default_threshold_frequency() -> f64 {
    10.0
}

fn default_initial_mode() -> String {
    prism_shared::mode::CONTEMPLATIVE.to_string()
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            adaptation_level: default_adaptation_level(),
            quantum_randomness: default_quantum_randomness(),
            adaptation_period_ms: default_adaptation_period(),
            idle_threshold_ms: default_idle_threshold(),
            threshold_frequency: default_threshold_frequency(),
            initial_mode: default_initial_mode(),
            seed: None,
        }
    }
}

impl AdaptationConfig {
    pub fn adaptation_period(&self) -> Duration {
        Duration::from_millis(self.adaptation_period_ms)
    }
}

/// Reasoning service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// AI-assisted decisions enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Answer locally with deterministic synthetic responses
    #[serde(default = "default_true")]
    pub simulate: bool,

    /// Base URL of an OpenAI-compatible endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Minimum delay between dispatched requests
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Latency of simulated responses
    #[serde(default = "default_simulate_latency")]
    pub simulate_latency_ms: u64,

    /// Consecutive AI failures before the AI path is skipped
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Decisions to skip the AI path for after the threshold is hit
    #[serde(default = "default_cooldown_cycles")]
    pub cooldown_cycles: u32,
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5:7b-instruct".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    500
}

fn default_request_delay() -> u64 {
    500
}

fn default_timeout() -> u64 {
    30
}

fn default_simulate_latency() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_cycles() -> u32 {
    5
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            simulate: true,
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_delay_ms: default_request_delay(),
            timeout_secs: default_timeout(),
            simulate_latency_ms: default_simulate_latency(),
            failure_threshold: default_failure_threshold(),
            cooldown_cycles: default_cooldown_cycles(),
        }
    }
}

impl ReasoningConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Bearer token read from `api_key_env`, if configured and set
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_ref()?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Persist the cache to this file when set
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_max_entries() -> usize {
    100
}

fn default_ttl() -> u64 {
    3_600
}

fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            default_ttl_secs: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            path: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Configured path, or the user cache directory
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(|| {
            dirs::cache_dir().map(|dir| dir.join("prism").join("response_cache.json"))
        })
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub adaptation: AdaptationConfig,

    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Load config from the first readable location, or return defaults
    pub fn load() -> Self {
        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from(CONFIG_PATH));
        candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

        for path in &candidates {
            match Self::load_from_path(path) {
                Ok(config) => return config,
                Err(e) => warn!("Config not loaded from {}: {:#}", path.display(), e),
            }
        }

        warn!("Config not found, using defaults");
        Config::default()
    }

    /// Load config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config.sanitized())
    }

    /// Clamp out-of-range values into range
    pub fn sanitized(mut self) -> Self {
        let a = &mut self.adaptation;
        a.adaptation_level = a.adaptation_level.clamp(0.0, 1.0);
        a.quantum_randomness = a.quantum_randomness.clamp(0.0, 1.0);
        a.adaptation_period_ms = a.adaptation_period_ms.max(MIN_PERIOD_MS);
        a.idle_threshold_ms = a.idle_threshold_ms.max(1);
        if a.threshold_frequency <= 0.0 {
            a.threshold_frequency = default_threshold_frequency();
        }
        self.cache.max_entries = self.cache.max_entries.max(1);
        self.cache.sweep_interval_secs = self.cache.sweep_interval_secs.max(1);
        self
    }
}
