// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Facade Configuration Types
//
// Defines the configuration schema for a Bulwark facade node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Default and per-capability circuit breaker settings
// - Health monitor cadence
// - Router settings (handler timeout, replay window, tenant grants)
// - Reply dispatcher settings (retry policy, concurrency, dead letters)
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::capability::Capability;
use crate::domain::circuit_breaker::CircuitBreakerConfig;
use crate::domain::delivery::RetryPolicy;

pub const API_VERSION: &str = "bulwark/v1";
pub const KIND: &str = "FacadeConfig";

/// Top-level Kubernetes-style facade configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacadeConfigManifest {
    /// API version (must be "bulwark/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "FacadeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: FacadeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Facade configuration (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacadeConfigSpec {
    /// Breaker settings applied to every backend unless overridden
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    /// Per-capability breaker overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<CapabilityConfig>,

    #[serde(default)]
    pub health: HealthMonitorConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Breaker overrides for one capability. Unset fields inherit `spec.breaker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub capability: Capability,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub recovery_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub max_recovery_timeout: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_max_probes: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub timeout_per_call: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between checks of one backend
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Upper bound on a single tool handler run
    #[serde(default = "default_handler_timeout", with = "humantime_serde")]
    pub handler_timeout: Duration,

    /// Envelopes older than this are rejected; consumed ids are kept this long
    #[serde(default = "default_replay_window", with = "humantime_serde")]
    pub replay_window: Duration,

    /// Caller → tenants it may act for. `"*"` grants every tenant.
    #[serde(default)]
    pub tenant_grants: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Deliveries for different envelopes that may run at once
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// Timeout for one delivery attempt
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,

    /// Bound of the handler → dispatcher queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// JSON-lines dead-letter file. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_replay_window() -> Duration {
    Duration::from_secs(600)
}

fn default_max_concurrent_deliveries() -> usize {
    32
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            handler_timeout: default_handler_timeout(),
            replay_window: default_replay_window(),
            tenant_grants: HashMap::new(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            delivery_timeout: default_delivery_timeout(),
            queue_capacity: default_queue_capacity(),
            dead_letter_path: None,
        }
    }
}

impl Default for FacadeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "bulwark-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: FacadeConfigSpec::default(),
        }
    }
}

impl FacadeConfigSpec {
    /// Effective breaker settings for a capability's backends.
    pub fn breaker_for(&self, capability: Capability) -> CircuitBreakerConfig {
        let mut config = self.breaker.clone();
        if let Some(o) = self.capabilities.iter().find(|c| c.capability == capability) {
            if let Some(v) = o.failure_threshold {
                config.failure_threshold = v;
            }
            if let Some(v) = o.recovery_timeout {
                config.recovery_timeout = v;
            }
            if let Some(v) = o.max_recovery_timeout {
                config.max_recovery_timeout = v;
            }
            if let Some(v) = o.half_open_max_probes {
                config.half_open_max_probes = v;
            }
            if let Some(v) = o.success_threshold {
                config.success_threshold = v;
            }
            if let Some(v) = o.timeout_per_call {
                config.timeout_per_call = v;
            }
        }
        config
    }
}

impl FacadeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BULWARK_CONFIG_PATH environment variable
    /// 2. ./bulwark-config.yaml (working directory)
    /// 3. ~/.bulwark/config.yaml (user home)
    /// 4. /etc/bulwark/config.yaml (system, Unix) or C:\ProgramData\Bulwark\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BULWARK_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./bulwark-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".bulwark").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/bulwark/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Bulwark\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails hard if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to the default breaker settings
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BULWARK_FAILURE_THRESHOLD") {
            match val.parse::<u32>() {
                Ok(threshold) => {
                    tracing::info!("Environment override: BULWARK_FAILURE_THRESHOLD={}", threshold);
                    self.spec.breaker.failure_threshold = threshold;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for BULWARK_FAILURE_THRESHOLD: '{}'. Expected an integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("BULWARK_RECOVERY_TIMEOUT") {
            match humantime_serde::re::humantime::parse_duration(&val) {
                Ok(timeout) => {
                    tracing::info!("Environment override: BULWARK_RECOVERY_TIMEOUT={:?}", timeout);
                    self.spec.breaker.recovery_timeout = timeout;
                    if self.spec.breaker.max_recovery_timeout < timeout {
                        self.spec.breaker.max_recovery_timeout = timeout;
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for BULWARK_RECOVERY_TIMEOUT: '{}'. Expected a duration like '30s'. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        self.spec
            .breaker
            .validate()
            .map_err(|e| anyhow::anyhow!("spec.breaker: {}", e))?;

        let mut seen = HashSet::new();
        for entry in &self.spec.capabilities {
            if !seen.insert(entry.capability) {
                anyhow::bail!("Duplicate capability entry: {}", entry.capability);
            }
            self.spec
                .breaker_for(entry.capability)
                .validate()
                .map_err(|e| anyhow::anyhow!("spec.capabilities[{}]: {}", entry.capability, e))?;
        }

        if self.spec.health.enabled && self.spec.health.interval.is_zero() {
            anyhow::bail!("spec.health.interval must be greater than zero");
        }

        if self.spec.router.handler_timeout.is_zero() {
            anyhow::bail!("spec.router.handler_timeout must be greater than zero");
        }

        for (caller, tenants) in &self.spec.router.tenant_grants {
            if caller.is_empty() {
                anyhow::bail!("spec.router.tenant_grants has an empty caller");
            }
            if tenants.is_empty() || tenants.iter().any(|t| t.trim().is_empty()) {
                anyhow::bail!("spec.router.tenant_grants[{}] must list at least one non-empty tenant", caller);
            }
        }

        self.spec
            .dispatcher
            .retry
            .validate()
            .map_err(|e| anyhow::anyhow!("spec.dispatcher: {}", e))?;

        if self.spec.dispatcher.max_concurrent_deliveries == 0 {
            anyhow::bail!("spec.dispatcher.max_concurrent_deliveries must be at least 1");
        }

        if self.spec.dispatcher.queue_capacity == 0 {
            anyhow::bail!("spec.dispatcher.queue_capacity must be at least 1");
        }

        Ok(())
    }
}
