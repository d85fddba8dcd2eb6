//! Engine configuration.
//!
//! Loaded from YAML, then overridden by `MANDATE_*` environment variables.
//!
//! ```yaml
//! chainId: 8453
//! rpcUrl: https://mainnet.base.org
//! bundlerUrl: https://api.pimlico.io/v2/8453/rpc?apikey=...
//! entryPoint: "0x0000000071727De22E5E9d8BAf0edAc6f37da032"
//! delegationManager: "0xdb9B1e94B5b69Df7e401DDbedE43491141047dB3"
//! enforcers:
//!   timestamp: "0x..."
//!   # ...
//! venues:
//!   trader: ["0x..."]
//! spenderWhitelist: ["0x..."]
//! storeDir: ~/.mandate
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentArchetype;
use crate::cache::QuoteCache;
use crate::caveats::EnforcerAddresses;
use crate::delegation::{
    DelegationDomain, DelegationPolicy, MAX_CALL_LIMIT, MAX_EXPIRY_DAYS, MIN_CALL_LIMIT,
    MIN_EXPIRY_DAYS,
};
use crate::poll::Poller;
use crate::retry::RetryPolicy;
use crate::userop::GasFloors;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "MANDATE_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    FileRead(String, #[source] std::io::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::ConfigurationError(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuoteCacheConfig {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for QuoteCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl_secs: 30,
        }
    }
}

/// Everything the engine needs to talk to one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    /// Defaults to the bundler when the provider serves both.
    #[serde(default)]
    pub paymaster_url: Option<String>,
    pub entry_point: Address,
    pub delegation_manager: Address,
    pub enforcers: EnforcerAddresses,
    #[serde(default)]
    pub venues: BTreeMap<AgentArchetype, Vec<Address>>,
    #[serde(default)]
    pub spender_whitelist: Vec<Address>,
    #[serde(default)]
    pub policy: DelegationPolicy,
    #[serde(default)]
    pub gas_floors: GasFloors,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quote_cache: QuoteCacheConfig,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".mandate")
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().display().to_string(), e))?;
        Self::from_yaml(&content)
    }

    /// `from_file`, then process environment overrides, then validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MANDATE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("CHAIN_ID") {
            self.chain_id = v.parse().map_err(|_| invalid("MANDATE_CHAIN_ID", &v))?;
        }
        if let Some(v) = var("RPC_URL") {
            self.rpc_url = v;
        }
        if let Some(v) = var("BUNDLER_URL") {
            self.bundler_url = v;
        }
        if let Some(v) = var("PAYMASTER_URL") {
            self.paymaster_url = Some(v);
        }
        if let Some(v) = var("ENTRY_POINT") {
            self.entry_point = v.parse().map_err(|_| invalid("MANDATE_ENTRY_POINT", &v))?;
        }
        if let Some(v) = var("DELEGATION_MANAGER") {
            self.delegation_manager = v
                .parse()
                .map_err(|_| invalid("MANDATE_DELEGATION_MANAGER", &v))?;
        }
        if let Some(v) = var("STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_id == 0 {
            return Err(invalid("chainId", "0"));
        }
        for (field, url) in [("rpcUrl", &self.rpc_url), ("bundlerUrl", &self.bundler_url)] {
            check_url(field, url)?;
        }
        if let Some(url) = &self.paymaster_url {
            check_url("paymasterUrl", url)?;
        }
        if self.entry_point.is_zero() {
            return Err(invalid("entryPoint", "zero address"));
        }
        if self.delegation_manager.is_zero() {
            return Err(invalid("delegationManager", "zero address"));
        }
        if self.policy.min_expiry_days > self.policy.max_expiry_days {
            return Err(ConfigError::Invalid {
                field: "policy".into(),
                message: "minExpiryDays exceeds maxExpiryDays".into(),
            });
        }
        if self.policy.min_expiry_days < MIN_EXPIRY_DAYS
            || self.policy.max_expiry_days > MAX_EXPIRY_DAYS
        {
            return Err(ConfigError::Invalid {
                field: "policy".into(),
                message: format!(
                    "expiry bounds must lie within {MIN_EXPIRY_DAYS}..={MAX_EXPIRY_DAYS} days"
                ),
            });
        }
        let policy = &self.policy;
        if policy.min_call_limit < MIN_CALL_LIMIT
            || policy.min_call_limit > policy.max_call_limit
            || policy.max_call_limit > MAX_CALL_LIMIT
        {
            return Err(ConfigError::Invalid {
                field: "policy".into(),
                message: format!(
                    "call limit bounds must be ordered within {MIN_CALL_LIMIT}..={MAX_CALL_LIMIT}"
                ),
            });
        }
        if self.poll.interval_ms == 0 {
            return Err(invalid("poll.intervalMs", "0"));
        }
        Ok(())
    }

    pub fn domain(&self) -> DelegationDomain {
        DelegationDomain::new(self.chain_id, self.delegation_manager)
    }

    pub fn paymaster_url(&self) -> &str {
        self.paymaster_url.as_deref().unwrap_or(&self.bundler_url)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn poller(&self) -> Poller {
        Poller::new(
            Duration::from_millis(self.poll.interval_ms),
            Duration::from_secs(self.poll.timeout_secs),
        )
    }

    pub fn quote_cache(&self) -> QuoteCache {
        QuoteCache::new(
            self.quote_cache.capacity,
            Duration::from_secs(self.quote_cache.ttl_secs),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn invalid(field: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: format!("'{value}' is not allowed"),
    }
}

fn check_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: field.to_string(),
            message: format!("'{url}' is not an http(s) URL"),
        })
    }
}
