//! Per-process configuration
//!
//! Configuration is resolved once at startup; invalid values are fatal.
//! `development()` and `production()` provide pre-validated profiles, and
//! `from_env()` overlays `GENESIS_*` environment variables onto a profile.

use crate::domain_types::{
    DiscoveryTimeoutSecs, DomainId, LivenessTimeoutSecs, MaxExecutorTurns, MaxPayloadBytes,
    PreferredName, RpcTimeoutSecs, ServiceName,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors; always fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {variable}: {reason}")]
    InvalidValue { variable: String, reason: String },

    #[error("invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// Complete per-process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Bus domain; participants only match within a domain
    pub domain_id: DomainId,
    /// Named transport QoS profile
    pub qos_profile: String,
    /// RPC channel identity for services and agents
    pub service_name: Option<ServiceName>,
    /// Announcement name for agents
    pub preferred_name: Option<PreferredName>,
    /// Endpoint the injected classifier collaborator should talk to.
    /// Credentials come from the environment, never from config files.
    pub llm_classifier_endpoint: Option<String>,
    /// Endpoint the injected executor collaborator should talk to
    pub llm_executor_endpoint: Option<String>,
    /// Per-call RPC timeout
    pub rpc_timeout: RpcTimeoutSecs,
    /// Matched-peer discovery timeout
    pub discovery_timeout: DiscoveryTimeoutSecs,
    /// Bound on stale advertisements after provider death
    pub liveness_timeout: LivenessTimeoutSecs,
    /// Validate request parameters against the registered schema
    pub strict_schema_validation: bool,
    /// Upper bound on serialized payload size
    pub max_payload_bytes: MaxPayloadBytes,
    /// Bound on executor turns per pipeline run
    pub max_executor_turns: MaxExecutorTurns,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl GenesisConfig {
    /// Profile for local development: short timeouts, fast feedback
    #[must_use]
    pub fn development() -> Self {
        Self {
            domain_id: DomainId::default(),
            qos_profile: "default".to_string(),
            service_name: None,
            preferred_name: None,
            llm_classifier_endpoint: None,
            llm_executor_endpoint: None,
            rpc_timeout: RpcTimeoutSecs::try_new(5).unwrap_or_default(),
            discovery_timeout: DiscoveryTimeoutSecs::try_new(5).unwrap_or_default(),
            liveness_timeout: LivenessTimeoutSecs::try_new(2).unwrap_or_default(),
            strict_schema_validation: true,
            max_payload_bytes: MaxPayloadBytes::default(),
            max_executor_turns: MaxExecutorTurns::default(),
        }
    }

    /// Profile for production: spec-default timeouts
    #[must_use]
    pub fn production() -> Self {
        Self {
            domain_id: DomainId::default(),
            qos_profile: "default".to_string(),
            service_name: None,
            preferred_name: None,
            llm_classifier_endpoint: None,
            llm_executor_endpoint: None,
            rpc_timeout: RpcTimeoutSecs::default(),
            discovery_timeout: DiscoveryTimeoutSecs::default(),
            liveness_timeout: LivenessTimeoutSecs::default(),
            strict_schema_validation: true,
            max_payload_bytes: MaxPayloadBytes::default(),
            max_executor_turns: MaxExecutorTurns::default(),
        }
    }

    /// Overlays `GENESIS_*` environment variables onto the production profile
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] for any unparsable or
    /// out-of-range variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::production();

        if let Some(raw) = read_env("GENESIS_DOMAIN_ID") {
            let value: u32 = parse_env("GENESIS_DOMAIN_ID", &raw)?;
            config.domain_id = DomainId::try_new(value).map_err(|e| ConfigError::InvalidValue {
                variable: "GENESIS_DOMAIN_ID".to_string(),
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = read_env("GENESIS_QOS_PROFILE") {
            config.qos_profile = raw;
        }
        if let Some(raw) = read_env("GENESIS_SERVICE_NAME") {
            config.service_name =
                Some(
                    ServiceName::try_new(raw).map_err(|e| ConfigError::InvalidValue {
                        variable: "GENESIS_SERVICE_NAME".to_string(),
                        reason: e.to_string(),
                    })?,
                );
        }
        if let Some(raw) = read_env("GENESIS_PREFERRED_NAME") {
            config.preferred_name =
                Some(
                    PreferredName::try_new(raw).map_err(|e| ConfigError::InvalidValue {
                        variable: "GENESIS_PREFERRED_NAME".to_string(),
                        reason: e.to_string(),
                    })?,
                );
        }
        if let Some(raw) = read_env("GENESIS_LLM_CLASSIFIER_ENDPOINT") {
            config.llm_classifier_endpoint = Some(raw);
        }
        if let Some(raw) = read_env("GENESIS_LLM_EXECUTOR_ENDPOINT") {
            config.llm_executor_endpoint = Some(raw);
        }
        if let Some(raw) = read_env("GENESIS_RPC_TIMEOUT_SECS") {
            let value: u64 = parse_env("GENESIS_RPC_TIMEOUT_SECS", &raw)?;
            config.rpc_timeout =
                RpcTimeoutSecs::try_new(value).map_err(|e| ConfigError::InvalidValue {
                    variable: "GENESIS_RPC_TIMEOUT_SECS".to_string(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(raw) = read_env("GENESIS_DISCOVERY_TIMEOUT_SECS") {
            let value: u64 = parse_env("GENESIS_DISCOVERY_TIMEOUT_SECS", &raw)?;
            config.discovery_timeout =
                DiscoveryTimeoutSecs::try_new(value).map_err(|e| ConfigError::InvalidValue {
                    variable: "GENESIS_DISCOVERY_TIMEOUT_SECS".to_string(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(raw) = read_env("GENESIS_LIVENESS_TIMEOUT_SECS") {
            let value: u64 = parse_env("GENESIS_LIVENESS_TIMEOUT_SECS", &raw)?;
            config.liveness_timeout =
                LivenessTimeoutSecs::try_new(value).map_err(|e| ConfigError::InvalidValue {
                    variable: "GENESIS_LIVENESS_TIMEOUT_SECS".to_string(),
                    reason: e.to_string(),
                })?;
        }
        if let Some(raw) = read_env("GENESIS_STRICT_SCHEMA_VALIDATION") {
            config.strict_schema_validation = parse_env("GENESIS_STRICT_SCHEMA_VALIDATION", &raw)?;
        }
        if let Some(raw) = read_env("GENESIS_MAX_PAYLOAD_BYTES") {
            let value: usize = parse_env("GENESIS_MAX_PAYLOAD_BYTES", &raw)?;
            config.max_payload_bytes =
                MaxPayloadBytes::try_new(value).map_err(|e| ConfigError::InvalidValue {
                    variable: "GENESIS_MAX_PAYLOAD_BYTES".to_string(),
                    reason: e.to_string(),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qos_profile.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "qos_profile".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Builder-style service name override
    #[must_use]
    pub fn with_service_name(mut self, service_name: ServiceName) -> Self {
        self.service_name = Some(service_name);
        self
    }

    /// Builder-style preferred name override
    #[must_use]
    pub fn with_preferred_name(mut self, preferred_name: PreferredName) -> Self {
        self.preferred_name = Some(preferred_name);
        self
    }

    /// Builder-style domain override
    #[must_use]
    pub fn with_domain_id(mut self, domain_id: DomainId) -> Self {
        self.domain_id = domain_id;
        self
    }
}

fn read_env(variable: &str) -> Option<String> {
    std::env::var(variable).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(variable: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        variable: variable.to_string(),
        reason: e.to_string(),
    })
}
