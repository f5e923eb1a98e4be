//! Domain types for the Genesis runtime
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Globally unique identifier assigned to a process's bus attachment
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ParticipantGuid(Uuid);

impl ParticipantGuid {
    /// Creates a new random participant GUID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an advertised function
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct FunctionId(Uuid);

impl FunctionId {
    /// Creates a new random function ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Derives the stable ID for a function hosted under a service identity.
    ///
    /// The same service name and function name always produce the same ID,
    /// so a restarted provider re-advertises under its original identity.
    #[must_use]
    pub fn derive(service_name: &ServiceName, function_name: &FunctionName) -> Self {
        let material = format!("{service_name}/{function_name}");
        Self::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes()))
    }
}

/// Unique identifier for a single RPC invocation
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random request ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier shared by every step in one end-user request's causal chain
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ChainId(Uuid);

impl ChainId {
    /// Creates a new random chain ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of one RPC call within a chain
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CallId(Uuid);

impl CallId {
    /// Creates a new random call ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an agent
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Logical name of a service; doubles as its RPC channel identifier
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct ServiceName(String);

/// Name of a remotely invocable function
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct FunctionName(String);

/// Human-facing name an agent announces itself under
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct PreferredName(String);

/// Free-form capability tag attached to a function advertisement
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Deref,
        TryFrom,
        Into
    )
)]
pub struct CapabilityTag(String);

/// Bus domain number; participants only match within the same domain
#[nutype(
    validate(less_or_equal = 232),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct DomainId(u32);

impl DomainId {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Timeout applied to each outbound RPC call
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct RpcTimeoutSecs(u64);

impl RpcTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Timeout for waiting until at least one matched peer exists
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct DiscoveryTimeoutSecs(u64);

impl DiscoveryTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Bound on how long a dead provider's advertisements may linger
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct LivenessTimeoutSecs(u64);

impl LivenessTimeoutSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Upper bound on serialized payload string size.
///
/// The floor of 8 KiB is a wire-compatibility requirement; LLM payloads
/// routinely exceed it, so the default is considerably larger.
#[nutype(
    validate(greater_or_equal = 8192, less_or_equal = 16_777_216),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 65_536
)]
pub struct MaxPayloadBytes(usize);

impl MaxPayloadBytes {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Channel capacity for bounded queues
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Upper bound on executor turns within one pipeline run
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 8
)]
pub struct MaxExecutorTurns(u32);

impl MaxExecutorTurns {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}
