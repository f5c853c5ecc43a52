//! Configuration types for the orchestrator.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker transport configuration.
    pub transport: TransportConfig,
    /// Admin HTTP API configuration.
    pub api: ApiConfig,
    /// Worker liveness configuration.
    pub health: HealthConfig,
    /// Retry policy configuration.
    pub retry: RetryConfig,
    /// Dispatch loop configuration.
    pub dispatch: DispatchConfig,
    /// Egress proxy labels available for rotation hints.
    pub proxies: Vec<String>,
}

/// Worker transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address workers connect to.
    pub listen_addr: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7350),
        }
    }
}

/// Admin HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7351),
        }
    }
}

/// Worker liveness configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Expected heartbeat interval from workers.
    #[serde(with = "serde_duration_secs")]
    pub heartbeat_interval: Duration,
    /// Timeout before a silent worker is forced to disconnected.
    #[serde(with = "serde_duration_secs")]
    pub heartbeat_timeout: Duration,
    /// Interval of the stale-worker sweep.
    #[serde(with = "serde_duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Dispatch loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Interval of the matching loop.
    #[serde(with = "serde_duration_millis")]
    pub tick_interval: Duration,
    /// How long a dispatched task may run before it is treated as a
    /// timeout failure.
    #[serde(with = "serde_duration_secs")]
    pub result_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            result_timeout: Duration::from_secs(120),
        }
    }
}

/// Serde helper for Duration as seconds.
pub(crate) mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds.
pub(crate) mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
