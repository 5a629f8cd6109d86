//! Configuration of routers, route groups and setup nodes.
//!
//! All configuration types can be deserialized, so they can be embedded in a larger config file.
//! Durations are expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{crypto::PublicKey, routing::DEFAULT_ROUTE_KEEP_ALIVE};

/// Default interval between two runs of the rule garbage collector.
pub const DEFAULT_RULES_GC_INTERVAL: Duration = Duration::from_secs(5);

/// Default size of the queue of incoming route groups waiting to be accepted.
pub const DEFAULT_ACCEPT_BUFFER_SIZE: usize = 1024;

/// Default bounds on the amount of hops of a route.
pub const DEFAULT_MIN_HOPS: u16 = 0;
pub const DEFAULT_MAX_HOPS: u16 = 50;

/// Default interval of route group keep alives: half the keep alive of the route.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration =
    Duration::from_millis(DEFAULT_ROUTE_KEEP_ALIVE.as_millis() as u64 / 2);

/// Default interval between two network probes on a route group.
pub const DEFAULT_NETWORK_PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Default amount of data chunks buffered for the reader of a route group.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Default time a route group waits for close replies.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time a setup node spends on a single request.
pub const DEFAULT_SETUP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration of a [`Router`](crate::router::Router).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Identity of the local visor.
    pub public_key: PublicKey,
    /// Setup nodes used to dial route groups. Only these setup nodes may push rules to the
    /// router.
    #[serde(default)]
    pub setup_nodes: Vec<PublicKey>,
    #[serde(default = "default_rules_gc_interval", with = "duration_ms")]
    pub rules_gc_interval: Duration,
    /// Keep alive of the rules of dialed routes.
    #[serde(default = "default_route_keep_alive", with = "duration_ms")]
    pub route_keep_alive: Duration,
    #[serde(default = "default_min_hops")]
    pub min_hops: u16,
    #[serde(default = "default_max_hops")]
    pub max_hops: u16,
    #[serde(default = "default_accept_buffer_size")]
    pub accept_buffer_size: usize,
    #[serde(default)]
    pub route_group: RouteGroupConfig,
}

impl RouterConfig {
    /// A configuration with default values for everything but the identity.
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            setup_nodes: Vec::new(),
            rules_gc_interval: DEFAULT_RULES_GC_INTERVAL,
            route_keep_alive: DEFAULT_ROUTE_KEEP_ALIVE,
            min_hops: DEFAULT_MIN_HOPS,
            max_hops: DEFAULT_MAX_HOPS,
            accept_buffer_size: DEFAULT_ACCEPT_BUFFER_SIZE,
            route_group: RouteGroupConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

/// Configuration of a [`RouteGroup`](crate::router::RouteGroup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteGroupConfig {
    #[serde(with = "duration_ms")]
    pub keep_alive_interval: Duration,
    #[serde(with = "duration_ms")]
    pub network_probe_interval: Duration,
    pub read_buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
}

impl Default for RouteGroupConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            network_probe_interval: DEFAULT_NETWORK_PROBE_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Configuration of a [`SetupNode`](crate::setup::SetupNode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupConfig {
    pub public_key: PublicKey,
    #[serde(default = "default_setup_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl SetupConfig {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            request_timeout: DEFAULT_SETUP_REQUEST_TIMEOUT,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

fn default_rules_gc_interval() -> Duration {
    DEFAULT_RULES_GC_INTERVAL
}

fn default_route_keep_alive() -> Duration {
    DEFAULT_ROUTE_KEEP_ALIVE
}

fn default_min_hops() -> u16 {
    DEFAULT_MIN_HOPS
}

fn default_max_hops() -> u16 {
    DEFAULT_MAX_HOPS
}

fn default_accept_buffer_size() -> usize {
    DEFAULT_ACCEPT_BUFFER_SIZE
}

fn default_setup_request_timeout() -> Duration {
    DEFAULT_SETUP_REQUEST_TIMEOUT
}

/// (De)serialize a [`Duration`] as an amount of milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
