use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dialer::DialerConfig;
use crate::error::ConfigError;
use crate::listener::DEFAULT_ACCEPT_QUEUE;
use crate::policy::{HopPolicy, RelayPolicy};
use crate::relay::RelayLimits;

// =============================================================================
// Relay config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [relay.hop]
//                    active = true
//
//   env var:         CIRCUIT_RELAY__HOP__ACTIVE=true   (double underscore = nesting)
//
//   (single underscore stays within field names: CIRCUIT_LIMITS__MAX_CIRCUITS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub limits: LimitsFileConfig,
    #[serde(default)]
    pub dial: DialFileConfig,
}

/// Relay capability switches (lives under `[relay]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Dial through relays and accept relayed connections.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hop: HopFileConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HopFileConfig {
    /// Relay for other peers.
    #[serde(default)]
    pub enabled: bool,
    /// Dial destinations we are not yet connected to.
    #[serde(default)]
    pub active: bool,
}

/// Relay resource limits (lives under `[limits]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsFileConfig {
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,
    #[serde(default = "default_buffer_kb")]
    pub buffer_kb: usize,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_accept_queue")]
    pub accept_queue: usize,
}

impl Default for LimitsFileConfig {
    fn default() -> Self {
        Self {
            max_circuits: default_max_circuits(),
            buffer_kb: default_buffer_kb(),
            dial_timeout_secs: default_dial_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            linger_ms: default_linger_ms(),
            accept_queue: default_accept_queue(),
        }
    }
}

/// Client-side dial settings (lives under `[dial]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DialFileConfig {
    #[serde(default = "default_circuit_dial_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub probe_can_hop: bool,
}

impl Default for DialFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_circuit_dial_timeout_secs(),
            probe_can_hop: false,
        }
    }
}

fn default_max_circuits() -> usize {
    64
}
fn default_buffer_kb() -> usize {
    16
}
fn default_dial_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_linger_ms() -> u64 {
    5000
}
fn default_accept_queue() -> usize {
    DEFAULT_ACCEPT_QUEUE
}
fn default_circuit_dial_timeout_secs() -> u64 {
    15
}

/// Resolved configuration (runtime view). An immutable snapshot handed to a
/// [`RelayService`](crate::service::RelayService) at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    pub policy: RelayPolicy,
    pub limits: RelayLimits,
    pub dialer: DialerConfig,
    pub accept_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            policy: RelayPolicy::default(),
            limits: RelayLimits::default(),
            dialer: DialerConfig::default(),
            accept_queue: DEFAULT_ACCEPT_QUEUE,
        }
    }
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        if fc.limits.max_circuits == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_circuits",
                reason: "must be at least 1".into(),
            });
        }
        let buffer_size = fc
            .limits
            .buffer_kb
            .checked_mul(1024)
            .filter(|size| *size > 0)
            .ok_or_else(|| ConfigError::Invalid {
                field: "limits.buffer_kb",
                reason: format!("{} KiB is not a usable buffer size", fc.limits.buffer_kb),
            })?;
        for (field, value) in [
            ("limits.dial_timeout_secs", fc.limits.dial_timeout_secs),
            ("limits.request_timeout_secs", fc.limits.request_timeout_secs),
            ("limits.linger_ms", fc.limits.linger_ms),
            ("dial.timeout_secs", fc.dial.timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        Ok(Self {
            policy: RelayPolicy {
                client_enabled: fc.relay.enabled,
                hop: HopPolicy {
                    enabled: fc.relay.hop.enabled,
                    active: fc.relay.hop.active,
                },
            },
            limits: RelayLimits {
                max_circuits: fc.limits.max_circuits,
                buffer_size,
                dial_timeout: Duration::from_secs(fc.limits.dial_timeout_secs),
                request_timeout: Duration::from_secs(fc.limits.request_timeout_secs),
                linger: Duration::from_millis(fc.limits.linger_ms),
            },
            dialer: DialerConfig {
                dial_timeout: Duration::from_secs(fc.dial.timeout_secs),
                probe_can_hop: fc.dial.probe_can_hop,
            },
            accept_queue: fc.limits.accept_queue,
        })
    }

    /// Load from defaults, then `path` (if given), then `CIRCUIT_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let fc: FileConfig = load_config(path).extract()?;
        Self::from_file(&fc)
    }
}

/// Build a figment that layers: defaults → TOML file → CIRCUIT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CIRCUIT_RELAY__ENABLED=true`  →  `relay.enabled = true`
///   `CIRCUIT_LIMITS__LINGER_MS=500`  →  `limits.linger_ms = 500`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("CIRCUIT_").split("__"))
}
