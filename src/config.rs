//! Configuration for the relay and the signaling gateway.
//!
//! [`Config`] is loaded from environment variables; every other struct has a
//! `Default` suitable for local runs and tests.

use std::{
    collections::HashMap,
    env,
    fmt::Display,
    net::IpAddr,
    str::FromStr,
    time::Duration,
};

use derivative::Derivative;
use thiserror::Error;
use webrtc::{
    api::setting_engine::SettingEngine,
    ice_transport::{ice_candidate_type::RTCIceCandidateType, ice_server::RTCIceServer},
    peer_connection::configuration::RTCConfiguration,
    rtp_transceiver::rtp_codec::RTCRtpCodecParameters,
};
use webrtc_ice::{
    network_type::NetworkType,
    udp_network::{EphemeralUDP, UDPNetwork},
};

use crate::error::Error;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_SIGNALING_PATH: &str = "/ws";
pub const DEFAULT_USER_ID_HEADER: &str = "X-User-ID";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_CLIENT_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_PRESENCE_KEY_PREFIX: &str = "call:presence:";
pub const DEFAULT_RENEGOTIATION_DELAY_MS: u64 = 50;
pub const DEFAULT_PLI_INTERVAL_MS: u64 = 1000;

/// UDP port range reserved for the ICE agent of each connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Configuration for every media-transport connection created by a [`crate::room::Room`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    /// Addresses advertised instead of the local interface addresses (NAT 1:1 mapping).
    pub announced_ips: Vec<IpAddr>,
    pub port_range: Option<PortRange>,
    pub network_types: Vec<NetworkType>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ..Default::default()
            },
            announced_ips: vec![],
            port_range: None,
            network_types: vec![NetworkType::Udp4],
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
        }
    }
}

impl WebRTCTransportConfig {
    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    pub(crate) fn setting_engine(&self) -> Result<SettingEngine, Error> {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.announced_ips.is_empty() {
            let ips = self.announced_ips.iter().map(|ip| ip.to_string()).collect();
            setting_engine.set_nat_1to1_ips(ips, RTCIceCandidateType::Host);
        }

        if let Some(range) = self.port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max)?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        Ok(setting_engine)
    }
}

/// Codec overrides. Empty lists mean the platform default codec set.
#[derive(Clone, Debug, Default)]
pub struct CodecConfig {
    pub audio: Vec<RTCRtpCodecParameters>,
    pub video: Vec<RTCRtpCodecParameters>,
}

/// Configuration shared by every [`crate::room::Room`] of a [`crate::registry::RoomRegistry`].
#[derive(Clone, Debug)]
pub struct SfuConfig {
    pub transport: WebRTCTransportConfig,
    pub codec: CodecConfig,
    /// Settle time between an answer arriving and a deferred offer being flushed.
    pub renegotiation_delay: Duration,
    pub pli_interval: Duration,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            transport: Default::default(),
            codec: Default::default(),
            renegotiation_delay: Duration::from_millis(DEFAULT_RENEGOTIATION_DELAY_MS),
            pli_interval: Duration::from_millis(DEFAULT_PLI_INTERVAL_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub signaling_path: String,
    pub user_id_header: String,
    /// Accept `?user_id=` when the upstream header is absent. Local and test use only.
    pub allow_query_user_id: bool,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            signaling_path: DEFAULT_SIGNALING_PATH.to_string(),
            user_id_header: DEFAULT_USER_ID_HEADER.to_string(),
            allow_query_user_id: true,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            client_timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct PresenceConfig {
    /// `None` selects the in-process store.
    #[derivative(Debug = "ignore")]
    pub redis_url: Option<String>,
    pub ttl: Duration,
    pub key_prefix: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl: Duration::from_secs(DEFAULT_PRESENCE_TTL_SECONDS),
            key_prefix: DEFAULT_PRESENCE_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub presence: PresenceConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

impl ConfigError {
    fn invalid(name: &str, message: String) -> Self {
        ConfigError::InvalidValue {
            name: name.to_string(),
            message,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let string_var = |name: &str, default: &str| {
            vars.get(name)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let gateway = GatewayConfig {
            bind_address: string_var("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            signaling_path: string_var("SIGNALING_PATH", DEFAULT_SIGNALING_PATH),
            user_id_header: string_var("USER_ID_HEADER", DEFAULT_USER_ID_HEADER),
            allow_query_user_id: parse_var(vars, "ALLOW_QUERY_USER_ID")?.unwrap_or(true),
            heartbeat_interval: Duration::from_secs(positive_var(
                vars,
                "HEARTBEAT_INTERVAL_SECONDS",
                DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            )?),
            client_timeout: Duration::from_secs(positive_var(
                vars,
                "CLIENT_TIMEOUT_SECONDS",
                DEFAULT_CLIENT_TIMEOUT_SECONDS,
            )?),
        };

        if gateway.client_timeout <= gateway.heartbeat_interval {
            return Err(ConfigError::invalid(
                "CLIENT_TIMEOUT_SECONDS",
                "must be greater than HEARTBEAT_INTERVAL_SECONDS".to_string(),
            ));
        }

        let presence = PresenceConfig {
            redis_url: vars.get("REDIS_URL").filter(|v| !v.is_empty()).cloned(),
            ttl: Duration::from_secs(positive_var(
                vars,
                "PRESENCE_TTL_SECONDS",
                DEFAULT_PRESENCE_TTL_SECONDS,
            )?),
            key_prefix: string_var("PRESENCE_KEY_PREFIX", DEFAULT_PRESENCE_KEY_PREFIX),
        };

        let mut transport = WebRTCTransportConfig::default();
        if let Some(value) = vars.get("PUBLIC_IP") {
            transport.announced_ips = split_list(value)
                .map(|ip| {
                    ip.parse::<IpAddr>().map_err(|e| {
                        ConfigError::invalid("PUBLIC_IP", format!("'{}': {}", ip, e))
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        transport.port_range = match (
            parse_var::<u16>(vars, "RTC_MIN_PORT")?,
            parse_var::<u16>(vars, "RTC_MAX_PORT")?,
        ) {
            (None, None) => None,
            (Some(min), Some(max)) if min > 0 && min <= max => Some(PortRange { min, max }),
            (Some(min), Some(max)) => {
                return Err(ConfigError::invalid(
                    "RTC_MIN_PORT",
                    format!("invalid range {}-{}", min, max),
                ))
            }
            _ => {
                return Err(ConfigError::invalid(
                    "RTC_MIN_PORT",
                    "RTC_MIN_PORT and RTC_MAX_PORT must be set together".to_string(),
                ))
            }
        };
        if let Some(value) = vars.get("RTC_NETWORK") {
            transport.network_types = match value.as_str() {
                "udp4" => vec![NetworkType::Udp4],
                "udp6" => vec![NetworkType::Udp6],
                "udp" => vec![NetworkType::Udp4, NetworkType::Udp6],
                other => {
                    return Err(ConfigError::invalid(
                        "RTC_NETWORK",
                        format!("expected udp4, udp6 or udp, got '{}'", other),
                    ))
                }
            };
        }
        if let Some(value) = vars.get("ICE_SERVERS") {
            let urls: Vec<String> = split_list(value).map(str::to_string).collect();
            if !urls.is_empty() {
                transport.configuration.ice_servers = vec![RTCIceServer {
                    urls,
                    ..Default::default()
                }];
            }
        }

        let sfu = SfuConfig {
            transport,
            codec: CodecConfig::default(),
            renegotiation_delay: Duration::from_millis(
                parse_var(vars, "RENEGOTIATION_DELAY_MS")?
                    .unwrap_or(DEFAULT_RENEGOTIATION_DELAY_MS),
            ),
            pli_interval: Duration::from_millis(positive_var(
                vars,
                "PLI_INTERVAL_MS",
                DEFAULT_PLI_INTERVAL_MS,
            )?),
        };

        Ok(Config {
            gateway,
            presence,
            sfu,
        })
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    vars.get(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid(name, format!("'{}': {}", value, e)))
        })
        .transpose()
}

fn positive_var(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parse_var(vars, name)?.unwrap_or(default) {
        0 => Err(ConfigError::invalid(name, "must be greater than 0".to_string())),
        value => Ok(value),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
