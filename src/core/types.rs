use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Correlation identifier tying a request to its response
pub type CallId = u32;

/// Liveness of the gateway as inferred from traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Availability {
    /// The gateway answered recently
    Available,
    /// Too many heartbeats went unanswered
    Unavailable,
}

impl Availability {
    /// Returns true for [`Availability::Available`]
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl From<bool> for Availability {
    fn from(available: bool) -> Self {
        if available {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Available => f.write_str("available"),
            Availability::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// A sub-device paired with the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Source ID the gateway reports for this device
    pub sid: String,
    /// Device class hint for the embedding system
    #[serde(default)]
    pub class: Option<String>,
    /// Human readable name
    #[serde(default)]
    pub friendly_name: Option<String>,
}

/// Configuration for the gateway client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway host name or IP address
    pub host: String,
    /// Gateway UDP port
    pub port: u16,
    /// How often a heartbeat probe is queued
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub heartbeat_interval: Duration,
    /// How often missed heartbeats are evaluated
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub availability_check_interval: Duration,
    /// Missed heartbeats tolerated before the gateway is declared unavailable
    pub missed_heartbeat_threshold: u32,
    /// Deadline for a correlated call
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub call_timeout: Duration,
    /// Receive timeout of one loop iteration
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub read_timeout: Duration,
    /// Send timeout for one datagram
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub send_timeout: Duration,
    /// Capacity of the outbound queue
    pub queue_capacity: usize,
    /// Receive buffer size
    pub max_datagram_size: usize,
    /// Probe the gateway once before entering the loop
    pub probe_on_start: bool,
    /// How long the start-up probe waits for an answer
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub initial_probe_timeout: Duration,
    /// Spawn the heartbeat and availability timers; when false the host
    /// drives them through the handle
    pub schedule_heartbeats: bool,
    /// Sub-devices known ahead of time
    pub sensors: Vec<SensorConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: String::new(),
            port: super::DEFAULT_PORT,
            heartbeat_interval: Duration::from_secs(60),
            availability_check_interval: Duration::from_secs(180),
            missed_heartbeat_threshold: 2,
            call_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(200),
            queue_capacity: super::DEFAULT_QUEUE_CAPACITY,
            max_datagram_size: super::MAX_DATAGRAM_SIZE,
            probe_on_start: true,
            initial_probe_timeout: Duration::from_secs(5),
            schedule_heartbeats: true,
            sensors: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Creates a configuration for the given host with default settings
    pub fn new(host: impl Into<String>) -> Self {
        GatewayConfig {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Parses and validates a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GatewayConfig = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can drive a client
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("port must not be 0"));
        }
        let timers = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("availability_check_interval", self.availability_check_interval),
            ("call_timeout", self.call_timeout),
            ("read_timeout", self.read_timeout),
            ("send_timeout", self.send_timeout),
            ("initial_probe_timeout", self.initial_probe_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.availability_check_interval < self.heartbeat_interval {
            return Err(Error::config(
                "availability_check_interval must not be shorter than heartbeat_interval",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be greater than zero"));
        }
        if self.max_datagram_size < 64 {
            return Err(Error::config("max_datagram_size must be at least 64 bytes"));
        }
        if let Some(sensor) = self.sensors.iter().find(|s| s.sid.trim().is_empty()) {
            return Err(Error::config(format!("sensor {:?} has an empty sid", sensor.friendly_name)));
        }
        Ok(())
    }
}
