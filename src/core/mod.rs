//! Core types for the miio gateway client
//!
//! This module contains the error type, configuration and the protocol
//! constants shared by the codec and the transport.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{Availability, CallId, GatewayConfig, SensorConfig};

/// Default UDP port the gateway listens on
pub const DEFAULT_PORT: u16 = 54321;

/// Largest datagram the gateway sends
pub const MAX_DATAGRAM_SIZE: usize = 1480;

/// Default capacity of the outbound send queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 25;

/// Method name of the liveness probe
pub const PING_METHOD: &str = "internal.PING";

/// Correlation ID reserved for heartbeats; never handed out to calls
pub const HEARTBEAT_ID: CallId = 12345;

/// Correlation IDs wrap back to 1 past this value
pub const MAX_CALL_ID: CallId = 999_999_999;

/// Model reported for pushes the gateway emits about itself
pub const GATEWAY_MODEL: &str = "lumi.gateway.mieu01";

/// Source ID reported for pushes the gateway emits about itself
pub const GATEWAY_SID: &str = "miio.gateway";

/// Result value substituted for an empty result list
pub const UNKNOWN_RESULT: &str = "unknown";
