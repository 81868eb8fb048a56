//! miio gateway: persistent UDP client for the miio home-automation gateway
//!
//! The gateway speaks a JSON-RPC-like protocol over plain UDP. This library
//! keeps one logical connection to it: a single transport task owns the
//! socket, correlates calls with their answers, infers liveness from
//! heartbeats and fans pushed events out to subscribers.
//!
//! ```no_run
//! use miio_gateway::{GatewayClient, GatewayConfig, Notification, Request};
//!
//! #[tokio::main]
//! async fn main() -> miio_gateway::Result<()> {
//!     let mut client = GatewayClient::new(GatewayConfig::new("192.168.1.10"))?;
//!     client.subscribe(|n: &Notification| -> miio_gateway::Result<()> {
//!         println!("{} from {:?}", n.kind().as_str(), n.sid());
//!         Ok(())
//!     });
//!     client.start().await?;
//!
//!     let volume = client.call(Request::new("get_prop").with_params(serde_json::json!(["gateway_volume"]))).await?;
//!     println!("volume: {:?}", volume.value());
//!
//!     client.stop().await
//! }
//! ```

pub mod core;

mod network;
pub mod protocol;
mod util;

// Re-export commonly used items
pub use crate::core::{Availability, CallId, Error, GatewayConfig, Result, SensorConfig};
pub use network::{
    DeliveryFailure, Diagnostic, EventDispatcher, GatewayClient, GatewayHandle, Subscriber,
    SubscriberId,
};
pub use protocol::{CallResult, EventKind, Notification, Params, Push, Request};
pub use util::gateway_unique_id;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
