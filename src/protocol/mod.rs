//! Protocol implementation module
//!
//! This module defines the gateway's message shapes, the datagram codec,
//! call correlation and the liveness state machine.

pub mod codec;
pub mod message;
pub mod registry;
pub mod state;

pub use self::codec::GatewayCodec;
pub use self::message::{
    classify_method, CallResult, EventKind, Message, MessageKind, MethodRoute, Notification,
    OutboundCall, Params, Push, Request,
};
pub use self::registry::{PendingCall, RequestRegistry};
pub use self::state::AvailabilityTracker;
