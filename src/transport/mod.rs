//! Host transport for rtcbridge
//!
//! Carries host calls and callback deliveries across the bridge boundary.

pub mod dispatcher;
pub mod protocol;
pub mod websocket;

pub use dispatcher::Dispatcher;
pub use protocol::{Call, HostMessage, Request};
pub use websocket::WebSocketHost;
