//! Privilege boundary
//!
//! Newline-delimited JSON between the unprivileged CLI ([`client`]) and the
//! privileged gateway process ([`server`]).

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ChildTransport, GatewayClient, Transport};
pub use protocol::{DeviceStatus, GatewayRequest, GatewayResponse};
pub use server::{serve, SessionEnd};
