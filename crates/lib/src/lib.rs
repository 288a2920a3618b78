//! Tether core library: a relay between WebSocket clients and a gateway.
//!
//! The relay holds one authenticated [`gateway::GatewayLink`] and bridges every
//! client session onto it; [`client::ClientStore`] is the client end of a session.

pub mod client;
pub mod config;
pub mod credentials;
pub mod device;
mod error;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod pending;
pub mod protocol;
pub mod relay;

pub use error::{Error, Result};
