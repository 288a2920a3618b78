//! Gateway link: the relay's outbound, authenticated connection to the gateway.
//!
//! Protocol: the gateway sends `connect.challenge` right after the socket opens;
//! the link answers with one `connect` request and waits for its response. Then
//! requests (req/res) and events flow until the socket closes.

mod handshake;
mod link;

pub use handshake::{challenge_nonce, connect_params};
pub use link::{GatewayLink, LinkState, RawFrame};
