//! Relay: accepts authenticated client WebSockets and bridges each onto the gateway link.
//!
//! Clients connect to `/ws?token=…`. A bad credential closes with 1008, an
//! unauthenticated gateway link with 1013. Accepted clients first receive the
//! cached handshake snapshot as a `proxy-hello` response.

mod auth;
mod bridge;
mod server;

pub use auth::{validate_bearer, validate_ws_token};
pub use server::{router, run_relay, serve, RelayState};
