//! Client side of the relay: connection store, reconnect backoff, and chat helpers.

mod backoff;
pub mod chat;
mod store;

pub use backoff::{reconnect_delay, BACKOFF_SCHEDULE_MS};
pub use chat::{ChatSession, ChatUpdate, DeltaMode};
pub use store::{ClientStore, ConnectionSnapshot, ConnectionStatus};
