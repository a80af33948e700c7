//! Remote terminal session control over an unreliable relay.
//!
//! The client side ([`client::RelayClient`]) owns one connection, its
//! liveness probes and reconnection; [`delivery::CommandSender`] sits on top
//! of it so commands are never silently lost. The host side
//! ([`host::HostService`], served by [`server`]) runs PTY sessions and
//! streams their batched output back.

pub mod batcher;
pub mod client;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod host;
pub mod liveness;
pub mod protocol;
pub mod pty;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;
