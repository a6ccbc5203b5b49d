//! Gateway: WebSocket/HTTP server relaying one-to-one messages between
//! authenticated participants.
//!
//! Lifecycle of a connection:
//! 1. Verify the bearer token before the upgrade (`auth`)
//! 2. Register presence and broadcast the snapshot (`supervisor`, `broadcast`)
//! 3. Serve history requests and submissions (`history`, `delivery`)
//! 4. Unregister and re-broadcast on logout or disconnect
//!
//! Messages are persisted through `relay-store` before any push happens.

pub mod auth;
pub mod broadcast;
pub mod delivery;
pub mod error;
pub mod history;
pub mod presence;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod ws;

#[cfg(test)]
mod testutil;

pub use {
    error::RelayError,
    server::{bind_listener, build_gateway_app, cors_layer, start_gateway},
    state::GatewayState,
};
