//! WebSocket relay between CDP automation clients and a privileged
//! browser extension.
//!
//! The relay terminates two populations on one listener: any number of
//! automation clients on `/cdp`, and exactly one extension on `/extension`.
//! Commands from clients are answered locally where the relay holds the
//! truth (target bookkeeping, capability descriptors) and forwarded to the
//! extension otherwise; CDP events from the extension fan out to every
//! connected client.

pub mod clients;
pub mod connection;
pub mod events;
pub mod extension;
pub mod router;
pub mod server;
pub mod state;

pub use server::{relay_router, start_relay};
pub use state::RelayState;
