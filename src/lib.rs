//! tcpdup Library
//!
//! TCP forwarder with traffic duplication.
//!
//! Accepts connections on a listen address, relays each one to a fixed target
//! and optionally mirrors each direction of the byte stream to its own
//! duplication endpoint, without disturbing the original exchange.

pub mod address;
pub mod config;
pub mod connection;
pub mod relay;
pub mod shutdown;

pub use address::{resolve, Endpoint};
pub use config::Config;
pub use connection::{Forwarder, ForwarderState};
pub use relay::Session;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the forwarder
pub type Result<T> = anyhow::Result<T>;
