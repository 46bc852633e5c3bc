//! Connection Management Module
//!
//! Listener lifecycle and the accept loop that spawns relay sessions.

pub mod forwarder;

pub use forwarder::{Forwarder, ForwarderState};
