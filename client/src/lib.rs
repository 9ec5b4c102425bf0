//! Outpost tunnel client
//!
//! Holds one long-lived WebSocket to a relay, authenticates, and shuttles
//! opaque HTTP byte streams between the relay and a local TCP server.
//!
//! ```text
//! relay frames -> control (classify) -> queue -> forward/local -> link -> relay
//! ```

pub mod config;
pub mod control;
pub mod forward;
pub mod link;
pub mod local;
pub mod multi;
pub mod queue;
pub mod session;
pub mod tunnel;

pub use config::{OutpostConfig, TunnelConfig};
pub use session::LinkState;
pub use tunnel::TunnelClient;
