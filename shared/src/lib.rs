//! Outpost Shared Library
//!
//! Control protocol types and errors shared by the tunnel client.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
