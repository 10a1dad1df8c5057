//! Common types shared between the detection server and its HTTP clients.
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
