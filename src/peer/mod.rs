//! Peer connection management for WebRTC.
//!
//! Handles the connection engine seam and the webrtc-rs implementation.

pub mod connection;
pub mod factory;

pub use connection::*;
pub use factory::*;
