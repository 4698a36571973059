//! Wire layer for supervisor <-> test host communication.
//!
//! # Architecture
//!
//! - **protocol**: the `Message` envelope and reserved message kinds
//! - **codec**: varint length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: loopback TCP bind/accept/connect

pub mod codec;
pub mod protocol;
pub mod transport;
