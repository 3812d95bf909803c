//! L2CAP (Logical Link Control and Adaptation Protocol) Transport Boundary
//!
//! SDP runs over a connection-oriented L2CAP channel. This module defines the
//! only transport abstraction the SDP engine depends on ([`L2capChannel`] and
//! [`L2capConnector`]) and the MTU-bounded framed reader/writer layered on top
//! of it.

pub mod channel;
pub mod framed;

#[cfg(test)]
pub(crate) mod mock;

pub use channel::{L2capChannel, L2capConnector, ProtocolServiceMultiplexer, TransportError, psm};
pub use framed::{FrameReader, FrameWriter};
