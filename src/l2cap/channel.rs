//! L2CAP Channel Abstraction
//!
//! A packet-oriented logical channel with a negotiated transmit and receive
//! MTU. Implementations wrap whatever the host stack offers (an HCI/ACL
//! driven L2CAP layer, a BlueZ socket, a test double).

use crate::BluetoothAddress;

/// L2CAP Protocol Service Multiplexer (PSM)
///
/// PSMs identify the upper layer protocol that should receive the data.
pub type ProtocolServiceMultiplexer = u16;

/// Well-known Protocol Service Multiplexers
pub mod psm {
    use super::ProtocolServiceMultiplexer;

    /// Service Discovery Protocol
    pub const SDP: ProtocolServiceMultiplexer = 0x0001;
    /// RFCOMM Protocol
    pub const RFCOMM: ProtocolServiceMultiplexer = 0x0003;
}

/// Transport-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The channel could not be established
    ConnectionFailed,
    /// The channel has been closed locally or by the peer
    Disconnected,
    /// The peer delivered a zero-length packet (end of input)
    EndOfStream,
    /// A received packet does not fit the negotiated receive MTU
    PacketTooLarge,
    /// Generic I/O failure reported by the underlying stack
    Io,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "L2CAP connection failed"),
            Self::Disconnected => write!(f, "L2CAP channel disconnected"),
            Self::EndOfStream => write!(f, "L2CAP end of stream"),
            Self::PacketTooLarge => write!(f, "L2CAP packet exceeds receive MTU"),
            Self::Io => write!(f, "L2CAP I/O error"),
        }
    }
}

/// A connection-oriented L2CAP channel
///
/// All methods take `&self`: one task blocks in [`receive`](Self::receive)
/// while other tasks [`send`](Self::send) on the same channel.
#[allow(async_fn_in_trait)]
pub trait L2capChannel {
    /// Send exactly one packet. `packet.len()` never exceeds
    /// [`transmit_mtu`](Self::transmit_mtu).
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the packet cannot be sent
    async fn send(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next packet and copy it into `buffer`.
    ///
    /// Returns the packet length; `Ok(0)` signals end of stream. Must be
    /// cancel-safe: a receive dropped before completion consumes no packet.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the channel fails or is closed
    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    /// Close the channel. Pending and later receives fail.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the disconnect procedure fails
    async fn close(&self) -> Result<(), TransportError>;

    /// Negotiated outgoing MTU
    fn transmit_mtu(&self) -> u16;

    /// Negotiated incoming MTU
    fn receive_mtu(&self) -> u16;
}

/// Opens L2CAP channels to remote devices
#[allow(async_fn_in_trait)]
pub trait L2capConnector {
    /// Channel type produced by this connector
    type Channel: L2capChannel;

    /// Open a channel to `psm` on the device at `address`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the channel cannot be established
    async fn connect(
        &self,
        address: BluetoothAddress,
        psm: ProtocolServiceMultiplexer,
    ) -> Result<Self::Channel, TransportError>;
}
