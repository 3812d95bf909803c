//! MTU-bounded Framed Reader/Writer
//!
//! Turns the packet-oriented [`L2capChannel`] into a byte stream. The writer
//! coalesces small writes into MTU-sized packets; the reader serves reads from
//! the last received packet and pulls the next one when it runs dry.
//!
//! Both halves are plain buffers: the channel is passed to every call, so the
//! owner decides which lock guards which half.

use super::{L2capChannel, TransportError};
use crate::constants::DEFAULT_L2CAP_MTU;
use alloc::{vec, vec::Vec};

fn effective_mtu(mtu: u16) -> usize {
    if mtu == 0 {
        usize::from(DEFAULT_L2CAP_MTU)
    } else {
        usize::from(mtu)
    }
}

/// Outgoing half: accumulates bytes and sends them as packets
#[derive(Debug)]
pub struct FrameWriter {
    buffer: Vec<u8>,
    offset: usize,
}

impl FrameWriter {
    /// Create a writer whose packets never exceed `transmit_mtu` bytes
    #[must_use]
    pub fn new(transmit_mtu: u16) -> Self {
        Self {
            buffer: vec![0; effective_mtu(transmit_mtu)],
            offset: 0,
        }
    }

    /// Capacity of one outgoing packet
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes buffered but not yet sent
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.offset
    }

    /// Buffer one byte, sending a full packet if the buffer fills
    ///
    /// # Errors
    /// Returns a [`TransportError`] if a full packet cannot be sent
    pub async fn write_byte<C: L2capChannel>(
        &mut self,
        channel: &C,
        byte: u8,
    ) -> Result<(), TransportError> {
        self.write_bytes(channel, &[byte]).await
    }

    /// Buffer a big-endian `u16`
    ///
    /// # Errors
    /// Returns a [`TransportError`] if a full packet cannot be sent
    pub async fn write_u16<C: L2capChannel>(
        &mut self,
        channel: &C,
        value: u16,
    ) -> Result<(), TransportError> {
        self.write_bytes(channel, &value.to_be_bytes()).await
    }

    /// Buffer `data`, sending every packet that fills up on the way
    ///
    /// # Errors
    /// Returns a [`TransportError`] if a full packet cannot be sent
    pub async fn write_bytes<C: L2capChannel>(
        &mut self,
        channel: &C,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut rest = data;
        while !rest.is_empty() {
            let space = self.buffer.len() - self.offset;
            let (head, tail) = rest.split_at(space.min(rest.len()));
            self.buffer[self.offset..self.offset + head.len()].copy_from_slice(head);
            self.offset += head.len();
            rest = tail;

            if self.offset == self.buffer.len() {
                channel.send(&self.buffer).await?;
                self.offset = 0;
            }
        }
        Ok(())
    }

    /// Send whatever is buffered as one short packet
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the packet cannot be sent
    pub async fn flush<C: L2capChannel>(&mut self, channel: &C) -> Result<(), TransportError> {
        if self.offset == 0 {
            return Ok(());
        }
        let length = self.offset;
        self.offset = 0;
        channel.send(&self.buffer[..length]).await
    }

    /// Drop buffered bytes without sending them
    pub fn discard(&mut self) {
        self.offset = 0;
    }
}

/// Incoming half: serves reads from the most recently received packet
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    length: usize,
    offset: usize,
}

impl FrameReader {
    /// Create a reader able to hold one packet of `receive_mtu` bytes
    #[must_use]
    pub fn new(receive_mtu: u16) -> Self {
        Self {
            buffer: vec![0; effective_mtu(receive_mtu)],
            length: 0,
            offset: 0,
        }
    }

    /// Bytes received but not yet consumed
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.length - self.offset
    }

    async fn fill<C: L2capChannel>(&mut self, channel: &C) -> Result<(), TransportError> {
        let received = channel.receive(&mut self.buffer).await?;
        if received == 0 {
            return Err(TransportError::EndOfStream);
        }
        if received > self.buffer.len() {
            return Err(TransportError::PacketTooLarge);
        }
        self.length = received;
        self.offset = 0;
        Ok(())
    }

    /// Read one byte
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the next packet cannot be received
    pub async fn read_byte<C: L2capChannel>(&mut self, channel: &C) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        self.read_bytes(channel, &mut byte).await?;
        Ok(byte[0])
    }

    /// Read a big-endian `u16`
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the next packet cannot be received
    pub async fn read_u16<C: L2capChannel>(&mut self, channel: &C) -> Result<u16, TransportError> {
        let mut bytes = [0u8; 2];
        self.read_bytes(channel, &mut bytes).await?;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Copy as many buffered bytes into `out` as fit, receiving one packet
    /// first if nothing is buffered. Returns the number of bytes copied.
    ///
    /// Bytes are consumed only in the poll that returns them, so dropping the
    /// future loses no data if the channel's receive is cancel-safe.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the packet cannot be received
    pub async fn read_some<C: L2capChannel>(
        &mut self,
        channel: &C,
        out: &mut [u8],
    ) -> Result<usize, TransportError> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.length {
            self.fill(channel).await?;
        }
        let count = (self.length - self.offset).min(out.len());
        out[..count].copy_from_slice(&self.buffer[self.offset..self.offset + count]);
        self.offset += count;
        Ok(count)
    }

    /// Fill `out` completely, receiving as many packets as needed
    ///
    /// # Errors
    /// Returns a [`TransportError`] if a packet cannot be received
    pub async fn read_bytes<C: L2capChannel>(
        &mut self,
        channel: &C,
        out: &mut [u8],
    ) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < out.len() {
            filled += self.read_some(channel, &mut out[filled..]).await?;
        }
        Ok(())
    }

    /// Consume and drop exactly `count` bytes
    ///
    /// # Errors
    /// Returns a [`TransportError`] if a packet cannot be received
    pub async fn skip<C: L2capChannel>(
        &mut self,
        channel: &C,
        count: usize,
    ) -> Result<(), TransportError> {
        let mut remaining = count;
        while remaining > 0 {
            if self.offset >= self.length {
                self.fill(channel).await?;
            }
            let step = (self.length - self.offset).min(remaining);
            self.offset += step;
            remaining -= step;
        }
        Ok(())
    }
}
