//! Shared SDP Connections
//!
//! One L2CAP channel per remote device is shared by every session talking to
//! that device. The [`ConnectionPool`] hands out reference-counted
//! [`Connection`]s and closes the channel when the last reference goes away.

use super::{SdpError, SdpPduId, TransactionId, protocol::SdpPduHeader};
use crate::{
    BluetoothAddress,
    constants::{MAX_CONNECTIONS, PDU_HEADER_LENGTH},
    l2cap::{
        FrameReader, FrameWriter, L2capChannel, L2capConnector, ProtocolServiceMultiplexer,
        TransportError,
    },
};
use alloc::{sync::Arc, vec, vec::Vec};
use core::cell::Cell;
use embassy_sync::{
    blocking_mutex::{Mutex as BlockingMutex, raw::CriticalSectionRawMutex},
    mutex::Mutex,
};
use heapless::FnvIndexMap;

/// Raw PDU as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPdu {
    /// PDU ID byte, not yet validated
    pub pdu_id: u8,
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Parameter bytes
    pub payload: Vec<u8>,
}

/// Incoming half of a connection
///
/// Holds the PDU being assembled, so a read dropped part way through a frame
/// resumes at the same byte on the next call.
#[derive(Debug)]
pub struct PduReader {
    frames: FrameReader,
    header: [u8; PDU_HEADER_LENGTH],
    header_filled: usize,
    payload: Vec<u8>,
    payload_filled: usize,
}

impl PduReader {
    fn new(receive_mtu: u16) -> Self {
        Self {
            frames: FrameReader::new(receive_mtu),
            header: [0; PDU_HEADER_LENGTH],
            header_filled: 0,
            payload: Vec::new(),
            payload_filled: 0,
        }
    }

    /// Whether a PDU has been partly read
    #[must_use]
    pub const fn in_frame(&self) -> bool {
        self.header_filled > 0
    }
}

/// An open SDP channel to one remote device
///
/// Writers serialize on the write lock so PDUs never interleave; the read lock
/// is held by the single receiver task for the connection.
pub struct Connection<C: L2capChannel> {
    address: BluetoothAddress,
    channel: C,
    reader: Mutex<CriticalSectionRawMutex, PduReader>,
    writer: Mutex<CriticalSectionRawMutex, FrameWriter>,
    failed: BlockingMutex<CriticalSectionRawMutex, Cell<bool>>,
}

impl<C: L2capChannel> Connection<C> {
    /// Wrap an open channel
    #[must_use]
    pub fn new(address: BluetoothAddress, channel: C) -> Self {
        let reader = PduReader::new(channel.receive_mtu());
        let writer = FrameWriter::new(channel.transmit_mtu());
        Self {
            address,
            channel,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            failed: BlockingMutex::new(Cell::new(false)),
        }
    }

    /// Remote device address
    #[must_use]
    pub const fn address(&self) -> BluetoothAddress {
        self.address
    }

    /// Underlying channel
    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Read lock guarding the incoming half
    #[must_use]
    pub const fn reader(&self) -> &Mutex<CriticalSectionRawMutex, PduReader> {
        &self.reader
    }

    /// Whether reading from the channel has failed
    ///
    /// A failed connection is never read again. The pool replaces it on the
    /// next [`ConnectionPool::acquire`].
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.lock(Cell::get)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.lock(|failed| failed.set(true));
    }

    /// Write one complete PDU and flush it
    ///
    /// On failure any partially buffered bytes are dropped so the next PDU
    /// starts on a clean packet.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the channel fails
    pub async fn send_pdu(
        &self,
        pdu_id: SdpPduId,
        transaction_id: TransactionId,
        parameters: &[u8],
    ) -> Result<(), TransportError> {
        let parameter_length =
            u16::try_from(parameters.len()).map_err(|_| TransportError::PacketTooLarge)?;
        let header = SdpPduHeader::new(pdu_id, transaction_id, parameter_length).encode();

        let mut writer = self.writer.lock().await;
        let result = write_pdu(&mut writer, &self.channel, &header, parameters).await;
        if result.is_err() {
            writer.discard();
        }
        trace!(
            "[SDP] sent pdu {:?} tid {} ({} bytes)",
            pdu_id,
            transaction_id,
            parameters.len()
        );
        result
    }

    /// Read the next PDU, header and complete payload
    ///
    /// `reader` is the guard obtained from [`Self::reader`]. Cancel-safe: the
    /// partly read PDU stays in `reader`.
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the channel fails or ends
    pub async fn read_pdu(&self, reader: &mut PduReader) -> Result<InboundPdu, TransportError> {
        while reader.header_filled < PDU_HEADER_LENGTH {
            let count = reader
                .frames
                .read_some(&self.channel, &mut reader.header[reader.header_filled..])
                .await?;
            reader.header_filled += count;
            if reader.header_filled == PDU_HEADER_LENGTH {
                let length = u16::from_be_bytes([reader.header[3], reader.header[4]]);
                reader.payload = vec![0u8; usize::from(length)];
                reader.payload_filled = 0;
            }
        }
        while reader.payload_filled < reader.payload.len() {
            let count = reader
                .frames
                .read_some(&self.channel, &mut reader.payload[reader.payload_filled..])
                .await?;
            reader.payload_filled += count;
        }

        reader.header_filled = 0;
        Ok(InboundPdu {
            pdu_id: reader.header[0],
            transaction_id: u16::from_be_bytes([reader.header[1], reader.header[2]]),
            payload: core::mem::take(&mut reader.payload),
        })
    }
}

async fn write_pdu<C: L2capChannel>(
    writer: &mut FrameWriter,
    channel: &C,
    header: &[u8],
    parameters: &[u8],
) -> Result<(), TransportError> {
    writer.write_bytes(channel, header).await?;
    writer.write_bytes(channel, parameters).await?;
    writer.flush(channel).await
}

struct PoolEntry<C: L2capChannel> {
    connection: Arc<Connection<C>>,
    references: usize,
}

/// Reference-counted pool with at most one connection per remote address
pub struct ConnectionPool<C: L2capConnector> {
    connector: C,
    psm: ProtocolServiceMultiplexer,
    entries: Mutex<CriticalSectionRawMutex, PoolEntries<C::Channel>>,
}

type PoolEntries<C> = FnvIndexMap<BluetoothAddress, PoolEntry<C>, MAX_CONNECTIONS>;

impl<C: L2capConnector> ConnectionPool<C> {
    /// Create an empty pool opening channels to `psm`
    #[must_use]
    pub const fn new(connector: C, psm: ProtocolServiceMultiplexer) -> Self {
        Self {
            connector,
            psm,
            entries: Mutex::new(FnvIndexMap::new()),
        }
    }

    /// Connector used to open channels
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Get the connection to `address`, opening it if needed
    ///
    /// A pooled connection whose reader failed is closed and replaced by a new
    /// channel.
    ///
    /// The lookup, connect and insert happen under the pool lock, so two
    /// concurrent callers for the same address share one channel.
    ///
    /// # Errors
    /// Returns [`SdpError::TooManyConnections`] if the pool is full, or the
    /// transport error if the channel cannot be opened
    pub async fn acquire(
        &self,
        address: BluetoothAddress,
    ) -> Result<Arc<Connection<C::Channel>>, SdpError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&address) {
            if !entry.connection.is_failed() {
                entry.references += 1;
                return Ok(Arc::clone(&entry.connection));
            }
            // Holders of the failed connection keep their handle; their
            // releases no longer match the pooled entry.
            if let Some(failed) = entries.remove(&address) {
                warn!("[SDP] replacing failed connection to {:?}", address);
                close_channel(&failed.connection).await;
            }
        }
        if entries.len() >= MAX_CONNECTIONS {
            warn!("[SDP] connection pool full, refusing {:?}", address);
            return Err(SdpError::TooManyConnections);
        }

        let channel = self.connector.connect(address, self.psm).await?;
        let connection = Arc::new(Connection::new(address, channel));
        let entry = PoolEntry {
            connection: Arc::clone(&connection),
            references: 1,
        };
        if entries.insert(address, entry).is_err() {
            return Err(SdpError::TooManyConnections);
        }
        info!("[SDP] connected to {:?}", address);
        Ok(connection)
    }

    /// Take an additional reference on a pooled connection
    ///
    /// Returns `false` if the connection is no longer pooled.
    pub async fn retain(&self, connection: &Arc<Connection<C::Channel>>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&connection.address) {
            Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                entry.references += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop one reference; the last one closes the channel
    pub async fn release(&self, connection: &Arc<Connection<C::Channel>>) {
        let mut entries = self.entries.lock().await;
        let address = connection.address;
        let closing = match entries.get_mut(&address) {
            Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                entry.references -= 1;
                entry.references == 0
            }
            _ => {
                debug!("[SDP] release of unpooled connection {:?}", address);
                return;
            }
        };
        if closing {
            entries.remove(&address);
            close_channel(connection).await;
        }
    }

    /// Close every pooled connection regardless of references
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;
        let addresses: Vec<BluetoothAddress> = entries.keys().copied().collect();
        for address in addresses {
            if let Some(entry) = entries.remove(&address) {
                close_channel(&entry.connection).await;
            }
        }
    }

    /// Number of pooled connections
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no connection is pooled
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reference count of the connection to `address`, 0 if not pooled
    pub async fn references(&self, address: BluetoothAddress) -> usize {
        self.entries
            .lock()
            .await
            .get(&address)
            .map_or(0, |entry| entry.references)
    }
}

async fn close_channel<C: L2capChannel>(connection: &Connection<C>) {
    match connection.channel.close().await {
        Ok(()) => info!("[SDP] disconnected from {:?}", connection.address),
        Err(error) => warn!(
            "[SDP] closing channel to {:?} failed: {:?}",
            connection.address,
            error
        ),
    }
}
