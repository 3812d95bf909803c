//! SDP Client Stack
//!
//! [`SdpStack`] owns everything shared between sessions: the transaction ID
//! allocator, the connection pool, the live transaction table and the reader
//! slots. Integrators create one stack, keep [`SdpStack::run`] polled on their
//! executor and open a session per remote device.

use super::{
    SdpClientOptions, SdpError, TransactionId,
    client::SdpSession,
    connection::ConnectionPool,
    receiver::{Readers, SdpReceiver},
    transaction::{Finished, SessionId, TransactionIdAllocator, TransactionTable},
};
use crate::{
    BluetoothAddress,
    constants::MAX_PENDING_TRANSACTIONS,
    l2cap::L2capConnector,
};
use core::cell::Cell;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};

/// Shared SDP client state
///
/// # Example
///
/// ```rust,ignore
/// let stack = SdpStack::new(connector, SdpClientOptions::default());
/// let session = stack.open(address).await?;
/// let id = session
///     .service_search(&[ServiceClassId::SerialPort.into()], listener)
///     .await?;
/// // results arrive on `listener` while `stack.run()` is polled
/// session.close().await;
/// ```
pub struct SdpStack<C: L2capConnector> {
    pub(super) options: SdpClientOptions,
    pub(super) ids: TransactionIdAllocator,
    pub(super) pool: ConnectionPool<C>,
    pub(super) transactions: TransactionTable,
    pub(super) readers: Readers<C::Channel>,
    sessions: Mutex<CriticalSectionRawMutex, Cell<SessionId>>,
    shut_down: Mutex<CriticalSectionRawMutex, Cell<bool>>,
}

impl<C: L2capConnector> SdpStack<C> {
    /// Create a stack opening channels through `connector`
    #[must_use]
    pub fn new(connector: C, options: SdpClientOptions) -> Self {
        Self {
            options,
            ids: TransactionIdAllocator::new(),
            pool: ConnectionPool::new(connector, options.psm),
            transactions: TransactionTable::new(),
            readers: Readers::new(),
            sessions: Mutex::new(Cell::new(0)),
            shut_down: Mutex::new(Cell::new(false)),
        }
    }

    /// Client configuration
    #[must_use]
    pub const fn options(&self) -> &SdpClientOptions {
        &self.options
    }

    /// Connection pool
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Live transactions of every session
    #[must_use]
    pub const fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    /// Response receiver
    #[must_use]
    pub const fn receiver(&self) -> SdpReceiver<'_, C> {
        SdpReceiver::new(self)
    }

    /// Number of connections with a running reader
    #[must_use]
    pub fn active_readers(&self) -> usize {
        self.readers.active()
    }

    /// Whether [`Self::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.lock(Cell::get)
    }

    /// Open a session to `address`, sharing the pooled connection if one
    /// exists
    ///
    /// # Errors
    /// Returns [`SdpError::SessionClosed`] after shutdown, or the pool error
    /// if no connection can be acquired
    pub async fn open(&self, address: BluetoothAddress) -> Result<SdpSession<'_, C>, SdpError> {
        if self.is_shut_down() {
            return Err(SdpError::SessionClosed);
        }
        let connection = self.pool.acquire(address).await?;
        let id = self.sessions.lock(|sessions| {
            let id = sessions.get().wrapping_add(1);
            sessions.set(id);
            id
        });
        info!("[SDP] session {} opened to {:?}", id, address);
        Ok(SdpSession::new(self, connection, id))
    }

    /// Drive the response readers. Never returns.
    pub async fn run(&self) {
        self.receiver().run().await;
    }

    /// Terminate every pending transaction, stop all readers and close every
    /// pooled connection
    ///
    /// [`Self::run`] must still be polled for this to complete.
    pub async fn shutdown(&self) {
        self.shut_down.lock(|shut_down| shut_down.set(true));
        self.receiver().cancel_all().await;
        self.pool.close_all().await;
        info!("[SDP] stack shut down");
    }

    /// Next transaction ID not used by a live transaction
    pub(crate) fn allocate_id(&self) -> Result<TransactionId, SdpError> {
        for _ in 0..=MAX_PENDING_TRANSACTIONS {
            let id = self.ids.next_id();
            if !self.transactions.contains_id(id) {
                return Ok(id);
            }
            debug!("[SDP] skipping live transaction id {}", id);
        }
        Err(SdpError::TooManyTransactions)
    }

    /// Notify the listeners of finished transactions and release their IDs
    pub(crate) fn settle(&self, finished: impl IntoIterator<Item = Finished>) {
        for finished in finished {
            finished.notify();
            self.ids.free(finished.id);
        }
    }
}
