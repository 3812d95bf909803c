//! SDP Client Sessions
//!
//! An [`SdpSession`] is one user's view of a remote device. It issues
//! requests over the pooled connection, remembers which transactions it
//! started so they can be cancelled, and hands the connection back on
//! [`SdpSession::close`].

use super::{
    ErrorReason, SdpError, SdpListener, ServiceRecordHandle, TransactionId,
    connection::Connection,
    protocol::{
        SdpRequest, ServiceAttributeRequest, ServiceSearchAttributeRequest, ServiceSearchRequest,
    },
    record::{AttributeId, Uuid},
    stack::SdpStack,
    transaction::{Finished, SessionId, Transaction, TransactionKey},
};
use crate::{
    BluetoothAddress,
    constants::{MAX_ATTRIBUTE_IDS, MAX_SEARCH_UUIDS, MAX_SESSION_TRANSACTIONS},
    l2cap::{L2capConnector, TransportError},
};
use alloc::{sync::Arc, vec::Vec};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use heapless::FnvIndexSet;

struct SessionState {
    transactions: FnvIndexSet<TransactionKey, MAX_SESSION_TRANSACTIONS>,
    attached: bool,
    closed: bool,
}

/// Client session with one remote SDP server
///
/// Requests return the transaction ID once the request is on the wire; the
/// outcome arrives later on the listener. Close the session when done, it
/// holds a reference on the pooled connection until then.
///
/// Once the connection's reader fails, every further request returns
/// [`TransportError::Disconnected`]. Close the session and open a new one;
/// the pool then connects again.
pub struct SdpSession<'a, C: L2capConnector> {
    stack: &'a SdpStack<C>,
    connection: Arc<Connection<C::Channel>>,
    id: SessionId,
    state: Mutex<CriticalSectionRawMutex, RefCell<SessionState>>,
}

impl<'a, C: L2capConnector> SdpSession<'a, C> {
    pub(crate) fn new(
        stack: &'a SdpStack<C>,
        connection: Arc<Connection<C::Channel>>,
        id: SessionId,
    ) -> Self {
        Self {
            stack,
            connection,
            id,
            state: Mutex::new(RefCell::new(SessionState {
                transactions: FnvIndexSet::new(),
                attached: false,
                closed: false,
            })),
        }
    }

    /// Session ID
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Remote device address
    #[must_use]
    pub fn address(&self) -> BluetoothAddress {
        self.connection.address()
    }

    /// Whether [`Self::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock(|state| state.borrow().closed)
    }

    /// Number of this session's transactions still in flight
    #[must_use]
    pub fn pending(&self) -> usize {
        self.prune();
        self.state.lock(|state| state.borrow().transactions.len())
    }

    /// Find the records matching every UUID in `uuids`
    ///
    /// Duplicate UUIDs are collapsed before sending.
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidParameter`] for an empty or oversized UUID
    /// set, [`SdpError::SessionClosed`] after close, or the error that kept
    /// the request from being sent
    pub async fn service_search(
        &self,
        uuids: &[Uuid],
        listener: Arc<dyn SdpListener>,
    ) -> Result<TransactionId, SdpError> {
        self.ensure_open()?;
        let options = self.stack.options();
        let request = SdpRequest::ServiceSearch(ServiceSearchRequest {
            service_search_pattern: search_pattern(uuids, options.max_search_uuids)?,
            maximum_service_record_count: options.max_service_record_count,
        });
        self.start(request, listener).await
    }

    /// Fetch attributes of the record at `handle`
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidParameter`] for an empty, oversized or
    /// duplicated attribute ID list, [`SdpError::SessionClosed`] after close,
    /// or the error that kept the request from being sent
    pub async fn service_attribute(
        &self,
        handle: ServiceRecordHandle,
        attribute_ids: &[AttributeId],
        listener: Arc<dyn SdpListener>,
    ) -> Result<TransactionId, SdpError> {
        self.ensure_open()?;
        let options = self.stack.options();
        let request = SdpRequest::ServiceAttribute(ServiceAttributeRequest {
            service_record_handle: handle,
            maximum_attribute_byte_count: options.max_attribute_byte_count,
            attribute_id_list: attribute_list(attribute_ids, options.max_attribute_ids)?,
        });
        self.start(request, listener).await
    }

    /// Search for records matching `uuids` and fetch their attributes in one
    /// transaction
    ///
    /// # Errors
    /// Same as [`Self::service_search`] and [`Self::service_attribute`]
    pub async fn service_search_attribute(
        &self,
        attribute_ids: &[AttributeId],
        uuids: &[Uuid],
        listener: Arc<dyn SdpListener>,
    ) -> Result<TransactionId, SdpError> {
        self.ensure_open()?;
        let options = self.stack.options();
        let request = SdpRequest::ServiceSearchAttribute(ServiceSearchAttributeRequest {
            service_search_pattern: search_pattern(uuids, options.max_search_uuids)?,
            maximum_attribute_byte_count: options.max_attribute_byte_count,
            attribute_id_list: attribute_list(attribute_ids, options.max_attribute_ids)?,
        });
        self.start(request, listener).await
    }

    /// Cancel this session's transaction `id`; its listener gets
    /// [`ErrorReason::Terminated`]
    ///
    /// Returns `false` if no such transaction is in flight.
    pub fn cancel(&self, id: TransactionId) -> bool {
        let keys: Vec<TransactionKey> = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let keys: Vec<TransactionKey> = state
                .transactions
                .iter()
                .filter(|key| key.id == id)
                .copied()
                .collect();
            for key in &keys {
                state.transactions.remove(key);
            }
            keys
        });

        let cancelled = self.terminate(keys);
        let found = !cancelled.is_empty();
        if found {
            debug!("[SDP] session {} cancelled tid {}", self.id, id);
        }
        self.stack.settle(cancelled);
        found
    }

    /// Terminate every pending transaction and release the connection
    ///
    /// Calling it again does nothing.
    pub async fn close(&self) {
        let closing = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.closed {
                return None;
            }
            state.closed = true;
            let keys: Vec<TransactionKey> = state.transactions.iter().copied().collect();
            state.transactions.clear();
            Some((keys, state.attached))
        });
        let Some((keys, attached)) = closing else {
            return;
        };

        let cancelled = self.terminate(keys);
        let count = cancelled.len();
        self.stack.settle(cancelled);
        if attached {
            self.stack.receiver().detach(&self.connection);
        }
        self.stack.pool.release(&self.connection).await;
        info!(
            "[SDP] session {} closed, {} transactions terminated",
            self.id,
            count
        );
    }

    fn ensure_open(&self) -> Result<(), SdpError> {
        if self.is_closed() || self.stack.is_shut_down() {
            return Err(SdpError::SessionClosed);
        }
        Ok(())
    }

    fn terminate(&self, keys: Vec<TransactionKey>) -> Vec<Finished> {
        keys.into_iter()
            .filter_map(|key| {
                self.stack
                    .transactions
                    .cancel_owned(key, self.id, ErrorReason::Terminated)
            })
            .collect()
    }

    /// Forget transactions that already finished
    fn prune(&self) {
        let keys: Vec<TransactionKey> = self
            .state
            .lock(|state| state.borrow().transactions.iter().copied().collect());
        let finished: Vec<TransactionKey> = keys
            .into_iter()
            .filter(|key| !self.stack.transactions.contains(*key))
            .collect();
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            for key in &finished {
                state.transactions.remove(key);
            }
        });
    }

    async fn start(
        &self,
        request: SdpRequest,
        listener: Arc<dyn SdpListener>,
    ) -> Result<TransactionId, SdpError> {
        let stack = self.stack;
        self.prune();

        let id = stack.allocate_id()?;
        let transaction = Transaction::new(
            id,
            self.id,
            self.address(),
            listener,
            request,
            stack.options().max_response_bytes,
        );
        let key = transaction.key();
        let parameters = match transaction.encode_request() {
            Ok(parameters) => parameters,
            Err(error) => {
                stack.ids.free(id);
                return Err(error);
            }
        };
        if let Err(error) = stack.transactions.insert(transaction) {
            stack.ids.free(id);
            return Err(error);
        }
        let tracked = self
            .state
            .lock(|state| state.borrow_mut().transactions.insert(key).is_ok());
        if !tracked {
            self.abandon(key);
            return Err(SdpError::TooManyTransactions);
        }
        // Checked after registering: a reader failing from here on cancels
        // the transaction itself
        if self.connection.is_failed() {
            debug!(
                "[SDP] session {} connection to {:?} has failed",
                self.id,
                self.address()
            );
            self.abandon(key);
            return Err(SdpError::Transport(TransportError::Disconnected));
        }

        if let Err(error) = self.attach().await {
            self.abandon(key);
            return Err(error);
        }
        if let Err(error) = self
            .connection
            .send_pdu(key.kind.request_pdu(), id, &parameters)
            .await
        {
            warn!("[SDP] sending tid {} failed: {:?}", id, error);
            self.abandon(key);
            return Err(error.into());
        }
        stack.transactions.mark_sent(key);
        debug!(
            "[SDP] session {} started {:?} tid {}",
            self.id,
            key.kind,
            id
        );
        Ok(id)
    }

    async fn attach(&self) -> Result<(), SdpError> {
        let first = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            !core::mem::replace(&mut state.attached, true)
        });
        if !first {
            return Ok(());
        }
        let result = self.stack.receiver().attach(&self.connection).await;
        if result.is_err() {
            self.state.lock(|state| state.borrow_mut().attached = false);
        }
        result
    }

    /// Drop a transaction whose request never went out
    fn abandon(&self, key: TransactionKey) {
        self.stack.transactions.remove(key);
        self.state
            .lock(|state| state.borrow_mut().transactions.remove(&key));
        self.stack.ids.free(key.id);
    }
}

impl<C: L2capConnector> Drop for SdpSession<'_, C> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("[SDP] session {} dropped without close", self.id);
        }
    }
}

fn search_pattern(
    uuids: &[Uuid],
    limit: usize,
) -> Result<heapless::Vec<Uuid, MAX_SEARCH_UUIDS>, SdpError> {
    let mut pattern: heapless::Vec<Uuid, MAX_SEARCH_UUIDS> = heapless::Vec::new();
    for uuid in uuids {
        if pattern.iter().any(|known| known.matches(*uuid)) {
            continue;
        }
        pattern
            .push(*uuid)
            .map_err(|_| SdpError::InvalidParameter)?;
    }
    if pattern.is_empty() || pattern.len() > limit.min(MAX_SEARCH_UUIDS) {
        return Err(SdpError::InvalidParameter);
    }
    Ok(pattern)
}

fn attribute_list(
    attribute_ids: &[AttributeId],
    limit: usize,
) -> Result<heapless::Vec<AttributeId, MAX_ATTRIBUTE_IDS>, SdpError> {
    if attribute_ids.is_empty() || attribute_ids.len() > limit.min(MAX_ATTRIBUTE_IDS) {
        return Err(SdpError::InvalidParameter);
    }
    let mut list: heapless::Vec<AttributeId, MAX_ATTRIBUTE_IDS> = heapless::Vec::new();
    for id in attribute_ids {
        if list.contains(id) {
            return Err(SdpError::InvalidParameter);
        }
        list.push(*id).map_err(|_| SdpError::InvalidParameter)?;
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::{
        record::DataElement,
        stack::tests::{ADDRESS, drive, idle, pdu, stack},
        transaction::tests::RecordingListener,
    };

    #[test]
    fn test_service_search_attribute_end_to_end() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            let id = session
                .service_search_attribute(&[0x0000, 0x0100], &[Uuid::Uuid16(0x1101)], listener.clone())
                .await
                .unwrap();
            assert_eq!(id, 1);

            let link = stack.pool().connector().link(ADDRESS).unwrap();
            assert_eq!(
                link.sent_bytes(),
                [
                    0x06, 0x00, 0x01, 0x00, 0x10, 0x35, 0x03, 0x19, 0x11, 0x01, 0xFF, 0xFF, 0x35,
                    0x06, 0x09, 0x00, 0x00, 0x09, 0x01, 0x00, 0x00
                ]
            );

            let mut lists = alloc::vec![0x00, 0x1C, 0x35, 0x1A, 0x35, 0x18];
            lists.extend_from_slice(&[0x09, 0x00, 0x00, 0x0A, 0x00, 0x01, 0x00, 0x01]);
            lists.extend_from_slice(&[0x09, 0x01, 0x00, 0x25, 0x0B]);
            lists.extend_from_slice(b"Serial Port");
            lists.push(0x00);
            link.push(&pdu(0x07, 1, &lists));
            idle().await;

            assert_eq!(listener.events(), ["search-attributes 1 [0, 100]"]);
            assert_eq!(
                listener.attributes(),
                [
                    (0x0000, DataElement::UnsignedInt32(0x0001_0001)),
                    (0x0100, DataElement::text_string("Serial Port")),
                ]
            );
            assert_eq!(session.pending(), 0);
            session.close().await;
        });
    }

    #[test]
    fn test_invalid_arguments_are_rejected_before_sending() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            assert_eq!(
                session.service_search(&[], listener.clone()).await,
                Err(SdpError::InvalidParameter)
            );
            let many: Vec<Uuid> = (0..13).map(|value| Uuid::Uuid16(0x1100 + value)).collect();
            assert_eq!(
                session.service_search(&many, listener.clone()).await,
                Err(SdpError::InvalidParameter)
            );
            assert_eq!(
                session
                    .service_attribute(0x0001_0000, &[], listener.clone())
                    .await,
                Err(SdpError::InvalidParameter)
            );
            assert_eq!(
                session
                    .service_attribute(0x0001_0000, &[0x0100, 0x0100], listener.clone())
                    .await,
                Err(SdpError::InvalidParameter)
            );

            let link = stack.pool().connector().link(ADDRESS).unwrap();
            assert_eq!(link.sent_count(), 0);
            assert!(listener.events().is_empty());
            assert!(stack.transactions().is_empty());
            session.close().await;
        });
    }

    #[test]
    fn test_duplicate_uuids_are_collapsed() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            let long_form = Uuid::Uuid128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);
            session
                .service_search(&[Uuid::Uuid16(0x1101), long_form], listener.clone())
                .await
                .unwrap();
            let link = stack.pool().connector().link(ADDRESS).unwrap();
            assert_eq!(
                link.sent_bytes(),
                [0x02, 0x00, 0x01, 0x00, 0x08, 0x35, 0x03, 0x19, 0x11, 0x01, 0xFF, 0xFF, 0x00]
            );
            session.close().await;
        });
    }

    #[test]
    fn test_close_terminates_pending_and_is_idempotent() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            session
                .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                .await
                .unwrap();
            idle().await;
            assert_eq!(stack.active_readers(), 1);

            session.close().await;
            idle().await;
            assert_eq!(listener.events(), ["error 1 Terminated \"\""]);
            assert_eq!(stack.active_readers(), 0);
            let link = stack.pool().connector().link(ADDRESS).unwrap();
            assert_eq!(link.close_count(), 1);
            assert!(stack.pool().is_empty().await);

            session.close().await;
            assert_eq!(listener.events().len(), 1);
            assert_eq!(link.close_count(), 1);
            assert_eq!(
                session
                    .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                    .await,
                Err(SdpError::SessionClosed)
            );
        });
    }

    #[test]
    fn test_cancel_only_touches_own_transaction() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let first = stack.open(ADDRESS).await.unwrap();
            let second = stack.open(ADDRESS).await.unwrap();
            let id = first
                .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                .await
                .unwrap();

            assert!(!second.cancel(id));
            assert!(listener.events().is_empty());
            assert!(first.cancel(id));
            assert!(!first.cancel(id));
            assert_eq!(listener.events(), ["error 1 Terminated \"\""]);
            assert_eq!(first.pending(), 0);

            first.close().await;
            second.close().await;
        });
    }

    #[test]
    fn test_cancel_applies_to_every_request_kind() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            let attributes = session
                .service_attribute(0x0001_0001, &[0x0100], listener.clone())
                .await
                .unwrap();
            let combined = session
                .service_search_attribute(&[0x0100], &[Uuid::Uuid16(0x1101)], listener.clone())
                .await
                .unwrap();

            assert!(session.cancel(combined));
            assert!(session.cancel(attributes));
            assert_eq!(
                listener.events(),
                ["error 2 Terminated \"\"", "error 1 Terminated \"\""]
            );
            assert_eq!(session.pending(), 0);
            session.close().await;
        });
    }

    #[test]
    fn test_requests_after_reader_failure_need_a_new_session() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            session
                .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                .await
                .unwrap();
            idle().await;
            let old_link = stack.pool().connector().link(ADDRESS).unwrap();

            old_link.fail_receive();
            idle().await;
            assert_eq!(listener.events(), ["error 1 IoError \"\""]);
            assert_eq!(
                session
                    .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                    .await,
                Err(SdpError::Transport(TransportError::Disconnected))
            );
            assert_eq!(old_link.sent_count(), 1);
            assert_eq!(session.pending(), 0);
            assert!(stack.transactions().is_empty());
            assert_eq!(stack.active_readers(), 0);

            let fresh = stack.open(ADDRESS).await.unwrap();
            assert_eq!(stack.pool().connector().connect_count(), 2);
            assert!(old_link.is_closed());
            let id = fresh
                .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                .await
                .unwrap();
            let link = stack.pool().connector().link(ADDRESS).unwrap();
            let response = [0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x30, 0x00];
            link.push(&pdu(0x03, id, &response));
            idle().await;
            let expected = alloc::format!("search {id} [10030]");
            assert_eq!(listener.events().last(), Some(&expected));

            session.close().await;
            assert!(!link.is_closed());
            fresh.close().await;
            assert!(link.is_closed());
            assert!(stack.pool().is_empty().await);
        });
    }

    #[test]
    fn test_sessions_share_one_connection() {
        let stack = stack();
        drive(&stack, async {
            let first = stack.open(ADDRESS).await.unwrap();
            let second = stack.open(ADDRESS).await.unwrap();
            assert_ne!(first.id(), second.id());
            assert_eq!(stack.pool().connector().connect_count(), 1);
            assert_eq!(stack.pool().references(ADDRESS).await, 2);

            let link = stack.pool().connector().link(ADDRESS).unwrap();
            first.close().await;
            assert!(!link.is_closed());
            second.close().await;
            assert!(link.is_closed());
        });
    }

    #[test]
    fn test_failed_send_is_reported_to_caller_only() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            stack.pool().connector().link(ADDRESS).unwrap().fail_sends();
            assert_eq!(
                session
                    .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                    .await,
                Err(SdpError::Transport(TransportError::Io))
            );
            assert!(listener.events().is_empty());
            assert!(stack.transactions().is_empty());
            assert_eq!(session.pending(), 0);
            session.close().await;
        });
    }

    #[test]
    fn test_session_transaction_limit() {
        let stack = stack();
        let listener = Arc::new(RecordingListener::default());
        drive(&stack, async {
            let session = stack.open(ADDRESS).await.unwrap();
            for _ in 0..MAX_SESSION_TRANSACTIONS {
                session
                    .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                    .await
                    .unwrap();
            }
            assert_eq!(
                session
                    .service_search(&[Uuid::Uuid16(0x1101)], listener.clone())
                    .await,
                Err(SdpError::TooManyTransactions)
            );
            assert_eq!(stack.transactions().len(), MAX_SESSION_TRANSACTIONS);
            session.close().await;
            assert_eq!(listener.events().len(), MAX_SESSION_TRANSACTIONS);
        });
    }
}
