//! SDP Transactions
//!
//! A transaction is one logical request (service search, service attribute,
//! or service search attribute) together with every continuation round trip
//! needed to collect its full answer. This module holds the transaction ID
//! allocator, the per-transaction state machine and the table of live
//! transactions the receiver dispatches into.

use super::{
    ErrorReason, SdpError, SdpListener, SdpPduId, ServiceRecordHandle, TransactionId,
    attribute::{parse_attribute_list, parse_attribute_lists},
    protocol::{
        ContinuationState, ErrorResponse, SdpRequest, ServiceAttributeRequest,
        ServiceAttributeResponse, ServiceSearchAttributeRequest, ServiceSearchResponse,
    },
    record::{AttributeId, DataElement},
};
use crate::{
    BluetoothAddress,
    constants::{MAX_PENDING_TRANSACTIONS, MAX_REQUEST_PARAMETERS, TOMBSTONE_CAPACITY},
};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::cell::{Cell, RefCell};
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use heapless::{Deque, FnvIndexMap};

/// Identifies the session that started a transaction
pub type SessionId = u32;

/// Encoded request parameters, continuation state included
pub type RequestParameters = heapless::Vec<u8, MAX_REQUEST_PARAMETERS>;

/// The three client request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    /// Service search (UUIDs to record handles)
    ServiceSearch,
    /// Service attribute (record handle to attributes)
    ServiceAttribute,
    /// Service search attribute (UUIDs to attributes of every match)
    ServiceSearchAttribute,
}

impl RequestKind {
    /// PDU ID of the request
    #[must_use]
    pub const fn request_pdu(self) -> SdpPduId {
        match self {
            Self::ServiceSearch => SdpPduId::ServiceSearchRequest,
            Self::ServiceAttribute => SdpPduId::ServiceAttributeRequest,
            Self::ServiceSearchAttribute => SdpPduId::ServiceSearchAttributeRequest,
        }
    }

    /// PDU ID of the matching success response
    #[must_use]
    pub const fn response_pdu(self) -> SdpPduId {
        match self {
            Self::ServiceSearch => SdpPduId::ServiceSearchResponse,
            Self::ServiceAttribute => SdpPduId::ServiceAttributeResponse,
            Self::ServiceSearchAttribute => SdpPduId::ServiceSearchAttributeResponse,
        }
    }
}

/// Lookup key of a live transaction
///
/// The numeric ID alone is not unique once the allocator wraps, so the key
/// pairs it with the request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionKey {
    /// Transaction ID carried in every PDU of the transaction
    pub id: TransactionId,
    /// Request kind
    pub kind: RequestKind,
}

impl TransactionKey {
    /// Create a key
    #[must_use]
    pub const fn new(id: TransactionId, kind: RequestKind) -> Self {
        Self { id, kind }
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionState {
    /// Registered, request not yet on the wire
    Created,
    /// Request sent, awaiting (more) responses
    Sent,
    /// Result delivered
    Completed,
    /// Server answered with an error response
    Errored,
    /// Cancelled locally or by a connection failure
    Cancelled,
}

impl TransactionState {
    /// No further callbacks will be made
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// Issues 16-bit transaction IDs
///
/// IDs are handed out sequentially starting at 1; after 65535 the sequence
/// wraps to 1. Zero is never issued.
pub struct TransactionIdAllocator {
    next: Mutex<CriticalSectionRawMutex, Cell<TransactionId>>,
}

impl TransactionIdAllocator {
    /// Create an allocator whose first ID is 1
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: Mutex::new(Cell::new(1)),
        }
    }

    /// Next ID in sequence
    pub fn next_id(&self) -> TransactionId {
        self.next.lock(|next| {
            let id = next.get();
            next.set(if id == TransactionId::MAX { 1 } else { id + 1 });
            id
        })
    }

    /// Return an ID. IDs are reused only after the sequence wraps.
    pub fn free(&self, id: TransactionId) {
        debug!("[SDP] transaction id {} freed", id);
    }
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Final outcome of a transaction, delivered to its listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Handles of all matching records
    ServiceSearch(Vec<ServiceRecordHandle>),
    /// Attributes of one record
    ServiceAttribute {
        /// Attribute IDs
        ids: Vec<AttributeId>,
        /// Values, pairwise with `ids`
        values: Vec<DataElement>,
    },
    /// Attributes of all matching records
    ServiceSearchAttribute {
        /// Attribute IDs
        ids: Vec<AttributeId>,
        /// Values, pairwise with `ids`
        values: Vec<DataElement>,
    },
    /// Error response or cancellation
    Error {
        /// Reason reported to the listener
        reason: ErrorReason,
        /// Server diagnostic text, empty for local failures
        info: String,
    },
}

impl Completion {
    /// Invoke the listener callback matching this outcome
    pub fn deliver(&self, listener: &dyn SdpListener, id: TransactionId) {
        match self {
            Self::ServiceSearch(handles) => listener.on_service_search_result(handles, id),
            Self::ServiceAttribute { ids, values } => {
                listener.on_service_attribute_result(ids, values, id);
            }
            Self::ServiceSearchAttribute { ids, values } => {
                listener.on_service_search_attribute_result(ids, values, id);
            }
            Self::Error { reason, info } => listener.on_error(*reason, info, id),
        }
    }
}

/// Result of feeding one response PDU to a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Partial response; resend the request with these parameters
    Continue(RequestParameters),
    /// Transaction finished with this outcome
    Done(Completion),
}

/// One SDP transaction
pub struct Transaction {
    key: TransactionKey,
    session: SessionId,
    address: BluetoothAddress,
    listener: Arc<dyn SdpListener>,
    request: SdpRequest,
    state: TransactionState,
    continuation: ContinuationState,
    response_limit: usize,
    handles: Vec<ServiceRecordHandle>,
    attribute_bytes: Vec<u8>,
}

impl Transaction {
    /// Create a transaction in the `Created` state
    ///
    /// `response_limit` bounds the attribute bytes accumulated across all
    /// continuation rounds.
    #[must_use]
    pub fn new(
        id: TransactionId,
        session: SessionId,
        address: BluetoothAddress,
        listener: Arc<dyn SdpListener>,
        request: SdpRequest,
        response_limit: usize,
    ) -> Self {
        Self {
            key: TransactionKey::new(id, request.kind()),
            session,
            address,
            listener,
            request,
            state: TransactionState::Created,
            continuation: ContinuationState::new(),
            response_limit,
            handles: Vec::new(),
            attribute_bytes: Vec::new(),
        }
    }

    /// Lookup key
    #[must_use]
    pub const fn key(&self) -> TransactionKey {
        self.key
    }

    /// Transaction ID
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.key.id
    }

    /// Owning session
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Remote device the request was sent to
    #[must_use]
    pub const fn address(&self) -> BluetoothAddress {
        self.address
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Listener receiving the outcome
    #[must_use]
    pub fn listener(&self) -> Arc<dyn SdpListener> {
        Arc::clone(&self.listener)
    }

    /// Request parameters carrying the current continuation state
    ///
    /// # Errors
    /// Returns [`SdpError::BufferTooSmall`] if the request does not fit the
    /// parameter buffer
    pub fn encode_request(&self) -> Result<RequestParameters, SdpError> {
        let mut buffer = [0u8; MAX_REQUEST_PARAMETERS];
        let length = self.request.encode_parameters(&self.continuation, &mut buffer)?;
        let mut parameters = RequestParameters::new();
        parameters
            .extend_from_slice(&buffer[..length])
            .map_err(|()| SdpError::BufferTooSmall)?;
        Ok(parameters)
    }

    /// Record that the initial request is on the wire
    pub fn mark_sent(&mut self) {
        if self.state == TransactionState::Created {
            self.state = TransactionState::Sent;
        }
    }

    /// Feed one response PDU addressed to this transaction
    ///
    /// # Errors
    /// Returns an error if the response is malformed, does not answer this
    /// request kind, or exceeds the negotiated limits. The caller treats
    /// that as a protocol error on the connection.
    pub fn process_response(
        &mut self,
        pdu_id: SdpPduId,
        payload: &[u8],
    ) -> Result<Progress, SdpError> {
        if self.state.is_terminal() {
            return Err(SdpError::UnexpectedResponse);
        }

        if pdu_id == SdpPduId::ErrorResponse {
            let response = ErrorResponse::decode(payload)?;
            self.state = TransactionState::Errored;
            return Ok(Progress::Done(Completion::Error {
                reason: ErrorReason::Server(response.error_code),
                info: String::from(response.error_info),
            }));
        }

        if pdu_id != self.key.kind.response_pdu() {
            return Err(SdpError::UnexpectedResponse);
        }

        let continuation = match &self.request {
            SdpRequest::ServiceSearch(request) => {
                let response = ServiceSearchResponse::decode(payload)?;
                let collected = self.handles.len() + response.service_record_handles.len();
                if collected > usize::from(request.maximum_service_record_count) {
                    return Err(SdpError::ResponseTooLarge);
                }
                self.handles.extend_from_slice(&response.service_record_handles);
                response.continuation_state
            }
            SdpRequest::ServiceAttribute(ServiceAttributeRequest {
                maximum_attribute_byte_count: limit,
                ..
            })
            | SdpRequest::ServiceSearchAttribute(ServiceSearchAttributeRequest {
                maximum_attribute_byte_count: limit,
                ..
            }) => accumulate(
                &mut self.attribute_bytes,
                self.response_limit,
                payload,
                *limit,
            )?,
        };

        if continuation.is_empty() {
            let completion = self.finish()?;
            self.state = TransactionState::Completed;
            return Ok(Progress::Done(completion));
        }

        trace!(
            "[SDP] transaction {} continues ({} byte state)",
            self.key.id,
            continuation.len()
        );
        self.continuation = continuation;
        self.mark_sent();
        self.encode_request().map(Progress::Continue)
    }

    fn finish(&mut self) -> Result<Completion, SdpError> {
        self.continuation.clear();
        let bytes = core::mem::take(&mut self.attribute_bytes);
        Ok(match self.key.kind {
            RequestKind::ServiceSearch => {
                Completion::ServiceSearch(core::mem::take(&mut self.handles))
            }
            RequestKind::ServiceAttribute => {
                let (ids, values) = parse_attribute_list(&bytes)?;
                Completion::ServiceAttribute { ids, values }
            }
            RequestKind::ServiceSearchAttribute => {
                let (ids, values) = parse_attribute_lists(&bytes)?;
                Completion::ServiceSearchAttribute { ids, values }
            }
        })
    }

    /// Move to `Cancelled`, returning the error outcome to deliver
    ///
    /// Returns `None` if the transaction already reached a terminal state.
    pub fn cancel(&mut self, reason: ErrorReason) -> Option<Completion> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = TransactionState::Cancelled;
        Some(Completion::Error {
            reason,
            info: String::new(),
        })
    }
}

/// Append one attribute response fragment, enforcing the per-response and
/// accumulated byte limits
fn accumulate(
    collected: &mut Vec<u8>,
    response_limit: usize,
    payload: &[u8],
    maximum_attribute_byte_count: u16,
) -> Result<ContinuationState, SdpError> {
    let response = ServiceAttributeResponse::decode(payload)?;
    if response.attribute_list.len() > usize::from(maximum_attribute_byte_count)
        || collected.len() + response.attribute_list.len() > response_limit
    {
        return Err(SdpError::ResponseTooLarge);
    }
    collected.extend_from_slice(response.attribute_list);
    Ok(response.continuation_state)
}

/// A transaction removed from the table together with the outcome its
/// listener still has to receive
pub struct Finished {
    /// Transaction ID
    pub id: TransactionId,
    /// Listener to notify
    pub listener: Arc<dyn SdpListener>,
    /// Outcome
    pub completion: Completion,
}

impl Finished {
    /// Invoke the listener. Call with no lock held.
    pub fn notify(&self) {
        self.completion.deliver(&*self.listener, self.id);
    }
}

/// What the receiver should do after dispatching a response
pub enum Dispatch {
    /// Send the continuation request
    Resend {
        /// Request kind
        kind: RequestKind,
        /// Parameters carrying the new continuation state
        parameters: RequestParameters,
    },
    /// Transaction ended; notify its listener
    Finished(Finished),
}

struct TableState {
    live: FnvIndexMap<TransactionKey, Transaction, MAX_PENDING_TRANSACTIONS>,
    tombstones: Deque<(TransactionKey, BluetoothAddress), TOMBSTONE_CAPACITY>,
}

impl TableState {
    fn bury(&mut self, key: TransactionKey, address: BluetoothAddress) {
        if self.tombstones.is_full() {
            self.tombstones.pop_front();
        }
        self.tombstones.push_back((key, address)).ok();
    }

    fn exhume(&mut self, key: TransactionKey) {
        let mut kept = Deque::new();
        while let Some(entry) = self.tombstones.pop_front() {
            if entry.0 != key {
                kept.push_back(entry).ok();
            }
        }
        self.tombstones = kept;
    }

    fn cancel(&mut self, key: TransactionKey, reason: ErrorReason) -> Option<Finished> {
        let mut transaction = self.live.remove(&key)?;
        self.bury(key, transaction.address);
        let completion = transaction.cancel(reason)?;
        Some(Finished {
            id: key.id,
            listener: transaction.listener,
            completion,
        })
    }
}

/// Live transactions plus recently cancelled keys
///
/// Every method takes the table lock only for its own duration; listener
/// callbacks happen after the returned [`Finished`] values leave the table.
pub struct TransactionTable {
    state: Mutex<CriticalSectionRawMutex, RefCell<TableState>>,
}

impl TransactionTable {
    /// Create an empty table
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(TableState {
                live: FnvIndexMap::new(),
                tombstones: Deque::new(),
            })),
        }
    }

    /// Register a transaction
    ///
    /// # Errors
    /// Returns [`SdpError::TooManyTransactions`] if the table is full
    pub fn insert(&self, transaction: Transaction) -> Result<(), SdpError> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let key = transaction.key;
            state.exhume(key);
            state
                .live
                .insert(key, transaction)
                .map(|_| ())
                .map_err(|_| SdpError::TooManyTransactions)
        })
    }

    /// Drop a transaction without notifying its listener or leaving a
    /// tombstone. Used when the request never made it onto the wire.
    pub fn remove(&self, key: TransactionKey) -> bool {
        self.state
            .lock(|state| state.borrow_mut().live.remove(&key).is_some())
    }

    /// Number of live transactions
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock(|state| state.borrow().live.len())
    }

    /// No live transactions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the transaction is still live
    #[must_use]
    pub fn contains(&self, key: TransactionKey) -> bool {
        self.state.lock(|state| state.borrow().live.contains_key(&key))
    }

    /// Whether any live transaction uses `id`
    #[must_use]
    pub fn contains_id(&self, id: TransactionId) -> bool {
        self.state
            .lock(|state| state.borrow().live.keys().any(|key| key.id == id))
    }

    /// Whether `key` was cancelled recently
    #[must_use]
    pub fn is_tombstone(&self, key: TransactionKey) -> bool {
        self.state.lock(|state| {
            state
                .borrow()
                .tombstones
                .iter()
                .any(|(buried, _)| *buried == key)
        })
    }

    /// Whether a transaction with `id` on `address` was cancelled recently
    #[must_use]
    pub fn is_tombstone_id(&self, id: TransactionId, address: BluetoothAddress) -> bool {
        self.state.lock(|state| {
            state
                .borrow()
                .tombstones
                .iter()
                .any(|(buried, at)| buried.id == id && *at == address)
        })
    }

    /// Update a live transaction's state after its request was sent
    pub fn mark_sent(&self, key: TransactionKey) {
        self.state.lock(|state| {
            if let Some(transaction) = state.borrow_mut().live.get_mut(&key) {
                transaction.mark_sent();
            }
        });
    }

    /// Resolve the transaction a response PDU on `address` is meant for
    ///
    /// Success responses match on ID and paired request kind; error responses
    /// carry no kind and match on ID alone.
    #[must_use]
    pub fn resolve(
        &self,
        pdu_id: SdpPduId,
        id: TransactionId,
        address: BluetoothAddress,
    ) -> Option<TransactionKey> {
        self.state.lock(|state| {
            let state = state.borrow();
            if pdu_id == SdpPduId::ErrorResponse {
                return state
                    .live
                    .iter()
                    .find(|(key, transaction)| key.id == id && transaction.address == address)
                    .map(|(key, _)| *key);
            }
            let key = TransactionKey::new(id, pdu_id.answers()?);
            state
                .live
                .get(&key)
                .filter(|transaction| transaction.address == address)
                .map(|_| key)
        })
    }

    /// Feed a response to the transaction at `key`
    ///
    /// Returns `None` if the transaction is gone. A finished transaction is
    /// removed from the table before this returns.
    ///
    /// # Errors
    /// Propagates the protocol error from
    /// [`Transaction::process_response`]; the transaction stays registered so
    /// the caller can cancel it along with the rest of the connection.
    pub fn dispatch(
        &self,
        key: TransactionKey,
        pdu_id: SdpPduId,
        payload: &[u8],
    ) -> Option<Result<Dispatch, SdpError>> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let transaction = state.live.get_mut(&key)?;
            let progress = match transaction.process_response(pdu_id, payload) {
                Ok(progress) => progress,
                Err(error) => return Some(Err(error)),
            };
            Some(Ok(match progress {
                Progress::Continue(parameters) => Dispatch::Resend {
                    kind: key.kind,
                    parameters,
                },
                Progress::Done(completion) => {
                    let transaction = state.live.remove(&key)?;
                    Dispatch::Finished(Finished {
                        id: key.id,
                        listener: transaction.listener,
                        completion,
                    })
                }
            }))
        })
    }

    /// Cancel one transaction. Returns `None` if it is not live.
    pub fn cancel(&self, key: TransactionKey, reason: ErrorReason) -> Option<Finished> {
        self.state
            .lock(|state| state.borrow_mut().cancel(key, reason))
    }

    /// Cancel one transaction only if `session` owns it
    pub fn cancel_owned(
        &self,
        key: TransactionKey,
        session: SessionId,
        reason: ErrorReason,
    ) -> Option<Finished> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.live.get(&key)?.session != session {
                return None;
            }
            state.cancel(key, reason)
        })
    }

    /// Cancel every transaction addressed to `address`
    pub fn cancel_connection(
        &self,
        address: BluetoothAddress,
        reason: ErrorReason,
    ) -> Vec<Finished> {
        self.cancel_where(reason, |transaction| transaction.address == address)
    }

    /// Cancel every live transaction
    pub fn cancel_all(&self, reason: ErrorReason) -> Vec<Finished> {
        self.cancel_where(reason, |_| true)
    }

    fn cancel_where(
        &self,
        reason: ErrorReason,
        predicate: impl Fn(&Transaction) -> bool,
    ) -> Vec<Finished> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let keys: Vec<TransactionKey> = state
                .live
                .iter()
                .filter(|(_, transaction)| predicate(transaction))
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| state.cancel(key, reason))
                .collect()
        })
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sdp::protocol::ServiceSearchRequest;
    use crate::sdp::record::Uuid;
    use alloc::{format, string::ToString};

    /// Listener recording every callback as a line of text
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        events: RefCell<Vec<String>>,
        attributes: RefCell<Vec<(AttributeId, DataElement)>>,
    }

    impl RecordingListener {
        pub(crate) fn events(&self) -> Vec<String> {
            self.events.borrow().clone()
        }

        pub(crate) fn attributes(&self) -> Vec<(AttributeId, DataElement)> {
            self.attributes.borrow().clone()
        }

        fn record(&self, event: String) {
            self.events.borrow_mut().push(event);
        }

        fn record_attributes(&self, ids: &[AttributeId], values: &[DataElement]) {
            self.attributes
                .borrow_mut()
                .extend(ids.iter().copied().zip(values.iter().cloned()));
        }
    }

    impl SdpListener for RecordingListener {
        fn on_error(&self, reason: ErrorReason, info: &str, id: TransactionId) {
            self.record(format!("error {id} {reason:?} {info:?}"));
        }

        fn on_service_search_result(&self, handles: &[ServiceRecordHandle], id: TransactionId) {
            self.record(format!("search {id} {handles:x?}"));
        }

        fn on_service_attribute_result(
            &self,
            attribute_ids: &[AttributeId],
            values: &[DataElement],
            id: TransactionId,
        ) {
            self.record_attributes(attribute_ids, values);
            self.record(format!("attributes {id} {attribute_ids:x?}"));
        }

        fn on_service_search_attribute_result(
            &self,
            attribute_ids: &[AttributeId],
            values: &[DataElement],
            id: TransactionId,
        ) {
            self.record_attributes(attribute_ids, values);
            self.record(format!("search-attributes {id} {attribute_ids:x?}"));
        }
    }

    const ADDRESS: BluetoothAddress = BluetoothAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0xAA]);

    fn search(id: TransactionId, max: u16, listener: &Arc<RecordingListener>) -> Transaction {
        let request = SdpRequest::ServiceSearch(ServiceSearchRequest {
            service_search_pattern: [Uuid::Uuid16(0x1101)].into_iter().collect(),
            maximum_service_record_count: max,
        });
        Transaction::new(id, 1, ADDRESS, listener.clone(), request, 1024)
    }

    fn attributes(id: TransactionId, listener: &Arc<RecordingListener>) -> Transaction {
        let request = SdpRequest::ServiceAttribute(ServiceAttributeRequest {
            service_record_handle: 0x0001_0001,
            maximum_attribute_byte_count: 0x40,
            attribute_id_list: [0x0100].into_iter().collect(),
        });
        Transaction::new(id, 1, ADDRESS, listener.clone(), request, 64)
    }

    #[test]
    fn test_allocator_is_sequential_from_one() {
        let ids = TransactionIdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        ids.free(1);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_allocator_wraps_past_zero() {
        let ids = TransactionIdAllocator::new();
        for expected in 1..=u32::from(TransactionId::MAX) {
            assert_eq!(u32::from(ids.next_id()), expected);
        }
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_kind_pairs_request_and_response() {
        for kind in [
            RequestKind::ServiceSearch,
            RequestKind::ServiceAttribute,
            RequestKind::ServiceSearchAttribute,
        ] {
            assert_eq!(kind.response_pdu().answers(), Some(kind));
            assert_eq!(kind.request_pdu() as u8 + 1, kind.response_pdu() as u8);
        }
    }

    #[test]
    fn test_search_completes_with_handles() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = search(5, 10, &listener);
        let payload = [0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00];

        let progress = transaction
            .process_response(SdpPduId::ServiceSearchResponse, &payload)
            .unwrap();
        assert_eq!(
            progress,
            Progress::Done(Completion::ServiceSearch(alloc::vec![0x0001_0001]))
        );
        assert_eq!(transaction.state(), TransactionState::Completed);
    }

    #[test]
    fn test_continuation_resends_with_state_then_accumulates() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = search(5, 10, &listener);
        let first = [0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xC0, 0xDE];

        let Progress::Continue(parameters) = transaction
            .process_response(SdpPduId::ServiceSearchResponse, &first)
            .unwrap()
        else {
            panic!("expected continuation");
        };
        assert_eq!(&parameters[parameters.len() - 3..], &[0x02, 0xC0, 0xDE]);
        assert_eq!(transaction.state(), TransactionState::Sent);

        let last = [0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x0B, 0x00];
        let progress = transaction
            .process_response(SdpPduId::ServiceSearchResponse, &last)
            .unwrap();
        assert_eq!(
            progress,
            Progress::Done(Completion::ServiceSearch(alloc::vec![0x0A, 0x0B]))
        );
    }

    #[test]
    fn test_too_many_handles_is_protocol_error() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = search(5, 1, &listener);
        let payload = [0x00, 0x02, 0x00, 0x02, 0, 0, 0, 1, 0, 0, 0, 2, 0x00];
        assert_eq!(
            transaction.process_response(SdpPduId::ServiceSearchResponse, &payload),
            Err(SdpError::ResponseTooLarge)
        );
    }

    #[test]
    fn test_attribute_bytes_are_bounded() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = attributes(3, &listener);
        let mut payload = alloc::vec![0x00, 0x41];
        payload.extend_from_slice(&[0x00; 0x41]);
        payload.push(0x00);
        assert_eq!(
            transaction.process_response(SdpPduId::ServiceAttributeResponse, &payload),
            Err(SdpError::ResponseTooLarge)
        );
    }

    #[test]
    fn test_attribute_list_split_over_continuations() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = attributes(3, &listener);
        // 0x0100 = "ab", split inside the text
        let list = [0x35, 0x07, 0x09, 0x01, 0x00, 0x25, 0x02, b'a', b'b'];

        let mut first = alloc::vec![0x00, 0x05];
        first.extend_from_slice(&list[..5]);
        first.extend_from_slice(&[0x01, 0x01]);
        assert!(matches!(
            transaction.process_response(SdpPduId::ServiceAttributeResponse, &first),
            Ok(Progress::Continue(_))
        ));

        let mut last = alloc::vec![0x00, 0x04];
        last.extend_from_slice(&list[5..]);
        last.push(0x00);
        let progress = transaction
            .process_response(SdpPduId::ServiceAttributeResponse, &last)
            .unwrap();
        assert_eq!(
            progress,
            Progress::Done(Completion::ServiceAttribute {
                ids: alloc::vec![0x0100],
                values: alloc::vec![DataElement::text_string("ab")],
            })
        );
    }

    #[test]
    fn test_error_response_completes_with_server_reason() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = attributes(3, &listener);
        let progress = transaction
            .process_response(SdpPduId::ErrorResponse, &[0x00, 0x02, b'n', b'o'])
            .unwrap();
        assert_eq!(
            progress,
            Progress::Done(Completion::Error {
                reason: ErrorReason::Server(0x0002),
                info: "no".to_string(),
            })
        );
        assert_eq!(transaction.state(), TransactionState::Errored);
    }

    #[test]
    fn test_wrong_response_kind_is_rejected() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = search(5, 10, &listener);
        assert_eq!(
            transaction.process_response(SdpPduId::ServiceAttributeResponse, &[0, 0, 0]),
            Err(SdpError::UnexpectedResponse)
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let listener = Arc::new(RecordingListener::default());
        let mut transaction = search(5, 10, &listener);
        assert!(transaction.cancel(ErrorReason::Terminated).is_some());
        assert!(transaction.cancel(ErrorReason::Terminated).is_none());
        assert_eq!(transaction.state(), TransactionState::Cancelled);
    }

    #[test]
    fn test_table_cancel_tombstones_and_notifies_once() {
        let listener = Arc::new(RecordingListener::default());
        let table = TransactionTable::new();
        let transaction = search(7, 10, &listener);
        let key = transaction.key();
        table.insert(transaction).unwrap();

        let finished = table.cancel(key, ErrorReason::Terminated).unwrap();
        finished.notify();
        assert!(table.cancel(key, ErrorReason::Terminated).is_none());
        assert!(!table.contains(key));
        assert!(table.is_tombstone(key));
        assert!(table.is_tombstone_id(7, ADDRESS));
        assert_eq!(listener.events(), ["error 7 Terminated \"\""]);
    }

    #[test]
    fn test_table_resolves_by_id_and_kind() {
        let listener = Arc::new(RecordingListener::default());
        let table = TransactionTable::new();
        table.insert(search(1, 10, &listener)).unwrap();
        table.insert(attributes(2, &listener)).unwrap();

        assert_eq!(
            table.resolve(SdpPduId::ServiceSearchResponse, 1, ADDRESS),
            Some(TransactionKey::new(1, RequestKind::ServiceSearch))
        );
        assert_eq!(table.resolve(SdpPduId::ServiceAttributeResponse, 1, ADDRESS), None);
        assert_eq!(
            table.resolve(SdpPduId::ErrorResponse, 2, ADDRESS),
            Some(TransactionKey::new(2, RequestKind::ServiceAttribute))
        );
        let elsewhere = BluetoothAddress::new([1; 6]);
        assert_eq!(table.resolve(SdpPduId::ServiceSearchResponse, 1, elsewhere), None);
        assert!(table.contains_id(2));
        assert!(!table.contains_id(3));
    }

    #[test]
    fn test_table_dispatch_removes_finished_transaction() {
        let listener = Arc::new(RecordingListener::default());
        let table = TransactionTable::new();
        let transaction = search(1, 10, &listener);
        let key = transaction.key();
        table.insert(transaction).unwrap();

        let payload = [0x00, 0x00, 0x00, 0x00, 0x00];
        let Some(Ok(Dispatch::Finished(finished))) =
            table.dispatch(key, SdpPduId::ServiceSearchResponse, &payload)
        else {
            panic!("expected completion");
        };
        finished.notify();
        assert!(table.is_empty());
        assert!(!table.is_tombstone(key));
        assert_eq!(listener.events(), ["search 1 []"]);
    }

    #[test]
    fn test_table_cancel_connection_only_touches_that_address() {
        let listener = Arc::new(RecordingListener::default());
        let table = TransactionTable::new();
        table.insert(search(1, 10, &listener)).unwrap();
        let other = Transaction::new(
            2,
            2,
            BluetoothAddress::new([9; 6]),
            listener.clone(),
            SdpRequest::ServiceSearchAttribute(ServiceSearchAttributeRequest {
                service_search_pattern: [Uuid::Uuid16(0x0100)].into_iter().collect(),
                maximum_attribute_byte_count: 0xFFFF,
                attribute_id_list: [0x0001].into_iter().collect(),
            }),
            1024,
        );
        table.insert(other).unwrap();

        let cancelled = table.cancel_connection(ADDRESS, ErrorReason::IoError);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, 1);
        assert_eq!(table.len(), 1);

        assert!(
            table
                .cancel_owned(
                    TransactionKey::new(2, RequestKind::ServiceSearchAttribute),
                    1,
                    ErrorReason::Terminated
                )
                .is_none()
        );
        assert_eq!(table.cancel_all(ErrorReason::Terminated).len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_reinserting_a_key_clears_its_tombstone() {
        let listener = Arc::new(RecordingListener::default());
        let table = TransactionTable::new();
        let key = TransactionKey::new(4, RequestKind::ServiceSearch);
        table.insert(search(4, 10, &listener)).unwrap();
        table.cancel(key, ErrorReason::Terminated);
        assert!(table.is_tombstone(key));

        table.insert(search(4, 10, &listener)).unwrap();
        assert!(!table.is_tombstone(key));
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let listener = Arc::new(RecordingListener::default());
        let table = TransactionTable::new();
        for id in 1..=(TOMBSTONE_CAPACITY as u16 + 2) {
            table.insert(search(id, 10, &listener)).unwrap();
            table.cancel(
                TransactionKey::new(id, RequestKind::ServiceSearch),
                ErrorReason::Terminated,
            );
        }
        assert!(!table.is_tombstone(TransactionKey::new(1, RequestKind::ServiceSearch)));
        assert!(table.is_tombstone(TransactionKey::new(
            TOMBSTONE_CAPACITY as u16 + 2,
            RequestKind::ServiceSearch
        )));
    }
}
