//! Service Discovery Protocol (SDP) Client
//!
//! This module implements the client side of the Bluetooth Service Discovery
//! Protocol: request encoding, the transaction state machine with continuation
//! handling, a shared connection pool and the background receiver that routes
//! response PDUs back to their transactions.
//!
//! The entry point is [`SdpStack`]; callers open an [`SdpSession`] per remote
//! device and receive results through an [`SdpListener`].

use crate::{
    constants::{DEFAULT_MAX_RESPONSE_BYTES, MAX_ATTRIBUTE_IDS, MAX_SEARCH_UUIDS},
    l2cap::{ProtocolServiceMultiplexer, TransportError, psm},
};

/// SDP Protocol Service Multiplexer (PSM) for L2CAP
pub const SDP_PSM: ProtocolServiceMultiplexer = psm::SDP;

/// Service record handle type
pub type ServiceRecordHandle = u32;

/// Transaction ID for SDP requests/responses
pub type TransactionId = u16;

pub mod attribute;
pub mod client;
pub mod connection;
pub mod protocol;
pub mod receiver;
pub mod record;
pub mod stack;
pub mod transaction;

// Re-export commonly used types
pub use attribute::{AttributeEntry, AttributeListParser, UniversalAttributeId};
pub use client::SdpSession;
pub use connection::{Connection, ConnectionPool};
pub use receiver::SdpReceiver;
pub use record::{AttributeId, DataElement, ServiceClassId, Uuid};
pub use stack::SdpStack;
pub use transaction::{RequestKind, TransactionIdAllocator, TransactionKey, TransactionState};

/// SDP Protocol Data Unit IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SdpPduId {
    /// Reserved PDU ID
    Reserved = 0x00,
    /// Error Response
    ErrorResponse = 0x01,
    /// Service Search Request
    ServiceSearchRequest = 0x02,
    /// Service Search Response
    ServiceSearchResponse = 0x03,
    /// Service Attribute Request
    ServiceAttributeRequest = 0x04,
    /// Service Attribute Response
    ServiceAttributeResponse = 0x05,
    /// Service Search Attribute Request
    ServiceSearchAttributeRequest = 0x06,
    /// Service Search Attribute Response
    ServiceSearchAttributeResponse = 0x07,
}

impl SdpPduId {
    /// Decode a PDU ID byte; unknown values map to `None`
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Reserved),
            0x01 => Some(Self::ErrorResponse),
            0x02 => Some(Self::ServiceSearchRequest),
            0x03 => Some(Self::ServiceSearchResponse),
            0x04 => Some(Self::ServiceAttributeRequest),
            0x05 => Some(Self::ServiceAttributeResponse),
            0x06 => Some(Self::ServiceSearchAttributeRequest),
            0x07 => Some(Self::ServiceSearchAttributeResponse),
            _ => None,
        }
    }

    /// Request kind a success response answers, `None` for requests and errors
    #[must_use]
    pub const fn answers(self) -> Option<RequestKind> {
        match self {
            Self::ServiceSearchResponse => Some(RequestKind::ServiceSearch),
            Self::ServiceAttributeResponse => Some(RequestKind::ServiceAttribute),
            Self::ServiceSearchAttributeResponse => Some(RequestKind::ServiceSearchAttribute),
            _ => None,
        }
    }
}

/// SDP Error Codes reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum SdpErrorCode {
    /// Invalid/unsupported SDP version
    InvalidVersion = 0x0001,
    /// Invalid Service Record Handle
    InvalidServiceRecordHandle = 0x0002,
    /// Invalid request syntax
    InvalidRequestSyntax = 0x0003,
    /// Invalid PDU size
    InvalidPduSize = 0x0004,
    /// Invalid continuation state
    InvalidContinuationState = 0x0005,
    /// Insufficient resources to satisfy request
    InsufficientResources = 0x0006,
}

impl SdpErrorCode {
    /// Map a raw error code, `None` for reserved values
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::InvalidVersion),
            0x0002 => Some(Self::InvalidServiceRecordHandle),
            0x0003 => Some(Self::InvalidRequestSyntax),
            0x0004 => Some(Self::InvalidPduSize),
            0x0005 => Some(Self::InvalidContinuationState),
            0x0006 => Some(Self::InsufficientResources),
            _ => None,
        }
    }
}

/// SDP Error Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdpError {
    /// Buffer too small for operation
    BufferTooSmall,
    /// Malformed PDU or data element
    InvalidData,
    /// Caller supplied an unusable argument
    InvalidParameter,
    /// Response exceeds the configured record/byte limits
    ResponseTooLarge,
    /// Continuation state longer than 16 bytes
    InvalidContinuationState,
    /// Response PDU does not answer the addressed request
    UnexpectedResponse,
    /// Transaction table is full
    TooManyTransactions,
    /// Connection pool or reader slots are exhausted
    TooManyConnections,
    /// Session was closed
    SessionClosed,
    /// L2CAP transport failure
    Transport(TransportError),
}

impl From<TransportError> for SdpError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

impl core::fmt::Display for SdpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::InvalidData => write!(f, "malformed SDP data"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::ResponseTooLarge => write!(f, "response exceeds configured limits"),
            Self::InvalidContinuationState => write!(f, "invalid continuation state"),
            Self::UnexpectedResponse => write!(f, "unexpected response PDU"),
            Self::TooManyTransactions => write!(f, "too many pending transactions"),
            Self::TooManyConnections => write!(f, "too many connections"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Transport(error) => write!(f, "{error}"),
        }
    }
}

/// Why a transaction ended without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorReason {
    /// Error response from the server carrying the raw error code
    Server(u16),
    /// The connection failed or the server sent a malformed PDU
    IoError,
    /// Cancelled locally (explicit cancel, session close, shutdown)
    Terminated,
}

impl ErrorReason {
    /// Decoded server error code, if this is a known server error
    #[must_use]
    pub const fn server_code(self) -> Option<SdpErrorCode> {
        match self {
            Self::Server(code) => SdpErrorCode::from_u16(code),
            Self::IoError | Self::Terminated => None,
        }
    }
}

/// Receives the outcome of SDP transactions
///
/// Callbacks run on the task driving [`SdpStack::run`] (or on the caller's
/// task for local cancellation) and never while an internal lock is held, so
/// a listener may start new requests. Exactly one callback is delivered per
/// transaction.
pub trait SdpListener {
    /// The transaction failed or was cancelled
    fn on_error(&self, reason: ErrorReason, info: &str, id: TransactionId);

    /// Record handles matching a service search
    fn on_service_search_result(&self, handles: &[ServiceRecordHandle], id: TransactionId);

    /// Attributes of a single record, IDs and values pairwise
    fn on_service_attribute_result(
        &self,
        attribute_ids: &[AttributeId],
        values: &[DataElement],
        id: TransactionId,
    );

    /// Attributes of every matching record, flattened in record order
    fn on_service_search_attribute_result(
        &self,
        attribute_ids: &[AttributeId],
        values: &[DataElement],
        id: TransactionId,
    );
}

/// SDP client configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdpClientOptions {
    /// PSM the SDP server listens on
    pub psm: ProtocolServiceMultiplexer,
    /// `MaximumServiceRecordCount` sent with service search requests
    pub max_service_record_count: u16,
    /// `MaximumAttributeByteCount` sent with attribute requests
    pub max_attribute_byte_count: u16,
    /// Upper bound on bytes accumulated over all continuation rounds
    pub max_response_bytes: usize,
    /// Maximum UUIDs per search pattern (capped by [`MAX_SEARCH_UUIDS`])
    pub max_search_uuids: usize,
    /// Maximum attribute IDs per request (capped by [`MAX_ATTRIBUTE_IDS`])
    pub max_attribute_ids: usize,
}

impl Default for SdpClientOptions {
    fn default() -> Self {
        Self {
            psm: SDP_PSM,
            max_service_record_count: 0xFFFF,
            max_attribute_byte_count: 0xFFFF,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_search_uuids: MAX_SEARCH_UUIDS,
            max_attribute_ids: MAX_ATTRIBUTE_IDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_id_decoding() {
        assert_eq!(SdpPduId::from_u8(0x07), Some(SdpPduId::ServiceSearchAttributeResponse));
        assert_eq!(SdpPduId::from_u8(0x42), None);
    }

    #[test]
    fn test_response_pairs_with_request_kind() {
        assert_eq!(
            SdpPduId::ServiceSearchResponse.answers(),
            Some(RequestKind::ServiceSearch)
        );
        assert_eq!(
            SdpPduId::ServiceAttributeResponse.answers(),
            Some(RequestKind::ServiceAttribute)
        );
        assert_eq!(
            SdpPduId::ServiceSearchAttributeResponse.answers(),
            Some(RequestKind::ServiceSearchAttribute)
        );
        assert_eq!(SdpPduId::ErrorResponse.answers(), None);
        assert_eq!(SdpPduId::ServiceSearchRequest.answers(), None);
    }

    #[test]
    fn test_server_error_codes() {
        assert_eq!(
            ErrorReason::Server(0x0002).server_code(),
            Some(SdpErrorCode::InvalidServiceRecordHandle)
        );
        assert_eq!(ErrorReason::Server(0x0100).server_code(), None);
        assert_eq!(ErrorReason::Terminated.server_code(), None);
    }

    #[test]
    fn test_default_options() {
        let options = SdpClientOptions::default();
        assert_eq!(options.psm, 0x0001);
        assert_eq!(options.max_search_uuids, 12);
        assert_eq!(options.max_attribute_ids, MAX_ATTRIBUTE_IDS);
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: SdpError = TransportError::Disconnected.into();
        assert_eq!(error, SdpError::Transport(TransportError::Disconnected));
    }
}
