//! `sdpclient` Constants
//!
//! Compile-time limits and Bluetooth-specific defaults used throughout the
//! crate. Runtime-tunable bounds live in [`crate::SdpClientOptions`].

/// Maximum number of simultaneously pooled L2CAP connections (one per remote address)
pub const MAX_CONNECTIONS: usize = 4;

/// Maximum number of transactions in flight across all sessions
pub const MAX_PENDING_TRANSACTIONS: usize = 16;

/// Maximum number of transactions a single session may hold
pub const MAX_SESSION_TRANSACTIONS: usize = 8;

/// Number of recently cancelled transaction keys remembered by the receiver
pub const TOMBSTONE_CAPACITY: usize = 8;

/// Maximum number of UUIDs in a service search pattern
pub const MAX_SEARCH_UUIDS: usize = 12;

/// Maximum number of attribute IDs in a single request
pub const MAX_ATTRIBUTE_IDS: usize = 16;

/// Maximum length of the continuation state carried between partial responses
pub const MAX_CONTINUATION_STATE: usize = 16;

/// Size of the encoded request parameter buffer
pub const MAX_REQUEST_PARAMETERS: usize = 320;

/// Size of an SDP PDU header (PDU ID, transaction ID, parameter length)
pub const PDU_HEADER_LENGTH: usize = 5;

/// L2CAP minimum / default MTU used when a channel reports zero
pub const DEFAULT_L2CAP_MTU: u16 = 672;

/// Default upper bound on accumulated response bytes across continuations
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 16 * 1024;
