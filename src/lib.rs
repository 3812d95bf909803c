#![no_std]
//! Bluetooth Service Discovery Protocol (SDP) client engine
//!
//! Issues SDP requests to remote devices over L2CAP and delivers the results
//! asynchronously:
//!
//! - service search: UUID pattern to service record handles
//! - service attribute: record handle and attribute IDs to attribute values
//! - service search attribute: both in one transaction
//!
//! Continuation is handled transparently. Sessions to the same device share a
//! single pooled L2CAP channel, and one background reader per channel routes
//! response PDUs back to their transactions by transaction ID.
//!
//! The L2CAP transport itself is supplied by the integrator through the
//! [`L2capConnector`] and [`L2capChannel`] traits.
//!
//! # Example
//!
//! ```rust,ignore
//! use sdpclient::{SdpClientOptions, SdpStack, ServiceClassId};
//!
//! let stack = SdpStack::new(connector, SdpClientOptions::default());
//! // keep `stack.run()` polled, e.g. in its own task
//! let session = stack.open("00:11:22:33:44:AA".try_into()?).await?;
//! session
//!     .service_search_attribute(&[0x0000, 0x0100], &[ServiceClassId::SerialPort.into()], listener)
//!     .await?;
//! ```
#![warn(missing_docs)]

extern crate alloc;

mod fmt;

mod address;
pub mod constants;
pub mod l2cap;
pub mod sdp;

pub use address::BluetoothAddress;
pub use l2cap::{
    L2capChannel, L2capConnector, ProtocolServiceMultiplexer, TransportError,
};
pub use sdp::{
    AttributeId, DataElement, ErrorReason, SdpClientOptions, SdpError, SdpErrorCode, SdpListener,
    SdpSession, SdpStack, ServiceClassId, ServiceRecordHandle, TransactionId, Uuid,
};
