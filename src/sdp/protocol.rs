//! SDP Protocol Implementation
//!
//! This module implements the SDP PDU formats used by the client: the common
//! header, request parameter encoding and response parameter decoding
//! (Core Vol 3 Part B §4).

use super::{
    SdpError, SdpPduId, ServiceRecordHandle, TransactionId,
    record::{AttributeId, DataElement, Uuid},
    transaction::RequestKind,
};
use crate::constants::{
    MAX_ATTRIBUTE_IDS, MAX_CONTINUATION_STATE, MAX_SEARCH_UUIDS, PDU_HEADER_LENGTH,
};
use alloc::vec::Vec;

/// Continuation state returned by a partial response
pub type ContinuationState = heapless::Vec<u8, MAX_CONTINUATION_STATE>;

/// SDP PDU Header
///
/// All SDP messages start with this 5-byte header containing the PDU ID,
/// transaction ID, and parameter length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdpPduHeader {
    /// PDU identifier
    pub pdu_id: SdpPduId,
    /// Transaction identifier
    pub transaction_id: TransactionId,
    /// Length of parameters following the header
    pub parameter_length: u16,
}

impl SdpPduHeader {
    /// Create new PDU header
    #[must_use]
    pub const fn new(
        pdu_id: SdpPduId,
        transaction_id: TransactionId,
        parameter_length: u16,
    ) -> Self {
        Self {
            pdu_id,
            transaction_id,
            parameter_length,
        }
    }

    /// Encode header to bytes
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> [u8; PDU_HEADER_LENGTH] {
        [
            self.pdu_id as u8,
            (self.transaction_id >> 8) as u8,
            self.transaction_id as u8,
            (self.parameter_length >> 8) as u8,
            self.parameter_length as u8,
        ]
    }

    /// Decode header from bytes
    ///
    /// # Errors
    /// Returns error if buffer is too small or the PDU ID is unknown
    pub fn decode(data: &[u8]) -> Result<Self, SdpError> {
        if data.len() < PDU_HEADER_LENGTH {
            return Err(SdpError::BufferTooSmall);
        }

        let pdu_id = SdpPduId::from_u8(data[0]).ok_or(SdpError::InvalidData)?;
        let transaction_id = (u16::from(data[1]) << 8) | u16::from(data[2]);
        let parameter_length = (u16::from(data[3]) << 8) | u16::from(data[4]);

        Ok(Self {
            pdu_id,
            transaction_id,
            parameter_length,
        })
    }
}

/// Service Search Request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSearchRequest {
    /// Service search pattern (list of UUIDs)
    pub service_search_pattern: heapless::Vec<Uuid, MAX_SEARCH_UUIDS>,
    /// Maximum number of service record handles to return
    pub maximum_service_record_count: u16,
}

/// Service Attribute Request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttributeRequest {
    /// Service record handle
    pub service_record_handle: ServiceRecordHandle,
    /// Maximum number of bytes to return in response
    pub maximum_attribute_byte_count: u16,
    /// Attribute ID list
    pub attribute_id_list: heapless::Vec<AttributeId, MAX_ATTRIBUTE_IDS>,
}

/// Service Search Attribute Request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSearchAttributeRequest {
    /// Service search pattern (list of UUIDs)
    pub service_search_pattern: heapless::Vec<Uuid, MAX_SEARCH_UUIDS>,
    /// Maximum number of bytes to return
    pub maximum_attribute_byte_count: u16,
    /// Attribute ID list
    pub attribute_id_list: heapless::Vec<AttributeId, MAX_ATTRIBUTE_IDS>,
}

/// One of the three client requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpRequest {
    /// Service Search Request
    ServiceSearch(ServiceSearchRequest),
    /// Service Attribute Request
    ServiceAttribute(ServiceAttributeRequest),
    /// Service Search Attribute Request
    ServiceSearchAttribute(ServiceSearchAttributeRequest),
}

impl SdpRequest {
    /// Request kind
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::ServiceSearch(_) => RequestKind::ServiceSearch,
            Self::ServiceAttribute(_) => RequestKind::ServiceAttribute,
            Self::ServiceSearchAttribute(_) => RequestKind::ServiceSearchAttribute,
        }
    }

    /// Encode the parameters, followed by `continuation` as the trailing
    /// continuation state, into the start of `buffer`
    ///
    /// # Errors
    /// Returns [`SdpError::BufferTooSmall`] if `buffer` is too short and
    /// [`SdpError::InvalidContinuationState`] if `continuation` is longer than
    /// 16 bytes
    pub fn encode_parameters(
        &self,
        continuation: &[u8],
        buffer: &mut [u8],
    ) -> Result<usize, SdpError> {
        let mut writer = ParameterWriter::new(buffer);
        match self {
            Self::ServiceSearch(request) => {
                writer.element(&DataElement::uuid_sequence(&request.service_search_pattern))?;
                writer.put(&request.maximum_service_record_count.to_be_bytes())?;
            }
            Self::ServiceAttribute(request) => {
                writer.put(&request.service_record_handle.to_be_bytes())?;
                writer.put(&request.maximum_attribute_byte_count.to_be_bytes())?;
                writer.element(&DataElement::u16_sequence(&request.attribute_id_list))?;
            }
            Self::ServiceSearchAttribute(request) => {
                writer.element(&DataElement::uuid_sequence(&request.service_search_pattern))?;
                writer.put(&request.maximum_attribute_byte_count.to_be_bytes())?;
                writer.element(&DataElement::u16_sequence(&request.attribute_id_list))?;
            }
        }

        if continuation.len() > MAX_CONTINUATION_STATE {
            return Err(SdpError::InvalidContinuationState);
        }
        let length = u8::try_from(continuation.len())
            .map_err(|_| SdpError::InvalidContinuationState)?;
        writer.put(&[length])?;
        writer.put(continuation)?;
        Ok(writer.position)
    }
}

struct ParameterWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> ParameterWriter<'a> {
    fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), SdpError> {
        let target = self
            .buffer
            .get_mut(self.position..self.position + bytes.len())
            .ok_or(SdpError::BufferTooSmall)?;
        target.copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    fn element(&mut self, element: &DataElement) -> Result<(), SdpError> {
        let written = element.encode(&mut self.buffer[self.position..])?;
        self.position += written;
        Ok(())
    }
}

/// Cursor over response parameters
struct ParameterReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ParameterReader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], SdpError> {
        let bytes = self
            .data
            .get(self.position..self.position + count)
            .ok_or(SdpError::InvalidData)?;
        self.position += count;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, SdpError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, SdpError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Trailing continuation state; must end the parameters exactly
    fn continuation_state(&mut self) -> Result<ContinuationState, SdpError> {
        let length = usize::from(self.take(1)?[0]);
        if length > MAX_CONTINUATION_STATE {
            return Err(SdpError::InvalidContinuationState);
        }
        let bytes = self.take(length)?;
        if self.position != self.data.len() {
            return Err(SdpError::InvalidData);
        }
        let mut state = ContinuationState::new();
        state
            .extend_from_slice(bytes)
            .map_err(|()| SdpError::InvalidContinuationState)?;
        Ok(state)
    }
}

/// Service Search Response parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSearchResponse {
    /// Total number of matching service records
    pub total_service_record_count: u16,
    /// Service record handles in this response
    pub service_record_handles: Vec<ServiceRecordHandle>,
    /// Continuation state
    pub continuation_state: ContinuationState,
}

impl ServiceSearchResponse {
    /// Decode response parameters
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidData`] if the counts are inconsistent or the
    /// parameters are truncated or overlong
    pub fn decode(data: &[u8]) -> Result<Self, SdpError> {
        let mut reader = ParameterReader::new(data);
        let total_service_record_count = reader.u16()?;
        let current = reader.u16()?;
        if current > total_service_record_count {
            return Err(SdpError::InvalidData);
        }

        let available = (data.len().saturating_sub(reader.position)) / 4;
        if usize::from(current) > available {
            return Err(SdpError::InvalidData);
        }
        let mut service_record_handles = Vec::with_capacity(usize::from(current));
        for _ in 0..current {
            service_record_handles.push(reader.u32()?);
        }

        Ok(Self {
            total_service_record_count,
            service_record_handles,
            continuation_state: reader.continuation_state()?,
        })
    }
}

/// Service Attribute Response parameters
///
/// Also used for the service search attribute response, which shares the
/// layout (byte count, attribute list bytes, continuation state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttributeResponse<'a> {
    /// Attribute list fragment carried by this response
    pub attribute_list: &'a [u8],
    /// Continuation state
    pub continuation_state: ContinuationState,
}

impl<'a> ServiceAttributeResponse<'a> {
    /// Decode response parameters
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidData`] if the byte count does not match the
    /// parameters
    pub fn decode(data: &'a [u8]) -> Result<Self, SdpError> {
        let mut reader = ParameterReader::new(data);
        let count = reader.u16()?;
        let attribute_list = reader.take(usize::from(count))?;
        Ok(Self {
            attribute_list,
            continuation_state: reader.continuation_state()?,
        })
    }
}

/// Error Response parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse<'a> {
    /// Raw error code
    pub error_code: u16,
    /// Diagnostic text following the code, empty if absent
    pub error_info: &'a str,
}

impl<'a> ErrorResponse<'a> {
    /// Decode response parameters
    ///
    /// Info bytes that are not valid UTF-8 are cut at the first bad sequence.
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidData`] if the error code is missing
    pub fn decode(data: &'a [u8]) -> Result<Self, SdpError> {
        let mut reader = ParameterReader::new(data);
        let error_code = reader.u16()?;
        let info = &data[reader.position..];
        let error_info = match core::str::from_utf8(info) {
            Ok(text) => text,
            Err(error) => core::str::from_utf8(&info[..error.valid_up_to()]).unwrap_or_default(),
        };
        Ok(Self {
            error_code,
            error_info,
        })
    }
}
