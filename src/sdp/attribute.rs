//! SDP Attribute Processing
//!
//! This module parses the attribute lists carried by service attribute and
//! service search attribute responses into ID/value pairs.

use super::{
    SdpError,
    record::{AttributeId, DataElement, DataElementHeader, DataElementType},
};
use alloc::vec::Vec;

/// Universal SDP Attribute IDs
///
/// These are standardized attribute IDs defined by the Bluetooth SIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum UniversalAttributeId {
    /// Service Record Handle
    ServiceRecordHandle = 0x0000,
    /// Service Class ID List
    ServiceClassIdList = 0x0001,
    /// Service Record State
    ServiceRecordState = 0x0002,
    /// Service ID
    ServiceId = 0x0003,
    /// Protocol Descriptor List
    ProtocolDescriptorList = 0x0004,
    /// Browse Group List
    BrowseGroupList = 0x0005,
    /// Language Based Attribute ID List
    LanguageBaseAttributeIdList = 0x0006,
    /// Service Info Time To Live
    ServiceInfoTimeToLive = 0x0007,
    /// Service Availability
    ServiceAvailability = 0x0008,
    /// Bluetooth Profile Descriptor List
    BluetoothProfileDescriptorList = 0x0009,
    /// Documentation URL
    DocumentationUrl = 0x000A,
    /// Client Executable URL
    ClientExecutableUrl = 0x000B,
    /// Icon URL
    IconUrl = 0x000C,
    /// Additional Protocol Descriptor Lists
    AdditionalProtocolDescriptorLists = 0x000D,
}

/// Language-Based Attribute IDs
///
/// These IDs are offsets added to the language base ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LanguageAttributeOffset {
    /// Service Name
    ServiceName = 0x0000,
    /// Service Description
    ServiceDescription = 0x0001,
    /// Provider Name
    ProviderName = 0x0002,
}

/// Standard Language Base ID for English
pub const ENGLISH_LANGUAGE_BASE_ID: u16 = 0x0100;

/// Attribute List Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntry {
    /// Attribute ID
    pub id: AttributeId,
    /// Attribute value
    pub value: DataElement,
}

impl UniversalAttributeId {
    /// Convert to u16 value
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16 value
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::ServiceRecordHandle),
            0x0001 => Some(Self::ServiceClassIdList),
            0x0002 => Some(Self::ServiceRecordState),
            0x0003 => Some(Self::ServiceId),
            0x0004 => Some(Self::ProtocolDescriptorList),
            0x0005 => Some(Self::BrowseGroupList),
            0x0006 => Some(Self::LanguageBaseAttributeIdList),
            0x0007 => Some(Self::ServiceInfoTimeToLive),
            0x0008 => Some(Self::ServiceAvailability),
            0x0009 => Some(Self::BluetoothProfileDescriptorList),
            0x000A => Some(Self::DocumentationUrl),
            0x000B => Some(Self::ClientExecutableUrl),
            0x000C => Some(Self::IconUrl),
            0x000D => Some(Self::AdditionalProtocolDescriptorLists),
            _ => None,
        }
    }
}

impl AttributeEntry {
    /// Create new attribute entry
    #[must_use]
    pub const fn new(id: AttributeId, value: DataElement) -> Self {
        Self { id, value }
    }

    /// Check if this is a universal attribute
    #[must_use]
    pub const fn is_universal(&self) -> bool {
        UniversalAttributeId::from_u16(self.id).is_some()
    }

    /// Check if this is a language-based attribute
    #[must_use]
    pub const fn is_language_based(&self) -> bool {
        self.id >= ENGLISH_LANGUAGE_BASE_ID && self.id < (ENGLISH_LANGUAGE_BASE_ID + 0x100)
    }
}

/// Attribute List Parser
///
/// Walks the body of one attribute list (the bytes inside its data element
/// sequence), yielding `(attribute ID, value)` pairs in wire order.
#[derive(Debug)]
pub struct AttributeListParser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> AttributeListParser<'a> {
    /// Create a parser over an attribute list body
    #[must_use]
    pub const fn new(body: &'a [u8]) -> Self {
        Self {
            data: body,
            position: 0,
        }
    }

    /// Parse next attribute from data
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidData`] if the ID is not a 16-bit unsigned
    /// integer element or the value is malformed
    pub fn parse_next(&mut self) -> Result<Option<AttributeEntry>, SdpError> {
        let rest = &self.data[self.position..];
        if rest.is_empty() {
            return Ok(None);
        }

        let (id, used) = DataElement::decode(rest)?;
        let DataElement::UnsignedInt16(id) = id else {
            return Err(SdpError::InvalidData);
        };
        self.position += used;

        let (value, used) = DataElement::decode(&self.data[self.position..])?;
        self.position += used;

        Ok(Some(AttributeEntry::new(id, value)))
    }

    /// Get current position
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Check if parsing is complete
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.position >= self.data.len()
    }
}

/// Split a data element sequence at the start of `data` into its body and
/// total encoded length
fn sequence_body(data: &[u8]) -> Result<(&[u8], usize), SdpError> {
    let header = DataElementHeader::decode(data)?;
    if header.data_type != DataElementType::Sequence {
        return Err(SdpError::InvalidData);
    }
    let total = header.total_length();
    let body = data
        .get(header.header_length..total)
        .ok_or(SdpError::InvalidData)?;
    Ok((body, total))
}

fn collect_entries(
    body: &[u8],
    ids: &mut Vec<AttributeId>,
    values: &mut Vec<DataElement>,
) -> Result<(), SdpError> {
    let mut parser = AttributeListParser::new(body);
    while let Some(entry) = parser.parse_next()? {
        ids.push(entry.id);
        values.push(entry.value);
    }
    Ok(())
}

/// Parse a complete `AttributeList` (service attribute response)
///
/// # Errors
/// Returns [`SdpError::InvalidData`] if `data` is not exactly one well-formed
/// attribute list
pub fn parse_attribute_list(
    data: &[u8],
) -> Result<(Vec<AttributeId>, Vec<DataElement>), SdpError> {
    let (body, total) = sequence_body(data)?;
    if total != data.len() {
        return Err(SdpError::InvalidData);
    }
    let mut ids = Vec::new();
    let mut values = Vec::new();
    collect_entries(body, &mut ids, &mut values)?;
    Ok((ids, values))
}

/// Parse `AttributeLists` (service search attribute response), flattening
/// the per-record lists in record order
///
/// # Errors
/// Returns [`SdpError::InvalidData`] if any list is malformed
pub fn parse_attribute_lists(
    data: &[u8],
) -> Result<(Vec<AttributeId>, Vec<DataElement>), SdpError> {
    let (mut records, total) = sequence_body(data)?;
    if total != data.len() {
        return Err(SdpError::InvalidData);
    }
    let mut ids = Vec::new();
    let mut values = Vec::new();
    while !records.is_empty() {
        let (body, used) = sequence_body(records)?;
        collect_entries(body, &mut ids, &mut values)?;
        records = &records[used..];
    }
    Ok((ids, values))
}

/// Create language-based attribute ID
#[must_use]
pub const fn language_attribute_id(base_id: u16, offset: LanguageAttributeOffset) -> u16 {
    base_id + offset as u16
}

/// Get English service name attribute ID
#[must_use]
pub const fn english_service_name_id() -> u16 {
    language_attribute_id(
        ENGLISH_LANGUAGE_BASE_ID,
        LanguageAttributeOffset::ServiceName,
    )
}

/// Get English service description attribute ID
#[must_use]
pub const fn english_service_description_id() -> u16 {
    language_attribute_id(
        ENGLISH_LANGUAGE_BASE_ID,
        LanguageAttributeOffset::ServiceDescription,
    )
}

/// Get English provider name attribute ID
#[must_use]
pub const fn english_provider_name_id() -> u16 {
    language_attribute_id(
        ENGLISH_LANGUAGE_BASE_ID,
        LanguageAttributeOffset::ProviderName,
    )
}
