//! SDP Data Elements
//!
//! Self-describing type/size/value encoding used by SDP for search patterns,
//! attribute ID lists and attribute values (Core Vol 3 Part B §3).

use super::SdpError;
use alloc::{boxed::Box, vec::Vec};

/// Attribute ID type
pub type AttributeId = u16;

/// Deepest sequence nesting accepted when decoding
pub const MAX_NESTING_DEPTH: usize = 16;

/// Bluetooth Base UUID `00000000-0000-1000-8000-00805F9B34FB`
pub const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Standard Bluetooth Service Classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ServiceClassId {
    /// SDP Server Service
    ServiceDiscoveryServer = 0x1000,
    /// Browse Group Descriptor
    BrowseGroupDescriptor = 0x1001,
    /// Public Browse Root
    PublicBrowseRoot = 0x1002,
    /// Serial Port Profile
    SerialPort = 0x1101,
    /// LAN Access Using PPP
    LanAccessPpp = 0x1102,
    /// Dialup Networking
    DialupNetworking = 0x1103,
    /// Object Push Profile
    ObjectPush = 0x1105,
    /// File Transfer Profile
    FileTransfer = 0x1106,
    /// Headset Profile
    Headset = 0x1108,
    /// Audio Source
    AudioSource = 0x110A,
    /// Audio Sink
    AudioSink = 0x110B,
    /// A/V Remote Control Target
    AvRemoteControlTarget = 0x110C,
    /// Advanced Audio Distribution Profile
    AdvancedAudioDistribution = 0x110D,
    /// A/V Remote Control
    AvRemoteControl = 0x110E,
    /// Hands-Free Profile
    HandsFree = 0x111E,
    /// Hands-Free Audio Gateway
    HandsFreeAudioGateway = 0x111F,
    /// Human Interface Device
    HumanInterfaceDevice = 0x1124,
}

impl ServiceClassId {
    /// Short-form UUID of this class
    #[must_use]
    pub const fn to_uuid(self) -> Uuid {
        Uuid::Uuid16(self as u16)
    }

    /// Get service name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ServiceDiscoveryServer => "Service Discovery Server",
            Self::BrowseGroupDescriptor => "Browse Group Descriptor",
            Self::PublicBrowseRoot => "Public Browse Root",
            Self::SerialPort => "Serial Port",
            Self::LanAccessPpp => "LAN Access Using PPP",
            Self::DialupNetworking => "Dialup Networking",
            Self::ObjectPush => "Object Push",
            Self::FileTransfer => "File Transfer",
            Self::Headset => "Headset",
            Self::AudioSource => "Audio Source",
            Self::AudioSink => "Audio Sink",
            Self::AvRemoteControlTarget => "A/V Remote Control Target",
            Self::AdvancedAudioDistribution => "Advanced Audio Distribution",
            Self::AvRemoteControl => "A/V Remote Control",
            Self::HandsFree => "Hands-Free",
            Self::HandsFreeAudioGateway => "Hands-Free Audio Gateway",
            Self::HumanInterfaceDevice => "Human Interface Device",
        }
    }
}

/// Bluetooth UUID in any of its three wire sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Uuid {
    /// 16-bit alias of the Base UUID
    Uuid16(u16),
    /// 32-bit alias of the Base UUID
    Uuid32(u32),
    /// Full 128-bit UUID
    Uuid128(u128),
}

impl Uuid {
    /// Expand to the full 128-bit form
    ///
    /// Short forms occupy the top 32 bits of the Base UUID, so `0x1101`
    /// and `0x00001101-0000-1000-8000-00805F9B34FB` compare equal here.
    #[must_use]
    pub const fn to_u128(self) -> u128 {
        match self {
            Self::Uuid16(value) => BASE_UUID | ((value as u128) << 96),
            Self::Uuid32(value) => BASE_UUID | ((value as u128) << 96),
            Self::Uuid128(value) => value,
        }
    }

    /// Same UUID regardless of the encoded size
    #[must_use]
    pub const fn matches(self, other: Self) -> bool {
        self.to_u128() == other.to_u128()
    }
}

impl From<u16> for Uuid {
    fn from(value: u16) -> Self {
        Self::Uuid16(value)
    }
}

impl From<u32> for Uuid {
    fn from(value: u32) -> Self {
        Self::Uuid32(value)
    }
}

impl From<u128> for Uuid {
    fn from(value: u128) -> Self {
        Self::Uuid128(value)
    }
}

impl From<ServiceClassId> for Uuid {
    fn from(class: ServiceClassId) -> Self {
        class.to_uuid()
    }
}

/// Data element type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DataElementType {
    /// Nil (null value)
    Nil = 0,
    /// Unsigned integer
    UnsignedInt = 1,
    /// Signed integer
    SignedInt = 2,
    /// UUID
    Uuid = 3,
    /// Text string
    TextString = 4,
    /// Boolean
    Boolean = 5,
    /// Data element sequence
    Sequence = 6,
    /// Data element alternative
    Alternative = 7,
    /// URL
    Url = 8,
}

impl DataElementType {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Nil),
            1 => Some(Self::UnsignedInt),
            2 => Some(Self::SignedInt),
            3 => Some(Self::Uuid),
            4 => Some(Self::TextString),
            5 => Some(Self::Boolean),
            6 => Some(Self::Sequence),
            7 => Some(Self::Alternative),
            8 => Some(Self::Url),
            _ => None,
        }
    }
}

/// Data element size descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DataElementSize {
    /// 1 byte
    Size1 = 0,
    /// 2 bytes
    Size2 = 1,
    /// 4 bytes
    Size4 = 2,
    /// 8 bytes
    Size8 = 3,
    /// 16 bytes
    Size16 = 4,
    /// Additional 8-bit size descriptor follows
    AdditionalU8 = 5,
    /// Additional 16-bit size descriptor follows
    AdditionalU16 = 6,
    /// Additional 32-bit size descriptor follows
    AdditionalU32 = 7,
}

/// Decoded type descriptor plus length prefix of one data element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataElementHeader {
    /// Element type
    pub data_type: DataElementType,
    /// Size index from the descriptor byte
    pub size_index: u8,
    /// Bytes taken by the descriptor and any length prefix
    pub header_length: usize,
    /// Bytes of value following the header
    pub body_length: usize,
}

impl DataElementHeader {
    /// Parse the header at the start of `data`
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidData`] for unknown types, size indexes that
    /// are invalid for the type, or a truncated length prefix
    pub fn decode(data: &[u8]) -> Result<Self, SdpError> {
        let descriptor = *data.first().ok_or(SdpError::InvalidData)?;
        let data_type = DataElementType::from_u8(descriptor >> 3).ok_or(SdpError::InvalidData)?;
        let size_index = descriptor & 0x07;

        let (header_length, body_length) = match size_index {
            0..=4 => (1, 1usize << size_index),
            5 => (2, usize::from(*data.get(1).ok_or(SdpError::InvalidData)?)),
            6 => (3, usize::from(read_u16(data, 1)?)),
            _ => (5, read_u32(data, 1)? as usize),
        };

        let valid = match data_type {
            DataElementType::Nil => size_index == 0,
            DataElementType::UnsignedInt | DataElementType::SignedInt => size_index <= 4,
            DataElementType::Uuid => matches!(size_index, 1 | 2 | 4),
            DataElementType::Boolean => size_index == 0,
            DataElementType::TextString
            | DataElementType::Sequence
            | DataElementType::Alternative
            | DataElementType::Url => size_index >= 5,
        };
        if !valid {
            return Err(SdpError::InvalidData);
        }

        Ok(Self {
            data_type,
            size_index,
            header_length,
            // Nil carries no value despite size index 0
            body_length: if data_type == DataElementType::Nil {
                0
            } else {
                body_length
            },
        })
    }

    /// Header plus body
    #[must_use]
    pub const fn total_length(&self) -> usize {
        self.header_length + self.body_length
    }
}

/// SDP Data Element
///
/// Represents a data element in an SDP service record attribute.
/// Data elements are the basic building blocks of SDP information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
    /// Nil (null value)
    Nil,
    /// Unsigned 8-bit integer
    UnsignedInt8(u8),
    /// Unsigned 16-bit integer
    UnsignedInt16(u16),
    /// Unsigned 32-bit integer
    UnsignedInt32(u32),
    /// Unsigned 64-bit integer
    UnsignedInt64(u64),
    /// Unsigned 128-bit integer
    UnsignedInt128(u128),
    /// Signed 8-bit integer
    SignedInt8(i8),
    /// Signed 16-bit integer
    SignedInt16(i16),
    /// Signed 32-bit integer
    SignedInt32(i32),
    /// Signed 64-bit integer
    SignedInt64(i64),
    /// Signed 128-bit integer
    SignedInt128(i128),
    /// UUID of any size
    Uuid(Uuid),
    /// Text string, raw bytes as sent (normally UTF-8)
    TextString(Vec<u8>),
    /// Boolean value
    Boolean(bool),
    /// Data element sequence
    Sequence(Vec<DataElement>),
    /// Data element alternative
    Alternative(Vec<DataElement>),
    /// URL string
    Url(Vec<u8>),
}

impl DataElement {
    /// Create a new text string data element
    #[must_use]
    pub fn text_string(text: &str) -> Self {
        Self::TextString(text.as_bytes().to_vec())
    }

    /// Sequence of 16-bit unsigned integers, as used for attribute ID lists
    #[must_use]
    pub fn u16_sequence(values: &[u16]) -> Self {
        Self::Sequence(values.iter().copied().map(Self::UnsignedInt16).collect())
    }

    /// Sequence of UUIDs, as used for service search patterns
    #[must_use]
    pub fn uuid_sequence(uuids: &[Uuid]) -> Self {
        Self::Sequence(uuids.iter().copied().map(Self::Uuid).collect())
    }

    /// Get the data element type
    #[must_use]
    pub const fn data_type(&self) -> DataElementType {
        match self {
            Self::Nil => DataElementType::Nil,
            Self::UnsignedInt8(_)
            | Self::UnsignedInt16(_)
            | Self::UnsignedInt32(_)
            | Self::UnsignedInt64(_)
            | Self::UnsignedInt128(_) => DataElementType::UnsignedInt,
            Self::SignedInt8(_)
            | Self::SignedInt16(_)
            | Self::SignedInt32(_)
            | Self::SignedInt64(_)
            | Self::SignedInt128(_) => DataElementType::SignedInt,
            Self::Uuid(_) => DataElementType::Uuid,
            Self::TextString(_) => DataElementType::TextString,
            Self::Boolean(_) => DataElementType::Boolean,
            Self::Sequence(_) => DataElementType::Sequence,
            Self::Alternative(_) => DataElementType::Alternative,
            Self::Url(_) => DataElementType::Url,
        }
    }

    /// Text content if this is valid UTF-8 text
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::TextString(bytes) | Self::Url(bytes) => core::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Unsigned value widened to `u32`, if it fits
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::UnsignedInt8(value) => Some(u32::from(value)),
            Self::UnsignedInt16(value) => Some(u32::from(value)),
            Self::UnsignedInt32(value) => Some(value),
            Self::UnsignedInt64(value) => u32::try_from(value).ok(),
            Self::UnsignedInt128(value) => u32::try_from(value).ok(),
            _ => None,
        }
    }

    /// UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> Option<Uuid> {
        match *self {
            Self::Uuid(uuid) => Some(uuid),
            _ => None,
        }
    }

    /// Members of a sequence or alternative
    #[must_use]
    pub fn as_sequence(&self) -> Option<&[DataElement]> {
        match self {
            Self::Sequence(items) | Self::Alternative(items) => Some(items),
            _ => None,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Self::Nil => 0,
            Self::UnsignedInt8(_) | Self::SignedInt8(_) | Self::Boolean(_) => 1,
            Self::UnsignedInt16(_) | Self::SignedInt16(_) | Self::Uuid(Uuid::Uuid16(_)) => 2,
            Self::UnsignedInt32(_) | Self::SignedInt32(_) | Self::Uuid(Uuid::Uuid32(_)) => 4,
            Self::UnsignedInt64(_) | Self::SignedInt64(_) => 8,
            Self::UnsignedInt128(_) | Self::SignedInt128(_) | Self::Uuid(Uuid::Uuid128(_)) => 16,
            Self::TextString(bytes) | Self::Url(bytes) => bytes.len(),
            Self::Sequence(items) | Self::Alternative(items) => {
                items.iter().map(Self::encoded_size).sum()
            }
        }
    }

    const fn fixed_size_index(&self) -> Option<u8> {
        match self {
            Self::Nil
            | Self::UnsignedInt8(_)
            | Self::SignedInt8(_)
            | Self::Boolean(_) => Some(0),
            Self::UnsignedInt16(_) | Self::SignedInt16(_) | Self::Uuid(Uuid::Uuid16(_)) => Some(1),
            Self::UnsignedInt32(_) | Self::SignedInt32(_) | Self::Uuid(Uuid::Uuid32(_)) => Some(2),
            Self::UnsignedInt64(_) | Self::SignedInt64(_) => Some(3),
            Self::UnsignedInt128(_) | Self::SignedInt128(_) | Self::Uuid(Uuid::Uuid128(_)) => {
                Some(4)
            }
            Self::TextString(_) | Self::Url(_) | Self::Sequence(_) | Self::Alternative(_) => None,
        }
    }

    /// Big-endian value bytes of a fixed-size element, left aligned in 16 bytes
    fn scalar_bytes(&self) -> heapless::Vec<u8, 16> {
        let mut out = heapless::Vec::new();
        let bytes: &[u8] = &match *self {
            Self::UnsignedInt8(value) => u128::from(value).to_be_bytes(),
            Self::UnsignedInt16(value) | Self::Uuid(Uuid::Uuid16(value)) => {
                u128::from(value).to_be_bytes()
            }
            Self::UnsignedInt32(value) | Self::Uuid(Uuid::Uuid32(value)) => {
                u128::from(value).to_be_bytes()
            }
            Self::UnsignedInt64(value) => u128::from(value).to_be_bytes(),
            Self::UnsignedInt128(value) | Self::Uuid(Uuid::Uuid128(value)) => value.to_be_bytes(),
            Self::SignedInt8(value) => i128::from(value).to_be_bytes(),
            Self::SignedInt16(value) => i128::from(value).to_be_bytes(),
            Self::SignedInt32(value) => i128::from(value).to_be_bytes(),
            Self::SignedInt64(value) => i128::from(value).to_be_bytes(),
            Self::SignedInt128(value) => value.to_be_bytes(),
            Self::Boolean(value) => u128::from(value).to_be_bytes(),
            Self::Nil
            | Self::TextString(_)
            | Self::Url(_)
            | Self::Sequence(_)
            | Self::Alternative(_) => return out,
        };
        // Keep only the low-order bytes the wire size calls for
        let width = self.body_size();
        out.extend_from_slice(&bytes[16 - width..]).ok();
        out
    }

    /// Get the encoded size of this data element
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        let body = self.body_size();
        let prefix = match self.fixed_size_index() {
            Some(_) => 0,
            None if body <= 0xFF => 1,
            None if body <= 0xFFFF => 2,
            None => 4,
        };
        1 + prefix + body
    }

    /// Encode into the start of `buffer`, returning the bytes written
    ///
    /// # Errors
    /// Returns [`SdpError::BufferTooSmall`] if `buffer` cannot hold the
    /// element
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize, SdpError> {
        let total = self.encoded_size();
        if buffer.len() < total {
            return Err(SdpError::BufferTooSmall);
        }

        let data_type = self.data_type() as u8;
        let body = self.body_size();
        let mut position = match self.fixed_size_index() {
            Some(index) => {
                buffer[0] = (data_type << 3) | index;
                1
            }
            None if body <= 0xFF => {
                buffer[0] = (data_type << 3) | DataElementSize::AdditionalU8 as u8;
                buffer[1] = body as u8;
                2
            }
            None if body <= 0xFFFF => {
                buffer[0] = (data_type << 3) | DataElementSize::AdditionalU16 as u8;
                buffer[1..3].copy_from_slice(&(body as u16).to_be_bytes());
                3
            }
            None => {
                buffer[0] = (data_type << 3) | DataElementSize::AdditionalU32 as u8;
                let length = u32::try_from(body).map_err(|_| SdpError::BufferTooSmall)?;
                buffer[1..5].copy_from_slice(&length.to_be_bytes());
                5
            }
        };

        let scalar = self.scalar_bytes();
        let body_bytes: &[u8] = match self {
            Self::Sequence(items) | Self::Alternative(items) => {
                for item in items {
                    position += item.encode(&mut buffer[position..])?;
                }
                return Ok(position);
            }
            Self::TextString(bytes) | Self::Url(bytes) => bytes,
            _ => &scalar,
        };
        buffer[position..position + body_bytes.len()].copy_from_slice(body_bytes);
        position += body_bytes.len();

        Ok(position)
    }

    /// Decode one element from the start of `data`
    ///
    /// Returns the element and the number of bytes it occupied.
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidData`] if the element is malformed,
    /// truncated, or nested deeper than [`MAX_NESTING_DEPTH`]
    pub fn decode(data: &[u8]) -> Result<(Self, usize), SdpError> {
        Self::decode_nested(data, 0)
    }

    fn decode_nested(data: &[u8], depth: usize) -> Result<(Self, usize), SdpError> {
        let header = DataElementHeader::decode(data)?;
        let end = header
            .header_length
            .checked_add(header.body_length)
            .ok_or(SdpError::InvalidData)?;
        let body = data
            .get(header.header_length..end)
            .ok_or(SdpError::InvalidData)?;

        let element = match header.data_type {
            DataElementType::Nil => Self::Nil,
            DataElementType::UnsignedInt => match header.size_index {
                0 => Self::UnsignedInt8(body[0]),
                1 => Self::UnsignedInt16(u16::from_be_bytes(fixed(body)?)),
                2 => Self::UnsignedInt32(u32::from_be_bytes(fixed(body)?)),
                3 => Self::UnsignedInt64(u64::from_be_bytes(fixed(body)?)),
                _ => Self::UnsignedInt128(u128::from_be_bytes(fixed(body)?)),
            },
            DataElementType::SignedInt => match header.size_index {
                0 => Self::SignedInt8(i8::from_be_bytes(fixed(body)?)),
                1 => Self::SignedInt16(i16::from_be_bytes(fixed(body)?)),
                2 => Self::SignedInt32(i32::from_be_bytes(fixed(body)?)),
                3 => Self::SignedInt64(i64::from_be_bytes(fixed(body)?)),
                _ => Self::SignedInt128(i128::from_be_bytes(fixed(body)?)),
            },
            DataElementType::Uuid => match header.size_index {
                1 => Self::Uuid(Uuid::Uuid16(u16::from_be_bytes(fixed(body)?))),
                2 => Self::Uuid(Uuid::Uuid32(u32::from_be_bytes(fixed(body)?))),
                _ => Self::Uuid(Uuid::Uuid128(u128::from_be_bytes(fixed(body)?))),
            },
            DataElementType::TextString => Self::TextString(body.to_vec()),
            DataElementType::Url => Self::Url(body.to_vec()),
            DataElementType::Boolean => Self::Boolean(body[0] != 0),
            DataElementType::Sequence | DataElementType::Alternative => {
                if depth >= MAX_NESTING_DEPTH {
                    return Err(SdpError::InvalidData);
                }
                let mut items = Vec::new();
                let mut rest = body;
                while !rest.is_empty() {
                    let (item, used) = Self::decode_nested(rest, depth + 1)?;
                    items.push(item);
                    rest = &rest[used..];
                }
                if header.data_type == DataElementType::Sequence {
                    Self::Sequence(items)
                } else {
                    Self::Alternative(items)
                }
            }
        };

        Ok((element, end))
    }

    /// Encode into a freshly allocated buffer
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8]> {
        let mut bytes = alloc::vec![0u8; self.encoded_size()];
        // The buffer is sized by encoded_size, encoding cannot run short
        let written = self.encode(&mut bytes).unwrap_or(0);
        bytes.truncate(written);
        bytes.into_boxed_slice()
    }
}

fn fixed<const N: usize>(body: &[u8]) -> Result<[u8; N], SdpError> {
    body.try_into().map_err(|_| SdpError::InvalidData)
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, SdpError> {
    let bytes = data.get(at..at + 2).ok_or(SdpError::InvalidData)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, SdpError> {
    let bytes = data.get(at..at + 4).ok_or(SdpError::InvalidData)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
