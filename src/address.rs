use crate::sdp::SdpError;

/// A Bluetooth Device Address (`BD_ADDR`) wrapper for type safety
///
/// Bytes are stored in display order, so `00:11:22:33:44:AA` is
/// `[0x00, 0x11, 0x22, 0x33, 0x44, 0xAA]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    /// Create a new Bluetooth address from bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Format the address as a colon-separated hex string
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        let mut result = heapless::String::new();
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(hex_digit(byte >> 4)).ok();
            result.push(hex_digit(byte & 0x0F)).ok();
        }
        result
    }

    /// Format the address as twelve hex digits without separators
    #[must_use]
    pub fn format_compact(&self) -> heapless::String<12> {
        let mut result = heapless::String::new();
        for byte in &self.0 {
            result.push(hex_digit(byte >> 4)).ok();
            result.push(hex_digit(byte & 0x0F)).ok();
        }
        result
    }

    /// Parse a Bluetooth address from hex text
    ///
    /// Accepts the colon-separated form (`00:11:22:33:44:AA`) and the
    /// compact twelve-digit form (`0011223344AA`), in either case.
    ///
    /// # Errors
    /// Returns [`SdpError::InvalidParameter`] if the text is neither form or
    /// contains non-hex characters
    pub fn from_hex(hex: &str) -> Result<Self, SdpError> {
        match hex.len() {
            17 => Self::from_colon_hex(hex),
            12 => Self::from_compact_hex(hex),
            _ => Err(SdpError::InvalidParameter),
        }
    }

    fn from_colon_hex(hex: &str) -> Result<Self, SdpError> {
        if !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(SdpError::InvalidParameter);
        }

        let mut bytes = [0u8; 6];
        let mut count = 0;
        for (i, byte) in hex.split(':').enumerate() {
            if i >= 6 || byte.len() != 2 {
                return Err(SdpError::InvalidParameter);
            }
            bytes[i] = u8::from_str_radix(byte, 16).map_err(|_| SdpError::InvalidParameter)?;
            count += 1;
        }
        if count != 6 {
            return Err(SdpError::InvalidParameter);
        }
        Ok(Self(bytes))
    }

    fn from_compact_hex(hex: &str) -> Result<Self, SdpError> {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SdpError::InvalidParameter);
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = hex.get(i * 2..i * 2 + 2).ok_or(SdpError::InvalidParameter)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| SdpError::InvalidParameter)?;
        }
        Ok(Self(bytes))
    }
}

const fn hex_digit(nibble: u8) -> char {
    const HEX_CHARS: [char; 16] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
    ];
    HEX_CHARS[(nibble & 0x0F) as usize]
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

impl From<BluetoothAddress> for bt_hci::param::BdAddr {
    fn from(addr: BluetoothAddress) -> Self {
        bt_hci::param::BdAddr::new(addr.0)
    }
}

impl From<BluetoothAddress> for heapless::String<17> {
    fn from(addr: BluetoothAddress) -> Self {
        addr.format_hex()
    }
}

impl TryFrom<&str> for BluetoothAddress {
    type Error = SdpError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        BluetoothAddress::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for BluetoothAddress {
    type Error = SdpError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let addr: [u8; 6] = bytes.try_into().map_err(|_| SdpError::InvalidParameter)?;
        Ok(BluetoothAddress(addr))
    }
}

impl TryFrom<bt_hci::param::BdAddr> for BluetoothAddress {
    type Error = SdpError;

    fn try_from(bd_addr: bt_hci::param::BdAddr) -> Result<Self, Self::Error> {
        bd_addr.raw().try_into()
    }
}
