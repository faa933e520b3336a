//! STUN message codec (RFC 5389)
//!
//! Only what binding discovery needs: the 20-byte header, the address
//! attributes, ERROR-CODE and SOFTWARE. Anything else is carried through
//! as [`StunAttribute::Unknown`].

use rand::RngCore;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    /// Fewer bytes than a header
    #[error("STUN message too short ({0} bytes)")]
    MessageTooShort(usize),

    /// Header does not carry the magic cookie
    #[error("Invalid STUN magic cookie")]
    InvalidMagicCookie,

    /// Unsupported method or malformed type field
    #[error("Invalid STUN message type {0:#06x}")]
    InvalidMessageType(u16),

    /// Attribute value malformed
    #[error("Invalid STUN attribute {0:#06x}")]
    InvalidAttribute(u16),

    /// Declared length runs past the end of the datagram
    #[error("Truncated STUN message: {declared} bytes declared, {available} available")]
    Truncated {
        /// Length from the header or attribute
        declared: usize,
        /// Bytes actually present
        available: usize,
    },
}

/// 96-bit STUN transaction identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Draw a random identifier
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

impl StunMessageClass {
    /// Success or error response
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// STUN method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Pack method and class into the 16-bit type field.
    ///
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method: u16 = match self {
            Self::Binding => 0x0001,
        };
        let class_bits: u16 = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        (method & 0x0F)
            | ((class_bits & 0x01) << 4)
            | ((method & 0x70) << 1)
            | ((class_bits & 0x02) << 7)
            | ((method & 0xF80) << 2)
    }

    fn decode(raw: u16) -> Result<(Self, StunMessageClass), StunError> {
        if raw & 0xC000 != 0 {
            return Err(StunError::InvalidMessageType(raw));
        }

        let class = match ((raw >> 4) & 0x01) | ((raw >> 7) & 0x02) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (raw & 0x0F) | ((raw >> 1) & 0x70) | ((raw >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, class)),
            _ => Err(StunError::InvalidMessageType(raw)),
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001), sent by RFC 3489 servers
    MappedAddress(SocketAddr),
    /// XOR-MAPPED-ADDRESS (0x0020)
    XorMappedAddress(SocketAddr),
    /// ERROR-CODE (0x0009)
    ErrorCode {
        /// Code in 300..=699
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// SOFTWARE (0x8022)
    Software(String),
    /// Attribute this codec does not interpret
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::ErrorCode { .. } => ATTR_ERROR_CODE,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>, id: &TransactionId) {
        let value = match self {
            Self::MappedAddress(addr) => encode_address(*addr, None),
            Self::XorMappedAddress(addr) => encode_address(*addr, Some(id)),
            Self::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, ((code / 100) & 0x07) as u8, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        };

        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);
        out.extend(std::iter::repeat_n(0, padding(value.len())));
    }

    fn decode(attr_type: u16, value: &[u8], id: &TransactionId) -> Result<Self, StunError> {
        match attr_type {
            ATTR_MAPPED_ADDRESS => decode_address(attr_type, value, None).map(Self::MappedAddress),
            ATTR_XOR_MAPPED_ADDRESS => {
                decode_address(attr_type, value, Some(id)).map(Self::XorMappedAddress)
            }
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute(attr_type));
                }
                let class = u16::from(value[2] & 0x07);
                let number = u16::from(value[3]);
                if number >= 100 {
                    return Err(StunError::InvalidAttribute(attr_type));
                }
                Ok(Self::ErrorCode {
                    code: class * 100 + number,
                    reason: String::from_utf8_lossy(&value[4..]).into_owned(),
                })
            }
            ATTR_SOFTWARE => Ok(Self::Software(String::from_utf8_lossy(value).into_owned())),
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// XOR key for an address: cookie, followed by the transaction id for IPv6
fn xor_key(id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(id.as_bytes());
    key
}

fn encode_address(addr: SocketAddr, xor_with: Option<&TransactionId>) -> Vec<u8> {
    let key = xor_with.map(xor_key).unwrap_or([0u8; 16]);
    let port = addr.port() ^ u16::from_be_bytes([key[0], key[1]]);

    let mut value = vec![0];
    let ip: Vec<u8> = match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            ip.octets().to_vec()
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            ip.octets().to_vec()
        }
    };
    value.extend_from_slice(&port.to_be_bytes());
    value.extend(ip.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    value
}

fn decode_address(
    attr_type: u16,
    value: &[u8],
    xor_with: Option<&TransactionId>,
) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute(attr_type));
    }
    let key = xor_with.map(xor_key).unwrap_or([0u8; 16]);
    let port = u16::from_be_bytes([value[2], value[3]]) ^ u16::from_be_bytes([key[0], key[1]]);
    let raw_ip = &value[4..];

    let ip = match value[1] {
        FAMILY_IPV4 if raw_ip.len() >= 4 => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = raw_ip[i] ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 if raw_ip.len() >= 16 => {
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = raw_ip[i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute(attr_type)),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Cheap header check: long enough, top two bits clear, magic cookie present
#[must_use]
pub fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// Transaction id of something that looks like a STUN message
#[must_use]
pub fn peek_transaction_id(data: &[u8]) -> Option<TransactionId> {
    if !is_stun_message(data) {
        return None;
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&data[8..HEADER_SIZE]);
    Some(TransactionId(id))
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message method
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: TransactionId,
    /// Message attributes, in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Binding request with a fresh random transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        Self::binding_request_with_id(TransactionId::random())
    }

    /// Binding request with a chosen transaction id
    #[must_use]
    pub fn binding_request_with_id(transaction_id: TransactionId) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Binding success response reporting `mapped` as XOR-MAPPED-ADDRESS
    #[must_use]
    pub fn binding_response(transaction_id: TransactionId, mapped: SocketAddr) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    /// Binding error response
    #[must_use]
    pub fn binding_error(transaction_id: TransactionId, code: u16, reason: &str) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::ErrorResponse,
            transaction_id,
            attributes: vec![StunAttribute::ErrorCode {
                code,
                reason: reason.to_string(),
            }],
        }
    }

    /// Append an attribute
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode to wire format
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 32);
        bytes.extend_from_slice(&self.message_type.encode(self.message_class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            attr.encode_into(&mut bytes, &self.transaction_id);
        }

        let body_len = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&body_len.to_be_bytes());
        bytes
    }

    /// Decode from wire format.
    ///
    /// Attributes with malformed values are skipped; a length running past
    /// the end of the datagram is an error.
    ///
    /// # Errors
    /// Returns [`StunError`] when the header is invalid or the message is
    /// truncated
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort(bytes.len()));
        }

        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body_len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        if u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }
        let (message_type, message_class) = StunMessageType::decode(raw_type)?;

        let end = HEADER_SIZE + body_len;
        if end > bytes.len() {
            return Err(StunError::Truncated {
                declared: end,
                available: bytes.len(),
            });
        }

        let mut id = [0u8; 12];
        id.copy_from_slice(&bytes[8..HEADER_SIZE]);
        let transaction_id = TransactionId(id);

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
            offset += 4;

            if offset + attr_len > end {
                return Err(StunError::Truncated {
                    declared: offset + attr_len,
                    available: end,
                });
            }

            match StunAttribute::decode(attr_type, &bytes[offset..offset + attr_len], &transaction_id) {
                Ok(attr) => attributes.push(attr),
                Err(e) => tracing::trace!("Skipping STUN attribute: {}", e),
            }
            offset += attr_len + padding(attr_len);
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// Reflexive address reported by the server. XOR-MAPPED-ADDRESS wins
    /// over MAPPED-ADDRESS.
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let xor = self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });
        xor.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                StunAttribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// ERROR-CODE value and reason, if present
    #[must_use]
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }
}
