//! Memcached binary protocol codec
//!
//! Every frame is a 24-byte big-endian header followed by `extras`, `key` and
//! `value`:
//!
//! ```text
//! 0      1       2-3      4       5        6-7             8-11      12-15   16-23
//! magic  opcode  key_len  ext_len dtype    reserved/status body_len  opaque  cas
//! ```
//!
//! The codec is a pure transform; framing on the socket lives in
//! [`crate::core::connection`].

use std::fmt;

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Longest key the server accepts
pub const MAX_KEY_LEN: usize = 250;
/// Largest value the server accepts (1 MiB)
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

const STORE_EXTRAS_LEN: u8 = 8;
const FLAGS_EXTRAS_LEN: u8 = 4;
// Leaves room for extras and the key on top of a maximal value.
const MAX_BODY_LEN: usize = MAX_VALUE_LEN + MAX_KEY_LEN + 64;

/// Binary protocol opcodes understood by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Replace = 0x03,
    Delete = 0x04,
    Noop = 0x0a,
    Version = 0x0b,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl Opcode {
    /// Opcodes whose requests carry flags and expiration extras
    pub fn is_store(self) -> bool {
        matches!(self, Opcode::Set | Opcode::Replace)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Opcode::Get),
            0x01 => Ok(Opcode::Set),
            0x03 => Ok(Opcode::Replace),
            0x04 => Ok(Opcode::Delete),
            0x0a => Ok(Opcode::Noop),
            0x0b => Ok(Opcode::Version),
            0x20 => Ok(Opcode::SaslListMechs),
            0x21 => Ok(Opcode::SaslAuth),
            0x22 => Ok(Opcode::SaslStep),
            other => Err(ProtocolError::UnsupportedOpcode(other)),
        }
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    /// The entry exists with a different CAS token
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    NotStored,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    InternalError,
    Busy,
    Other(u16),
}

impl Status {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::NotStored,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            other => Status::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::NotStored => 0x0005,
            Status::AuthError => 0x0020,
            Status::AuthContinue => 0x0021,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::KeyNotFound => "key not found",
            Status::KeyExists => "key exists",
            Status::ValueTooLarge => "value too large",
            Status::InvalidArguments => "invalid arguments",
            Status::NotStored => "not stored",
            Status::AuthError => "authentication error",
            Status::AuthContinue => "authentication continue",
            Status::UnknownCommand => "unknown command",
            Status::OutOfMemory => "out of memory",
            Status::InternalError => "internal error",
            Status::Busy => "busy",
            Status::Other(_) => "unrecognized status",
        };
        write!(f, "{} (0x{:04x})", text, self.code())
    }
}

/// Parsed fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    /// Reserved field on requests, status code on responses
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Total frame length including the header
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

/// A client-to-server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    /// Seconds until expiry, 0 means never
    pub expiration: u32,
    /// 0 means "not applicable"
    pub cas: u64,
    pub opaque: u32,
}

impl Request {
    fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            key: Vec::new(),
            value: Vec::new(),
            flags: 0,
            expiration: 0,
            cas: 0,
            opaque: 0,
        }
    }

    pub fn get(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            ..Self::new(Opcode::Get)
        }
    }

    pub fn set(key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
            flags,
            expiration,
            ..Self::new(Opcode::Set)
        }
    }

    /// `Replace` only stores when the key already exists
    pub fn replace(key: &[u8], value: &[u8], flags: u32, expiration: u32) -> Self {
        Self {
            opcode: Opcode::Replace,
            ..Self::set(key, value, flags, expiration)
        }
    }

    pub fn delete(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            ..Self::new(Opcode::Delete)
        }
    }

    pub fn noop() -> Self {
        Self::new(Opcode::Noop)
    }

    pub fn version() -> Self {
        Self::new(Opcode::Version)
    }

    pub fn sasl_list_mechs() -> Self {
        Self::new(Opcode::SaslListMechs)
    }

    pub fn sasl_auth(mechanism: &[u8], payload: &[u8]) -> Self {
        Self {
            key: mechanism.to_vec(),
            value: payload.to_vec(),
            ..Self::new(Opcode::SaslAuth)
        }
    }

    /// Attach a CAS precondition
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }
}

/// A server-to-client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    /// Present on `Get` hits
    pub flags: Option<u32>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub cas: u64,
    pub opaque: u32,
}

impl Response {
    /// An empty response answering `request`
    pub fn for_request(request: &Request, status: Status) -> Self {
        Self {
            opcode: request.opcode,
            status,
            flags: None,
            key: Vec::new(),
            value: Vec::new(),
            cas: 0,
            opaque: request.opaque,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Bad magic byte: 0x{0:02x}")]
    BadMagic(u8),
    #[error("Unsupported opcode: 0x{0:02x}")]
    UnsupportedOpcode(u8),
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

// =============================================================================
// Encoding
// =============================================================================

#[allow(clippy::too_many_arguments)]
fn write_frame(
    buf: &mut Vec<u8>,
    magic: u8,
    opcode: Opcode,
    status: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    opaque: u32,
    cas: u64,
) {
    let body_len = extras.len() + key.len() + value.len();
    buf.reserve(HEADER_LEN + body_len);
    buf.push(magic);
    buf.push(opcode as u8);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.push(extras.len() as u8);
    buf.push(0); // raw bytes
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(&cas.to_be_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Encode a request frame
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut extras = Vec::new();
    if request.opcode.is_store() {
        extras.extend_from_slice(&request.flags.to_be_bytes());
        extras.extend_from_slice(&request.expiration.to_be_bytes());
    }

    let mut buf = Vec::new();
    write_frame(
        &mut buf,
        REQUEST_MAGIC,
        request.opcode,
        0,
        &extras,
        &request.key,
        &request.value,
        request.opaque,
        request.cas,
    );
    buf
}

/// Encode a response frame
pub fn encode_response(response: &Response) -> Vec<u8> {
    let extras = response
        .flags
        .map(|flags| flags.to_be_bytes().to_vec())
        .unwrap_or_default();

    let mut buf = Vec::new();
    write_frame(
        &mut buf,
        RESPONSE_MAGIC,
        response.opcode,
        response.status.code(),
        &extras,
        &response.key,
        &response.value,
        response.opaque,
        response.cas,
    );
    buf
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode the fixed-size header at the start of `bytes`
pub fn decode_header(bytes: &[u8]) -> Result<Header, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }

    let magic = bytes[0];
    if magic != REQUEST_MAGIC && magic != RESPONSE_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let header = Header {
        magic,
        opcode: Opcode::try_from(bytes[1])?,
        key_len: u16::from_be_bytes([bytes[2], bytes[3]]),
        extras_len: bytes[4],
        data_type: bytes[5],
        status: u16::from_be_bytes([bytes[6], bytes[7]]),
        body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        opaque: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        cas: u64::from_be_bytes([
            bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22], bytes[23],
        ]),
    };

    if header.body_len as usize > MAX_BODY_LEN {
        return Err(ProtocolError::Malformed(format!(
            "body length {} exceeds maximum {}",
            header.body_len, MAX_BODY_LEN
        )));
    }
    if header.extras_len as usize + header.key_len as usize > header.body_len as usize {
        return Err(ProtocolError::Malformed(format!(
            "extras ({}) and key ({}) exceed body length {}",
            header.extras_len, header.key_len, header.body_len
        )));
    }

    Ok(header)
}

/// Split a complete frame into (header, extras, key, value)
fn split_frame(bytes: &[u8], magic: u8) -> Result<(Header, &[u8], &[u8], &[u8]), ProtocolError> {
    let header = decode_header(bytes)?;
    if header.magic != magic {
        return Err(ProtocolError::Malformed(format!(
            "expected magic 0x{:02x}, got 0x{:02x}",
            magic, header.magic
        )));
    }

    let frame_len = header.frame_len();
    if bytes.len() < frame_len {
        return Err(ProtocolError::Truncated {
            expected: frame_len,
            actual: bytes.len(),
        });
    }

    let extras_end = HEADER_LEN + header.extras_len as usize;
    let key_end = extras_end + header.key_len as usize;
    Ok((
        header,
        &bytes[HEADER_LEN..extras_end],
        &bytes[extras_end..key_end],
        &bytes[key_end..frame_len],
    ))
}

/// Decode a complete request frame
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let (header, extras, key, value) = split_frame(bytes, REQUEST_MAGIC)?;

    let (flags, expiration) = if header.opcode.is_store() {
        if header.extras_len != STORE_EXTRAS_LEN {
            return Err(ProtocolError::Malformed(format!(
                "{:?} requires {} bytes of extras, got {}",
                header.opcode, STORE_EXTRAS_LEN, header.extras_len
            )));
        }
        (
            u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
            u32::from_be_bytes([extras[4], extras[5], extras[6], extras[7]]),
        )
    } else {
        if header.extras_len != 0 {
            return Err(ProtocolError::Malformed(format!(
                "{:?} does not take extras",
                header.opcode
            )));
        }
        (0, 0)
    };

    Ok(Request {
        opcode: header.opcode,
        key: key.to_vec(),
        value: value.to_vec(),
        flags,
        expiration,
        cas: header.cas,
        opaque: header.opaque,
    })
}

/// Decode a complete response frame
pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let (header, extras, key, value) = split_frame(bytes, RESPONSE_MAGIC)?;

    let flags = match header.extras_len {
        0 => None,
        FLAGS_EXTRAS_LEN => Some(u32::from_be_bytes([
            extras[0], extras[1], extras[2], extras[3],
        ])),
        other => {
            return Err(ProtocolError::Malformed(format!(
                "unexpected {} bytes of response extras",
                other
            )))
        }
    };

    Ok(Response {
        opcode: header.opcode,
        status: Status::from_u16(header.status),
        flags,
        key: key.to_vec(),
        value: value.to_vec(),
        cas: header.cas,
        opaque: header.opaque,
    })
}
