//! Proprietary wrapper handshake frames (login / heartbeat).
//!
//! ```text
//! offset size field
//! 0      2    protocol version
//! 2      2    destination address
//! 4      2    source address
//! 6      2    length of everything after the header
//! 8      1    function code 1 (0x0A login / 0x0C heartbeat, 0xAA / 0xCC in responses)
//! 9      1    function code 2 (0x02 request / 0x03 response)
//! 10     1    meter-id length N
//! 11     N    meter id (ASCII)
//! 11+N   1    reserved / status (login only)
//! ...    2    CRC16 over every preceding byte, big-endian
//! ```
//!
//! Application frames share the 8-byte header but carry anything else at
//! offsets 8 and 9; they are passed through untouched.

pub mod codec;
pub mod crc;

pub use codec::WrapperFrameCodec;

pub const HEADER_LEN: usize = 8;
pub const CRC_LEN: usize = 2;
/// Header plus the two control bytes inspected by [`classify`].
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 2;

const ID_LEN_OFFSET: usize = HEADER_LEN + 2;
const ID_OFFSET: usize = ID_LEN_OFFSET + 1;
const MIN_HANDSHAKE_LEN: usize = ID_OFFSET + CRC_LEN;

pub const FN_LOGIN_REQUEST: u8 = 0x0A;
pub const FN_HEARTBEAT_REQUEST: u8 = 0x0C;
pub const FN_LOGIN_RESPONSE: u8 = 0xAA;
pub const FN_HEARTBEAT_RESPONSE: u8 = 0xCC;
pub const FN_DIRECTION_REQUEST: u8 = 0x02;
pub const FN_DIRECTION_RESPONSE: u8 = 0x03;

/// Status byte written into accepted login responses.
pub const LOGIN_ACCEPTED: u8 = 0x00;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("not a handshake frame")]
    NotHandshake,
    #[error("handshake length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("CRC mismatch: frame carries {received:#06X}, computed {computed:#06X}")]
    CrcMismatch { received: u16, computed: u16 },
    #[error("meter id is not printable ASCII")]
    NonAsciiId,
    #[error("meter id of {0} bytes does not fit the one-byte length field")]
    IdTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Login,
    Heartbeat,
    Application,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Login,
    Heartbeat,
}

impl HandshakeKind {
    fn request_code(self) -> u8 {
        match self {
            Self::Login => FN_LOGIN_REQUEST,
            Self::Heartbeat => FN_HEARTBEAT_REQUEST,
        }
    }

    fn response_code(self) -> u8 {
        match self {
            Self::Login => FN_LOGIN_RESPONSE,
            Self::Heartbeat => FN_HEARTBEAT_RESPONSE,
        }
    }

    fn status_len(self) -> usize {
        match self {
            Self::Login => 1,
            Self::Heartbeat => 0,
        }
    }
}

/// The 8-byte header shared by handshake and application frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperHeader {
    pub version: u16,
    pub destination: u16,
    pub source: u16,
    pub length: u16,
}

impl WrapperHeader {
    pub fn decode(data: &[u8]) -> Option<Self> {
        let h = data.get(..HEADER_LEN)?;
        Some(Self {
            version: u16::from_be_bytes([h[0], h[1]]),
            destination: u16::from_be_bytes([h[2], h[3]]),
            source: u16::from_be_bytes([h[4], h[5]]),
            length: u16::from_be_bytes([h[6], h[7]]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination.to_be_bytes());
        out[4..6].copy_from_slice(&self.source.to_be_bytes());
        out[6..8].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Header for a handshake frame carrying `id_len` id bytes.
    pub fn for_handshake(version: u16, destination: u16, source: u16, kind: HandshakeKind, id_len: usize) -> Self {
        let body = 2 + 1 + id_len + kind.status_len() + CRC_LEN;
        Self {
            version,
            destination,
            source,
            length: u16::try_from(body).unwrap_or(u16::MAX),
        }
    }
}

/// Cheap classification on the I/O path: looks only at the control bytes.
pub fn classify(bytes: &[u8]) -> FrameKind {
    if bytes.len() < MIN_FRAME_LEN {
        return FrameKind::Invalid;
    }
    match (bytes[HEADER_LEN], bytes[HEADER_LEN + 1]) {
        (FN_LOGIN_REQUEST, FN_DIRECTION_REQUEST) => FrameKind::Login,
        (FN_HEARTBEAT_REQUEST, FN_DIRECTION_REQUEST) => FrameKind::Heartbeat,
        _ => FrameKind::Application,
    }
}

/// A validated inbound login or heartbeat frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    kind: HandshakeKind,
    header: [u8; HEADER_LEN],
    meter_id: String,
    status: Option<u8>,
}

impl HandshakeFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let kind = match classify(bytes) {
            FrameKind::Login => HandshakeKind::Login,
            FrameKind::Heartbeat => HandshakeKind::Heartbeat,
            FrameKind::Application => return Err(FrameError::NotHandshake),
            FrameKind::Invalid => {
                return Err(FrameError::TooShort {
                    len: bytes.len(),
                    min: MIN_HANDSHAKE_LEN,
                })
            }
        };
        if bytes.len() < MIN_HANDSHAKE_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                min: MIN_HANDSHAKE_LEN,
            });
        }

        let id_len = usize::from(bytes[ID_LEN_OFFSET]);
        let expected = ID_OFFSET + id_len + kind.status_len() + CRC_LEN;
        if bytes.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let (body, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
        let received = u16::from_be_bytes([trailer[0], trailer[1]]);
        let computed = crc::crc16(body);
        if received != computed {
            return Err(FrameError::CrcMismatch { received, computed });
        }

        let id_bytes = &bytes[ID_OFFSET..ID_OFFSET + id_len];
        if !id_bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(FrameError::NonAsciiId);
        }
        let meter_id = String::from_utf8_lossy(id_bytes).into_owned();

        let status = match kind {
            HandshakeKind::Login => Some(bytes[ID_OFFSET + id_len]),
            HandshakeKind::Heartbeat => None,
        };

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);

        Ok(Self {
            kind,
            header,
            meter_id,
            status,
        })
    }

    pub fn kind(&self) -> HandshakeKind {
        self.kind
    }

    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    pub fn meter_id(&self) -> &str {
        &self.meter_id
    }

    /// Reserved byte of a login request; `None` for heartbeats.
    pub fn status(&self) -> Option<u8> {
        self.status
    }

    pub fn response(&self) -> Result<Vec<u8>, FrameError> {
        match self.kind {
            HandshakeKind::Login => build_login_response(&self.header, &self.meter_id),
            HandshakeKind::Heartbeat => build_heartbeat_response(&self.header, &self.meter_id),
        }
    }
}

pub fn build_login_response(header: &[u8; HEADER_LEN], meter_id: &str) -> Result<Vec<u8>, FrameError> {
    build_frame(
        header,
        HandshakeKind::Login.response_code(),
        FN_DIRECTION_RESPONSE,
        meter_id,
        Some(LOGIN_ACCEPTED),
    )
}

pub fn build_heartbeat_response(header: &[u8; HEADER_LEN], meter_id: &str) -> Result<Vec<u8>, FrameError> {
    build_frame(
        header,
        HandshakeKind::Heartbeat.response_code(),
        FN_DIRECTION_RESPONSE,
        meter_id,
        None,
    )
}

/// Meter-side request frame; used by simulators and tests.
pub fn build_handshake_request(
    kind: HandshakeKind,
    header: &[u8; HEADER_LEN],
    meter_id: &str,
) -> Result<Vec<u8>, FrameError> {
    let status = match kind {
        HandshakeKind::Login => Some(0x00),
        HandshakeKind::Heartbeat => None,
    };
    build_frame(header, kind.request_code(), FN_DIRECTION_REQUEST, meter_id, status)
}

fn build_frame(
    header: &[u8; HEADER_LEN],
    function: u8,
    direction: u8,
    meter_id: &str,
    status: Option<u8>,
) -> Result<Vec<u8>, FrameError> {
    if !meter_id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(FrameError::NonAsciiId);
    }
    let id_len = u8::try_from(meter_id.len()).map_err(|_| FrameError::IdTooLong(meter_id.len()))?;

    let mut out = Vec::with_capacity(ID_OFFSET + meter_id.len() + 1 + CRC_LEN);
    out.extend_from_slice(header);
    out.push(function);
    out.push(direction);
    out.push(id_len);
    out.extend_from_slice(meter_id.as_bytes());
    if let Some(status) = status {
        out.push(status);
    }
    let crc = crc::crc16_be_bytes(&out);
    out.extend_from_slice(&crc);
    Ok(out)
}
