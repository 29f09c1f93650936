//! FREC message framing.
//!
//! ```text
//! magic u32 "FREC" | type u16 | length u32 | payload (length bytes)
//! ```
//!
//! All header fields are big-endian.

use std::io::{Read, Write};
use thiserror::Error;

pub const MAGIC: u32 = 0x4652_4543;
pub const HEADER_LEN: usize = 10;
pub const MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),
    #[error("payload of {0} bytes exceeds the 1 MiB limit")]
    PayloadTooLarge(usize),
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("unexpected {actual} message, wanted {expected}")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

macro_rules! message_types {
    ($($name:ident = $code:literal => $label:literal,)*) => {
        /// Message type codes. Requests are 0x00xx, responses 0x10xx,
        /// stream records 0x20xx and events 0x30xx.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum MessageType {
            $($name = $code,)*
        }

        impl MessageType {
            /// Unrecognized codes map to [`MessageType::Unknown`].
            pub fn from_code(code: u16) -> Self {
                match code {
                    $($code => Self::$name,)*
                    _ => Self::Unknown,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $label,)*
                }
            }
        }
    };
}

message_types! {
    CameraOn = 0x0001 => "REQ_CAMERA_ON",
    CameraOff = 0x0002 => "REQ_CAMERA_OFF",
    Capture = 0x0003 => "REQ_CAPTURE",
    Train = 0x0004 => "REQ_TRAIN",
    Status = 0x0005 => "REQ_STATUS",
    StreamStart = 0x0006 => "REQ_STREAM_START",
    StreamStop = 0x0007 => "REQ_STREAM_STOP",
    DeletePerson = 0x0008 => "REQ_DELETE_PERSON",
    ListPersons = 0x0009 => "REQ_LIST_PERSONS",
    GetSettings = 0x000A => "REQ_GET_SETTINGS",
    SetSettings = 0x000B => "REQ_SET_SETTINGS",
    Success = 0x1001 => "RESP_SUCCESS",
    Error = 0x1002 => "RESP_ERROR",
    StatusReport = 0x1003 => "RESP_STATUS",
    PersonList = 0x1004 => "RESP_PERSON_LIST",
    Settings = 0x1005 => "RESP_SETTINGS",
    FaceDetected = 0x2001 => "STREAM_FACE_DETECTED",
    NoFace = 0x2002 => "STREAM_NO_FACE",
    MultipleFaces = 0x2003 => "STREAM_MULTIPLE_FACES",
    TrainingStarted = 0x3001 => "EVENT_TRAINING_STARTED",
    TrainingProgress = 0x3002 => "EVENT_TRAINING_PROGRESS",
    TrainingCompleted = 0x3003 => "EVENT_TRAINING_COMPLETED",
    TrainingFailed = 0x3004 => "EVENT_TRAINING_FAILED",
    CameraError = 0x3005 => "EVENT_CAMERA_ERROR",
    Unknown = 0xFFFF => "UNKNOWN",
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_request(self) -> bool {
        self.code() < 0x1000
    }
}

/// Numeric error codes carried by `RESP_ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Unknown = 1,
    InvalidMessage = 2,
    CameraNotRunning = 10,
    CameraAlreadyRunning = 11,
    CameraDeviceError = 12,
    CaptureFailed = 20,
    NoFaceDetected = 21,
    EmbeddingFailed = 22,
    RegistrationFailed = 23,
    TrainingInProgress = 30,
    TrainingFailed = 31,
    PersonNotFound = 40,
    InvalidParameters = 50,
    DatabaseError = 60,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Success,
            2 => Self::InvalidMessage,
            10 => Self::CameraNotRunning,
            11 => Self::CameraAlreadyRunning,
            12 => Self::CameraDeviceError,
            20 => Self::CaptureFailed,
            21 => Self::NoFaceDetected,
            22 => Self::EmbeddingFailed,
            23 => Self::RegistrationFailed,
            30 => Self::TrainingInProgress,
            31 => Self::TrainingFailed,
            40 => Self::PersonNotFound,
            50 => Self::InvalidParameters,
            60 => Self::DatabaseError,
            _ => Self::Unknown,
        }
    }
}

/// One framed message. `payload.len()` is the header length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&self.msg_type.code().to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one message from the front of `bytes`. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            })?;
        let (msg_type, length) = parse_header(header)?;
        let payload = bytes
            .get(HEADER_LEN..HEADER_LEN + length)
            .ok_or(ProtocolError::Truncated {
                needed: HEADER_LEN + length,
                available: bytes.len(),
            })?;
        Ok(Self::new(msg_type, payload.to_vec()))
    }
}

/// True when `bytes` start with the FREC magic.
pub fn starts_with_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == MAGIC.to_be_bytes()
}

/// Validate a header and return the type and payload length.
/// The magic is checked before anything else is interpreted.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(MessageType, usize), ProtocolError> {
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let code = u16::from_be_bytes([header[4], header[5]]);
    let length = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(length));
    }
    Ok((MessageType::from_code(code), length))
}

/// Read one message. `prefix` holds bytes already consumed from the stream
/// (for instance during protocol detection); the rest is read from `reader`.
/// Returns the message and how many prefix bytes it used. Prefix bytes past
/// that point belong to the next message.
pub fn read_message_with_prefix<R: Read>(prefix: &[u8], reader: &mut R) -> Result<(Message, usize), ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    let from_prefix = prefix.len().min(HEADER_LEN);
    header[..from_prefix].copy_from_slice(&prefix[..from_prefix]);
    reader.read_exact(&mut header[from_prefix..])?;

    let (msg_type, length) = parse_header(&header)?;

    let mut payload = vec![0u8; length];
    let leftover = &prefix[from_prefix..];
    let take = leftover.len().min(length);
    payload[..take].copy_from_slice(&leftover[..take]);
    reader.read_exact(&mut payload[take..])?;

    Ok((Message::new(msg_type, payload), from_prefix + take))
}

pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    read_message_with_prefix(&[], reader).map(|(message, _)| message)
}

pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    if message.payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(message.payload.len()));
    }
    writer.write_all(&message.encode())?;
    writer.flush()?;
    Ok(())
}
