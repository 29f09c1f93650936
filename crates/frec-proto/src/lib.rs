//! frec-proto — Control protocol shared by the daemon and the CLI.
//!
//! Binary messages are framed with a `FREC` magic header (see [`message`]).
//! Clients that do not send the magic speak the line-based text protocol,
//! whose replies are produced by the `to_text` methods in [`types`].

pub mod client;
pub mod message;
pub mod payload;
pub mod types;

pub use client::{Client, ClientError, RecordStream};
pub use message::{
    read_message, read_message_with_prefix, starts_with_magic, write_message, ErrorCode, Message, MessageType,
    ProtocolError, HEADER_LEN, MAGIC, MAX_PAYLOAD,
};
pub use payload::{PayloadReader, PayloadWriter};
pub use types::{
    CaptureRequest, DeletePersonRequest, ErrorResponse, FaceDetection, MultipleFaces, NoFace, Payload, PersonInfo,
    PersonList, Response, Settings, StatusReport, StreamRecord, Text, TrainingCompleted, TrainingProgress,
};
