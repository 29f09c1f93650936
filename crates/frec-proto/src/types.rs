//! Typed payloads for every FREC message, plus their text-protocol renderings.

use crate::message::{ErrorCode, Message, MessageType, ProtocolError};
use crate::payload::{PayloadReader, PayloadWriter};
use serde::{Deserialize, Serialize};

/// A message body that can be written to and read from a payload buffer.
pub trait Payload: Sized {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter;
    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError>;

    fn to_bytes(&self) -> Vec<u8> {
        self.encode(PayloadWriter::new()).finish()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(&mut PayloadReader::new(bytes))
    }

    fn into_message(self, msg_type: MessageType) -> Message {
        Message::new(msg_type, self.to_bytes())
    }
}

impl Message {
    /// Decode the payload as `P`, checking the type code first.
    pub fn parse<P: Payload>(&self, expected: MessageType) -> Result<P, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedType {
                expected: expected.name(),
                actual: self.msg_type.name(),
            });
        }
        P::from_bytes(&self.payload)
    }
}

/// A bare string payload (`RESP_SUCCESS`, `EVENT_TRAINING_FAILED`, `EVENT_CAMERA_ERROR`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl Payload for Text {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.string(&self.0)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self(r.string()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub initial: String,
    pub person_id: u64,
}

impl Payload for CaptureRequest {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.string(&self.initial).u64(self.person_id)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            initial: r.string()?,
            person_id: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePersonRequest {
    pub name: String,
}

impl Payload for DeletePersonRequest {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.string(&self.name)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self { name: r.string()? })
    }
}

/// Runtime-tunable recognition settings. Used by both `REQ_SET_SETTINGS`
/// and `RESP_SETTINGS`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub similarity_threshold: f32,
    pub recognition_interval_ms: u32,
    pub auto_train: bool,
}

impl Settings {
    pub fn to_text(&self) -> String {
        format!(
            "similarity_threshold:{:.2},recognition_interval_ms:{},auto_train:{}",
            self.similarity_threshold, self.recognition_interval_ms, self.auto_train
        )
    }
}

impl Payload for Settings {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.f32(self.similarity_threshold)
            .u32(self.recognition_interval_ms)
            .bool(self.auto_train)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            similarity_threshold: r.f32()?,
            recognition_interval_ms: r.u32()?,
            auto_train: r.bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub camera_running: bool,
    pub recognition_enabled: bool,
    pub training_in_progress: bool,
    pub people_count: u32,
    pub total_faces: u32,
    pub fps: f32,
}

impl StatusReport {
    /// `camera_running:true,recognition_enabled:false,...` as sent after `OK:`.
    pub fn to_text(&self) -> String {
        format!(
            "camera_running:{},recognition_enabled:{},training_in_progress:{},people_count:{},total_faces:{}",
            self.camera_running,
            self.recognition_enabled,
            self.training_in_progress,
            self.people_count,
            self.total_faces
        )
    }
}

impl Payload for StatusReport {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.bool(self.camera_running)
            .bool(self.recognition_enabled)
            .bool(self.training_in_progress)
            .u32(self.people_count)
            .u32(self.total_faces)
            .f32(self.fps)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            camera_running: r.bool()?,
            recognition_enabled: r.bool()?,
            training_in_progress: r.bool()?,
            people_count: r.u32()?,
            total_faces: r.u32()?,
            fps: r.f32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonInfo {
    pub name: String,
    pub id: u32,
    pub image_count: u32,
    /// Milliseconds since the Unix epoch.
    pub created_timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonList {
    pub persons: Vec<PersonInfo>,
}

impl PersonList {
    /// `<count>,name1,name2,...`
    pub fn to_text(&self) -> String {
        let mut out = self.persons.len().to_string();
        for p in &self.persons {
            out.push(',');
            out.push_str(&p.name);
        }
        out
    }
}

impl Payload for PersonList {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        let mut w = w.u32(self.persons.len() as u32);
        for p in &self.persons {
            w = w.string(&p.name).u32(p.id).u32(p.image_count).u64(p.created_timestamp);
        }
        w
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let count = r.u32()? as usize;
        // Each record is at least 20 bytes; don't trust `count` for the allocation.
        let mut persons = Vec::with_capacity(count.min(r.remaining() / 20));
        for _ in 0..count {
            persons.push(PersonInfo {
                name: r.string()?,
                id: r.u32()?,
                image_count: r.u32()?,
                created_timestamp: r.u64()?,
            });
        }
        Ok(Self { persons })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl Payload for ErrorResponse {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.u32(self.code.code()).string(&self.message)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            code: ErrorCode::from_code(r.u32()?),
            message: r.string()?,
        })
    }
}

/// One recognized (or unknown) face in a stream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub name: String,
    pub confidence: f32,
    pub timestamp_ms: u64,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl FaceDetection {
    /// `FACE:<name>:<confidence percent>:<timestamp ms>`
    pub fn to_text(&self) -> String {
        format!(
            "FACE:{}:{}:{}",
            self.name,
            (self.confidence * 100.0).round() as i32,
            self.timestamp_ms
        )
    }
}

impl Payload for FaceDetection {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.string(&self.name)
            .f32(self.confidence)
            .u64(self.timestamp_ms)
            .u16(self.x)
            .u16(self.y)
            .u16(self.width)
            .u16(self.height)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: r.string()?,
            confidence: r.f32()?,
            timestamp_ms: r.u64()?,
            x: r.u16()?,
            y: r.u16()?,
            width: r.u16()?,
            height: r.u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFace {
    pub timestamp_ms: u64,
}

impl Payload for NoFace {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.u64(self.timestamp_ms)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            timestamp_ms: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipleFaces {
    pub faces: Vec<FaceDetection>,
}

impl Payload for MultipleFaces {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        let w = w.u32(self.faces.len() as u32);
        self.faces.iter().fold(w, |w, face| face.encode(w))
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let count = r.u32()? as usize;
        let mut faces = Vec::with_capacity(count.min(r.remaining() / 24));
        for _ in 0..count {
            faces.push(FaceDetection::decode(r)?);
        }
        Ok(Self { faces })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingProgress {
    pub current: u32,
    pub total: u32,
    pub message: String,
}

impl Payload for TrainingProgress {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.u32(self.current).u32(self.total).string(&self.message)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            current: r.u32()?,
            total: r.u32()?,
            message: r.string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingCompleted {
    pub identities: u32,
    pub images: u32,
}

impl Payload for TrainingCompleted {
    fn encode(&self, w: PayloadWriter) -> PayloadWriter {
        w.u32(self.identities).u32(self.images)
    }

    fn decode(r: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            identities: r.u32()?,
            images: r.u32()?,
        })
    }
}

/// Anything a request handler can answer with.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(String),
    Error(ErrorResponse),
    Status(StatusReport),
    PersonList(PersonList),
    Settings(Settings),
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse::new(code, message))
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error(_))
    }

    pub fn to_message(&self) -> Message {
        match self {
            Self::Success(text) => Message::new(MessageType::Success, Text(text.clone()).to_bytes()),
            Self::Error(e) => Message::new(MessageType::Error, e.to_bytes()),
            Self::Status(s) => Message::new(MessageType::StatusReport, s.to_bytes()),
            Self::PersonList(p) => Message::new(MessageType::PersonList, p.to_bytes()),
            Self::Settings(s) => Message::new(MessageType::Settings, s.to_bytes()),
        }
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let bytes = msg.payload.as_slice();
        Ok(match msg.msg_type {
            MessageType::Success => Self::Success(Text::from_bytes(bytes)?.0),
            MessageType::Error => Self::Error(ErrorResponse::from_bytes(bytes)?),
            MessageType::StatusReport => Self::Status(StatusReport::from_bytes(bytes)?),
            MessageType::PersonList => Self::PersonList(PersonList::from_bytes(bytes)?),
            MessageType::Settings => Self::Settings(Settings::from_bytes(bytes)?),
            other => {
                return Err(ProtocolError::UnexpectedType {
                    expected: "response",
                    actual: other.name(),
                })
            }
        })
    }

    /// `OK:<message>` or `ERROR:<message>`, without the trailing newline.
    pub fn to_text(&self) -> String {
        match self {
            Self::Success(text) => format!("OK:{text}"),
            Self::Error(e) => format!("ERROR:{}", e.message),
            Self::Status(s) => format!("OK:{}", s.to_text()),
            Self::PersonList(p) => format!("OK:{}", p.to_text()),
            Self::Settings(s) => format!("OK:{}", s.to_text()),
        }
    }
}

/// Records pushed to a client after a stream has been opened.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Face(FaceDetection),
    NoFace(NoFace),
    MultipleFaces(MultipleFaces),
    TrainingStarted,
    TrainingProgress(TrainingProgress),
    TrainingCompleted(TrainingCompleted),
    TrainingFailed(String),
    CameraError(String),
}

impl StreamRecord {
    pub fn to_message(&self) -> Message {
        match self {
            Self::Face(f) => Message::new(MessageType::FaceDetected, f.to_bytes()),
            Self::NoFace(n) => Message::new(MessageType::NoFace, n.to_bytes()),
            Self::MultipleFaces(m) => Message::new(MessageType::MultipleFaces, m.to_bytes()),
            Self::TrainingStarted => Message::empty(MessageType::TrainingStarted),
            Self::TrainingProgress(p) => Message::new(MessageType::TrainingProgress, p.to_bytes()),
            Self::TrainingCompleted(c) => Message::new(MessageType::TrainingCompleted, c.to_bytes()),
            Self::TrainingFailed(m) => Message::new(MessageType::TrainingFailed, Text(m.clone()).to_bytes()),
            Self::CameraError(m) => Message::new(MessageType::CameraError, Text(m.clone()).to_bytes()),
        }
    }

    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let bytes = msg.payload.as_slice();
        Ok(match msg.msg_type {
            MessageType::FaceDetected => Self::Face(FaceDetection::from_bytes(bytes)?),
            MessageType::NoFace => Self::NoFace(NoFace::from_bytes(bytes)?),
            MessageType::MultipleFaces => Self::MultipleFaces(MultipleFaces::from_bytes(bytes)?),
            MessageType::TrainingStarted => Self::TrainingStarted,
            MessageType::TrainingProgress => Self::TrainingProgress(TrainingProgress::from_bytes(bytes)?),
            MessageType::TrainingCompleted => Self::TrainingCompleted(TrainingCompleted::from_bytes(bytes)?),
            MessageType::TrainingFailed => Self::TrainingFailed(Text::from_bytes(bytes)?.0),
            MessageType::CameraError => Self::CameraError(Text::from_bytes(bytes)?.0),
            other => {
                return Err(ProtocolError::UnexpectedType {
                    expected: "stream record",
                    actual: other.name(),
                })
            }
        })
    }

    /// Text-protocol line, without the trailing newline. Only face records
    /// have a text form; events are binary-only.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Face(f) => Some(f.to_text()),
            Self::NoFace(n) => Some(format!("NO_FACE:{}", n.timestamp_ms)),
            Self::MultipleFaces(m) => {
                let lines: Vec<String> = m.faces.iter().map(FaceDetection::to_text).collect();
                Some(lines.join("\n"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(name: &str, confidence: f32) -> FaceDetection {
        FaceDetection {
            name: name.into(),
            confidence,
            timestamp_ms: 1_700_000_000_123,
            x: 10,
            y: 20,
            width: 90,
            height: 100,
        }
    }

    #[test]
    fn test_capture_request_layout() {
        let req = CaptureRequest {
            initial: "A".into(),
            person_id: 7,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 1, b'A', 0, 0, 0, 0, 0, 0, 0, 7]);
        let msg = req.clone().into_message(MessageType::Capture);
        assert_eq!(msg.parse::<CaptureRequest>(MessageType::Capture).unwrap(), req);
    }

    #[test]
    fn test_parse_checks_type() {
        let msg = Message::empty(MessageType::Status);
        assert!(matches!(
            msg.parse::<DeletePersonRequest>(MessageType::DeletePerson),
            Err(ProtocolError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_status_text_and_binary() {
        let status = StatusReport {
            camera_running: true,
            recognition_enabled: false,
            training_in_progress: false,
            people_count: 3,
            total_faces: 12,
            fps: 29.5,
        };
        assert_eq!(
            Response::Status(status.clone()).to_text(),
            "OK:camera_running:true,recognition_enabled:false,training_in_progress:false,people_count:3,total_faces:12"
        );
        let msg = Response::Status(status.clone()).to_message();
        assert_eq!(msg.payload.len(), 3 + 4 + 4 + 4);
        assert_eq!(Response::from_message(&msg).unwrap(), Response::Status(status));
    }

    #[test]
    fn test_person_list() {
        let list = PersonList {
            persons: vec![
                PersonInfo {
                    name: "A1".into(),
                    id: 1,
                    image_count: 3,
                    created_timestamp: 5,
                },
                PersonInfo {
                    name: "B2".into(),
                    id: 2,
                    image_count: 0,
                    created_timestamp: 6,
                },
            ],
        };
        assert_eq!(list.to_text(), "2,A1,B2");
        assert_eq!(PersonList::default().to_text(), "0");
        assert_eq!(PersonList::from_bytes(&list.to_bytes()).unwrap(), list);
    }

    #[test]
    fn test_person_list_lying_count() {
        let bytes = PayloadWriter::new().u32(u32::MAX).finish();
        assert!(PersonList::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_error_response() {
        let resp = Response::error(ErrorCode::TrainingInProgress, "Training already in progress");
        assert_eq!(resp.to_text(), "ERROR:Training already in progress");
        assert!(!resp.is_success());
        let msg = resp.to_message();
        assert_eq!(msg.msg_type, MessageType::Error);
        assert_eq!(&msg.payload[..4], &[0, 0, 0, 30]);
        assert_eq!(Response::from_message(&msg).unwrap(), resp);
    }

    #[test]
    fn test_face_record_text() {
        assert_eq!(face("A1", 0.873).to_text(), "FACE:A1:87:1700000000123");
        assert_eq!(
            StreamRecord::NoFace(NoFace { timestamp_ms: 42 }).to_text().as_deref(),
            Some("NO_FACE:42")
        );
        assert_eq!(StreamRecord::TrainingStarted.to_text(), None);
    }

    #[test]
    fn test_stream_records_decode() {
        let records = vec![
            StreamRecord::Face(face("Unknown", 0.0)),
            StreamRecord::MultipleFaces(MultipleFaces {
                faces: vec![face("A1", 0.9), face("B2", 0.8)],
            }),
            StreamRecord::TrainingStarted,
            StreamRecord::TrainingProgress(TrainingProgress {
                current: 1,
                total: 4,
                message: "A1".into(),
            }),
            StreamRecord::TrainingCompleted(TrainingCompleted {
                identities: 2,
                images: 8,
            }),
            StreamRecord::CameraError("unplugged".into()),
        ];
        for record in records {
            assert_eq!(StreamRecord::from_message(&record.to_message()).unwrap(), record);
        }
        assert!(StreamRecord::from_message(&Message::empty(MessageType::Status)).is_err());
    }

    #[test]
    fn test_settings_text() {
        let s = Settings {
            similarity_threshold: 0.7,
            recognition_interval_ms: 1500,
            auto_train: true,
        };
        assert_eq!(
            Response::Settings(s).to_text(),
            "OK:similarity_threshold:0.70,recognition_interval_ms:1500,auto_train:true"
        );
    }
}
