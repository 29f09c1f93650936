//! Blocking client for the control socket.

use crate::message::{read_message, write_message, Message, MessageType, ProtocolError};
use crate::types::{Payload, Response, StreamRecord};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server closed the connection")]
    Closed,
}

pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "connected to control socket");
        Ok(Self { stream })
    }

    /// Applies to every subsequent read. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send one binary request and read its response.
    pub fn request(&mut self, request: &Message) -> Result<Response, ClientError> {
        write_message(&mut self.stream, request)?;
        let reply = read_message(&mut self.stream)?;
        tracing::debug!(request = ?request.msg_type, reply = ?reply.msg_type, len = reply.payload.len(), "binary exchange");
        Ok(Response::from_message(&reply)?)
    }

    pub fn request_empty(&mut self, msg_type: MessageType) -> Result<Response, ClientError> {
        self.request(&Message::empty(msg_type))
    }

    pub fn request_with<P: Payload>(&mut self, msg_type: MessageType, payload: P) -> Result<Response, ClientError> {
        self.request(&payload.into_message(msg_type))
    }

    /// Send a text command (`status`, `capture:A:1`, ...) and return the reply
    /// line without its newline.
    pub fn text(self, command: &str) -> Result<String, ClientError> {
        let mut stream = self.stream;
        stream.write_all(command.as_bytes())?;
        stream.flush()?;
        let mut line = String::new();
        if BufReader::new(stream).read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Open a binary recognition stream. The server's initial reply is
    /// returned alongside the stream so callers can report a refusal.
    pub fn open_stream(mut self) -> Result<(Response, RecordStream), ClientError> {
        let first = self.request_empty(MessageType::StreamStart)?;
        Ok((first, RecordStream { stream: self.stream }))
    }
}

/// Records arriving on an open binary stream.
pub struct RecordStream {
    stream: UnixStream,
}

impl RecordStream {
    pub fn next_record(&mut self) -> Result<StreamRecord, ClientError> {
        let msg = read_message(&mut self.stream).map_err(|e| match e {
            ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => ClientError::Closed,
            other => other.into(),
        })?;
        Ok(StreamRecord::from_message(&msg)?)
    }
}

impl Iterator for RecordStream {
    type Item = Result<StreamRecord, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Err(ClientError::Closed) => None,
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NoFace, Text};
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_request_and_stream_against_fake_server() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frec.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let req = read_message(&mut conn).unwrap();
            assert_eq!(req.msg_type, MessageType::Status);
            write_message(&mut conn, &Text("pong".into()).into_message(MessageType::Success)).unwrap();

            let (mut conn, _) = listener.accept().unwrap();
            let req = read_message(&mut conn).unwrap();
            assert_eq!(req.msg_type, MessageType::StreamStart);
            write_message(&mut conn, &Response::Success("Stream started".into()).to_message()).unwrap();
            for ts in [1, 2] {
                write_message(&mut conn, &StreamRecord::NoFace(NoFace { timestamp_ms: ts }).to_message()).unwrap();
            }
        });

        let mut client = Client::connect(&path).unwrap();
        assert_eq!(
            client.request_empty(MessageType::Status).unwrap(),
            Response::Success("pong".into())
        );

        let (first, stream) = Client::connect(&path).unwrap().open_stream().unwrap();
        assert!(first.is_success());
        let records: Vec<StreamRecord> = stream.map(Result::unwrap).collect();
        assert_eq!(
            records,
            vec![
                StreamRecord::NoFace(NoFace { timestamp_ms: 1 }),
                StreamRecord::NoFace(NoFace { timestamp_ms: 2 }),
            ]
        );
        server.join().unwrap();
    }

    #[test]
    fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Client::connect(dir.path().join("absent.sock")),
            Err(ClientError::Connect { .. })
        ));
    }
}
