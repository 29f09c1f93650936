//! Unix-socket control server.
//!
//! Every connection is sniffed on its first read: a `FREC` magic selects the
//! binary protocol, anything else is a text command line. Both protocols
//! dispatch through the same command table; binary requests are mapped onto
//! the text command names before lookup.

use frec_proto::{
    read_message_with_prefix, starts_with_magic, write_message, CaptureRequest, DeletePersonRequest, ErrorCode,
    Message, MessageType, Payload, ProtocolError, Response, Settings, StreamRecord, MAGIC,
};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

const READ_BUFFER: usize = 4096;
const BUSY_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
pub const STREAM_COMMAND: &str = "stream_recognition";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,
    #[error("cannot bind {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to spawn accept thread: {0}")]
    Spawn(io::Error),
}

/// A failed command, carrying the binary error code and the text message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<HandlerError> for Response {
    fn from(e: HandlerError) -> Self {
        Response::error(e.code, e.message)
    }
}

pub type CommandFn = dyn Fn(&[String]) -> Result<Response, HandlerError> + Send + Sync;
pub type StreamFn = dyn Fn(&mut StreamSession<'_>) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Text,
    Binary,
}

/// Write side of an open stream, in whichever protocol the client spoke.
pub struct StreamSession<'a> {
    stream: &'a mut UnixStream,
    protocol: Protocol,
    running: &'a AtomicBool,
}

impl StreamSession<'_> {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// False once the server is stopping.
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True when the client hung up or sent anything (taken as a stop
    /// request). Never blocks.
    pub fn client_done(&mut self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut buf = [0u8; 64];
        let done = match self.stream.read(&mut buf) {
            Ok(_) => true,
            Err(e) => e.kind() != io::ErrorKind::WouldBlock,
        };
        let _ = self.stream.set_nonblocking(false);
        done
    }

    /// Send one record. Records with no text form are skipped on text
    /// streams. An error means the client is gone.
    pub fn send(&mut self, record: &StreamRecord) -> io::Result<()> {
        match self.protocol {
            Protocol::Binary => write_message(&mut *self.stream, &record.to_message()).map_err(|e| match e {
                ProtocolError::Io(io) => io,
                other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
            }),
            Protocol::Text => match record.to_text() {
                Some(line) => {
                    self.stream.write_all(line.as_bytes())?;
                    self.stream.write_all(b"\n")?;
                    self.stream.flush()
                }
                None => Ok(()),
            },
        }
    }
}

#[derive(Default, Clone)]
struct Registry {
    commands: HashMap<String, Arc<CommandFn>>,
    streams: HashMap<String, Arc<StreamFn>>,
}

struct Shared {
    registry: Arc<Registry>,
    running: AtomicBool,
    connections: AtomicUsize,
    max_connections: usize,
    read_timeout: Duration,
}

pub struct ControlServer {
    socket_path: PathBuf,
    registry: Arc<Registry>,
    max_connections: usize,
    read_timeout: Duration,
    shared: Option<Arc<Shared>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ControlServer {
    pub fn new(socket_path: impl Into<PathBuf>, max_connections: usize, read_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            registry: Arc::default(),
            max_connections: max_connections.max(1),
            read_timeout,
            shared: None,
            accept_thread: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Register a request/response command. Names are matched lower-cased.
    /// Registrations made while running take effect on the next `start()`.
    pub fn register_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[String]) -> Result<Response, HandlerError> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry)
            .commands
            .insert(name.to_lowercase(), Arc::new(handler));
    }

    /// Register a command that keeps the connection open and pushes records.
    pub fn register_streaming_command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut StreamSession<'_>) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.registry)
            .streams
            .insert(name.to_lowercase(), Arc::new(handler));
    }

    pub fn is_running(&self) -> bool {
        self.shared.as_ref().is_some_and(|s| s.running.load(Ordering::SeqCst))
    }

    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        remove_stale_socket(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path).map_err(|source| ServerError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;

        let shared = Arc::new(Shared {
            registry: Arc::clone(&self.registry),
            running: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            max_connections: self.max_connections,
            read_timeout: self.read_timeout,
        });

        let accept_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("frec-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))
            .map_err(|e| {
                shared.running.store(false, Ordering::SeqCst);
                ServerError::Spawn(e)
            })?;

        *self.accept_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.shared = Some(shared);
        tracing::info!(path = %self.socket_path.display(), "control server listening");
        Ok(())
    }

    /// Stop accepting, wake and join the accept thread, remove the socket.
    /// Open streams notice on their next tick. Idempotent.
    pub fn stop(&self) {
        let Some(shared) = &self.shared else {
            return;
        };
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept().
        let _ = UnixStream::connect(&self.socket_path);
        let handle = self.accept_thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("accept thread panicked");
            }
        }
        remove_stale_socket(&self.socket_path);
        tracing::info!("control server stopped");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove socket file"),
    }
}

/// Decrements the live connection count when the connection thread ends.
struct ConnectionSlot(Arc<Shared>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_loop(listener: UnixListener, shared: Arc<Shared>) {
    for conn in listener.incoming() {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        if shared.connections.fetch_add(1, Ordering::SeqCst) >= shared.max_connections {
            shared.connections.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(max = shared.max_connections, "connection limit reached, rejecting client");
            reject_busy(stream);
            continue;
        }

        let slot = ConnectionSlot(Arc::clone(&shared));
        let spawned = std::thread::Builder::new()
            .name("frec-conn".into())
            .spawn(move || {
                let shared = Arc::clone(&slot.0);
                if let Err(e) = handle_connection(stream, &shared) {
                    tracing::debug!(error = %e, "connection ended with error");
                }
                drop(slot);
            });
        if let Err(e) = spawned {
            // The closure, and with it the slot, was dropped.
            tracing::error!(error = %e, "failed to spawn connection thread");
        }
    }
    tracing::debug!("accept loop exiting");
}

fn reject_busy(mut stream: UnixStream) {
    let _ = stream.set_read_timeout(Some(BUSY_PROBE_TIMEOUT));
    let mut buf = [0u8; READ_BUFFER];
    let n = stream.read(&mut buf).unwrap_or(0);
    let reply = Response::error(ErrorCode::Unknown, "Server busy");
    let _ = if starts_with_magic(&buf[..n]) {
        write_message(&mut stream, &reply.to_message()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    } else {
        stream.write_all(format!("{}\n", reply.to_text()).as_bytes())
    };
}

/// First read of a connection. A short read that could still be the start
/// of the magic is topped up until four bytes are available.
fn read_first(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut n = stream.read(&mut buf)?;
    let magic = MAGIC.to_be_bytes();
    while n > 0 && n < magic.len() && buf[..n] == magic[..n] {
        let more = stream.read(&mut buf[n..])?;
        if more == 0 {
            break;
        }
        n += more;
    }
    buf.truncate(n);
    Ok(buf)
}

fn handle_connection(mut stream: UnixStream, shared: &Shared) -> io::Result<()> {
    stream.set_read_timeout(Some(shared.read_timeout))?;
    let first = read_first(&mut stream)?;
    if first.is_empty() {
        return Ok(());
    }
    if starts_with_magic(&first) {
        handle_binary(stream, first, shared)
    } else {
        handle_text(stream, &first, shared)
    }
}

fn handle_text(mut stream: UnixStream, first: &[u8], shared: &Shared) -> io::Result<()> {
    let line = String::from_utf8_lossy(first);
    let mut parts = line.trim().split(':');
    let command = parts.next().unwrap_or_default().trim().to_lowercase();
    let args: Vec<String> = parts.map(|s| s.trim().to_string()).collect();
    tracing::debug!(command = %command, args = args.len(), "text command");

    if let Some(handler) = shared.registry.streams.get(&command) {
        stream.write_all(b"OK:Stream started\n")?;
        run_stream(handler, &mut stream, Protocol::Text, shared);
        return Ok(());
    }

    let response = dispatch(shared, &command, &args);
    stream.write_all(response.to_text().as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

fn handle_binary(mut stream: UnixStream, mut pending: Vec<u8>, shared: &Shared) -> io::Result<()> {
    loop {
        let message = match read_message_with_prefix(&pending, &mut stream) {
            Ok((message, used)) => {
                pending.drain(..used);
                message
            }
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof && pending.is_empty() => {
                return Ok(());
            }
            Err(ProtocolError::Io(e)) if pending.is_empty() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "malformed binary message");
                let reply = Response::error(ErrorCode::InvalidMessage, e.to_string());
                let _ = write_message(&mut stream, &reply.to_message());
                return Ok(());
            }
        };
        tracing::debug!(msg_type = message.msg_type.name(), len = message.payload.len(), "binary request");

        if message.msg_type == MessageType::StreamStart {
            match shared.registry.streams.get(STREAM_COMMAND) {
                Some(handler) => {
                    send_reply(&mut stream, &Response::Success("Stream started".into()))?;
                    run_stream(handler, &mut stream, Protocol::Binary, shared);
                    return Ok(());
                }
                None => {
                    send_reply(&mut stream, &Response::error(ErrorCode::Unknown, "Streaming not available"))?;
                    continue;
                }
            }
        }

        let response = match binary_command(&message) {
            Ok(Some((command, args))) => dispatch(shared, command, &args),
            Ok(None) => Response::Success("Stream stop acknowledged".into()),
            Err(response) => response,
        };
        send_reply(&mut stream, &response)?;
    }
}

fn send_reply(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
    write_message(stream, &response.to_message()).map_err(|e| match e {
        ProtocolError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    })
}

/// Map a binary request onto a text command and its arguments.
/// `Ok(None)` is a stream-stop acknowledgement.
fn binary_command(message: &Message) -> Result<Option<(&'static str, Vec<String>)>, Response> {
    let invalid = |e: ProtocolError| Response::error(ErrorCode::InvalidMessage, e.to_string());
    let command = match message.msg_type {
        MessageType::CameraOn => {
            // An explicit `false` flag turns the camera off.
            if message.payload.first() == Some(&0) {
                ("camera_off", vec![])
            } else {
                ("camera_on", vec![])
            }
        }
        MessageType::CameraOff => ("camera_off", vec![]),
        MessageType::Capture => {
            let req = CaptureRequest::from_bytes(&message.payload).map_err(invalid)?;
            ("capture", vec![req.initial, req.person_id.to_string()])
        }
        MessageType::Train => ("train", vec![]),
        MessageType::Status => ("status", vec![]),
        MessageType::DeletePerson => {
            let req = DeletePersonRequest::from_bytes(&message.payload).map_err(invalid)?;
            ("delete", vec![req.name])
        }
        MessageType::ListPersons => ("list", vec![]),
        MessageType::GetSettings => ("settings", vec![]),
        MessageType::SetSettings => {
            let s = Settings::from_bytes(&message.payload).map_err(invalid)?;
            (
                "set_settings",
                vec![
                    s.similarity_threshold.to_string(),
                    s.recognition_interval_ms.to_string(),
                    (s.auto_train as u8).to_string(),
                ],
            )
        }
        MessageType::StreamStop => return Ok(None),
        other => {
            tracing::warn!(msg_type = other.name(), "unsupported binary message");
            return Err(Response::error(ErrorCode::Unknown, "Message type not supported"));
        }
    };
    Ok(Some(command))
}

fn dispatch(shared: &Shared, command: &str, args: &[String]) -> Response {
    let Some(handler) = shared.registry.commands.get(command) else {
        tracing::debug!(command, "unknown command");
        return Response::error(ErrorCode::Unknown, format!("Unknown command: {command}"));
    };
    match catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::info!(command, code = e.code.code(), error = %e.message, "command failed");
            e.into()
        }
        Err(panic) => {
            let what = panic_message(panic.as_ref());
            tracing::error!(command, panic = %what, "command handler panicked");
            Response::error(ErrorCode::Unknown, what)
        }
    }
}

fn run_stream(handler: &Arc<StreamFn>, stream: &mut UnixStream, protocol: Protocol, shared: &Shared) {
    let mut session = StreamSession {
        stream,
        protocol,
        running: &shared.running,
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&mut session))) {
        tracing::error!(panic = %panic_message(panic.as_ref()), "stream handler panicked");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "internal error".to_string())
}
