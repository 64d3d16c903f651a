//! # RPC transport
//!
//! All cross-side communication is request/response RPC over an
//! authenticated transport. The framework this crate is built
//! against only dials client-to-server; the two-way connector is what
//! gets both sides a channel to call the other.
//!
//! Wire framing: a 4-byte little-endian length prefix followed by a
//! bincode-encoded `Envelope`. Decoding a possibly-incomplete buffer
//! follows a `Partial`/`Complete` shape.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::FrameId;
use crate::qubit::Qubit;
use crate::reports::SystemParameters;

/// Status codes mapped from the nearest framework status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    OutOfRange,
    Aborted,
    FailedPrecondition,
    Unavailable,
    NotFound,
}

/// An RPC-level failure, as reported by the remote peer or synthesized
/// locally (e.g. on timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> RpcError {
        RpcError { code, message: message.into() }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for crate::error::Error {
    fn from(e: RpcError) -> Self {
        match e.code {
            StatusCode::InvalidArgument => crate::error::Error::ProtocolMismatch(e.message),
            StatusCode::Unavailable => crate::error::Error::PeerUnreachable(e.message),
            StatusCode::OutOfRange | StatusCode::FailedPrecondition | StatusCode::Aborted | StatusCode::NotFound => {
                crate::error::Error::Internal(e.message)
            }
            StatusCode::Ok => crate::error::Error::Internal("RpcError carried Ok status".into()),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Basis list for one frame, as exchanged during sifting.
pub type BasisList = Vec<u8>;

/// Every request any endpoint can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    SessionStarting { parameters: SystemParameters, initiator_addr: String },
    SessionEnding,

    ConnectToMe { my_address: String },

    SharePublicKey { algorithm_id: u8, public_key_bytes: Vec<u8>, token: Option<String> },

    GetAlignmentMarkers { frame_id: FrameId, marker_count: u32, send_all_basis: bool, idempotency_token: String },
    DiscardTransmissions { frame_id: FrameId, valid_slots: Vec<u32> },

    VerifyBases { sift_seq: u64, bases: HashMap<u64, BasisList> },

    /// Opaque parity-exchange payload for error correction.
    ErrorCorrectRound { sift_seq: u64, round: u32, payload: Vec<u8> },

    /// Opaque seed/parameter exchange for privacy amplification.
    PrivacyAmplifySeedExchange { sift_seq: u64, seed_material: Vec<u8> },

    /// Key-id confirmation when keys are released.
    ConfirmKeyId { key_id: u64 },
}

/// Every response any endpoint can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Empty,
    PublicKey { algorithm_id: u8, public_key_bytes: Vec<u8>, token: String },
    AlignmentMarkers { markers: HashMap<u32, Qubit> },
    SiftAnswers { answers: HashMap<u64, Vec<bool>> },
    ErrorCorrectRound { payload: Vec<u8>, converged: bool },
    PrivacyAmplifySeedAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Envelope {
    Request { id: u64, body: RpcRequest },
    Response { id: u64, body: RpcResult<RpcResponse> },
}

/// Result of attempting to decode one frame from a byte buffer that may
/// not yet hold a complete frame.
enum FrameStatus {
    Complete { consumed: usize, bytes: Vec<u8> },
    Partial,
}

const LEN_PREFIX: usize = 4;

fn try_decode_frame(buf: &[u8]) -> FrameStatus {
    if buf.len() < LEN_PREFIX {
        return FrameStatus::Partial;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < LEN_PREFIX + len {
        return FrameStatus::Partial;
    }
    FrameStatus::Complete {
        consumed: LEN_PREFIX + len,
        bytes: buf[LEN_PREFIX..LEN_PREFIX + len].to_vec(),
    }
}

fn encode_frame(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

fn read_one_frame(stream: &mut impl Read, scratch: &mut Vec<u8>) -> io::Result<Vec<u8>> {
    loop {
        match try_decode_frame(scratch) {
            FrameStatus::Complete { consumed, bytes } => {
                scratch.drain(..consumed);
                return Ok(bytes);
            }
            FrameStatus::Partial => {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf)?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection"));
                }
                scratch.extend_from_slice(&buf[..n]);
            }
        }
    }
}

/// Capability interface served on the responder side of a session RPC
///. A `Dispatcher` holds one
/// `Arc` per capability actually registered by the session controller;
/// unregistered capabilities answer `NotFound`.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: RpcRequest) -> RpcResult<RpcResponse>;
}

/// Dispatches incoming requests to whichever stage registered itself.
/// Exactly one handler is consulted per request: the first one present
/// is given the request, in the fixed order below. Stages register only
/// the capability they implement, so in practice each request type has
/// exactly one candidate handler.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<Mutex<Vec<Arc<dyn RequestHandler>>>>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    pub fn register(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn dispatch(&self, request: RpcRequest) -> RpcResult<RpcResponse> {
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            match handler.handle(request.clone()) {
                Err(e) if e.code == StatusCode::NotFound => continue,
                other => return other,
            }
        }
        Err(RpcError::new(StatusCode::NotFound, "no handler registered for this request"))
    }
}

struct PendingCall {
    tx: crossbeam_channel::Sender<RpcResult<RpcResponse>>,
}

/// A client-side channel to a peer: supports many concurrent outstanding
/// calls multiplexed over one TCP connection via a correlation id,
/// matching a real RPC channel's concurrency without needing one socket
/// per stage.
pub struct RpcChannel {
    writer: Mutex<TcpStream>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, PendingCall>>>,
    reader_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RpcChannel {
    /// Wrap an already-connected stream as a client channel. A
    /// background thread reads `Response` frames and wakes the matching
    /// `call` invocation; this channel never expects `Request` frames
    /// (the peer is purely a server on this connection).
    pub fn from_stream(stream: TcpStream) -> io::Result<Arc<RpcChannel>> {
        let reader_stream = stream.try_clone()?;
        let pending: Arc<Mutex<HashMap<u64, PendingCall>>> = Arc::new(Mutex::new(HashMap::new()));
        let channel = Arc::new(RpcChannel {
            writer: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            pending: Arc::clone(&pending),
            reader_thread: Mutex::new(None),
        });

        let reader_pending = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            let mut stream = reader_stream;
            let mut scratch = Vec::new();
            loop {
                let bytes = match read_one_frame(&mut stream, &mut scratch) {
                    Ok(b) => b,
                    Err(_) => break,
                };
                let envelope: Envelope = match bincode::deserialize(&bytes) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if let Envelope::Response { id, body } = envelope {
                    if let Some(call) = reader_pending.lock().unwrap().remove(&id) {
                        let _ = call.tx.send(body);
                    }
                }
            }
            // Connection closed: wake every still-pending caller with Unavailable.
            let mut pending = reader_pending.lock().unwrap();
            for (_, call) in pending.drain() {
                let _ = call.tx.send(Err(RpcError::new(StatusCode::Unavailable, "connection closed")));
            }
        });
        *channel.reader_thread.lock().unwrap() = Some(handle);

        Ok(channel)
    }

    pub fn connect(addr: &str, connect_timeout: Duration) -> io::Result<Arc<RpcChannel>> {
        let socket_addr = addr
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid peer address"))?;
        let stream = TcpStream::connect_timeout(&socket_addr, connect_timeout)?;
        RpcChannel::from_stream(stream)
    }

    /// Issue one RPC call, blocking the calling thread until the peer
    /// responds or `timeout` elapses.
    pub fn call(&self, request: RpcRequest, timeout: Duration) -> RpcResult<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.pending.lock().unwrap().insert(id, PendingCall { tx });

        let envelope = Envelope::Request { id, body: request };
        let bytes = bincode::serialize(&envelope)
            .map_err(|e| RpcError::new(StatusCode::InvalidArgument, format!("{}", e)))?;
        {
            let mut writer = self.writer.lock().unwrap();
            if writer.write_all(&encode_frame(&bytes)).is_err() {
                self.pending.lock().unwrap().remove(&id);
                return Err(RpcError::new(StatusCode::Unavailable, "failed to write request"));
            }
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(RpcError::new(StatusCode::Unavailable, "RPC timed out"))
            }
        }
    }
}

/// The server half: accepts connections and, for each request frame
/// received, dispatches to the registered `Dispatcher` and writes back a
/// `Response` frame. Each request is handled on its own thread so
/// independent frames can
/// proceed concurrently even within one connection.
pub struct RpcServer {
    local_addr: std::net::SocketAddr,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    should_stop: Arc<std::sync::atomic::AtomicBool>,
}

impl RpcServer {
    pub fn bind(bind_addr: &str, dispatcher: Dispatcher) -> io::Result<RpcServer> {
        let listener = std::net::TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;
        let should_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        listener.set_nonblocking(true)?;

        let stop_flag = Arc::clone(&should_stop);
        let accept_thread = thread::spawn(move || {
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let dispatcher = dispatcher.clone();
                        let stop_flag = Arc::clone(&stop_flag);
                        thread::spawn(move || serve_connection(stream, dispatcher, stop_flag));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(_) => return,
                }
            }
        });

        Ok(RpcServer {
            local_addr,
            accept_thread: Mutex::new(Some(accept_thread)),
            should_stop,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
    }
}

fn serve_connection(mut stream: TcpStream, dispatcher: Dispatcher, should_stop: Arc<std::sync::atomic::AtomicBool>) {
    let writer = Arc::new(Mutex::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    }));
    let mut scratch = Vec::new();
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));

    loop {
        if should_stop.load(Ordering::Relaxed) {
            return;
        }
        let bytes = match read_one_frame(&mut stream, &mut scratch) {
            Ok(b) => b,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(_) => return,
        };
        let envelope: Envelope = match bincode::deserialize(&bytes) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if let Envelope::Request { id, body } = envelope {
            let dispatcher = dispatcher.clone();
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                let result = dispatcher.dispatch(body);
                let response = Envelope::Response { id, body: result };
                if let Ok(bytes) = bincode::serialize(&response) {
                    let _ = writer.lock().unwrap().write_all(&encode_frame(&bytes));
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn handle(&self, request: RpcRequest) -> RpcResult<RpcResponse> {
            match request {
                RpcRequest::SessionEnding => Ok(RpcResponse::Empty),
                _ => Err(RpcError::new(StatusCode::NotFound, "unhandled")),
            }
        }
    }

    #[test]
    fn frame_roundtrip_with_partial_reads() {
        let bytes = b"hello rpc frame".to_vec();
        let frame = encode_frame(&bytes);
        // Split the frame into two halves to exercise the Partial path.
        let (first, second) = frame.split_at(frame.len() / 2);
        let mut buf = first.to_vec();
        match try_decode_frame(&buf) {
            FrameStatus::Partial => {}
            FrameStatus::Complete { .. } => panic!("expected partial"),
        }
        buf.extend_from_slice(second);
        match try_decode_frame(&buf) {
            FrameStatus::Complete { bytes: decoded, .. } => assert_eq!(decoded, bytes),
            FrameStatus::Partial => panic!("expected complete"),
        }
    }

    #[test]
    fn end_to_end_call_over_loopback() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(Arc::new(EchoHandler));
        let server = RpcServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().to_string();

        let channel = RpcChannel::connect(&addr, Duration::from_secs(1)).unwrap();
        let response = channel.call(RpcRequest::SessionEnding, Duration::from_secs(1)).unwrap();
        assert!(matches!(response, RpcResponse::Empty));
        server.stop();
    }

    #[test]
    fn dispatcher_returns_not_found_with_no_handlers() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.dispatch(RpcRequest::SessionEnding).unwrap_err();
        assert_eq!(err.code, StatusCode::NotFound);
    }
}
