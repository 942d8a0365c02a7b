//! Per-connection protocol engine and host-facing connection handle.
//!
//! One [`Connection`] exists per live WebSocket session, on either side of
//! the wire. Internally it is split along the ownership boundary the
//! threading model imposes:
//!
//! - The [`Engine`] runs the protocol: it consumes raw inbound bytes,
//!   drives the handshake, decodes frames, reassembles fragmented messages
//!   (with streaming UTF-8 validation for text), answers control frames,
//!   and emits a stream of [`Event`]s. It owns no I/O and is exercised by
//!   the worker thread only, which keeps it lock-free and directly
//!   testable.
//! - The [`Connection`] handle owns the shared pieces: the write half of
//!   the socket behind a mutex (one concurrent writer per connection), the
//!   connection state guarded by a mutex + condvar, and the close-request
//!   flag. Handles are cheap to clone and safe to use from any thread.
//!
//! The worker thread loops on a blocking read with a 300 ms timeout so it
//! can observe shutdown requests promptly, feeds the engine, and applies
//! the resulting events: socket writes, host callbacks, state changes.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    close::CloseCode,
    codec::{Decoder, Encoder},
    frame::{DataType, Frame, Message, OpCode, MAX_CONTROL_PAYLOAD},
    handshake::{self, ReplyCheck, ServerUpgrade},
    utf8::{Utf8State, Utf8Validator},
    Result, WebSocketError,
};

/// The maximum allowed payload size of a single inbound frame, 1 MiB.
///
/// Larger frames are rejected and the connection closes with code 1009.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed size of a reassembled message, 2 MiB.
///
/// A fragmented message growing past this limit closes the connection with
/// code 1009, bounding memory growth from hostile peers.
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Worker threads block in `read` for at most this long, so close requests
/// are observed within one cycle.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(300);

const READ_CHUNK: usize = 4096;

/// The role a connection takes.
///
/// The role decides the masking polarity: frames sent by a client are
/// masked, frames sent by a server are not, and inbound frames must show
/// the opposite of our own polarity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// The lifecycle state of a connection. Transitions are monotonic:
/// `Handshake` → `Connected` → `Closed`, or `Handshake` → `Closed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum State {
    Handshake,
    Connected,
    Closed,
}

/// Host callbacks bound to an endpoint.
///
/// One handler instance serves every connection of its endpoint; any
/// endpoint-wide context lives in the handler value itself. The per
/// connection context is the `Session` value returned by `on_open`, handed
/// back mutably to `on_message` and `on_close`.
///
/// All three callbacks run on the connection's worker thread. Within one
/// connection, `on_open` happens before any `on_message`, messages arrive
/// in wire order, and `on_close` is the final call — exactly once, and only
/// if `on_open` ran.
pub trait Handler: Send + Sync + 'static {
    /// Opaque per-connection value created on open.
    type Session: Send + 'static;

    /// The connection completed its handshake.
    fn on_open(&self, conn: &Connection) -> Self::Session;

    /// A complete message arrived. The message buffer is owned by the
    /// callback for the duration of the call; copy it to retain it.
    fn on_message(&self, conn: &Connection, session: &mut Self::Session, msg: Message);

    /// The connection reached its terminal state. No further callbacks
    /// follow and sends on the handle will fail.
    fn on_close(&self, conn: &Connection, session: &mut Self::Session);
}

/// Endpoint configuration.
///
/// The defaults implement the protocol limits and timeouts described in the
/// module documentation; hosts typically only reach for this to tighten the
/// size limits or to enable frame tracing.
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) max_payload_read: usize,
    pub(crate) max_read_buffer: usize,
    pub(crate) message_timeout: Duration,
    pub(crate) open_timeout: Duration,
    pub(crate) trace_frames: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: MAX_PAYLOAD_READ,
            max_read_buffer: MAX_READ_BUFFER,
            message_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            trace_frames: false,
        }
    }
}

impl Options {
    /// Caps the payload size of a single inbound frame. Default 1 MiB.
    pub fn with_max_payload_read(mut self, limit: usize) -> Self {
        self.max_payload_read = limit;
        self
    }

    /// Caps the size of a reassembled inbound message. Default 2 MiB.
    pub fn with_max_read_buffer(mut self, limit: usize) -> Self {
        self.max_read_buffer = limit;
        self
    }

    /// How long an incomplete inbound message may linger before the partial
    /// data is abandoned. Default 30 seconds.
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// How long `Client::open` waits for the handshake to complete.
    /// Default 30 seconds.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Logs every dispatched frame at debug level. Scoped to the endpoint
    /// this options value is passed to.
    pub fn with_trace_frames(mut self, enabled: bool) -> Self {
        self.trace_frames = enabled;
        self
    }
}

struct Shared {
    role: Role,
    /// Write half of the socket. The mutex is the single-writer contract:
    /// host sends and engine replies interleave whole frames, never bytes.
    transport: Mutex<TcpStream>,
    state: Mutex<State>,
    state_changed: Condvar,
    close_requested: AtomicBool,
    peer: Option<SocketAddr>,
}

/// Handle to a live WebSocket connection.
///
/// Handles are cheaply cloneable and may be used from any thread; a common
/// pattern is storing clones obtained in `on_open` in shared host state to
/// push messages from elsewhere. All sends are serialized per connection at
/// the transport layer.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(role: Role, write_half: TcpStream) -> Self {
        let peer = write_half.peer_addr().ok();
        Self {
            shared: Arc::new(Shared {
                role,
                transport: Mutex::new(write_half),
                state: Mutex::new(State::Handshake),
                state_changed: Condvar::new(),
                close_requested: AtomicBool::new(false),
                peer,
            }),
        }
    }

    /// The role of this connection.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The peer's socket address, if it was known at accept/connect time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    /// Whether the connection has completed its handshake and not yet
    /// closed.
    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Sends a complete text or binary message.
    ///
    /// Fails with [`WebSocketError::ConnectionClosed`] unless the connection
    /// is open; a transport failure also initiates connection teardown.
    pub fn send(&self, msg: Message) -> Result<()> {
        let opcode = match msg.data_type() {
            DataType::Text => OpCode::Text,
            DataType::Binary => OpCode::Binary,
        };
        self.send_data(opcode, true, msg.payload())
    }

    /// Starts a fragmented message. Follow up with
    /// [`Connection::send_fragment_cont`]; the message ends at the fragment
    /// sent with `fin == true`.
    pub fn send_fragment_start(&self, data_type: DataType, payload: &[u8]) -> Result<()> {
        let opcode = match data_type {
            DataType::Text => OpCode::Text,
            DataType::Binary => OpCode::Binary,
        };
        self.send_data(opcode, false, payload)
    }

    /// Continues a fragmented message started with
    /// [`Connection::send_fragment_start`].
    pub fn send_fragment_cont(&self, fin: bool, payload: &[u8]) -> Result<()> {
        self.send_data(OpCode::Continuation, fin, payload)
    }

    /// Sends a ping carrying up to 125 payload bytes. The peer is required
    /// to answer with a pong echoing the payload.
    pub fn ping(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.send_data(OpCode::Ping, true, payload)
    }

    /// Closes the connection with the given status code.
    ///
    /// A close frame is sent while the transport is still open, any partial
    /// inbound message is dropped, and the worker tears the connection down
    /// (firing `on_close` once) within one read cycle. Closing an already
    /// closed connection is a no-op.
    pub fn close(&self, code: CloseCode) {
        if self.state() == State::Closed {
            return;
        }
        let _ = self.write_frame(Frame::close(code, self.outbound_mask()));
        self.request_close();
    }

    fn send_data(&self, opcode: OpCode, fin: bool, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.write_frame(Frame::new(fin, opcode, self.outbound_mask(), payload))
    }

    fn outbound_mask(&self) -> Option<[u8; 4]> {
        match self.shared.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        }
    }

    pub(crate) fn write_frame(&self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        Encoder::encode(frame, &mut buf);
        self.write_all(&buf)
    }

    /// Writes raw bytes through the serialized transport. A failure is
    /// fatal for the connection: the worker is asked to tear down.
    pub(crate) fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut transport = self.shared.transport.lock().unwrap();
        if let Err(err) = transport.write_all(bytes) {
            drop(transport);
            log::error!("send failed on {} connection: {}", self.role(), err);
            self.request_close();
            return Err(err.into());
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> State {
        *self.shared.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.shared.state.lock().unwrap() = state;
        self.shared.state_changed.notify_all();
    }

    pub(crate) fn request_close(&self) {
        self.shared.close_requested.store(true, Ordering::Release);
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.shared.close_requested.load(Ordering::Acquire)
    }

    /// Blocks until the connection leaves the handshake state or the
    /// timeout elapses, returning the state observed last.
    pub(crate) fn wait_for_open(&self, timeout: Duration) -> State {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        while *state == State::Handshake {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        *state
    }

    pub(crate) fn shutdown_transport(&self) {
        let transport = self.shared.transport.lock().unwrap();
        let _ = transport.shutdown(Shutdown::Both);
    }

    /// Whether two handles refer to the same connection.
    pub(crate) fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("peer", &self.shared.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Actions the engine asks the worker to perform, in order.
pub(crate) enum Event {
    /// The handshake completed; mark the connection open and call
    /// `on_open`.
    Open,
    /// A complete message is ready for the host.
    Message(Message),
    /// Bytes to put on the wire (handshake reply, control replies, close
    /// frames).
    Write(Bytes),
    /// The engine reached its terminal state; tear the transport down.
    Shutdown,
}

/// Reassembly slot for a fragmented inbound message.
struct PartialMessage {
    data_type: DataType,
    payload: BytesMut,
    validator: Utf8Validator,
}

/// The per-connection protocol engine.
///
/// Purely computational: bytes in, events out. All I/O and callback
/// invocation happens in the worker loop.
pub(crate) struct Engine {
    role: Role,
    options: Options,
    phase: State,
    decoder: Decoder,
    partial: Option<PartialMessage>,
    /// Set while an inbound message is incomplete; exceeding the message
    /// timeout abandons the partial data.
    deadline: Option<Instant>,
    /// Client role only: the handshake nonce awaiting verification.
    nonce: Option<String>,
}

impl Engine {
    pub fn new(role: Role, options: Options, nonce: Option<String>) -> Self {
        let decoder = Decoder::new(options.max_payload_read);
        Self {
            role,
            options,
            phase: State::Handshake,
            decoder,
            partial: None,
            deadline: None,
            nonce,
        }
    }

    /// Consumes as much of `buf` as possible, appending resulting actions
    /// to `events`.
    pub fn ingest(&mut self, buf: &mut BytesMut, events: &mut Vec<Event>) {
        loop {
            match self.phase {
                State::Handshake => {
                    if !self.ingest_handshake(buf, events) {
                        return;
                    }
                }
                State::Connected => match self.decoder.decode(buf) {
                    Ok(Some(frame)) => {
                        if let Err(err) = self.dispatch(frame, events) {
                            log::error!("failing {} connection: {}", self.role, err);
                            self.close_with(close_code_for(&err), events);
                        }
                    }
                    Ok(None) => {
                        self.check_message_deadline(buf);
                        return;
                    }
                    Err(err) => {
                        log::error!("frame decode failed: {}", err);
                        self.close_with(close_code_for(&err), events);
                    }
                },
                State::Closed => {
                    buf.clear();
                    return;
                }
            }
        }
    }

    /// Periodic maintenance when no bytes arrived within a read cycle.
    pub fn tick(&mut self, buf: &mut BytesMut) {
        if self.phase == State::Connected {
            self.check_message_deadline(buf);
        }
    }

    /// Advances the handshake. Returns `true` if the connection opened and
    /// ingestion should continue with any pipelined frame bytes.
    fn ingest_handshake(&mut self, buf: &mut BytesMut, events: &mut Vec<Event>) -> bool {
        match self.role {
            Role::Server => match handshake::server_upgrade(buf) {
                ServerUpgrade::NeedMore => false,
                ServerUpgrade::NoKey { consumed } => {
                    buf.advance(consumed);
                    false
                }
                ServerUpgrade::Accept { response, consumed } => {
                    buf.advance(consumed);
                    events.push(Event::Write(Bytes::from(response)));
                    self.phase = State::Connected;
                    events.push(Event::Open);
                    true
                }
            },
            Role::Client => {
                let nonce = self.nonce.as_deref().unwrap_or_default();
                match handshake::check_reply(buf, nonce) {
                    ReplyCheck::NeedMore => false,
                    ReplyCheck::Mismatch { consumed } => {
                        buf.advance(consumed);
                        false
                    }
                    ReplyCheck::Ok { consumed } => {
                        buf.advance(consumed);
                        self.phase = State::Connected;
                        events.push(Event::Open);
                        true
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        // Masking polarity is checked up front for every inbound frame:
        // peers of a server must mask, peers of a client must not.
        let expect_masked = self.role == Role::Server;
        if frame.is_masked() != expect_masked {
            return Err(WebSocketError::MaskViolation);
        }

        if self.options.trace_frames {
            log::debug!(
                "{} << opcode={:?} fin={} len={}",
                self.role,
                frame.opcode,
                frame.fin,
                frame.payload.len()
            );
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => self.on_data(frame, events),
            OpCode::Continuation => self.on_continuation(frame, events),
            OpCode::Ping => {
                let pong = Frame::pong(frame.payload, self.outbound_mask());
                events.push(write_frame(pong));
                Ok(())
            }
            // Pongs are ignored; we track no outstanding pings.
            OpCode::Pong => Ok(()),
            OpCode::Close => self.on_close_frame(frame, events),
        }
    }

    fn on_data(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        if self.partial.is_some() {
            return Err(WebSocketError::InvalidFragment);
        }

        let data_type = if frame.opcode == OpCode::Text {
            DataType::Text
        } else {
            DataType::Binary
        };
        let mut partial = PartialMessage {
            data_type,
            payload: frame.payload,
            validator: Utf8Validator::new(),
        };
        if data_type == DataType::Text {
            check_text(partial.validator.advance(&partial.payload), frame.fin)?;
        }

        if frame.fin {
            self.deliver(partial, events);
        } else {
            self.partial = Some(partial);
            // The message-completion window opens at the first fragment.
            self.deadline = Some(Instant::now());
        }
        Ok(())
    }

    fn on_continuation(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let mut partial = self
            .partial
            .take()
            .ok_or(WebSocketError::InvalidContinuationFrame)?;

        if partial.payload.len() + frame.payload.len() > self.options.max_read_buffer {
            return Err(WebSocketError::FrameTooLarge);
        }
        partial.payload.extend_from_slice(&frame.payload);
        if partial.data_type == DataType::Text {
            check_text(partial.validator.advance(&frame.payload), frame.fin)?;
        }

        if frame.fin {
            self.deliver(partial, events);
        } else {
            self.partial = Some(partial);
        }
        Ok(())
    }

    fn on_close_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        match frame.payload.len() {
            // An empty close is a clean peer close; answer with 1000.
            0 => {
                self.close_with(CloseCode::Normal, events);
                Ok(())
            }
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                if !CloseCode::from(code).is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
                let mut validator = Utf8Validator::new();
                if validator.advance(&frame.payload[2..]) != Utf8State::Ok {
                    return Err(WebSocketError::InvalidUTF8);
                }

                // Echo the peer's payload back and finish the handshake.
                let reply = Frame::close_raw(frame.payload, self.outbound_mask());
                events.push(write_frame(reply));
                self.finish_close(events);
                Ok(())
            }
        }
    }

    /// Emits a close frame with `code` and moves to the terminal state.
    fn close_with(&mut self, code: CloseCode, events: &mut Vec<Event>) {
        let frame = Frame::close(code, self.outbound_mask());
        events.push(write_frame(frame));
        self.finish_close(events);
    }

    fn finish_close(&mut self, events: &mut Vec<Event>) {
        self.partial = None;
        self.deadline = None;
        self.phase = State::Closed;
        events.push(Event::Shutdown);
    }

    fn deliver(&mut self, partial: PartialMessage, events: &mut Vec<Event>) {
        self.deadline = None;
        events.push(Event::Message(Message::from_parts(
            partial.data_type,
            partial.payload.freeze(),
        )));
    }

    /// Maintains the incomplete-message deadline: started when something is
    /// pending, and on expiry the partial message is abandoned (the
    /// connection itself stays up).
    fn check_message_deadline(&mut self, buf: &mut BytesMut) {
        let pending = self.partial.is_some() || self.decoder.is_mid_frame() || !buf.is_empty();
        if !pending {
            self.deadline = None;
            return;
        }
        match self.deadline {
            None => self.deadline = Some(Instant::now()),
            Some(started) if started.elapsed() > self.options.message_timeout => {
                log::error!("message timeout, abandoning partial message");
                self.partial = None;
                self.deadline = None;
                self.decoder.reset();
                buf.clear();
            }
            Some(_) => {}
        }
    }

    fn outbound_mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        }
    }
}

/// Encodes a frame into a `Write` event.
fn write_frame(frame: Frame) -> Event {
    let mut buf = BytesMut::new();
    Encoder::encode(frame, &mut buf);
    Event::Write(buf.freeze())
}

/// Maps a dispatch failure to the close code it must carry.
fn close_code_for(err: &WebSocketError) -> CloseCode {
    match err {
        WebSocketError::InvalidUTF8 => CloseCode::Invalid,
        WebSocketError::FrameTooLarge => CloseCode::Size,
        _ => CloseCode::Protocol,
    }
}

/// Applies the text-message validation rule: the final fragment must leave
/// the validator complete, intermediate fragments must merely not fail.
fn check_text(state: Utf8State, fin: bool) -> Result<()> {
    let ok = if fin {
        state == Utf8State::Ok
    } else {
        state != Utf8State::Fail
    };
    if ok {
        Ok(())
    } else {
        Err(WebSocketError::InvalidUTF8)
    }
}

/// The read loop driving one connection, run on its worker thread.
///
/// Exits on peer EOF, transport error, a close request from the host or
/// endpoint, or the engine reaching its terminal state; then marks the
/// connection closed, fires `on_close` (iff `on_open` ran), and shuts the
/// transport down.
pub(crate) fn worker_loop<H: Handler>(
    conn: &Connection,
    mut stream: TcpStream,
    handler: &H,
    options: &Options,
    nonce: Option<String>,
) {
    if let Err(err) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        log::error!("set_read_timeout failed: {}", err);
        conn.set_state(State::Closed);
        return;
    }

    let mut engine = Engine::new(conn.role(), options.clone(), nonce);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut events: Vec<Event> = Vec::new();
    let mut session: Option<H::Session> = None;

    'outer: while !conn.close_requested() && conn.state() != State::Closed {
        match stream.read(&mut chunk) {
            // Peer closed the transport.
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                engine.ingest(&mut buf, &mut events);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                engine.tick(&mut buf);
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("read failed on {} connection: {}", conn.role(), err);
                break;
            }
        }

        for event in events.drain(..) {
            match event {
                Event::Open => {
                    conn.set_state(State::Connected);
                    session = Some(handler.on_open(conn));
                }
                Event::Message(msg) => {
                    if let Some(session) = session.as_mut() {
                        handler.on_message(conn, session, msg);
                    }
                }
                Event::Write(bytes) => {
                    if conn.write_all(&bytes).is_err() {
                        break 'outer;
                    }
                }
                Event::Shutdown => break 'outer,
            }
        }
    }

    conn.set_state(State::Closed);
    if let Some(mut session) = session.take() {
        handler.on_close(conn, &mut session);
    }
    conn.shutdown_transport();
}
