//! Connection to a streaming server
//!
//! A [`Connection`] owns the transport stream and the two tasks that drive
//! it: a writer draining an unbounded queue of encoded bytes, and a reader
//! that owns the only inbound chunk decoder. The reader answers control
//! traffic, resolves outstanding transactions such as `createStream`, and
//! routes media messages to the session bound to their message stream. SRT
//! carries no message framing, so its bytes go to every session with input.
//!
//! Sessions attach through weak [`ConnectionObserver`] links. The connected
//! flag is flipped under the state lock, and on a drop every attached
//! session falls back to `open` under that same lock, so nobody observes an
//! active session on a dead connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::client::config::{parse_url, ClientConfig, ParsedUrl, Scheme};
use crate::error::{ConnectionError, Error, ProtocolError, Result};
use crate::net::transport::{BoxedStream, TcpTransport, Transport};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, ChunkMessage};
use crate::protocol::constants::*;
use crate::protocol::handshake::client_handshake;
use crate::protocol::message::{Command, ControlMessage, UC_PING_REQUEST};

/// Deferred action run on the next `connected = true` transition
pub type PendingAction = Box<dyn FnOnce() + Send>;

/// Lifecycle events, consumed by the reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectFailed(String),
    Closed,
}

/// A session's view of the connection
pub trait ConnectionObserver: Send + Sync {
    /// Called after every connected transition, outside the state lock
    fn connection_changed(&self, connected: bool);

    /// Called under the state lock when the connection goes down
    fn connection_lost(&self);

    /// Inbound traffic, delivered only while input is enabled
    fn input(&self, inbound: Inbound);
}

/// Inbound traffic routed to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Unframed stream bytes (SRT)
    Bytes(Bytes),
    /// Media or data message on the session's RTMP message stream
    Message(ChunkMessage),
}

/// Parameters sessions need to frame their output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub scheme: Scheme,
    pub chunk_size: u32,
    /// Socket these parameters belong to; changes on every connect
    pub generation: u64,
}

/// Byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Bytes handed to the writer and not yet written
    pub queued_bytes: u64,
}

struct Attachment {
    id: u64,
    observer: Weak<dyn ConnectionObserver>,
    input: bool,
    /// RTMP message stream whose media this session receives
    stream_id: Option<u32>,
}

struct Socket {
    generation: u64,
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

struct State {
    socket: Option<Socket>,
    sessions: Vec<Attachment>,
    pending_action: Option<PendingAction>,
    params: Option<StreamParams>,
    uri: Option<String>,
    encoder: ChunkEncoder,
    generation: u64,
    next_transaction: u64,
    transactions: HashMap<u64, oneshot::Sender<Command>>,
}

impl State {
    fn live_sessions(&mut self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.sessions.retain(|a| a.observer.strong_count() > 0);
        self.sessions
            .iter()
            .filter_map(|a| a.observer.upgrade())
            .collect()
    }
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    connected: watch::Sender<bool>,
    state: Mutex<State>,
    events: broadcast::Sender<ConnectionEvent>,
    next_id: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    queued: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(socket) = self.state.get_mut().socket.take() {
            socket.reader.abort();
        }
    }
}

/// Handle to a connection; clones share the same connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle held by sessions
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Connection dialing over TCP with the config's socket options
    pub fn new(config: ClientConfig) -> Self {
        let transport = TcpTransport::new(config.tcp_nodelay, config.connect_timeout);
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                connected,
                state: Mutex::new(State {
                    socket: None,
                    sessions: Vec::new(),
                    pending_action: None,
                    params: None,
                    uri: None,
                    encoder: ChunkEncoder::new(),
                    generation: 0,
                    next_transaction: FIRST_TRANSACTION_ID,
                    transactions: HashMap::new(),
                }),
                events,
                next_id: AtomicU64::new(1),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                queued: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch the connected flag
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            queued_bytes: self.inner.queued.load(Ordering::Relaxed),
        }
    }

    /// Framing parameters of the current connection
    pub async fn params(&self) -> Option<StreamParams> {
        self.inner.state.lock().await.params.clone()
    }

    /// URI of the last `open` call
    pub async fn uri(&self) -> Option<String> {
        self.inner.state.lock().await.uri.clone()
    }

    /// Connect to `uri`
    ///
    /// For RTMP this runs the handshake and `connect`; message streams are
    /// created per activation with [`create_stream`](Self::create_stream).
    /// On success the pending action runs once, then sessions are notified.
    pub async fn open(&self, uri: &str) -> Result<()> {
        self.close().await;
        self.inner.state.lock().await.uri = Some(uri.to_string());

        let timeout = self.inner.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.establish(uri)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout.into()),
        };
        let (stream, scheme, control) = match result {
            Ok(established) => established,
            Err(e) => {
                tracing::warn!(uri, error = %e, "Connect failed");
                let _ = self
                    .inner
                    .events
                    .send(ConnectionEvent::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };

        let (action, sessions) = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            let generation = state.generation;
            let params = StreamParams {
                scheme,
                chunk_size: control.encoder.chunk_size(),
                generation,
            };
            state.encoder = control.encoder;
            state.params = Some(params);
            state.next_transaction = FIRST_TRANSACTION_ID;

            let (read_half, write_half) = tokio::io::split(stream);
            let (writer, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_loop(
                Arc::downgrade(&self.inner),
                write_half,
                rx,
                generation,
            ));
            let reader = tokio::spawn(read_loop(
                Arc::downgrade(&self.inner),
                read_half,
                control.reader,
                generation,
            ));
            state.socket = Some(Socket {
                generation,
                writer,
                reader,
            });

            self.inner.connected.send_replace(true);
            (state.pending_action.take(), state.live_sessions())
        };

        tracing::info!(uri, scheme = ?scheme, "Connected");
        if let Some(action) = action {
            action();
        }
        for session in sessions {
            session.connection_changed(true);
        }
        let _ = self.inner.events.send(ConnectionEvent::Connected);
        Ok(())
    }

    async fn establish(&self, uri: &str) -> Result<(BoxedStream, Scheme, Control)> {
        let parsed = parse_url(uri)?;
        let url = Url::parse(uri)?;
        let mut stream = self.inner.transport.dial(&url).await?;

        let control = match parsed.scheme {
            Scheme::Rtmp => rtmp_connect(&mut stream, &parsed, &self.inner.config).await?,
            Scheme::Srt => Control {
                encoder: ChunkEncoder::new(),
                reader: None,
            },
        };
        Ok((stream, parsed.scheme, control))
    }

    /// Tear down the socket; sessions are notified as on a drop
    ///
    /// Queued output is still written before the writer exits.
    pub async fn close(&self) {
        let sessions = {
            let mut state = self.inner.state.lock().await;
            let Some(socket) = state.socket.take() else {
                return;
            };
            socket.reader.abort();
            drop(socket.writer);
            self.inner.set_disconnected(&mut state)
        };
        tracing::info!("Connection closed");
        self.inner.notify_closed(sessions);
    }

    /// Store the action to run on the next connect, replacing any earlier one
    pub async fn set_pending_action(&self, action: PendingAction) {
        let mut state = self.inner.state.lock().await;
        if state.pending_action.replace(action).is_some() {
            tracing::debug!("Replaced unexecuted pending action");
        }
    }

    pub async fn has_pending_action(&self) -> bool {
        self.inner.state.lock().await.pending_action.is_some()
    }

    /// Link a session; the connection never keeps it alive
    pub async fn attach(&self, observer: Weak<dyn ConnectionObserver>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().await.sessions.push(Attachment {
            id,
            observer,
            input: false,
            stream_id: None,
        });
        id
    }

    pub async fn detach(&self, id: u64) {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .retain(|a| a.id != id);
    }

    /// Start or stop delivering inbound traffic to a session
    ///
    /// RTMP media reaches the session only for the message stream it is
    /// bound to; `stream_id` is ignored for SRT.
    pub async fn set_input(&self, id: u64, stream_id: Option<u32>, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        if let Some(attachment) = state.sessions.iter_mut().find(|a| a.id == id) {
            attachment.input = enabled;
            attachment.stream_id = stream_id.filter(|_| enabled);
        }
    }

    /// Run `f` under the state lock if the socket of `generation` is up
    ///
    /// Sessions enter active states through this so the transition cannot
    /// interleave with a drop, nor land on a later connection than the one
    /// they set up their stream on.
    pub async fn when_connected<F: FnOnce()>(&self, generation: u64, f: F) -> bool {
        let state = self.inner.state.lock().await;
        let current = state.params.as_ref().map(|p| p.generation);
        if *self.inner.connected.borrow() && current == Some(generation) {
            f();
            true
        } else {
            false
        }
    }

    /// Ask the server for a new message stream and return its id
    ///
    /// SRT has a single implicit stream, reported as 0.
    pub async fn create_stream(&self) -> Result<u32> {
        let (transaction_id, response) = {
            let mut state = self.inner.state.lock().await;
            let scheme = state
                .params
                .as_ref()
                .map(|p| p.scheme)
                .ok_or(ConnectionError::NotConnected)?;
            if scheme == Scheme::Srt {
                return Ok(CONTROL_STREAM_ID);
            }
            let transaction_id = state.next_transaction;
            state.next_transaction += 1;

            let mut buf = BytesMut::new();
            let command = Command::create_stream(transaction_id as f64);
            state
                .encoder
                .encode(&mut buf, &command.into_chunk(CONTROL_STREAM_ID));
            self.inner.queue(&state, buf.freeze())?;

            let (tx, rx) = oneshot::channel();
            state.transactions.insert(transaction_id, tx);
            (transaction_id, rx)
        };

        let timeout = self.inner.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(ConnectionError::Closed.into()),
            Err(_) => {
                self.inner
                    .state
                    .lock()
                    .await
                    .transactions
                    .remove(&transaction_id);
                return Err(ConnectionError::Timeout.into());
            }
        };
        if result.is_error() {
            return Err(ConnectionError::Rejected(result.description()).into());
        }
        let stream_id = result
            .arguments
            .iter()
            .find_map(|v| v.as_number())
            .ok_or_else(|| {
                Error::from(ProtocolError::UnexpectedMessage(
                    "createStream result without stream id".into(),
                ))
            })? as u32;
        tracing::debug!(stream_id, "Message stream created");
        Ok(stream_id)
    }

    /// Queue encoded bytes for the writer
    pub async fn write(&self, data: Bytes) -> Result<()> {
        let state = self.inner.state.lock().await;
        self.inner.queue(&state, data)
    }

    /// Encode and queue a NetStream command on message stream `stream_id`
    pub async fn send_command(&self, command: &Command, stream_id: u32) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.params.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }
        let mut buf = BytesMut::new();
        state
            .encoder
            .encode(&mut buf, &command.into_chunk(stream_id));
        self.inner.queue(&state, buf.freeze())
    }

    /// Encode and queue a NetConnection command (stream 0)
    pub async fn send_connection_command(&self, command: &Command) -> Result<()> {
        self.send_command(command, CONTROL_STREAM_ID).await
    }
}

impl Inner {
    fn queue(&self, state: &State, data: Bytes) -> Result<()> {
        let socket = state.socket.as_ref().ok_or(ConnectionError::NotConnected)?;
        let len = data.len() as u64;
        socket
            .writer
            .send(data)
            .map_err(|_| ConnectionError::Closed)?;
        self.queued.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn send_control(&self, message: ControlMessage) {
        let mut state = self.state.lock().await;
        let mut buf = BytesMut::new();
        state.encoder.encode(&mut buf, &message.into_chunk());
        if let Err(e) = self.queue(&state, buf.freeze()) {
            tracing::debug!(error = %e, "Dropping control message");
        }
    }

    /// Downgrade sessions, then flip to disconnected; caller holds the lock
    fn set_disconnected(&self, state: &mut State) -> Vec<Arc<dyn ConnectionObserver>> {
        state.params = None;
        let sessions = state.live_sessions();
        for session in &sessions {
            session.connection_lost();
        }
        self.connected.send_replace(false);
        // Outstanding requests fail with `Closed`
        state.transactions.clear();
        sessions
    }

    fn notify_closed(&self, sessions: Vec<Arc<dyn ConnectionObserver>>) {
        for session in sessions {
            session.connection_changed(false);
        }
        let _ = self.events.send(ConnectionEvent::Closed);
    }

    /// The socket of `generation` failed
    async fn lost(&self, generation: u64) {
        let sessions = {
            let mut state = self.state.lock().await;
            match &state.socket {
                Some(socket) if socket.generation == generation => {}
                _ => return,
            }
            state.socket = None;
            self.set_disconnected(&mut state)
        };
        tracing::warn!("Connection lost");
        self.notify_closed(sessions);
    }

    /// Hand `inbound` to sessions with input enabled, limited to the ones
    /// bound to `stream_id` when given
    async fn deliver(&self, inbound: Inbound, stream_id: Option<u32>) {
        let inputs: Vec<_> = {
            let state = self.state.lock().await;
            state
                .sessions
                .iter()
                .filter(|a| a.input && (stream_id.is_none() || a.stream_id == stream_id))
                .filter_map(|a| a.observer.upgrade())
                .collect()
        };
        if inputs.is_empty() {
            tracing::trace!(stream_id = ?stream_id, "No session takes this input");
        }
        for session in inputs {
            session.input(inbound.clone());
        }
    }

    /// A command arrived; resolve its transaction or log the status
    async fn command_received(&self, command: Command) {
        if command.is_result() || command.is_error() {
            let waiter = self
                .state
                .lock()
                .await
                .transactions
                .remove(&(command.transaction_id as u64));
            if let Some(waiter) = waiter {
                let _ = waiter.send(command);
                return;
            }
        }
        let code = command.status_code().unwrap_or_default();
        if command.is_error() || code.ends_with("Failed") || code.ends_with("BadName") {
            tracing::warn!(code, description = %command.description(), "Stream status");
        } else {
            tracing::debug!(command = %command.name, code, "Stream status");
        }
    }
}

/// `connect` uses transaction 1
const FIRST_TRANSACTION_ID: u64 = 2;

/// Protocol state carried from the connect exchange into the reader
struct Control {
    encoder: ChunkEncoder,
    reader: Option<ControlReader>,
}

/// Decodes all inbound RTMP traffic
struct ControlReader {
    decoder: ChunkDecoder,
    buf: BytesMut,
    window: u32,
    acknowledged: u64,
}

enum ControlAction {
    Reply(ControlMessage),
    Status(Command),
    Media(ChunkMessage),
}

impl ControlReader {
    fn new() -> Self {
        Self {
            decoder: ChunkDecoder::new(),
            buf: BytesMut::new(),
            window: 0,
            acknowledged: 0,
        }
    }

    fn handle(&mut self, msg: ChunkMessage) -> Option<ControlAction> {
        match msg.type_id {
            MSG_COMMAND_AMF0 => {
                return Command::parse(msg.payload).ok().map(ControlAction::Status);
            }
            MSG_AUDIO | MSG_VIDEO | MSG_DATA_AMF0 => return Some(ControlAction::Media(msg)),
            _ => {}
        }
        match ControlMessage::parse(msg.type_id, &msg.payload) {
            Ok(Some(ControlMessage::UserControl {
                event: UC_PING_REQUEST,
                data,
            })) => Some(ControlAction::Reply(ControlMessage::ping_response(data))),
            Ok(Some(ControlMessage::WindowAckSize(size))) => {
                self.window = size;
                None
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed control message");
                None
            }
        }
    }

    /// Decode everything buffered
    fn drain(&mut self) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        loop {
            match self.decoder.decode(&mut self.buf) {
                Ok(Some(msg)) => actions.extend(self.handle(msg)),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Resyncing control stream");
                    self.decoder.resync(&mut self.buf);
                }
            }
        }
        actions
    }

    /// Acknowledgement due after `total` bytes received
    fn acknowledgement(&mut self, total: u64) -> Option<ControlMessage> {
        if self.window == 0 || total - self.acknowledged < self.window as u64 {
            return None;
        }
        self.acknowledged = total;
        Some(ControlMessage::Acknowledgement(total as u32))
    }
}

async fn read_message(
    stream: &mut BoxedStream,
    decoder: &mut ChunkDecoder,
    buf: &mut BytesMut,
) -> Result<ChunkMessage> {
    loop {
        if let Some(msg) = decoder.decode(buf)? {
            return Ok(msg);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(ConnectionError::Closed.into());
        }
    }
}

/// Wait for `_result` / `_error` of `transaction_id`
async fn await_result(
    stream: &mut BoxedStream,
    control: &mut Control,
    reader: &mut ControlReader,
    transaction_id: f64,
) -> Result<Command> {
    loop {
        let msg = read_message(stream, &mut reader.decoder, &mut reader.buf).await?;
        match reader.handle(msg) {
            Some(ControlAction::Status(cmd)) if cmd.transaction_id == transaction_id => {
                if cmd.is_result() {
                    return Ok(cmd);
                }
                if cmd.is_error() {
                    return Err(ConnectionError::Rejected(cmd.description()).into());
                }
            }
            Some(ControlAction::Reply(reply)) => {
                let mut out = BytesMut::new();
                control.encoder.encode(&mut out, &reply.into_chunk());
                stream.write_all(&out).await?;
            }
            _ => {}
        }
    }
}

async fn rtmp_connect(
    stream: &mut BoxedStream,
    url: &ParsedUrl,
    config: &ClientConfig,
) -> Result<Control> {
    client_handshake(stream).await?;

    let mut control = Control {
        encoder: ChunkEncoder::new(),
        reader: None,
    };
    let mut reader = ControlReader::new();

    let mut out = BytesMut::new();
    control
        .encoder
        .encode(&mut out, &ControlMessage::SetChunkSize(config.chunk_size).into_chunk());
    control.encoder.set_chunk_size(config.chunk_size);
    control.encoder.encode(
        &mut out,
        &ControlMessage::WindowAckSize(config.window_ack_size).into_chunk(),
    );
    let connect = Command::connect(1.0, &url.app, &url.tc_url, &config.flash_version);
    control
        .encoder
        .encode(&mut out, &connect.into_chunk(CONTROL_STREAM_ID));
    stream.write_all(&out).await?;
    stream.flush().await?;

    let result = await_result(stream, &mut control, &mut reader, 1.0).await?;
    tracing::debug!(code = ?result.status_code(), "NetConnection connected");

    control.reader = Some(reader);
    Ok(control)
}

async fn write_loop(
    inner: Weak<Inner>,
    mut writer: tokio::io::WriteHalf<BoxedStream>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
) {
    while let Some(data) = rx.recv().await {
        let len = data.len() as u64;
        let result = writer.write_all(&data).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.queued.fetch_sub(len, Ordering::Relaxed);
        if let Err(e) = result {
            tracing::debug!(error = %e, "Write failed");
            inner.lost(generation).await;
            return;
        }
        inner.bytes_out.fetch_add(len, Ordering::Relaxed);
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    inner: Weak<Inner>,
    mut reader: ReadHalf<BoxedStream>,
    mut control: Option<ControlReader>,
    generation: u64,
) {
    let capacity = match inner.upgrade() {
        Some(inner) => inner.config.read_buffer_size,
        None => return,
    };
    let mut buf = BytesMut::with_capacity(capacity);

    loop {
        buf.reserve(capacity);
        let n = match reader.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Peer closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Read failed");
                break;
            }
        };
        let data = buf.split().freeze();
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let total = inner.bytes_in.fetch_add(n as u64, Ordering::Relaxed) + n as u64;

        let Some(control) = control.as_mut() else {
            inner.deliver(Inbound::Bytes(data), None).await;
            continue;
        };
        control.buf.extend_from_slice(&data);
        for action in control.drain() {
            match action {
                ControlAction::Reply(reply) => inner.send_control(reply).await,
                ControlAction::Status(cmd) => inner.command_received(cmd).await,
                ControlAction::Media(msg) => {
                    let stream_id = msg.stream_id;
                    inner.deliver(Inbound::Message(msg), Some(stream_id)).await;
                }
            }
        }
        if let Some(ack) = control.acknowledgement(total) {
            inner.send_control(ack).await;
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.lost(generation).await;
    }
}
