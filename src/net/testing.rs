//! In-memory transport and a minimal RTMP server for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::amf::AmfValue;
use crate::error::{ConnectionError, Result};
use crate::net::transport::{BoxedStream, Transport};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, ChunkMessage};
use crate::protocol::constants::*;
use crate::protocol::handshake::server_handshake;
use crate::protocol::message::Command;

/// Far ends of dialed pipes, in dial order
pub type Listener = mpsc::UnboundedReceiver<DuplexStream>;

/// Every dial creates a duplex pipe and hands the far end to the listener
pub struct PipeTransport {
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

impl PipeTransport {
    pub fn pair() -> (Arc<Self>, Listener) {
        let (accepted, listener) = mpsc::unbounded_channel();
        (Arc::new(Self { accepted }), listener)
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn dial(&self, _url: &Url) -> Result<BoxedStream> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.accepted
            .send(far)
            .map_err(|_| ConnectionError::Closed)?;
        Ok(Box::new(near))
    }
}

struct Outbound {
    writer: WriteHalf<DuplexStream>,
    encoder: ChunkEncoder,
}

impl Outbound {
    async fn send(&mut self, msg: &ChunkMessage) {
        let mut out = BytesMut::new();
        self.encoder.encode(&mut out, msg);
        // The client may already be gone
        let _ = self.writer.write_all(&out).await;
    }
}

/// Server side of one accepted RTMP connection
///
/// A background task reads the client. It answers every `createStream`
/// with the next message stream id and queues all other messages for
/// [`next_message`](Self::next_message). Dropping the server hangs up.
pub struct FakeServer {
    pub listener: Listener,
    /// `app` from the client's `connect`
    pub app: String,
    outbound: Arc<Mutex<Outbound>>,
    messages: mpsc::UnboundedReceiver<ChunkMessage>,
    answer_create_stream: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl FakeServer {
    /// Accept the next dial and answer `connect`; message streams are
    /// numbered from `first_stream_id`
    pub async fn accept(mut listener: Listener, first_stream_id: u32) -> FakeServer {
        let stream = listener.recv().await.expect("no dial");
        let mut server = FakeServer::handshake(stream, listener, first_stream_id).await;

        let connect = server.expect_command("connect").await;
        server.app = connect
            .command_object
            .get_str("app")
            .unwrap_or_default()
            .to_string();
        server
            .reply(
                Command::new("_result", connect.transaction_id, AmfValue::Null).arg(
                    AmfValue::object([
                        ("level", AmfValue::from("status")),
                        ("code", AmfValue::from("NetConnection.Connect.Success")),
                    ]),
                ),
            )
            .await;
        server
    }

    /// Accept the next dial and refuse `connect`
    pub async fn reject(mut listener: Listener) -> FakeServer {
        let stream = listener.recv().await.expect("no dial");
        let mut server = FakeServer::handshake(stream, listener, 1).await;
        let connect = server.expect_command("connect").await;
        server
            .reply(
                Command::new("_error", connect.transaction_id, AmfValue::Null).arg(
                    AmfValue::object([
                        ("level", AmfValue::from("error")),
                        ("code", AmfValue::from("NetConnection.Connect.Rejected")),
                        ("description", AmfValue::from("not allowed")),
                    ]),
                ),
            )
            .await;
        server
    }

    async fn handshake(
        mut stream: DuplexStream,
        listener: Listener,
        first_stream_id: u32,
    ) -> FakeServer {
        server_handshake(&mut stream).await.expect("handshake");
        let (read_half, write_half) = tokio::io::split(stream);
        let outbound = Arc::new(Mutex::new(Outbound {
            writer: write_half,
            encoder: ChunkEncoder::new(),
        }));
        let (tx, messages) = mpsc::unbounded_channel();
        let answer_create_stream = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_client(
            read_half,
            outbound.clone(),
            tx,
            answer_create_stream.clone(),
            first_stream_id,
        ));
        FakeServer {
            listener,
            app: String::new(),
            outbound,
            messages,
            answer_create_stream,
            reader,
        }
    }

    /// Stop answering `createStream`; the commands are queued like any other
    pub fn hold_create_stream(&self) {
        self.answer_create_stream.store(false, Ordering::SeqCst);
    }

    /// Close the connection and keep listening for the next dial
    pub fn hang_up(mut self) -> Listener {
        let (_, closed) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.listener, closed)
    }

    pub async fn expect_command(&mut self, name: &str) -> Command {
        let command = self.next_command().await.expect("connection closed");
        assert_eq!(command.name, name);
        command
    }

    async fn reply(&mut self, command: Command) {
        self.send(command.into_chunk(CONTROL_STREAM_ID)).await;
    }

    pub async fn send(&self, msg: ChunkMessage) {
        self.outbound.lock().await.send(&msg).await;
    }

    /// Write bytes produced by an encoder other than the server's own
    pub async fn write_raw(&self, data: &[u8]) {
        let mut outbound = self.outbound.lock().await;
        outbound.writer.write_all(data).await.expect("write");
    }

    /// Next complete message; `None` once the client hung up
    pub async fn next_message(&mut self) -> Option<ChunkMessage> {
        self.messages.recv().await
    }

    /// Next AMF0 command and the message stream it arrived on
    pub async fn next_stream_command(&mut self) -> Option<(u32, Command)> {
        loop {
            let msg = self.next_message().await?;
            if msg.type_id == MSG_COMMAND_AMF0 {
                let command = Command::parse(msg.payload).expect("command");
                return Some((msg.stream_id, command));
            }
        }
    }

    /// Next AMF0 command, skipping everything else
    pub async fn next_command(&mut self) -> Option<Command> {
        self.next_stream_command().await.map(|(_, command)| command)
    }

    /// Next message of `type_id`, skipping everything else
    pub async fn next_of_type(&mut self, type_id: u8) -> Option<ChunkMessage> {
        loop {
            let msg = self.next_message().await?;
            if msg.type_id == type_id {
                return Some(msg);
            }
        }
    }
}

async fn read_client(
    mut reader: ReadHalf<DuplexStream>,
    outbound: Arc<Mutex<Outbound>>,
    messages: mpsc::UnboundedSender<ChunkMessage>,
    answer_create_stream: Arc<AtomicBool>,
    mut next_stream_id: u32,
) {
    let mut decoder = ChunkDecoder::new();
    let mut buf = BytesMut::new();
    loop {
        while let Some(msg) = decoder.decode(&mut buf).expect("decode") {
            if msg.type_id == MSG_COMMAND_AMF0 && answer_create_stream.load(Ordering::SeqCst) {
                let command = Command::parse(msg.payload.clone()).expect("command");
                if command.name == "createStream" {
                    let result = Command::new("_result", command.transaction_id, AmfValue::Null)
                        .arg(next_stream_id as f64);
                    next_stream_id += 1;
                    outbound
                        .lock()
                        .await
                        .send(&result.into_chunk(CONTROL_STREAM_ID))
                        .await;
                    continue;
                }
            }
            if messages.send(msg).is_err() {
                return;
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
