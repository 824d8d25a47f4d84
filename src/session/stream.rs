//! Publish/play sessions
//!
//! A [`Session`] is a named, one-directional endpoint on a [`Connection`].
//! Every operation is queued to one task per session, which owns the muxer
//! and is the only writer of the ready state apart from the connection's
//! drop path (active → open, under the connection lock).
//!
//! Each RTMP activation runs on a message stream of its own, created when
//! the activation starts and deleted when it ends. A session that was
//! active when the connection dropped remembers what it was doing and
//! resumes on its own once the connection is back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot, watch};

use crate::bitrate::{AdaptiveBitrateStrategy, BitrateStrategy};
use crate::client::config::Scheme;
use crate::error::{ConnectionError, Error};
use crate::media::sample::{
    AudioBuffer, AudioFormat, HostTime, MediaSet, MediaTime, MediaType, SampleBuffer, VideoFormat,
};
use crate::mux::{MuxEvent, Muxed, Muxer, RtmpMuxer, SrtMuxer};
use crate::net::{Connection, ConnectionObserver, Inbound, StreamParams, WeakConnection};
use crate::protocol::message::Command;
use crate::stats::{SessionCounters, SessionStats, ThroughputSample};

use super::handle::{InFlight, MediaSource, MuxerHandle};
use super::observer::{Format, Media, ObserverRegistry, SessionObserver};
use super::state::{Direction, ReadyState};

pub(crate) enum Operation {
    Publish(Option<String>),
    Play(Option<String>),
    Close,
    ConnectionChanged(bool),
    Input(Inbound),
    VideoFormat(Option<VideoFormat>),
    AudioFormat(Option<AudioFormat>),
    Video(SampleBuffer, InFlight),
    Audio(AudioBuffer, HostTime, InFlight),
    AttachSource(Arc<dyn MediaSource>),
    SetBitrateStrategy(Box<dyn BitrateStrategy>),
    Throughput(ThroughputSample),
    Info(oneshot::Sender<SessionInfo>),
    Flush(oneshot::Sender<()>),
}

/// Snapshot of session-task state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: Option<String>,
    pub ready_state: ReadyState,
    /// Media types the muxer waits for before reporting ready
    pub expected_medias: MediaSet,
}

/// Connection-facing side; the connection only holds it weakly
struct Shared {
    queue: mpsc::UnboundedSender<Operation>,
    state: Arc<watch::Sender<ReadyState>>,
}

impl ConnectionObserver for Shared {
    fn connection_changed(&self, connected: bool) {
        let _ = self.queue.send(Operation::ConnectionChanged(connected));
    }

    fn connection_lost(&self) {
        self.state.send_if_modified(|state| {
            if state.direction().is_some() {
                *state = ReadyState::Open;
                true
            } else {
                false
            }
        });
    }

    fn input(&self, inbound: Inbound) {
        let _ = self.queue.send(Operation::Input(inbound));
    }
}

/// Handle to a session task
///
/// Dropping the last handle stops the task.
pub struct Session {
    shared: Arc<Shared>,
    state: watch::Receiver<ReadyState>,
    observers: Arc<ObserverRegistry>,
    counters: Arc<SessionCounters>,
    handle: MuxerHandle,
}

impl Session {
    /// Bind a new session to `connection`
    pub async fn new(connection: &Connection) -> Session {
        let (queue, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ReadyState::Initialized);
        let state_tx = Arc::new(state_tx);
        let observers = Arc::new(ObserverRegistry::default());
        let counters = Arc::new(SessionCounters::new());
        let detached = Arc::new(AtomicBool::new(false));

        let config = connection.config();
        let handle = MuxerHandle::new(
            queue.downgrade(),
            detached.clone(),
            config.media_queue_capacity,
            counters.clone(),
        );
        let weak_queue = queue.downgrade();
        let shared = Arc::new(Shared {
            queue,
            state: state_tx.clone(),
        });
        let observer: Arc<dyn ConnectionObserver> = shared.clone();
        let attachment = connection.attach(Arc::downgrade(&observer)).await;

        let actor = Actor {
            rx,
            queue: weak_queue,
            state: state_tx,
            reported: ReadyState::Initialized,
            observers: observers.clone(),
            counters: counters.clone(),
            detached,
            connection: connection.downgrade(),
            attachment,
            composition_offset: config.composition_offset,
            name: None,
            active: None,
            stream_id: None,
            resume: None,
            framing: None,
            video_format: None,
            audio_format: None,
            source: None,
            strategy: Box::new(AdaptiveBitrateStrategy::default()),
        };
        tokio::spawn(actor.run());

        Session {
            shared,
            state,
            observers,
            counters,
            handle,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Watch ready-state changes
    pub fn subscribe(&self) -> watch::Receiver<ReadyState> {
        self.state.clone()
    }

    /// Publish as `name`; `None` stops an ongoing publish
    ///
    /// While disconnected the request is deferred until the connection comes
    /// up, replacing any earlier deferred request on that connection. A
    /// publish interrupted by a drop resumes without a new call.
    pub fn publish(&self, name: Option<&str>) {
        self.send(Operation::Publish(name.map(str::to_string)));
    }

    /// Play `name`; `None` stops an ongoing play
    pub fn play(&self, name: Option<&str>) {
        self.send(Operation::Play(name.map(str::to_string)));
    }

    /// Stop and close; later calls and late media are discarded
    pub fn close(&self) {
        self.send(Operation::Close);
    }

    /// Resolve once every earlier operation has been applied
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Operation::Flush(tx));
        let _ = rx.await;
    }

    pub async fn info(&self) -> Option<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Operation::Info(tx));
        rx.await.ok()
    }

    /// Handle producers use to feed this session
    pub fn muxer_handle(&self) -> MuxerHandle {
        self.handle.clone()
    }

    /// Source of input formats and target of bitrate changes
    pub fn attach_source(&self, source: Arc<dyn MediaSource>) {
        self.send(Operation::AttachSource(source));
    }

    pub fn add_observer(&self, observer: Weak<dyn SessionObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Weak<dyn SessionObserver>) {
        self.observers.remove(observer);
    }

    pub fn set_bitrate_strategy(&self, strategy: impl BitrateStrategy + 'static) {
        self.send(Operation::SetBitrateStrategy(Box::new(strategy)));
    }

    /// Feed a throughput sample to the bitrate strategy
    pub fn report_throughput(&self, sample: ThroughputSample) {
        self.send(Operation::Throughput(sample));
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    fn send(&self, operation: Operation) {
        let _ = self.shared.queue.send(operation);
    }
}

/// Protocol framing owned by the session task
enum Framing {
    Rtmp(RtmpMuxer),
    Srt(SrtMuxer),
}

impl Framing {
    fn new(scheme: Scheme, composition_offset: MediaTime) -> Self {
        match scheme {
            Scheme::Rtmp => Framing::Rtmp(RtmpMuxer::with_offset(0, composition_offset)),
            Scheme::Srt => Framing::Srt(SrtMuxer::new()),
        }
    }

    fn scheme(&self) -> Scheme {
        match self {
            Framing::Rtmp(_) => Scheme::Rtmp,
            Framing::Srt(_) => Scheme::Srt,
        }
    }

    fn configure(&mut self, params: &StreamParams, stream_id: u32) {
        if let Framing::Rtmp(muxer) = self {
            muxer.set_stream_id(stream_id);
            muxer.set_chunk_size(params.chunk_size);
        }
    }

    fn muxer(&mut self) -> &mut dyn Muxer {
        match self {
            Framing::Rtmp(muxer) => muxer,
            Framing::Srt(muxer) => muxer,
        }
    }
}

struct Actor {
    rx: mpsc::UnboundedReceiver<Operation>,
    queue: mpsc::WeakUnboundedSender<Operation>,
    state: Arc<watch::Sender<ReadyState>>,
    /// Last state reported to observers
    reported: ReadyState,
    observers: Arc<ObserverRegistry>,
    counters: Arc<SessionCounters>,
    detached: Arc<AtomicBool>,
    connection: WeakConnection,
    attachment: u64,
    composition_offset: MediaTime,

    name: Option<String>,
    active: Option<Direction>,
    /// Message stream of the current activation
    stream_id: Option<u32>,
    /// Activation to restart on the next connect
    resume: Option<(Direction, String)>,
    framing: Option<Framing>,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    source: Option<Arc<dyn MediaSource>>,
    strategy: Box<dyn BitrateStrategy>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(operation) = self.rx.recv().await {
            self.handle(operation).await;
        }
        if self.active.is_some() {
            self.leave(true).await;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.detach(self.attachment).await;
        }
        tracing::debug!(session = ?self.name, "Session task finished");
    }

    async fn handle(&mut self, operation: Operation) {
        match operation {
            Operation::Publish(name) => self.request(Direction::Publish, name).await,
            Operation::Play(name) => self.request(Direction::Play, name).await,
            Operation::Close => self.close().await,
            Operation::ConnectionChanged(connected) => self.connection_changed(connected).await,
            Operation::Input(inbound) => self.input(inbound).await,
            Operation::VideoFormat(format) => {
                self.video_format = format.clone();
                if let Some(framing) = self.framing.as_mut() {
                    framing.muxer().set_video_format(format);
                }
            }
            Operation::AudioFormat(format) => {
                self.audio_format = format.clone();
                if let Some(framing) = self.framing.as_mut() {
                    framing.muxer().set_audio_format(format);
                }
            }
            Operation::Video(sample, _slot) => self.append_video(sample).await,
            Operation::Audio(buffer, when, _slot) => self.append_audio(buffer, when).await,
            Operation::AttachSource(source) => self.source = Some(source),
            Operation::SetBitrateStrategy(strategy) => self.strategy = strategy,
            Operation::Throughput(sample) => self.adjust_bitrate(sample),
            Operation::Info(reply) => {
                let _ = reply.send(self.info());
            }
            Operation::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ReadyState) {
        self.state.send_replace(state);
        self.report(state);
    }

    /// Tell observers about `state` unless they already saw it
    ///
    /// The connection may have flipped the stored state on a drop without
    /// telling observers.
    fn report(&mut self, state: ReadyState) {
        if self.reported != state {
            self.reported = state;
            tracing::debug!(session = ?self.name, state = %state, "Ready state changed");
            self.observers.notify(|o| o.ready_state_changed(state));
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            ready_state: self.ready_state(),
            expected_medias: self
                .framing
                .as_ref()
                .map(|f| match f {
                    Framing::Rtmp(m) => m.expected_medias(),
                    Framing::Srt(m) => m.expected_medias(),
                })
                .unwrap_or_default(),
        }
    }

    /// Media types this publish activation waits for
    fn input_medias(&self) -> MediaSet {
        if let Some(source) = &self.source {
            return source.input_medias();
        }
        let mut medias = MediaSet::empty();
        if self.video_format.is_some() {
            medias.insert(MediaType::Video);
        }
        if self.audio_format.is_some() {
            medias.insert(MediaType::Audio);
        }
        medias
    }

    async fn request(&mut self, direction: Direction, name: Option<String>) {
        let current = self.ready_state();
        if current.is_closed() {
            tracing::debug!(direction = ?direction, "Ignoring request on closed session");
            return;
        }
        // A newer call replaces whatever a drop interrupted
        self.resume = None;
        if self.active.is_some() && current.direction().is_none() {
            self.dropped().await;
        }
        let Some(name) = name else {
            if current.direction() == Some(direction) {
                self.leave(true).await;
                self.set_state(ReadyState::Open);
            }
            return;
        };
        let Some(connection) = self.connection.upgrade() else {
            tracing::warn!(session = %name, "Connection is gone");
            return;
        };

        if !connection.is_connected() {
            if current == ReadyState::Initialized {
                self.set_state(ReadyState::Open);
            }
            self.defer(&connection, direction, name).await;
            return;
        }

        if current.direction().is_some() {
            self.leave(true).await;
        }
        self.activate(&connection, direction, name).await;
    }

    /// Store `direction` as the connection's pending action
    async fn defer(&mut self, connection: &Connection, direction: Direction, name: String) {
        tracing::debug!(session = %name, direction = ?direction, "Deferred until connected");
        let queue = self.queue.clone();
        connection
            .set_pending_action(Box::new(move || {
                if let Some(queue) = queue.upgrade() {
                    let operation = match direction {
                        Direction::Publish => Operation::Publish(Some(name)),
                        Direction::Play => Operation::Play(Some(name)),
                    };
                    let _ = queue.send(operation);
                }
            }))
            .await;
    }

    async fn activate(&mut self, connection: &Connection, direction: Direction, name: String) {
        let Some(params) = connection.params().await else {
            self.interrupted(direction, name);
            return;
        };
        self.name = Some(name.clone());
        self.set_state(direction.requested());

        let stream_id = match params.scheme {
            Scheme::Rtmp => match connection.create_stream().await {
                Ok(stream_id) => Some(stream_id),
                Err(e) if is_drop(&e) || !connection.is_connected() => {
                    tracing::debug!(session = %name, error = %e, "Connection dropped during createStream");
                    self.interrupted(direction, name);
                    return;
                }
                Err(e) => {
                    tracing::warn!(session = %name, error = %e, "createStream failed");
                    self.observers.notify(|o| o.error_occurred(&e));
                    self.set_state(ReadyState::Open);
                    return;
                }
            },
            Scheme::Srt => None,
        };
        self.stream_id = stream_id;

        let expected = match direction {
            Direction::Publish => self.input_medias(),
            Direction::Play => MediaSet::empty(),
        };
        let framing = self.framing(&params);
        framing.muxer().start(expected);
        framing.configure(&params, stream_id.unwrap_or_default());

        if direction == Direction::Play {
            connection.set_input(self.attachment, stream_id, true).await;
        }
        if let Some(stream_id) = stream_id {
            let command = match direction {
                Direction::Publish => Command::publish(&name),
                Direction::Play => Command::play(&name),
            };
            if let Err(e) = connection.send_command(&command, stream_id).await {
                tracing::debug!(session = %name, error = %e, "Failed to send {}", command.name);
            }
        }

        let state = self.state.clone();
        let entered = connection
            .when_connected(params.generation, || {
                state.send_replace(direction.active());
            })
            .await;
        if entered {
            self.active = Some(direction);
            tracing::info!(session = %name, state = %direction.active(), scheme = ?params.scheme, stream_id = ?stream_id, "Session active");
            self.report(direction.active());
        } else {
            self.leave(false).await;
            self.interrupted(direction, name);
        }
    }

    /// The connection went away before `direction` became active
    fn interrupted(&mut self, direction: Direction, name: String) {
        tracing::debug!(session = %name, direction = ?direction, "Activation interrupted, resuming on reconnect");
        self.set_state(ReadyState::Open);
        self.resume = Some((direction, name));
    }

    /// Muxer for `params`, created on first use
    fn framing(&mut self, params: &StreamParams) -> &mut Framing {
        let framing = match self.framing.take() {
            Some(framing) if framing.scheme() == params.scheme => framing,
            _ => {
                let mut framing = Framing::new(params.scheme, self.composition_offset);
                framing.muxer().set_video_format(self.video_format.clone());
                framing.muxer().set_audio_format(self.audio_format.clone());
                framing
            }
        };
        self.framing.insert(framing)
    }

    /// Leave the requested or active direction
    async fn leave(&mut self, notify_peer: bool) {
        let direction = self.active.take().or(self.ready_state().direction());
        let stream_id = self.stream_id.take();
        if let Some(connection) = self.connection.upgrade() {
            if direction == Some(Direction::Play) {
                connection.set_input(self.attachment, None, false).await;
            }
            if let Some(stream_id) = stream_id.filter(|_| notify_peer && connection.is_connected()) {
                let command = Command::delete_stream(stream_id);
                if let Err(e) = connection.send_connection_command(&command).await {
                    tracing::debug!(error = %e, "Failed to send deleteStream");
                }
            }
        }
        if let Some(framing) = self.framing.as_mut() {
            framing.muxer().stop();
        }
    }

    /// Tear down an activation whose connection went down
    async fn dropped(&mut self) -> Option<Direction> {
        let direction = self.active?;
        self.leave(false).await;
        self.set_state(ReadyState::Open);
        Some(direction)
    }

    async fn connection_changed(&mut self, connected: bool) {
        tracing::debug!(session = ?self.name, connected, "Connection changed");
        if !connected {
            if let Some(direction) = self.dropped().await {
                self.resume = self.name.clone().map(|name| (direction, name));
            }
            return;
        }
        let Some((direction, name)) = self.resume.take() else {
            return;
        };
        let current = self.ready_state();
        if current.is_closed() || current.direction().is_some() {
            return;
        }
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        tracing::info!(session = %name, direction = ?direction, "Resuming after reconnect");
        self.activate(&connection, direction, name).await;
    }

    async fn close(&mut self) {
        let current = self.ready_state();
        if matches!(current, ReadyState::Closed | ReadyState::Initialized) {
            return;
        }
        if current.direction().is_some() || self.active.is_some() {
            self.leave(current.direction().is_some()).await;
        }
        self.resume = None;
        self.detached.store(true, Ordering::Release);
        self.framing = None;
        self.set_state(ReadyState::Closed);
        if let Some(connection) = self.connection.upgrade() {
            connection.detach(self.attachment).await;
        }
        tracing::info!(session = ?self.name, "Session closed");
    }

    async fn append_video(&mut self, sample: SampleBuffer) {
        if self.ready_state() != ReadyState::Publishing {
            return;
        }
        let Some(framing) = self.framing.as_mut() else {
            return;
        };
        match framing.muxer().append_video(&sample) {
            Ok(muxed) => {
                if !muxed.bytes.is_empty() {
                    self.counters.record_video(sample.is_keyframe);
                }
                self.output(muxed).await;
            }
            Err(e) => {
                tracing::warn!(session = ?self.name, error = %e, "Video append failed");
                self.observers.notify(|o| o.error_occurred(&e));
            }
        }
    }

    async fn append_audio(&mut self, buffer: AudioBuffer, when: HostTime) {
        if self.ready_state() != ReadyState::Publishing {
            return;
        }
        let Some(framing) = self.framing.as_mut() else {
            return;
        };
        match framing.muxer().append_audio(&buffer, when) {
            Ok(muxed) => {
                if !muxed.bytes.is_empty() {
                    self.counters.record_audio();
                }
                self.output(muxed).await;
            }
            Err(e) => {
                tracing::warn!(session = ?self.name, error = %e, "Audio append failed");
                self.observers.notify(|o| o.error_occurred(&e));
            }
        }
    }

    async fn output(&mut self, muxed: Muxed) {
        if !muxed.bytes.is_empty() {
            self.counters.record_sent(muxed.bytes.len());
            if let Some(connection) = self.connection.upgrade() {
                if let Err(e) = connection.write(muxed.bytes).await {
                    tracing::debug!(error = %e, "Dropping muxed output");
                }
            }
        }
        if muxed.ready {
            tracing::info!(session = ?self.name, "All expected media flowing");
            self.observers.notify(|o| o.ready());
        }
    }

    async fn input(&mut self, inbound: Inbound) {
        if self.ready_state() != ReadyState::Playing {
            return;
        }
        let events = match (self.framing.as_mut(), inbound) {
            (Some(Framing::Rtmp(muxer)), Inbound::Message(msg)) => {
                self.counters.record_received(msg.payload.len());
                muxer.demux(msg)
            }
            (Some(framing), Inbound::Bytes(data)) => {
                self.counters.record_received(data.len());
                framing.muxer().read(&data)
            }
            _ => return,
        };

        let mut fatal = false;
        for event in events {
            match event {
                MuxEvent::Ready => self.observers.notify(|o| o.ready()),
                MuxEvent::VideoFormat(format) => {
                    let format = Format::Video(format);
                    self.observers.notify(|o| o.format_changed(&format));
                }
                MuxEvent::AudioFormat(format) => {
                    let format = Format::Audio(format);
                    self.observers.notify(|o| o.format_changed(&format));
                }
                MuxEvent::Video(sample) => {
                    self.counters.record_video(sample.is_keyframe);
                    let media = Media::Video(sample);
                    self.observers.notify(|o| o.media_received(&media));
                }
                MuxEvent::Audio(buffer, time) => {
                    self.counters.record_audio();
                    let media = Media::Audio(buffer, time);
                    self.observers.notify(|o| o.media_received(&media));
                }
                MuxEvent::Metadata(metadata) => {
                    tracing::debug!(metadata = ?metadata, "Received metadata");
                }
                MuxEvent::Error(e) => {
                    tracing::debug!(error = %e, "Skipped malformed input");
                    self.observers.notify(|o| o.error_occurred(&e));
                }
                MuxEvent::Fatal(e) => {
                    tracing::warn!(session = ?self.name, error = %e, "Inbound stream lost");
                    self.observers.notify(|o| o.error_occurred(&e));
                    fatal = true;
                }
            }
        }
        if fatal {
            self.close().await;
        }
    }

    fn adjust_bitrate(&mut self, sample: ThroughputSample) {
        let Some(source) = &self.source else {
            return;
        };
        let current = source.video_bitrate();
        if let Some(bitrate) = self.strategy.adjust(current, &sample) {
            if let Err(e) = source.set_video_bitrate(bitrate) {
                tracing::warn!(bitrate, error = %e, "Failed to apply bitrate");
            }
        }
    }
}

fn is_drop(error: &Error) -> bool {
    matches!(error, Error::Connection(ConnectionError::Closed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::bitrate::AdaptiveConfig;
    use crate::client::config::ClientConfig;
    use crate::media::avc::AvcConfig;
    use crate::media::sample::VideoCodec;
    use crate::net::testing::{FakeServer, Listener, PipeTransport};
    use crate::amf::AmfValue;
    use crate::protocol::chunk::ChunkType;
    use crate::protocol::constants::{CONTROL_STREAM_ID, MSG_VIDEO};

    const URI: &str = "rtmp://localhost/live/key";
    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ReadyState>>,
        ready: AtomicUsize,
        media: Mutex<Vec<Media>>,
        formats: Mutex<Vec<Format>>,
        errors: AtomicUsize,
    }

    impl SessionObserver for Recorder {
        fn ready_state_changed(&self, state: ReadyState) {
            self.states.lock().unwrap().push(state);
        }

        fn media_received(&self, media: &Media) {
            self.media.lock().unwrap().push(media.clone());
        }

        fn format_changed(&self, format: &Format) {
            self.formats.lock().unwrap().push(format.clone());
        }

        fn ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn error_occurred(&self, _error: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct VideoOnly {
        bitrate: AtomicU32,
    }

    impl MediaSource for VideoOnly {
        fn input_medias(&self) -> MediaSet {
            [MediaType::Video].into_iter().collect()
        }

        fn video_bitrate(&self) -> u32 {
            self.bitrate.load(Ordering::SeqCst)
        }

        fn set_video_bitrate(&self, bitrate: u32) -> crate::error::Result<()> {
            self.bitrate.store(bitrate, Ordering::SeqCst);
            Ok(())
        }
    }

    fn video_format() -> VideoFormat {
        let config =
            AvcConfig::from_parameter_sets(Bytes::from_static(SPS), Bytes::from_static(PPS))
                .unwrap();
        VideoFormat {
            codec: VideoCodec::Avc,
            width: 1280,
            height: 720,
            config: config.to_bytes(),
        }
    }

    fn keyframe(ms: i64) -> SampleBuffer {
        let data = Bytes::from(vec![0, 0, 0, 3, 0x65, 0x88, 0x81]);
        SampleBuffer::video(MediaTime::from_millis(ms), data, true)
    }

    async fn setup() -> (Connection, Listener, Session, Arc<Recorder>) {
        let (transport, listener) = PipeTransport::pair();
        let connection = Connection::with_transport(ClientConfig::new(URI), transport);
        let session = Session::new(&connection).await;
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn SessionObserver> = recorder.clone();
        session.add_observer(Arc::downgrade(&observer));
        (connection, listener, session, recorder)
    }

    async fn connect(connection: &Connection, listener: Listener) -> FakeServer {
        let accept = tokio::spawn(FakeServer::accept(listener, 1));
        connection.open(URI).await.unwrap();
        accept.await.unwrap()
    }

    async fn wait_for(session: &Session, state: ReadyState) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out")
            .expect("session dropped");
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_waits_for_connect() {
        let (connection, listener, session, recorder) = setup().await;

        session.publish(Some("x"));
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Open);
        assert!(connection.has_pending_action().await);

        let mut server = connect(&connection, listener).await;
        wait_for(&session, ReadyState::Publishing).await;
        assert!(!connection.has_pending_action().await);

        let publish = server.next_command().await.unwrap();
        assert_eq!(publish.name, "publish");
        assert_eq!(publish.arguments[0].as_str(), Some("x"));

        session.flush().await;
        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![ReadyState::Open, ReadyState::Publish, ReadyState::Publishing]
        );
        let info = session.info().await.unwrap();
        assert_eq!(info.name.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_stop_requests_are_noops_when_inactive() {
        let (connection, _listener, session, recorder) = setup().await;

        session.publish(None);
        session.play(None);
        session.close();
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Initialized);
        assert!(!connection.has_pending_action().await);

        session.play(Some("y"));
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Open);
        session.publish(None);
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Open);
        assert_eq!(*recorder.states.lock().unwrap(), vec![ReadyState::Open]);

        let observer: Arc<dyn SessionObserver> = recorder.clone();
        session.remove_observer(&Arc::downgrade(&observer));
        session.close();
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert_eq!(recorder.states.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (connection, listener, session, _recorder) = setup().await;
        let handle = session.muxer_handle();
        let _server = connect(&connection, listener).await;

        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;
        session.close();
        session.close();
        session.publish(None);
        session.publish(Some("again"));
        session.flush().await;

        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert!(!handle.is_attached());
        assert!(!handle.append_video(keyframe(0)));
    }

    #[tokio::test]
    async fn test_stop_publish_sends_delete_stream() {
        let (connection, listener, session, _recorder) = setup().await;
        let mut server = connect(&connection, listener).await;

        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;
        session.publish(None);
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Open);

        assert_eq!(server.next_command().await.unwrap().name, "publish");
        let (on, delete) = server.next_stream_command().await.unwrap();
        assert_eq!(on, CONTROL_STREAM_ID);
        assert_eq!(delete.name, "deleteStream");
        assert_eq!(delete.arguments[0].as_number(), Some(1.0));
    }

    #[tokio::test]
    async fn test_each_activation_gets_its_own_stream() {
        let (connection, listener, session, _recorder) = setup().await;
        let handle = session.muxer_handle();
        handle.set_video_format(Some(video_format()));
        let mut server = connect(&connection, listener).await;

        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;
        session.publish(None);
        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;
        assert!(handle.append_video(keyframe(0)));

        let mut commands = Vec::new();
        for _ in 0..3 {
            let (on, command) = server.next_stream_command().await.unwrap();
            let arg = command.arguments.first().and_then(AmfValue::as_number);
            commands.push((command.name, on, arg));
        }
        assert_eq!(
            commands,
            vec![
                ("publish".to_string(), 1, None),
                ("deleteStream".to_string(), 0, Some(1.0)),
                ("publish".to_string(), 2, None),
            ]
        );
        let frame = server.next_of_type(MSG_VIDEO).await.unwrap();
        assert_eq!(frame.stream_id, 2);
    }

    #[tokio::test]
    async fn test_never_active_while_disconnected() {
        let (connection, listener, session, recorder) = setup().await;
        let server = connect(&connection, listener).await;
        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;

        let mut connected = connection.connected();
        let listener = server.hang_up();
        connected.wait_for(|c| !*c).await.unwrap();
        assert_eq!(session.ready_state(), ReadyState::Open);

        session.flush().await;
        assert_eq!(recorder.states.lock().unwrap().last(), Some(&ReadyState::Open));
        // The session resumes by itself; nothing is left on the connection
        assert!(!connection.has_pending_action().await);
        let mut server = connect(&connection, listener).await;
        wait_for(&session, ReadyState::Publishing).await;
        let (on, publish) = server.next_stream_command().await.unwrap();
        assert_eq!(publish.name, "publish");
        assert_eq!(on, 1);
    }

    #[tokio::test]
    async fn test_every_dropped_session_resumes() {
        let (connection, listener, publisher, _recorder) = setup().await;
        let player = Session::new(&connection).await;
        let server = connect(&connection, listener).await;
        publisher.publish(Some("out"));
        player.play(Some("in"));
        wait_for(&publisher, ReadyState::Publishing).await;
        wait_for(&player, ReadyState::Playing).await;

        let mut connected = connection.connected();
        let listener = server.hang_up();
        connected.wait_for(|c| !*c).await.unwrap();
        publisher.flush().await;
        player.flush().await;
        assert_eq!(publisher.ready_state(), ReadyState::Open);
        assert_eq!(player.ready_state(), ReadyState::Open);

        let mut server = connect(&connection, listener).await;
        wait_for(&publisher, ReadyState::Publishing).await;
        wait_for(&player, ReadyState::Playing).await;

        let mut resumed = Vec::new();
        for _ in 0..2 {
            let (on, command) = server.next_stream_command().await.unwrap();
            let name = command.arguments[0].as_str().unwrap_or_default().to_string();
            resumed.push((command.name, name, on));
        }
        resumed.sort();
        assert_eq!(resumed.len(), 2);
        assert_eq!((resumed[0].0.as_str(), resumed[0].1.as_str()), ("play", "in"));
        assert_eq!((resumed[1].0.as_str(), resumed[1].1.as_str()), ("publish", "out"));
        assert_ne!(resumed[0].2, resumed[1].2);
    }

    #[tokio::test]
    async fn test_drop_during_activation_resumes() {
        let (connection, listener, session, recorder) = setup().await;
        let mut server = connect(&connection, listener).await;
        server.hold_create_stream();

        session.publish(Some("x"));
        // The session now waits for its message stream
        server.expect_command("createStream").await;
        let mut connected = connection.connected();
        let listener = server.hang_up();
        connected.wait_for(|c| !*c).await.unwrap();

        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Open);
        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![ReadyState::Publish, ReadyState::Open]
        );

        let mut server = connect(&connection, listener).await;
        wait_for(&session, ReadyState::Publishing).await;
        assert_eq!(server.next_command().await.unwrap().name, "publish");
    }

    #[tokio::test]
    async fn test_stop_after_drop_cancels_resume() {
        let (connection, listener, session, _recorder) = setup().await;
        let server = connect(&connection, listener).await;
        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;

        let mut connected = connection.connected();
        let listener = server.hang_up();
        connected.wait_for(|c| !*c).await.unwrap();
        session.publish(None);
        session.flush().await;

        let _server = connect(&connection, listener).await;
        session.flush().await;
        assert_eq!(session.ready_state(), ReadyState::Open);
        assert!(!connection.has_pending_action().await);
    }

    #[tokio::test]
    async fn test_expected_medias_follow_source() {
        let (connection, listener, session, _recorder) = setup().await;
        session.attach_source(Arc::new(VideoOnly {
            bitrate: AtomicU32::new(0),
        }));
        let _server = connect(&connection, listener).await;

        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;
        let info = session.info().await.unwrap();
        assert_eq!(info.expected_medias, [MediaType::Video].into_iter().collect());
    }

    #[tokio::test]
    async fn test_expected_medias_from_formats_without_source() {
        let (connection, listener, session, _recorder) = setup().await;
        let handle = session.muxer_handle();
        handle.set_video_format(Some(video_format()));
        let _server = connect(&connection, listener).await;

        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;
        let info = session.info().await.unwrap();
        assert_eq!(info.expected_medias, [MediaType::Video].into_iter().collect());
    }

    #[tokio::test]
    async fn test_published_video_reaches_server() {
        let (connection, listener, session, recorder) = setup().await;
        let handle = session.muxer_handle();
        handle.set_video_format(Some(video_format()));
        let mut server = connect(&connection, listener).await;
        session.publish(Some("x"));
        wait_for(&session, ReadyState::Publishing).await;

        assert!(handle.append_video(keyframe(0)));
        let header = server.next_of_type(MSG_VIDEO).await.unwrap();
        assert_eq!(&header.payload[..2], &[0x17, 0x00]);
        let frame = server.next_of_type(MSG_VIDEO).await.unwrap();
        assert_eq!(&frame.payload[..2], &[0x17, 0x01]);
        assert_eq!(frame.stream_id, 1);

        session.flush().await;
        assert_eq!(recorder.ready.load(Ordering::SeqCst), 1);
        let stats = session.stats();
        assert_eq!(stats.video_frames, 1);
        assert_eq!(stats.keyframes, 1);
        assert!(stats.bytes_sent > 0);
    }

    #[tokio::test]
    async fn test_samples_before_publishing_are_discarded() {
        let (_connection, _listener, session, _recorder) = setup().await;
        let handle = session.muxer_handle();
        handle.set_video_format(Some(video_format()));
        assert!(handle.append_video(keyframe(0)));
        session.flush().await;
        assert_eq!(session.stats().video_frames, 0);
        assert_eq!(handle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_play_delivers_media_to_observers() {
        let (connection, listener, session, recorder) = setup().await;
        let mut server = connect(&connection, listener).await;

        session.play(Some("remote"));
        wait_for(&session, ReadyState::Playing).await;
        let play = server.next_command().await.unwrap();
        assert_eq!(play.name, "play");
        assert_eq!(play.arguments[0].as_str(), Some("remote"));

        let mut remote = RtmpMuxer::new(1);
        remote.set_video_format(Some(video_format()));
        remote.start(MediaSet::empty());
        let muxed = remote.append_video(&keyframe(0)).unwrap();
        // Compressed headers on the command chunk stream stay with the connection
        let mut status = Command::new("onBWDone", 0.0, AmfValue::Null).into_chunk(CONTROL_STREAM_ID);
        status.chunk_type = ChunkType::SameStream;
        server.send(status).await;
        server.write_raw(&muxed.bytes).await;

        for _ in 0..100 {
            session.flush().await;
            if !recorder.media.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let media = recorder.media.lock().unwrap();
        assert_eq!(media.len(), 1);
        assert!(matches!(&media[0], Media::Video(s) if s.is_keyframe));
        assert!(recorder
            .formats
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, Format::Video(v) if v.config == video_format().config)));
        assert_eq!(recorder.ready.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_throughput_adjusts_source_bitrate() {
        let (_connection, _listener, session, _recorder) = setup().await;
        let source = Arc::new(VideoOnly {
            bitrate: AtomicU32::new(2_000_000),
        });
        session.attach_source(source.clone());
        session.set_bitrate_strategy(AdaptiveBitrateStrategy::new(AdaptiveConfig {
            downgrade_after: 1,
            ..Default::default()
        }));

        session.report_throughput(ThroughputSample {
            bytes_out_per_second: 125_000,
            queued_bytes: 4096,
        });
        session.flush().await;
        assert_eq!(source.bitrate.load(Ordering::SeqCst), 800_000);
    }
}
