//! RTMP muxer
//!
//! Outbound, every audio/video buffer becomes one RTMP message whose body is
//! an FLV tag body: audio on chunk stream 4, video on chunk stream 6, both
//! on the publishing message stream. The first message of a track carries a
//! type 0 header with timestamp 0; later ones carry type 1 headers with the
//! delta from the previous message of that track. A format change is
//! signalled by a sequence header message ahead of the next frame.
//!
//! Inbound, [`RtmpMuxer::demux`] takes messages already decoded by the
//! connection, rebuilds per-track times from their chunk headers and turns
//! sequence headers and frames back into [`MuxEvent`]s. [`Muxer::read`]
//! runs its own chunk decoder for callers holding a raw byte stream.

use bytes::{Bytes, BytesMut};

use super::{MuxEvent, Muxed, Muxer, Readiness, MAX_CONSECUTIVE_ERRORS};
use crate::amf::AmfValue;
use crate::error::{MediaError, Result};
use crate::media::aac::AudioSpecificConfig;
use crate::media::avc::AvcConfig;
use crate::media::flv::{self, AudioTag, VideoTag};
use crate::media::sample::{
    AudioBuffer, AudioCodec, AudioFormat, HostTime, MediaSet, MediaTime, MediaType, SampleBuffer,
    VideoCodec, VideoFormat,
};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, ChunkMessage, ChunkType};
use crate::protocol::constants::*;
use crate::protocol::message::{parse_metadata, set_data_frame};
use crate::protocol::timestamp::{TimeConvertible, Timestamp, DEFAULT_COMPOSITION_OFFSET};

/// Outbound state of one track
#[derive(Debug)]
struct Track<T> {
    timestamp: Timestamp<T>,
    config_pending: bool,
}

impl<T: TimeConvertible> Track<T> {
    fn new(offset: MediaTime) -> Self {
        Self {
            timestamp: Timestamp::new(offset),
            config_pending: false,
        }
    }

    /// Header type and timestamp field for the next message of this track
    fn next_header(&mut self, time: T) -> (ChunkType, u32) {
        if self.timestamp.is_started() {
            (ChunkType::SameStream, self.timestamp.update(time))
        } else {
            self.timestamp.update(time);
            (ChunkType::Full, 0)
        }
    }
}

/// FLV-over-RTMP framing for one message stream
#[derive(Debug)]
pub struct RtmpMuxer {
    stream_id: u32,
    composition_offset: MediaTime,
    encoder: ChunkEncoder,
    readiness: Readiness,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    video: Track<MediaTime>,
    audio: Track<HostTime>,
    metadata_pending: bool,

    decoder: ChunkDecoder,
    inbound: BytesMut,
    inbound_video: Timestamp<MediaTime>,
    inbound_audio: Timestamp<MediaTime>,
    inbound_size: (u32, u32),
    errors: u32,
}

impl RtmpMuxer {
    pub fn new(stream_id: u32) -> Self {
        Self::with_offset(stream_id, DEFAULT_COMPOSITION_OFFSET)
    }

    /// Muxer using `offset` as the composition time offset
    ///
    /// The offset is added to every outbound composition time and
    /// subtracted again from inbound ones, so presentation times only
    /// survive a round trip when both ends use the same offset. Reading a
    /// stream produced with another offset shifts the presentation time of
    /// reordered frames by the difference.
    pub fn with_offset(stream_id: u32, offset: MediaTime) -> Self {
        Self {
            stream_id,
            composition_offset: offset,
            encoder: ChunkEncoder::new(),
            readiness: Readiness::default(),
            video_format: None,
            audio_format: None,
            video: Track::new(offset),
            audio: Track::new(offset),
            metadata_pending: false,
            decoder: ChunkDecoder::new(),
            inbound: BytesMut::new(),
            inbound_video: Timestamp::new(offset),
            inbound_audio: Timestamp::new(offset),
            inbound_size: (0, 0),
            errors: 0,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Message stream id assigned by `createStream`
    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id;
    }

    /// Outbound chunk size announced with Set Chunk Size
    pub fn set_chunk_size(&mut self, size: u32) {
        self.encoder.set_chunk_size(size);
    }

    /// Turn one decoded message of the played stream into events
    ///
    /// Control messages and commands are ignored.
    pub fn demux(&mut self, msg: ChunkMessage) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        self.handle_message(msg, &mut events);
        events
    }

    fn metadata(&self) -> Vec<(String, AmfValue)> {
        let mut metadata = Vec::new();
        if let Some(video) = &self.video_format {
            metadata.push(("width".to_string(), AmfValue::from(video.width)));
            metadata.push(("height".to_string(), AmfValue::from(video.height)));
            metadata.push((
                "videocodecid".to_string(),
                AmfValue::from(flv::CODEC_AVC as u32),
            ));
        }
        if let Some(audio) = &self.audio_format {
            metadata.push((
                "audiocodecid".to_string(),
                AmfValue::from(flv::SOUND_FORMAT_AAC as u32),
            ));
            metadata.push((
                "audiosamplerate".to_string(),
                AmfValue::from(audio.sample_rate),
            ));
            metadata.push((
                "audiochannels".to_string(),
                AmfValue::from(audio.channels as u32),
            ));
        }
        metadata
    }

    fn write_metadata(&mut self, buf: &mut BytesMut) {
        if !self.metadata_pending {
            return;
        }
        self.metadata_pending = false;
        let msg = ChunkMessage::full(
            CSID_DATA,
            0,
            MSG_DATA_AMF0,
            self.stream_id,
            set_data_frame(&self.metadata()),
        );
        self.encoder.encode(buf, &msg);
    }

    fn write_message(
        &mut self,
        buf: &mut BytesMut,
        csid: u32,
        header: (ChunkType, u32),
        type_id: u8,
        payload: Bytes,
    ) {
        let msg = ChunkMessage {
            csid,
            chunk_type: header.0,
            timestamp: header.1,
            type_id,
            stream_id: self.stream_id,
            payload,
        };
        self.encoder.encode(buf, &msg);
    }

    fn handle_message(&mut self, msg: ChunkMessage, events: &mut Vec<MuxEvent>) {
        let result = match msg.type_id {
            MSG_VIDEO => self.handle_video(&msg, events),
            MSG_AUDIO => self.handle_audio(&msg, events),
            MSG_DATA_AMF0 => {
                match parse_metadata(msg.payload) {
                    Ok(Some(metadata)) => {
                        if let (Some(w), Some(h)) =
                            (metadata.get_number("width"), metadata.get_number("height"))
                        {
                            self.inbound_size = (w as u32, h as u32);
                        }
                        events.push(MuxEvent::Metadata(metadata));
                    }
                    Ok(None) => {}
                    Err(e) => events.push(MuxEvent::Error(e.into())),
                }
                Ok(())
            }
            // Control messages and commands belong to the connection
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!(type_id = msg.type_id, error = %e, "Skipping malformed media message");
            events.push(MuxEvent::Error(e.into()));
        }
    }

    fn handle_video(
        &mut self,
        msg: &ChunkMessage,
        events: &mut Vec<MuxEvent>,
    ) -> std::result::Result<(), MediaError> {
        self.inbound_video
            .update_message(msg.timestamp, msg.chunk_type);
        match flv::parse_video(&msg.payload)? {
            VideoTag::SequenceHeader(record) => {
                AvcConfig::parse(&record)?;
                events.push(MuxEvent::VideoFormat(VideoFormat {
                    codec: VideoCodec::Avc,
                    width: self.inbound_size.0,
                    height: self.inbound_size.1,
                    config: record,
                }));
            }
            VideoTag::Frame {
                keyframe,
                composition_time,
                data,
            } => {
                let decode_ms = self.inbound_video.elapsed_ms();
                let mut sample = SampleBuffer::video(MediaTime::from_millis(decode_ms), data, keyframe);
                if composition_time != 0 {
                    // Inverse of the outbound mapping; see `with_offset`
                    let offset_ms = (self.composition_offset.seconds() * 1000.0).round() as i64;
                    sample.decode_time = sample.presentation_time;
                    sample.presentation_time = MediaTime::from_millis(
                        decode_ms + composition_time as i64 - offset_ms,
                    );
                }
                if self.readiness.mark(MediaType::Video) {
                    events.push(MuxEvent::Ready);
                }
                events.push(MuxEvent::Video(sample));
            }
            VideoTag::EndOfSequence | VideoTag::Info => {}
        }
        Ok(())
    }

    fn handle_audio(
        &mut self,
        msg: &ChunkMessage,
        events: &mut Vec<MuxEvent>,
    ) -> std::result::Result<(), MediaError> {
        self.inbound_audio
            .update_message(msg.timestamp, msg.chunk_type);
        match flv::parse_audio(&msg.payload)? {
            AudioTag::SequenceHeader(config) => {
                let asc = AudioSpecificConfig::parse(&config)?;
                events.push(MuxEvent::AudioFormat(AudioFormat {
                    codec: AudioCodec::Aac,
                    sample_rate: asc.sample_rate(),
                    channels: asc.channel_config,
                    config,
                }));
            }
            AudioTag::Frame(data) => {
                let time = MediaTime::from_millis(self.inbound_audio.elapsed_ms());
                if self.readiness.mark(MediaType::Audio) {
                    events.push(MuxEvent::Ready);
                }
                events.push(MuxEvent::Audio(AudioBuffer::aac(data), time));
            }
        }
        Ok(())
    }
}

impl Muxer for RtmpMuxer {
    fn expected_medias(&self) -> MediaSet {
        self.readiness.expected()
    }

    fn set_expected_medias(&mut self, medias: MediaSet) {
        self.readiness.set_expected(medias);
    }

    fn start(&mut self, medias: MediaSet) {
        self.stop();
        self.readiness.reset(medias);
        self.video.config_pending = self.video_format.is_some();
        self.audio.config_pending = self.audio_format.is_some();
        self.metadata_pending = true;
    }

    fn stop(&mut self) {
        self.encoder.reset();
        self.video.timestamp.clear();
        self.audio.timestamp.clear();
        self.metadata_pending = false;

        self.decoder.reset();
        self.inbound.clear();
        self.inbound_video.clear();
        self.inbound_audio.clear();
        self.errors = 0;
    }

    fn set_video_format(&mut self, format: Option<VideoFormat>) {
        self.video.config_pending = format.is_some();
        self.video_format = format;
    }

    fn set_audio_format(&mut self, format: Option<AudioFormat>) {
        self.audio.config_pending = format.is_some();
        self.audio_format = format;
    }

    fn append_video(&mut self, sample: &SampleBuffer) -> Result<Muxed> {
        if !sample.is_compressed {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let Some(format) = &self.video_format else {
            tracing::trace!("Dropping video frame before format");
            return Ok(Muxed::default());
        };
        let config = format.config.clone();

        let mut buf = BytesMut::with_capacity(sample.data.len() + 64);
        self.write_metadata(&mut buf);

        let header = self.video.next_header(sample.decode_or_presentation_time());
        let composition_time = self
            .video
            .timestamp
            .composition_time(sample.presentation_time, sample.decode_time);

        let mut header = header;
        if self.video.config_pending {
            self.video.config_pending = false;
            let mut body = BytesMut::with_capacity(config.len() + 5);
            flv::write_avc_sequence_header(&mut body, &config);
            self.write_message(&mut buf, CSID_VIDEO, header, MSG_VIDEO, body.freeze());
            header = (ChunkType::SameStream, 0);
        }

        let mut body = BytesMut::with_capacity(sample.data.len() + 5);
        flv::write_avc_frame(&mut body, sample.is_keyframe, composition_time, &sample.data);
        self.write_message(&mut buf, CSID_VIDEO, header, MSG_VIDEO, body.freeze());

        Ok(Muxed {
            bytes: buf.freeze(),
            ready: self.readiness.mark(MediaType::Video),
        })
    }

    fn append_audio(&mut self, buffer: &AudioBuffer, when: HostTime) -> Result<Muxed> {
        if !buffer.is_compressed {
            return Err(MediaError::InvalidAacPacket.into());
        }
        let Some(format) = &self.audio_format else {
            tracing::trace!("Dropping audio buffer before format");
            return Ok(Muxed::default());
        };
        let config = format.config.clone();

        let mut buf = BytesMut::with_capacity(buffer.data.len() + 32);
        self.write_metadata(&mut buf);

        let mut header = self.audio.next_header(when);
        if self.audio.config_pending {
            self.audio.config_pending = false;
            let mut body = BytesMut::with_capacity(config.len() + 2);
            flv::write_aac_sequence_header(&mut body, &config);
            self.write_message(&mut buf, CSID_AUDIO, header, MSG_AUDIO, body.freeze());
            header = (ChunkType::SameStream, 0);
        }

        let mut body = BytesMut::with_capacity(buffer.data.len() + 2);
        flv::write_aac_frame(&mut body, &buffer.data);
        self.write_message(&mut buf, CSID_AUDIO, header, MSG_AUDIO, body.freeze());

        Ok(Muxed {
            bytes: buf.freeze(),
            ready: self.readiness.mark(MediaType::Audio),
        })
    }

    fn read(&mut self, data: &[u8]) -> Vec<MuxEvent> {
        self.inbound.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            match self.decoder.decode(&mut self.inbound) {
                Ok(Some(msg)) => {
                    self.errors = 0;
                    self.handle_message(msg, &mut events);
                }
                Ok(None) => break,
                Err(e) => {
                    self.errors += 1;
                    if self.errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::warn!(errors = self.errors, "RTMP input unrecoverable");
                        self.inbound.clear();
                        events.push(MuxEvent::Fatal(e.into()));
                        break;
                    }
                    tracing::debug!(error = %e, "Resyncing RTMP input");
                    events.push(MuxEvent::Error(e.into()));
                    self.decoder.resync(&mut self.inbound);
                    self.inbound_video.clear();
                    self.inbound_audio.clear();
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::aac::OBJECT_TYPE_AAC_LC;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];

    fn video_format() -> VideoFormat {
        let config = AvcConfig::from_parameter_sets(
            Bytes::from_static(SPS),
            Bytes::from_static(PPS),
        )
        .unwrap();
        VideoFormat {
            codec: VideoCodec::Avc,
            width: 1280,
            height: 720,
            config: config.to_bytes(),
        }
    }

    fn audio_format() -> AudioFormat {
        let asc = AudioSpecificConfig::new(OBJECT_TYPE_AAC_LC, 44100, 2).unwrap();
        AudioFormat {
            codec: AudioCodec::Aac,
            sample_rate: 44100,
            channels: 2,
            config: asc.to_bytes(),
        }
    }

    fn frame(ms: i64, keyframe: bool) -> SampleBuffer {
        let nal_type = if keyframe { 0x65 } else { 0x41 };
        let data = Bytes::from(vec![0, 0, 0, 3, nal_type, 0x88, ms as u8]);
        SampleBuffer::video(MediaTime::from_millis(ms), data, keyframe)
    }

    fn publishing_muxer() -> RtmpMuxer {
        let mut muxer = RtmpMuxer::new(1);
        muxer.set_video_format(Some(video_format()));
        muxer.set_audio_format(Some(audio_format()));
        muxer.start(MediaSet::all());
        muxer
    }

    fn decode(bytes: &[u8]) -> Vec<ChunkMessage> {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(&mut buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_first_video_message_layout() {
        let mut muxer = publishing_muxer();
        let out = muxer.append_video(&frame(1000, true)).unwrap();
        assert!(!out.ready);

        let messages = decode(&out.bytes);
        assert_eq!(messages.len(), 3);

        assert_eq!(messages[0].type_id, MSG_DATA_AMF0);
        assert_eq!(messages[0].csid, CSID_DATA);
        let metadata = parse_metadata(messages[0].payload.clone()).unwrap().unwrap();
        assert_eq!(metadata.get_number("width"), Some(1280.0));

        // Sequence header with an absolute timestamp of 0
        assert_eq!(messages[1].csid, CSID_VIDEO);
        assert_eq!(messages[1].chunk_type, ChunkType::Full);
        assert_eq!(messages[1].timestamp, 0);
        assert_eq!(messages[1].stream_id, 1);
        assert_eq!(&messages[1].payload[..2], &[0x17, 0x00]);

        assert_eq!(messages[2].chunk_type, ChunkType::SameStream);
        assert_eq!(messages[2].timestamp, 0);
        assert_eq!(&messages[2].payload[..2], &[0x17, 0x01]);
    }

    #[test]
    fn test_later_messages_carry_deltas() {
        let mut muxer = publishing_muxer();
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&muxer.append_video(&frame(0, true)).unwrap().bytes);
        bytes.extend_from_slice(&muxer.append_video(&frame(40, false)).unwrap().bytes);
        bytes.extend_from_slice(&muxer.append_video(&frame(80, false)).unwrap().bytes);

        let messages = decode(&bytes);
        let frames: Vec<_> = messages.iter().filter(|m| m.type_id == MSG_VIDEO).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2].chunk_type, ChunkType::SameStream);
        assert_eq!(frames[2].timestamp, 40);
        assert_eq!(frames[3].timestamp, 40);
    }

    #[test]
    fn test_ready_once_both_tracks_produced() {
        let mut muxer = publishing_muxer();
        assert!(!muxer.append_video(&frame(0, true)).unwrap().ready);
        assert!(!muxer.append_video(&frame(33, false)).unwrap().ready);
        let audio = AudioBuffer::aac(Bytes::from_static(&[0x21, 0x10]));
        assert!(muxer.append_audio(&audio, HostTime(0)).unwrap().ready);
        assert!(!muxer.append_audio(&audio, HostTime(23_000_000)).unwrap().ready);

        // A new activation re-arms readiness and re-sends the sequence header
        muxer.start(MediaSet::all());
        let out = muxer.append_video(&frame(100, true)).unwrap();
        let messages = decode(&out.bytes);
        assert_eq!(messages[1].chunk_type, ChunkType::Full);
        assert_eq!(&messages[1].payload[..2], &[0x17, 0x00]);
    }

    #[test]
    fn test_frames_before_format_are_dropped() {
        let mut muxer = RtmpMuxer::new(1);
        muxer.start(MediaSet::all());
        let out = muxer.append_video(&frame(0, true)).unwrap();
        assert!(out.bytes.is_empty());

        let mut raw = frame(0, true);
        raw.is_compressed = false;
        muxer.set_video_format(Some(video_format()));
        assert!(muxer.append_video(&raw).is_err());
    }

    #[test]
    fn test_composition_time_on_reordered_frames() {
        let mut muxer = publishing_muxer();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&muxer.append_video(&frame(0, true)).unwrap().bytes);

        let mut sample = frame(1250, false);
        sample.decode_time = MediaTime::from_millis(1000);
        // Later messages carry compressed headers; decode the whole stream
        wire.extend_from_slice(&muxer.append_video(&sample).unwrap().bytes);
        let messages = decode(&wire);
        let last = messages.last().unwrap();
        assert_eq!(last.chunk_type, ChunkType::SameStream);
        // 1250 + 100 - 1000
        assert_eq!(&last.payload[2..5], &[0x00, 0x01, 0x5E]);
    }

    #[test]
    fn test_round_trip_preserves_times() {
        let mut muxer = publishing_muxer();
        let mut wire = BytesMut::new();
        for i in 0..5i64 {
            let out = muxer.append_video(&frame(i * 125, i == 0)).unwrap();
            wire.extend_from_slice(&out.bytes);
        }
        for i in 0..3u64 {
            let audio = AudioBuffer::aac(Bytes::from(vec![0x21, i as u8]));
            let out = muxer.append_audio(&audio, HostTime(i * 250_000_000)).unwrap();
            wire.extend_from_slice(&out.bytes);
        }

        let mut reader = RtmpMuxer::new(1);
        reader.start(MediaSet::empty());
        let mut events = Vec::new();
        // Odd-sized reads split chunks and headers
        for piece in wire.chunks(7) {
            events.extend(reader.read(piece));
        }

        let video: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MuxEvent::Video(s) => Some(s.presentation_time),
                _ => None,
            })
            .collect();
        let audio: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MuxEvent::Audio(_, t) => Some(*t),
                _ => None,
            })
            .collect();

        assert_eq!(
            video,
            (0..5).map(|i| MediaTime::from_millis(i * 125)).collect::<Vec<_>>()
        );
        assert_eq!(
            audio,
            (0..3).map(|i| MediaTime::from_millis(i * 250)).collect::<Vec<_>>()
        );
        assert!(events.iter().any(|e| matches!(e, MuxEvent::VideoFormat(f) if f.width == 1280)));
        assert!(events.iter().any(|e| matches!(e, MuxEvent::AudioFormat(f) if f.sample_rate == 44100)));
        assert_eq!(
            events.iter().filter(|e| matches!(e, MuxEvent::Ready)).count(),
            1
        );
    }

    #[test]
    fn test_round_trip_reordered_frame() {
        let offset = MediaTime::new(1, 8);
        let mut muxer = RtmpMuxer::with_offset(1, offset);
        muxer.set_video_format(Some(video_format()));
        muxer.start(MediaSet::all());

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&muxer.append_video(&frame(0, true)).unwrap().bytes);
        let mut sample = frame(250, false);
        sample.decode_time = MediaTime::from_millis(125);
        wire.extend_from_slice(&muxer.append_video(&sample).unwrap().bytes);

        let mut reader = RtmpMuxer::with_offset(1, offset);
        let events = reader.read(&wire);
        let samples: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                MuxEvent::Video(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].presentation_time, MediaTime::from_millis(250));
        assert_eq!(samples[1].decode_time, MediaTime::from_millis(125));
    }

    #[test]
    fn test_reader_offset_must_match_sender() {
        let mut muxer = RtmpMuxer::with_offset(1, MediaTime::new(1, 8));
        muxer.set_video_format(Some(video_format()));
        muxer.start(MediaSet::all());
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&muxer.append_video(&frame(0, true)).unwrap().bytes);
        let mut sample = frame(250, false);
        sample.decode_time = MediaTime::from_millis(125);
        wire.extend_from_slice(&muxer.append_video(&sample).unwrap().bytes);

        // 125 ms sender offset, 100 ms reader offset
        let mut reader = RtmpMuxer::new(1);
        let shifted = reader
            .read(&wire)
            .into_iter()
            .filter_map(|e| match e {
                MuxEvent::Video(s) => Some(s.presentation_time),
                _ => None,
            })
            .last();
        assert_eq!(shifted, Some(MediaTime::from_millis(275)));
    }

    #[test]
    fn test_demux_decoded_messages() {
        let mut muxer = publishing_muxer();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&muxer.append_video(&frame(0, true)).unwrap().bytes);
        wire.extend_from_slice(&muxer.append_video(&frame(40, false)).unwrap().bytes);

        let mut reader = RtmpMuxer::new(1);
        let mut events = Vec::new();
        for msg in decode(&wire) {
            events.extend(reader.demux(msg));
        }
        // A command is left to the connection
        let command = crate::protocol::message::Command::publish("x").into_chunk(1);
        assert!(reader.demux(command).is_empty());

        let times: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                MuxEvent::Video(s) => Some(s.presentation_time),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![MediaTime::from_millis(0), MediaTime::from_millis(40)]);
        assert!(events.iter().any(|e| matches!(e, MuxEvent::Metadata(_))));
        assert!(!events.iter().any(|e| matches!(e, MuxEvent::Error(_))));
    }

    #[test]
    fn test_garbage_yields_errors_then_fatal() {
        let mut reader = RtmpMuxer::new(1);
        // fmt 1 on an unknown chunk stream, repeated
        let garbage = [0x45u8; 64];
        let events = reader.read(&garbage);
        assert!(events.iter().any(|e| matches!(e, MuxEvent::Error(_))));

        let mut fatal = false;
        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            fatal |= reader
                .read(&garbage)
                .iter()
                .any(|e| matches!(e, MuxEvent::Fatal(_)));
        }
        assert!(fatal);
    }
}
