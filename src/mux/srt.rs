//! MPEG-TS muxer for SRT
//!
//! Video goes out as Annex-B access units (with an access unit delimiter,
//! and SPS/PPS in front of every IDR) on PID 0x100; audio as ADTS frames on
//! PID 0x101. PAT and PMT are repeated before the first frame, on every
//! video keyframe and after a format change. Times start at zero for each
//! track and run on the 90 kHz clock.

use bytes::{BufMut, BytesMut};

use super::{MuxEvent, Muxed, Muxer, Readiness, MAX_CONSECUTIVE_ERRORS};
use crate::error::{MediaError, Result};
use crate::media::aac::{split_adts, AudioSpecificConfig};
use crate::media::avc::{annexb_to_avcc, avcc_to_annexb, AvcConfig, NAL_AUD};
use crate::media::sample::{
    AudioBuffer, AudioCodec, AudioFormat, HostTime, MediaSet, MediaTime, MediaType, SampleBuffer,
    VideoCodec, VideoFormat,
};
use crate::media::ts::{
    PesPacket, TsEvent, TsReader, TsWriter, PID_AUDIO, PID_VIDEO, STREAM_TYPE_AAC,
    STREAM_TYPE_H264,
};

const CLOCK: u32 = 90_000;

/// Access unit delimiter, primary_pic_type 7 (any slice type)
const AUD: [u8; 6] = [0x00, 0x00, 0x00, 0x01, NAL_AUD, 0xF0];

/// MPEG-TS framing for one SRT stream
#[derive(Debug)]
pub struct SrtMuxer {
    writer: TsWriter,
    readiness: Readiness,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    avc_config: Option<AvcConfig>,
    aac_config: Option<AudioSpecificConfig>,
    tables_pending: bool,
    video_origin: Option<f64>,
    audio_origin: Option<f64>,

    reader: TsReader,
    inbound_avc: Option<AvcConfig>,
    inbound_aac: Option<AudioSpecificConfig>,
    errors: u32,
}

impl Default for SrtMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl SrtMuxer {
    pub fn new() -> Self {
        Self {
            writer: TsWriter::new(),
            readiness: Readiness::default(),
            video_format: None,
            audio_format: None,
            avc_config: None,
            aac_config: None,
            tables_pending: true,
            video_origin: None,
            audio_origin: None,
            reader: TsReader::new(),
            inbound_avc: None,
            inbound_aac: None,
            errors: 0,
        }
    }

    /// Program layout: the expected set, or the known formats before start
    fn update_streams(&mut self) {
        let expected = self.readiness.expected();
        let (video, audio) = if expected.is_empty() {
            (self.video_format.is_some(), self.audio_format.is_some())
        } else {
            (
                expected.contains(MediaType::Video),
                expected.contains(MediaType::Audio),
            )
        };
        self.writer.set_streams(video, audio);
        self.tables_pending = true;
    }

    fn write_tables_if(&mut self, buf: &mut BytesMut, force: bool) {
        if force || self.tables_pending {
            self.tables_pending = false;
            self.writer.write_tables(buf);
        }
    }

    fn handle_pes(&mut self, pes: PesPacket, events: &mut Vec<MuxEvent>) {
        match pes.stream_type {
            STREAM_TYPE_H264 => self.handle_video(pes, events),
            STREAM_TYPE_AAC => {
                if let Err(e) = self.handle_audio(pes, events) {
                    events.push(MuxEvent::Error(e.into()));
                }
            }
            other => tracing::trace!(stream_type = other, "Ignoring PES"),
        }
    }

    fn handle_video(&mut self, pes: PesPacket, events: &mut Vec<MuxEvent>) {
        let au = annexb_to_avcc(&pes.data);
        if let (Some(sps), Some(pps)) = (au.sps, au.pps) {
            if let Ok(config) = AvcConfig::from_parameter_sets(sps, pps) {
                if self.inbound_avc.as_ref() != Some(&config) {
                    events.push(MuxEvent::VideoFormat(VideoFormat {
                        codec: VideoCodec::Avc,
                        width: 0,
                        height: 0,
                        config: config.to_bytes(),
                    }));
                    self.inbound_avc = Some(config);
                }
            }
        }
        if au.data.is_empty() {
            return;
        }

        let pts = pes.pts.unwrap_or(0);
        let mut sample = SampleBuffer::video(MediaTime::new(pts as i64, CLOCK), au.data, au.keyframe);
        if let Some(dts) = pes.dts {
            sample.decode_time = MediaTime::new(dts as i64, CLOCK);
        }
        if self.readiness.mark(MediaType::Video) {
            events.push(MuxEvent::Ready);
        }
        events.push(MuxEvent::Video(sample));
    }

    fn handle_audio(
        &mut self,
        pes: PesPacket,
        events: &mut Vec<MuxEvent>,
    ) -> std::result::Result<(), MediaError> {
        let pts = pes.pts.unwrap_or(0) as i64;
        for (i, frame) in split_adts(pes.data)?.into_iter().enumerate() {
            if self.inbound_aac != Some(frame.config) {
                self.inbound_aac = Some(frame.config);
                events.push(MuxEvent::AudioFormat(AudioFormat {
                    codec: AudioCodec::Aac,
                    sample_rate: frame.config.sample_rate(),
                    channels: frame.config.channel_config,
                    config: frame.config.to_bytes(),
                }));
            }
            let buffer = AudioBuffer::aac(frame.payload);
            let rate = frame.config.sample_rate().max(1) as i64;
            let time = MediaTime::new(
                pts + i as i64 * buffer.frame_length as i64 * CLOCK as i64 / rate,
                CLOCK,
            );
            if self.readiness.mark(MediaType::Audio) {
                events.push(MuxEvent::Ready);
            }
            events.push(MuxEvent::Audio(buffer, time));
        }
        Ok(())
    }
}

fn to_clock(seconds: f64, origin: f64) -> u64 {
    ((seconds - origin).max(0.0) * CLOCK as f64).round() as u64
}

impl Muxer for SrtMuxer {
    fn expected_medias(&self) -> MediaSet {
        self.readiness.expected()
    }

    fn set_expected_medias(&mut self, medias: MediaSet) {
        self.readiness.set_expected(medias);
        self.update_streams();
    }

    fn start(&mut self, medias: MediaSet) {
        self.stop();
        self.readiness.reset(medias);
        self.update_streams();
    }

    fn stop(&mut self) {
        self.writer.reset();
        self.tables_pending = true;
        self.video_origin = None;
        self.audio_origin = None;
        self.reader.reset();
        self.inbound_avc = None;
        self.inbound_aac = None;
        self.errors = 0;
    }

    fn set_video_format(&mut self, format: Option<VideoFormat>) {
        self.avc_config = match &format {
            Some(f) => match AvcConfig::parse(&f.config) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(error = %e, "Unusable AVC configuration");
                    None
                }
            },
            None => None,
        };
        self.video_format = format;
        self.update_streams();
    }

    fn set_audio_format(&mut self, format: Option<AudioFormat>) {
        self.aac_config = match &format {
            Some(f) => match AudioSpecificConfig::parse(&f.config) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(error = %e, "Unusable AAC configuration");
                    None
                }
            },
            None => None,
        };
        self.audio_format = format;
        self.update_streams();
    }

    fn append_video(&mut self, sample: &SampleBuffer) -> Result<Muxed> {
        if !sample.is_compressed {
            return Err(MediaError::InvalidAvcPacket.into());
        }
        let Some(config) = &self.avc_config else {
            tracing::trace!("Dropping video frame before format");
            return Ok(Muxed::default());
        };

        let parameter_sets = sample.is_keyframe.then_some(config);
        let units = avcc_to_annexb(&sample.data, config.length_size, parameter_sets)?;
        let mut payload = BytesMut::with_capacity(AUD.len() + units.len());
        payload.put_slice(&AUD);
        payload.put_slice(&units);

        let dts_seconds = sample.decode_or_presentation_time().seconds();
        let origin = *self.video_origin.get_or_insert(dts_seconds);
        let pts = to_clock(sample.presentation_time.seconds(), origin);
        let dts = sample
            .decode_time
            .is_valid()
            .then(|| to_clock(dts_seconds, origin));

        let mut buf = BytesMut::with_capacity(payload.len() + 4 * 188);
        self.write_tables_if(&mut buf, sample.is_keyframe);
        self.writer
            .write_pes(&mut buf, PID_VIDEO, pts, dts, &payload, sample.is_keyframe);

        Ok(Muxed {
            bytes: buf.freeze(),
            ready: self.readiness.mark(MediaType::Video),
        })
    }

    fn append_audio(&mut self, buffer: &AudioBuffer, when: HostTime) -> Result<Muxed> {
        if !buffer.is_compressed {
            return Err(MediaError::InvalidAacPacket.into());
        }
        let Some(config) = self.aac_config else {
            tracing::trace!("Dropping audio buffer before format");
            return Ok(Muxed::default());
        };

        let mut payload = BytesMut::with_capacity(buffer.data.len() + 7);
        config.write_adts_header(&mut payload, buffer.data.len());
        payload.put_slice(&buffer.data);

        let origin = *self.audio_origin.get_or_insert(when.seconds());
        let pts = to_clock(when.seconds(), origin);

        let mut buf = BytesMut::with_capacity(payload.len() + 3 * 188);
        self.write_tables_if(&mut buf, false);
        self.writer
            .write_pes(&mut buf, PID_AUDIO, pts, None, &payload, true);

        Ok(Muxed {
            bytes: buf.freeze(),
            ready: self.readiness.mark(MediaType::Audio),
        })
    }

    fn read(&mut self, data: &[u8]) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        for event in self.reader.push(data) {
            match event {
                TsEvent::Program(streams) => {
                    tracing::debug!(streams = streams.len(), "Program map updated");
                }
                TsEvent::Pes(pes) => {
                    self.errors = 0;
                    self.handle_pes(pes, &mut events);
                }
                TsEvent::Error(e) => {
                    self.errors += 1;
                    if self.errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::warn!(errors = self.errors, "MPEG-TS input unrecoverable");
                        events.push(MuxEvent::Fatal(e.into()));
                        self.reader.reset();
                        break;
                    }
                    events.push(MuxEvent::Error(e.into()));
                }
            }
        }
        events
    }
}
