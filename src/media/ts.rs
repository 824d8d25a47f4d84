//! MPEG-2 transport stream writer and reader
//!
//! A single-program stream with fixed PIDs:
//!
//! | PID    | Content                          |
//! |--------|----------------------------------|
//! | 0x0000 | PAT                              |
//! | 0x1000 | PMT                              |
//! | 0x0100 | H.264 video (stream type 0x1B)   |
//! | 0x0101 | AAC ADTS audio (stream type 0x0F)|
//!
//! PES headers carry PTS (and DTS when it differs) on the 90 kHz clock. The
//! PCR rides in the adaptation field of the first packet of each PES on the
//! PCR PID.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MediaError;

pub const TS_PACKET_SIZE: usize = 188;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;

pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_AAC: u8 = 0x0F;

pub const STREAM_ID_VIDEO: u8 = 0xE0;
pub const STREAM_ID_AUDIO: u8 = 0xC0;

const PROGRAM_NUMBER: u16 = 1;
const TRANSPORT_STREAM_ID: u16 = 1;

const TABLE_PAT: u8 = 0x00;
const TABLE_PMT: u8 = 0x02;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_MPEG_2);

/// An elementary stream listed in the PMT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementaryStream {
    pub stream_type: u8,
    pub pid: u16,
}

/// Packetizes PSI tables and PES packets
#[derive(Debug)]
pub struct TsWriter {
    continuity: HashMap<u16, u8>,
    streams: Vec<ElementaryStream>,
    pcr_pid: u16,
    pmt_version: u8,
}

impl Default for TsWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TsWriter {
    pub fn new() -> Self {
        Self {
            continuity: HashMap::new(),
            streams: Vec::new(),
            pcr_pid: PID_VIDEO,
            pmt_version: 0,
        }
    }

    /// Declare the program's streams; the PMT version moves on change
    pub fn set_streams(&mut self, video: bool, audio: bool) {
        let mut streams = Vec::with_capacity(2);
        if video {
            streams.push(ElementaryStream {
                stream_type: STREAM_TYPE_H264,
                pid: PID_VIDEO,
            });
        }
        if audio {
            streams.push(ElementaryStream {
                stream_type: STREAM_TYPE_AAC,
                pid: PID_AUDIO,
            });
        }
        if streams != self.streams {
            self.pmt_version = (self.pmt_version + 1) & 0x1F;
            self.streams = streams;
        }
        self.pcr_pid = if video { PID_VIDEO } else { PID_AUDIO };
    }

    pub fn pcr_pid(&self) -> u16 {
        self.pcr_pid
    }

    pub fn reset(&mut self) {
        self.continuity.clear();
    }

    /// Append PAT and PMT packets
    pub fn write_tables(&mut self, buf: &mut BytesMut) {
        let mut pat = BytesMut::with_capacity(16);
        pat.put_u16(PROGRAM_NUMBER);
        pat.put_u16(0xE000 | PID_PMT);
        self.write_section(buf, PID_PAT, TABLE_PAT, TRANSPORT_STREAM_ID, 0, &pat);

        let mut pmt = BytesMut::with_capacity(32);
        pmt.put_u16(0xE000 | self.pcr_pid);
        // No program descriptors
        pmt.put_u16(0xF000);
        for stream in &self.streams {
            pmt.put_u8(stream.stream_type);
            pmt.put_u16(0xE000 | stream.pid);
            pmt.put_u16(0xF000);
        }
        let version = self.pmt_version;
        self.write_section(buf, PID_PMT, TABLE_PMT, PROGRAM_NUMBER, version, &pmt);
    }

    fn write_section(
        &mut self,
        buf: &mut BytesMut,
        pid: u16,
        table_id: u8,
        table_id_extension: u16,
        version: u8,
        body: &[u8],
    ) {
        let mut section = BytesMut::with_capacity(body.len() + 12);
        section.put_u8(table_id);
        // section_syntax_indicator, reserved, length (+5 header, +4 CRC)
        section.put_u16(0xB000 | (body.len() as u16 + 9));
        section.put_u16(table_id_extension);
        section.put_u8(0xC1 | (version & 0x1F) << 1);
        section.put_u8(0);
        section.put_u8(0);
        section.put_slice(body);
        let crc = CRC.checksum(&section);
        section.put_u32(crc);

        let cc = self.next_continuity(pid);
        buf.reserve(TS_PACKET_SIZE);
        buf.put_u8(SYNC_BYTE);
        buf.put_u8(0x40 | (pid >> 8) as u8 & 0x1F);
        buf.put_u8(pid as u8);
        buf.put_u8(0x10 | cc);
        // pointer_field
        buf.put_u8(0);
        buf.put_slice(&section);
        buf.put_bytes(0xFF, TS_PAYLOAD_SIZE - 1 - section.len());
    }

    /// Append one PES packet split into TS packets
    ///
    /// Times are on the 90 kHz clock. `dts` is omitted from the header when
    /// equal to `pts`. The PCR is taken from `dts` (or `pts`) when `pid` is
    /// the PCR PID.
    pub fn write_pes(
        &mut self,
        buf: &mut BytesMut,
        pid: u16,
        pts: u64,
        dts: Option<u64>,
        payload: &[u8],
        random_access: bool,
    ) {
        let stream_id = if pid == PID_VIDEO {
            STREAM_ID_VIDEO
        } else {
            STREAM_ID_AUDIO
        };
        let dts = dts.filter(|d| *d != pts);
        let header_data_len: u8 = if dts.is_some() { 10 } else { 5 };

        let mut pes = BytesMut::with_capacity(payload.len() + 19);
        pes.put_slice(&[0, 0, 1, stream_id]);
        let packet_len = 3 + header_data_len as usize + payload.len();
        pes.put_u16(if packet_len > u16::MAX as usize {
            0
        } else {
            packet_len as u16
        });
        // '10' marker, data_alignment_indicator
        pes.put_u8(0x84);
        pes.put_u8(if dts.is_some() { 0xC0 } else { 0x80 });
        pes.put_u8(header_data_len);
        match dts {
            Some(dts) => {
                put_timestamp(&mut pes, 0x3, pts);
                put_timestamp(&mut pes, 0x1, dts);
            }
            None => put_timestamp(&mut pes, 0x2, pts),
        }
        pes.put_slice(payload);

        let pcr = (pid == self.pcr_pid).then(|| dts.unwrap_or(pts));
        self.write_packets(buf, pid, &pes, pcr, random_access);
    }

    fn write_packets(
        &mut self,
        buf: &mut BytesMut,
        pid: u16,
        data: &[u8],
        pcr: Option<u64>,
        random_access: bool,
    ) {
        let mut offset = 0;
        let mut first = true;
        buf.reserve((data.len() / TS_PAYLOAD_SIZE + 1) * TS_PACKET_SIZE);

        while first || offset < data.len() {
            // Adaptation field body, without its length byte
            let mut adaptation = BytesMut::new();
            let mut has_adaptation = false;
            if first && (pcr.is_some() || random_access) {
                has_adaptation = true;
                let mut flags = 0u8;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                adaptation.put_u8(flags);
                if let Some(pcr) = pcr {
                    put_pcr(&mut adaptation, pcr);
                }
            }

            let remaining = data.len() - offset;
            let space = TS_PAYLOAD_SIZE
                - if has_adaptation {
                    1 + adaptation.len()
                } else {
                    0
                };
            let take = remaining.min(space);
            let stuffing = space - take;
            if stuffing > 0 {
                if !has_adaptation {
                    has_adaptation = true;
                    // The length byte alone covers one byte of stuffing
                    if stuffing > 1 {
                        adaptation.put_u8(0x00);
                        adaptation.put_bytes(0xFF, stuffing - 2);
                    }
                } else {
                    adaptation.put_bytes(0xFF, stuffing);
                }
            }

            let cc = self.next_continuity(pid);
            buf.put_u8(SYNC_BYTE);
            let unit_start: u8 = if first { 0x40 } else { 0x00 };
            buf.put_u8(unit_start | (pid >> 8) as u8 & 0x1F);
            buf.put_u8(pid as u8);
            let control: u8 = if has_adaptation { 0x30 } else { 0x10 };
            buf.put_u8(control | cc);
            if has_adaptation {
                buf.put_u8(adaptation.len() as u8);
                buf.put_slice(&adaptation);
            }
            buf.put_slice(&data[offset..offset + take]);

            offset += take;
            first = false;
        }
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }
}

fn put_timestamp(buf: &mut BytesMut, prefix: u8, ts: u64) {
    let ts = ts & 0x1_FFFF_FFFF;
    buf.put_u8(prefix << 4 | ((ts >> 29) as u8 & 0x0E) | 1);
    buf.put_u16((((ts >> 14) & 0xFFFE) | 1) as u16);
    buf.put_u16((((ts << 1) & 0xFFFE) | 1) as u16);
}

fn get_timestamp(data: &[u8]) -> u64 {
    ((data[0] as u64 >> 1) & 0x07) << 30
        | (data[1] as u64) << 22
        | (data[2] as u64 >> 1) << 15
        | (data[3] as u64) << 7
        | data[4] as u64 >> 1
}

fn put_pcr(buf: &mut BytesMut, base: u64) {
    let base = base & 0x1_FFFF_FFFF;
    buf.put_u32((base >> 1) as u32);
    // Last base bit, 6 reserved bits, 9-bit extension of zero
    buf.put_u8(((base & 1) as u8) << 7 | 0x7E);
    buf.put_u8(0);
}

/// A reassembled PES packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesPacket {
    pub pid: u16,
    pub stream_type: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub random_access: bool,
    pub data: Bytes,
}

/// Output of [`TsReader::push`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsEvent {
    /// The PMT announced a new set of streams
    Program(Vec<ElementaryStream>),
    Pes(PesPacket),
    /// Recoverable error; the reader already resynchronised
    Error(MediaError),
}

#[derive(Debug)]
struct PesAssembly {
    random_access: bool,
    data: BytesMut,
}

/// Depacketizes a transport stream
///
/// Bytes may arrive in arbitrary pieces; partial packets are kept until the
/// rest arrives.
#[derive(Debug, Default)]
pub struct TsReader {
    buf: BytesMut,
    pmt_pid: Option<u16>,
    streams: Vec<ElementaryStream>,
    assemblies: HashMap<u16, PesAssembly>,
    in_sync: bool,
}

impl TsReader {
    pub fn new() -> Self {
        Self {
            in_sync: true,
            ..Default::default()
        }
    }

    pub fn streams(&self) -> &[ElementaryStream] {
        &self.streams
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<TsEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        while self.buf.len() >= TS_PACKET_SIZE {
            if self.buf[0] != SYNC_BYTE {
                if self.in_sync {
                    self.in_sync = false;
                    events.push(TsEvent::Error(MediaError::InvalidTransportStream(
                        "lost sync",
                    )));
                }
                let skip = self.buf[1..]
                    .iter()
                    .position(|b| *b == SYNC_BYTE)
                    .map(|p| p + 1)
                    .unwrap_or(self.buf.len());
                self.buf.advance(skip);
                continue;
            }
            self.in_sync = true;
            let packet = self.buf.split_to(TS_PACKET_SIZE).freeze();
            if let Err(e) = self.handle_packet(&packet, &mut events) {
                events.push(TsEvent::Error(e));
            }
        }
        events
    }

    /// Emit whatever PES data is still buffered
    pub fn flush(&mut self) -> Vec<TsEvent> {
        let mut events = Vec::new();
        let pids: Vec<u16> = self.assemblies.keys().copied().collect();
        for pid in pids {
            if let Some(assembly) = self.assemblies.remove(&pid) {
                self.emit(pid, assembly, &mut events);
            }
        }
        events
    }

    pub fn reset(&mut self) {
        *self = TsReader::new();
    }

    fn handle_packet(&mut self, packet: &Bytes, events: &mut Vec<TsEvent>) -> Result<(), MediaError> {
        let unit_start = packet[1] & 0x40 != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let control = (packet[3] >> 4) & 0x03;

        let mut start = 4;
        let mut random_access = false;
        if control & 0x02 != 0 {
            let len = packet[4] as usize;
            if len > 0 {
                random_access = packet[5] & 0x40 != 0;
            }
            start += 1 + len;
        }
        if control & 0x01 == 0 {
            return Ok(());
        }
        if start > TS_PACKET_SIZE {
            return Err(MediaError::InvalidTransportStream("adaptation field too long"));
        }
        let payload = packet.slice(start..);

        if pid == PID_PAT {
            if unit_start {
                self.parse_pat(&payload)?;
            }
            return Ok(());
        }
        if Some(pid) == self.pmt_pid {
            if unit_start {
                self.parse_pmt(&payload, events)?;
            }
            return Ok(());
        }
        if !self.streams.iter().any(|s| s.pid == pid) {
            return Ok(());
        }

        if unit_start {
            if let Some(previous) = self.assemblies.remove(&pid) {
                self.emit(pid, previous, events);
            }
            self.assemblies.insert(
                pid,
                PesAssembly {
                    random_access,
                    data: BytesMut::from(&payload[..]),
                },
            );
        } else if let Some(assembly) = self.assemblies.get_mut(&pid) {
            assembly.data.extend_from_slice(&payload);
        } else {
            // Continuation without a start: joined mid-PES
            return Ok(());
        }

        // Emit as soon as a PES with a declared length is complete
        let complete = self.assemblies.get(&pid).is_some_and(|a| {
            a.data.len() >= 6 && {
                let declared = u16::from_be_bytes([a.data[4], a.data[5]]) as usize;
                declared != 0 && a.data.len() >= declared + 6
            }
        });
        if complete {
            if let Some(assembly) = self.assemblies.remove(&pid) {
                self.emit(pid, assembly, events);
            }
        }
        Ok(())
    }

    fn emit(&self, pid: u16, assembly: PesAssembly, events: &mut Vec<TsEvent>) {
        let stream_type = self
            .streams
            .iter()
            .find(|s| s.pid == pid)
            .map(|s| s.stream_type)
            .unwrap_or(0);
        match parse_pes(assembly.data.freeze()) {
            Ok((pts, dts, data)) => events.push(TsEvent::Pes(PesPacket {
                pid,
                stream_type,
                pts,
                dts,
                random_access: assembly.random_access,
                data,
            })),
            Err(e) => events.push(TsEvent::Error(e)),
        }
    }

    fn parse_pat(&mut self, payload: &Bytes) -> Result<(), MediaError> {
        let body = section_body(payload, TABLE_PAT)?;
        for entry in body.chunks_exact(4) {
            let program = u16::from_be_bytes([entry[0], entry[1]]);
            if program != 0 {
                self.pmt_pid = Some(u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF);
                break;
            }
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &Bytes, events: &mut Vec<TsEvent>) -> Result<(), MediaError> {
        let body = section_body(payload, TABLE_PMT)?;
        if body.len() < 4 {
            return Err(MediaError::InvalidTransportStream("short PMT"));
        }
        let info_len = (u16::from_be_bytes([body[2], body[3]]) & 0x0FFF) as usize;
        let mut rest = body
            .get(4 + info_len..)
            .ok_or(MediaError::InvalidTransportStream("short PMT"))?;

        let mut streams = Vec::new();
        while rest.len() >= 5 {
            let stream_type = rest[0];
            let pid = u16::from_be_bytes([rest[1], rest[2]]) & 0x1FFF;
            let es_info_len = (u16::from_be_bytes([rest[3], rest[4]]) & 0x0FFF) as usize;
            streams.push(ElementaryStream { stream_type, pid });
            rest = rest.get(5 + es_info_len..).unwrap_or(&[]);
        }

        if streams != self.streams {
            self.streams = streams.clone();
            events.push(TsEvent::Program(streams));
        }
        Ok(())
    }
}

/// Validate a PSI section and return the bytes between its header and CRC
fn section_body(payload: &Bytes, table_id: u8) -> Result<Bytes, MediaError> {
    let pointer = *payload
        .first()
        .ok_or(MediaError::InvalidTransportStream("empty section"))? as usize;
    let section = payload
        .get(1 + pointer..)
        .ok_or(MediaError::InvalidTransportStream("bad pointer field"))?;
    if section.len() < 3 || section[0] != table_id {
        return Err(MediaError::InvalidTransportStream("unexpected table"));
    }
    let length = (u16::from_be_bytes([section[1], section[2]]) & 0x0FFF) as usize;
    if length < 9 || section.len() < 3 + length {
        return Err(MediaError::InvalidTransportStream("truncated section"));
    }
    let crc_offset = 3 + length - 4;
    let expected = u32::from_be_bytes([
        section[crc_offset],
        section[crc_offset + 1],
        section[crc_offset + 2],
        section[crc_offset + 3],
    ]);
    if CRC.checksum(&section[..crc_offset]) != expected {
        return Err(MediaError::InvalidTransportStream("section CRC mismatch"));
    }
    Ok(Bytes::copy_from_slice(&section[8..crc_offset]))
}

fn parse_pes(data: Bytes) -> Result<(Option<u64>, Option<u64>, Bytes), MediaError> {
    if data.len() < 9 || data[..3] != [0, 0, 1] {
        return Err(MediaError::InvalidTransportStream("bad PES start code"));
    }
    let declared = u16::from_be_bytes([data[4], data[5]]) as usize;
    let flags = data[7];
    let header_len = data[8] as usize;
    let payload_start = 9 + header_len;
    if data.len() < payload_start {
        return Err(MediaError::InvalidTransportStream("short PES header"));
    }

    let (pts, dts) = match flags >> 6 {
        0b10 if header_len >= 5 => (Some(get_timestamp(&data[9..14])), None),
        0b11 if header_len >= 10 => (
            Some(get_timestamp(&data[9..14])),
            Some(get_timestamp(&data[14..19])),
        ),
        _ => (None, None),
    };

    let end = if declared == 0 {
        data.len()
    } else {
        (declared + 6).min(data.len())
    };
    Ok((pts, dts, data.slice(payload_start..end)))
}
