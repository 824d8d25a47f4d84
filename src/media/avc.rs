//! H.264/AVC bitstream layouts
//!
//! Encoders hand out access units in AVCC layout (each NAL unit prefixed by
//! its length) and an AVCDecoderConfigurationRecord carrying SPS/PPS. RTMP
//! carries both unchanged. MPEG-TS needs Annex-B (start code prefixed) units
//! with parameter sets repeated in-band ahead of every IDR.
//!
//! AVCDecoderConfigurationRecord:
//! ```text
//! version(1) | profile(1) | compatibility(1) | level(1)
//! | 111111 lengthSizeMinusOne(2) | 111 numSPS(5) | { len(2) sps }*
//! | numPPS(1) | { len(2) pps }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MediaError;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// NAL unit type of a unit's first byte
pub fn nal_type(first_byte: u8) -> u8 {
    first_byte & 0x1F
}

/// Parsed AVCDecoderConfigurationRecord
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// Bytes in each NAL length prefix (1, 2 or 4)
    pub length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Build a record from one SPS and one PPS, 4-byte lengths
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self, MediaError> {
        if sps.len() < 4 || pps.is_empty() {
            return Err(MediaError::InvalidAvcPacket);
        }
        Ok(Self {
            profile: sps[1],
            compatibility: sps[2],
            level: sps[3],
            length_size: 4,
            sps: vec![sps],
            pps: vec![pps],
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self, MediaError> {
        let mut data = data;
        if data.len() < 7 || data[0] != 1 {
            return Err(MediaError::InvalidAvcPacket);
        }
        data.advance(1);
        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let length_size = (data.get_u8() & 0x03) + 1;
        if length_size == 3 {
            return Err(MediaError::InvalidAvcPacket);
        }

        let sps_count = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, sps_count)?;
        if data.is_empty() {
            return Err(MediaError::InvalidAvcPacket);
        }
        let pps_count = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, pps_count)?;

        Ok(Self {
            profile,
            compatibility,
            level,
            length_size,
            sps,
            pps,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            11 + self.sps.iter().chain(&self.pps).map(|p| p.len() + 2).sum::<usize>(),
        );
        buf.put_u8(1);
        buf.put_u8(self.profile);
        buf.put_u8(self.compatibility);
        buf.put_u8(self.level);
        buf.put_u8(0xFC | (self.length_size.saturating_sub(1) & 0x03));
        buf.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F));
        for sps in &self.sps {
            buf.put_u16(sps.len() as u16);
            buf.put_slice(sps);
        }
        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            buf.put_u16(pps.len() as u16);
            buf.put_slice(pps);
        }
        buf.freeze()
    }

    /// SPS and PPS as Annex-B units
    pub fn write_parameter_sets_annexb(&self, buf: &mut BytesMut) {
        for unit in self.sps.iter().chain(&self.pps) {
            buf.put_slice(&START_CODE);
            buf.put_slice(unit);
        }
    }
}

fn read_parameter_sets(data: &mut &[u8], count: usize) -> Result<Vec<Bytes>, MediaError> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < 2 {
            return Err(MediaError::InvalidAvcPacket);
        }
        let len = data.get_u16() as usize;
        if data.len() < len {
            return Err(MediaError::InvalidAvcPacket);
        }
        sets.push(Bytes::copy_from_slice(&data[..len]));
        data.advance(len);
    }
    Ok(sets)
}

/// Iterator over NAL units of an AVCC access unit
pub struct AvccUnits<'a> {
    data: &'a [u8],
    length_size: usize,
}

impl<'a> AvccUnits<'a> {
    pub fn new(data: &'a [u8], length_size: u8) -> Self {
        Self {
            data,
            length_size: length_size as usize,
        }
    }
}

impl<'a> Iterator for AvccUnits<'a> {
    type Item = Result<&'a [u8], MediaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < self.length_size {
            self.data = &[];
            return Some(Err(MediaError::InvalidAvcPacket));
        }
        let len = self.data[..self.length_size]
            .iter()
            .fold(0usize, |acc, b| acc << 8 | *b as usize);
        let rest = &self.data[self.length_size..];
        if rest.len() < len {
            self.data = &[];
            return Some(Err(MediaError::InvalidAvcPacket));
        }
        let (unit, tail) = rest.split_at(len);
        self.data = tail;
        Some(Ok(unit))
    }
}

/// Iterator over NAL units of an Annex-B byte stream
pub struct AnnexBUnits<'a> {
    data: &'a [u8],
}

impl<'a> AnnexBUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let start = find_start_code(data, 0).map(|(_, end)| end).unwrap_or(data.len());
        Self {
            data: &data[start..],
        }
    }
}

impl<'a> Iterator for AnnexBUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        match find_start_code(self.data, 0) {
            Some((begin, end)) => {
                let unit = &self.data[..begin];
                self.data = &self.data[end..];
                Some(unit)
            }
            None => {
                let unit = self.data;
                self.data = &[];
                Some(unit)
            }
        }
    }
}

/// Locate the next 3- or 4-byte start code at or after `from`
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let begin = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some((begin, i + 3));
        }
        i += 1;
    }
    None
}

/// Convert an AVCC access unit to Annex-B
///
/// Access unit delimiters are dropped. When `config` is given and the unit
/// holds an IDR slice, SPS/PPS are inserted ahead of it.
pub fn avcc_to_annexb(
    data: &[u8],
    length_size: u8,
    config: Option<&AvcConfig>,
) -> Result<Bytes, MediaError> {
    let mut buf = BytesMut::with_capacity(data.len() + 64);
    let mut has_parameter_sets = false;
    let mut wrote_parameter_sets = false;

    for unit in AvccUnits::new(data, length_size) {
        let unit = unit?;
        let Some(&first) = unit.first() else {
            continue;
        };
        match nal_type(first) {
            NAL_AUD => continue,
            NAL_SPS | NAL_PPS => has_parameter_sets = true,
            NAL_IDR if !has_parameter_sets && !wrote_parameter_sets => {
                if let Some(config) = config {
                    config.write_parameter_sets_annexb(&mut buf);
                    wrote_parameter_sets = true;
                }
            }
            _ => {}
        }
        buf.put_slice(&START_CODE);
        buf.put_slice(unit);
    }
    Ok(buf.freeze())
}

/// Convert an Annex-B access unit to AVCC with 4-byte lengths
///
/// Parameter sets found in-band are returned separately so they can be
/// turned into a decoder configuration; they are not copied into the
/// access unit.
pub fn annexb_to_avcc(data: &[u8]) -> AnnexBAccessUnit {
    let mut au = AnnexBAccessUnit::default();
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    for unit in AnnexBUnits::new(data) {
        // Trailing zero bytes belong to the next start code
        let unit = trim_trailing_zeros(unit);
        let Some(&first) = unit.first() else {
            continue;
        };
        match nal_type(first) {
            NAL_SPS => au.sps = Some(Bytes::copy_from_slice(unit)),
            NAL_PPS => au.pps = Some(Bytes::copy_from_slice(unit)),
            NAL_AUD => {}
            kind => {
                au.keyframe |= kind == NAL_IDR;
                buf.put_u32(unit.len() as u32);
                buf.put_slice(unit);
            }
        }
    }
    au.data = buf.freeze();
    au
}

fn trim_trailing_zeros(unit: &[u8]) -> &[u8] {
    let end = unit.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(0);
    &unit[..end]
}

/// Result of [`annexb_to_avcc`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnexBAccessUnit {
    pub data: Bytes,
    pub keyframe: bool,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

/// Whether an AVCC access unit contains an IDR slice
pub fn contains_idr(data: &[u8], length_size: u8) -> bool {
    AvccUnits::new(data, length_size)
        .filter_map(|u| u.ok())
        .any(|u| u.first().map(|b| nal_type(*b)) == Some(NAL_IDR))
}
