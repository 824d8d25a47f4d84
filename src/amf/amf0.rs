//! AMF0 encoder and decoder
//!
//! Reference: AMF0 File Format Specification.
//!
//! Type markers handled here:
//! ```text
//! 0x00 Number      0x01 Boolean     0x02 String     0x03 Object
//! 0x05 Null        0x06 Undefined   0x08 ECMA Array 0x09 Object End
//! 0x0A Strict Array                 0x0B Date       0x0C Long String
//! ```
//! Dates decode to numbers (milliseconds). Other markers are rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

const MAX_NESTING_DEPTH: usize = 32;

/// Encode values back to back into `buf`
pub fn write_values(buf: &mut BytesMut, values: &[AmfValue]) {
    for value in values {
        write_value(buf, value);
    }
}

/// Encode values into a fresh buffer
pub fn encode(values: &[AmfValue]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    write_values(&mut buf, values);
    buf.freeze()
}

/// Encode a single value
pub fn write_value(buf: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(*b as u8);
        }
        AmfValue::String(s) if s.len() > u16::MAX as usize => {
            buf.put_u8(MARKER_LONG_STRING);
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        AmfValue::String(s) => {
            buf.put_u8(MARKER_STRING);
            write_key(buf, s);
        }
        AmfValue::Object(props) => {
            buf.put_u8(MARKER_OBJECT);
            write_properties(buf, props);
        }
        AmfValue::EcmaArray(props) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(props.len() as u32);
            write_properties(buf, props);
        }
        AmfValue::StrictArray(items) => {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(items.len() as u32);
            write_values(buf, items);
        }
        AmfValue::Null => buf.put_u8(MARKER_NULL),
        AmfValue::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

fn write_properties(buf: &mut BytesMut, props: &[(String, AmfValue)]) {
    for (key, value) in props {
        write_key(buf, key);
        write_value(buf, value);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}

fn write_key(buf: &mut BytesMut, s: &str) {
    let len = s.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&s.as_bytes()[..len]);
}

/// Decode every value in `data`
pub fn decode_all(mut data: Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut values = Vec::new();
    while data.has_remaining() {
        values.push(read_value(&mut data, 0)?);
    }
    Ok(values)
}

/// Decode one value from the front of `buf`
pub fn read_value(buf: &mut Bytes, depth: usize) -> Result<AmfValue, AmfError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(AmfError::NestingTooDeep);
    }
    if !buf.has_remaining() {
        return Err(AmfError::UnexpectedEof);
    }

    match buf.get_u8() {
        MARKER_NUMBER => Ok(AmfValue::Number(read_f64(buf)?)),
        MARKER_BOOLEAN => {
            ensure(buf, 1)?;
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => Ok(AmfValue::String(read_key(buf)?)),
        MARKER_LONG_STRING => {
            ensure(buf, 4)?;
            let len = buf.get_u32() as usize;
            Ok(AmfValue::String(read_utf8(buf, len)?))
        }
        MARKER_OBJECT => Ok(AmfValue::Object(read_properties(buf, depth)?)),
        MARKER_ECMA_ARRAY => {
            ensure(buf, 4)?;
            // Count is only a hint; the end marker terminates the array
            let _count = buf.get_u32();
            Ok(AmfValue::EcmaArray(read_properties(buf, depth)?))
        }
        MARKER_STRICT_ARRAY => {
            ensure(buf, 4)?;
            let count = buf.get_u32() as usize;
            let mut items = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                items.push(read_value(buf, depth + 1)?);
            }
            Ok(AmfValue::StrictArray(items))
        }
        MARKER_DATE => {
            let millis = read_f64(buf)?;
            ensure(buf, 2)?;
            buf.advance(2);
            Ok(AmfValue::Number(millis))
        }
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        other => Err(AmfError::UnsupportedMarker(other)),
    }
}

fn read_properties(buf: &mut Bytes, depth: usize) -> Result<Vec<(String, AmfValue)>, AmfError> {
    let mut props = Vec::new();
    loop {
        let key = read_key(buf)?;
        if key.is_empty() {
            // Tolerate a missing end marker at the end of the buffer
            if buf.has_remaining() && buf[0] == MARKER_OBJECT_END {
                buf.advance(1);
            }
            return Ok(props);
        }
        let value = read_value(buf, depth + 1)?;
        props.push((key, value));
    }
}

fn read_key(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    read_utf8(buf, len)
}

fn read_utf8(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

fn read_f64(buf: &mut Bytes) -> Result<f64, AmfError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), AmfError> {
    if buf.remaining() < n {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_encoding() {
        let values = vec![
            AmfValue::from("connect"),
            AmfValue::from(1.0),
            AmfValue::object([("app", "live"), ("tcUrl", "rtmp://localhost/live")]),
        ];
        let encoded = encode(&values);

        // "connect" string marker + length
        assert_eq!(&encoded[..3], &[0x02, 0x00, 0x07]);
        assert_eq!(&encoded[3..10], b"connect");
        // Object ends with empty key + end marker
        assert_eq!(&encoded[encoded.len() - 3..], &[0x00, 0x00, 0x09]);

        let decoded = decode_all(encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_status_object_decoding() {
        let mut buf = BytesMut::new();
        write_values(
            &mut buf,
            &[
                AmfValue::from("onStatus"),
                AmfValue::from(0.0),
                AmfValue::Null,
                AmfValue::object([
                    ("level", "status"),
                    ("code", "NetStream.Publish.Start"),
                ]),
            ],
        );

        let decoded = decode_all(buf.freeze()).unwrap();
        assert_eq!(decoded[0].as_str(), Some("onStatus"));
        assert!(decoded[2].is_null_or_undefined());
        assert_eq!(decoded[3].get_str("code"), Some("NetStream.Publish.Start"));
    }

    #[test]
    fn test_ecma_array_and_strict_array() {
        let meta = AmfValue::EcmaArray(vec![
            ("width".into(), AmfValue::from(1280u32)),
            ("height".into(), AmfValue::from(720u32)),
        ]);
        let list = AmfValue::StrictArray(vec![AmfValue::from(true), AmfValue::Null]);

        let decoded = decode_all(encode(&[meta.clone(), list.clone()])).unwrap();
        assert_eq!(decoded, vec![meta, list]);
    }

    #[test]
    fn test_truncated_input() {
        let encoded = encode(&[AmfValue::from("publish")]);
        let truncated = encoded.slice(..encoded.len() - 2);
        assert_eq!(decode_all(truncated), Err(AmfError::UnexpectedEof));

        assert_eq!(
            decode_all(Bytes::from_static(&[0x00, 0x40])),
            Err(AmfError::UnexpectedEof)
        );
    }

    #[test]
    fn test_missing_object_end_is_tolerated() {
        // Object with one property, empty key, but no 0x09 marker
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_OBJECT);
        buf.put_u16(1);
        buf.put_slice(b"a");
        buf.put_u8(MARKER_BOOLEAN);
        buf.put_u8(1);
        buf.put_u16(0);

        let decoded = decode_all(buf.freeze()).unwrap();
        assert_eq!(decoded[0].get("a"), Some(&AmfValue::Boolean(true)));
    }

    #[test]
    fn test_unsupported_marker() {
        assert_eq!(
            decode_all(Bytes::from_static(&[0x11])),
            Err(AmfError::UnsupportedMarker(0x11))
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut buf = BytesMut::new();
        for _ in 0..(MAX_NESTING_DEPTH + 2) {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(1);
        }
        buf.put_u8(MARKER_NULL);

        assert_eq!(decode_all(buf.freeze()), Err(AmfError::NestingTooDeep));
    }

    #[test]
    fn test_date_decodes_as_number() {
        let mut buf = BytesMut::new();
        buf.put_u8(MARKER_DATE);
        buf.put_f64(1_700_000_000_000.0);
        buf.put_i16(0);

        let decoded = decode_all(buf.freeze()).unwrap();
        assert_eq!(decoded, vec![AmfValue::Number(1_700_000_000_000.0)]);
    }
}
