//! AMF0 (Action Message Format) support
//!
//! RTMP commands (`connect`, `createStream`, `publish`, `play`, ...) and the
//! `onMetaData` data message are AMF0-encoded value sequences.

pub mod amf0;
pub mod value;

pub use value::AmfValue;
