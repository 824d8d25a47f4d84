//! RTMP messages above the chunk layer
//!
//! Protocol control messages (types 1-6), user control events, and the
//! handful of AMF0 commands a publishing/playing client exchanges with a
//! server.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{amf0, AmfValue};
use crate::error::{AmfError, ProtocolError, Result};
use crate::protocol::chunk::{control_message, ChunkMessage};
use crate::protocol::constants::*;

/// User control event types
pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

/// Protocol control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SetChunkSize(u32),
    Abort(u32),
    Acknowledgement(u32),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit: u8 },
    UserControl { event: u16, data: Bytes },
}

impl ControlMessage {
    /// Parse a control message, `None` for other message types
    pub fn parse(type_id: u8, payload: &Bytes) -> Result<Option<Self>> {
        let mut p = payload.clone();
        let need = |p: &Bytes, n: usize| {
            if p.remaining() < n {
                Err(ProtocolError::UnexpectedMessage(format!(
                    "control message type {type_id} too short"
                )))
            } else {
                Ok(())
            }
        };

        let msg = match type_id {
            MSG_SET_CHUNK_SIZE => {
                need(&p, 4)?;
                ControlMessage::SetChunkSize(p.get_u32() & 0x7FFF_FFFF)
            }
            MSG_ABORT => {
                need(&p, 4)?;
                ControlMessage::Abort(p.get_u32())
            }
            MSG_ACKNOWLEDGEMENT => {
                need(&p, 4)?;
                ControlMessage::Acknowledgement(p.get_u32())
            }
            MSG_WINDOW_ACK_SIZE => {
                need(&p, 4)?;
                ControlMessage::WindowAckSize(p.get_u32())
            }
            MSG_SET_PEER_BANDWIDTH => {
                need(&p, 5)?;
                let size = p.get_u32();
                ControlMessage::SetPeerBandwidth {
                    size,
                    limit: p.get_u8(),
                }
            }
            MSG_USER_CONTROL => {
                need(&p, 2)?;
                let event = p.get_u16();
                ControlMessage::UserControl { event, data: p }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Wrap into a chunk message on the protocol control stream
    pub fn into_chunk(self) -> ChunkMessage {
        let mut buf = BytesMut::with_capacity(8);
        let type_id = match self {
            ControlMessage::SetChunkSize(size) => {
                buf.put_u32(size & 0x7FFF_FFFF);
                MSG_SET_CHUNK_SIZE
            }
            ControlMessage::Abort(csid) => {
                buf.put_u32(csid);
                MSG_ABORT
            }
            ControlMessage::Acknowledgement(seq) => {
                buf.put_u32(seq);
                MSG_ACKNOWLEDGEMENT
            }
            ControlMessage::WindowAckSize(size) => {
                buf.put_u32(size);
                MSG_WINDOW_ACK_SIZE
            }
            ControlMessage::SetPeerBandwidth { size, limit } => {
                buf.put_u32(size);
                buf.put_u8(limit);
                MSG_SET_PEER_BANDWIDTH
            }
            ControlMessage::UserControl { event, data } => {
                buf.put_u16(event);
                buf.put_slice(&data);
                MSG_USER_CONTROL
            }
        };
        control_message(type_id, buf.freeze())
    }

    /// Ping response echoing a ping request's timestamp
    pub fn ping_response(request_data: Bytes) -> Self {
        ControlMessage::UserControl {
            event: UC_PING_RESPONSE,
            data: request_data,
        }
    }
}

/// AMF0 command message
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: AmfValue,
    pub arguments: Vec<AmfValue>,
}

impl Command {
    pub fn new(name: &str, transaction_id: f64, command_object: AmfValue) -> Self {
        Self {
            name: name.to_string(),
            transaction_id,
            command_object,
            arguments: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<AmfValue>) -> Self {
        self.arguments.push(value.into());
        self
    }

    /// NetConnection `connect`
    pub fn connect(transaction_id: f64, app: &str, tc_url: &str, flash_ver: &str) -> Self {
        let object = AmfValue::object([
            ("app", AmfValue::from(app)),
            ("flashVer", AmfValue::from(flash_ver)),
            ("tcUrl", AmfValue::from(tc_url)),
            ("fpad", AmfValue::from(false)),
            ("capabilities", AmfValue::from(239.0)),
            ("audioCodecs", AmfValue::from(0x0400 as f64)),
            ("videoCodecs", AmfValue::from(0x0080 as f64)),
            ("videoFunction", AmfValue::from(1.0)),
            ("objectEncoding", AmfValue::from(0.0)),
        ]);
        Command::new("connect", transaction_id, object)
    }

    pub fn create_stream(transaction_id: f64) -> Self {
        Command::new("createStream", transaction_id, AmfValue::Null)
    }

    /// NetStream `publish` in live mode
    pub fn publish(stream_name: &str) -> Self {
        Command::new("publish", 0.0, AmfValue::Null)
            .arg(stream_name)
            .arg("live")
    }

    pub fn play(stream_name: &str) -> Self {
        Command::new("play", 0.0, AmfValue::Null)
            .arg(stream_name)
            .arg(-2.0)
    }

    pub fn delete_stream(stream_id: u32) -> Self {
        Command::new("deleteStream", 0.0, AmfValue::Null).arg(stream_id)
    }

    /// Encode the command body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        amf0::write_values(
            &mut buf,
            &[
                AmfValue::from(self.name.as_str()),
                AmfValue::Number(self.transaction_id),
                self.command_object.clone(),
            ],
        );
        amf0::write_values(&mut buf, &self.arguments);
        buf.freeze()
    }

    /// Wrap into a chunk message on the command chunk stream
    pub fn into_chunk(&self, stream_id: u32) -> ChunkMessage {
        ChunkMessage::full(CSID_COMMAND, 0, MSG_COMMAND_AMF0, stream_id, self.encode())
    }

    /// Parse an AMF0 command body
    pub fn parse(payload: Bytes) -> Result<Self> {
        let mut values = amf0::decode_all(payload)?.into_iter();
        let name = match values.next() {
            Some(AmfValue::String(name)) => name,
            _ => {
                return Err(
                    ProtocolError::UnexpectedMessage("command without name".into()).into(),
                )
            }
        };
        let transaction_id = values
            .next()
            .and_then(|v| v.as_number())
            .unwrap_or_default();
        let command_object = values.next().unwrap_or(AmfValue::Null);
        Ok(Self {
            name,
            transaction_id,
            command_object,
            arguments: values.collect(),
        })
    }

    /// `info` object of `_result` / `_error` / `onStatus`
    pub fn info(&self) -> Option<&AmfValue> {
        self.arguments
            .iter()
            .find(|v| v.properties().is_some())
            .or(Some(&self.command_object).filter(|v| v.properties().is_some()))
    }

    /// Status code (`NetConnection.Connect.Success`, ...) if present
    pub fn status_code(&self) -> Option<&str> {
        self.info()?.get_str("code")
    }

    pub fn is_result(&self) -> bool {
        self.name == "_result"
    }

    pub fn is_error(&self) -> bool {
        self.name == "_error"
    }

    /// Error description carried by `_error` or a failed `onStatus`
    pub fn description(&self) -> String {
        let info = self.info();
        info.and_then(|i| i.get_str("description"))
            .or_else(|| info.and_then(|i| i.get_str("code")))
            .unwrap_or("no description")
            .to_string()
    }
}

/// `@setDataFrame("onMetaData", metadata)` body
pub fn set_data_frame(metadata: &[(String, AmfValue)]) -> Bytes {
    amf0::encode(&[
        AmfValue::from("@setDataFrame"),
        AmfValue::from("onMetaData"),
        AmfValue::EcmaArray(metadata.to_vec()),
    ])
}

/// Extract the metadata array from an inbound data message
///
/// Accepts both `@setDataFrame, onMetaData, {..}` and `onMetaData, {..}`.
pub fn parse_metadata(payload: Bytes) -> std::result::Result<Option<AmfValue>, AmfError> {
    let values = amf0::decode_all(payload)?;
    let mut iter = values.into_iter().skip_while(|v| v.as_str() == Some("@setDataFrame"));
    match iter.next() {
        Some(AmfValue::String(name)) if name == "onMetaData" => Ok(iter.next()),
        _ => Ok(None),
    }
}
