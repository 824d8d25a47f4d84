//! Error types
//!
//! All fallible operations in the crate return [`Result`]. The top-level
//! [`Error`] is composed from per-layer error enums so callers can match on
//! the layer that failed:
//!
//! - transport failures ([`ConnectionError`], [`std::io::Error`]) drive the
//!   reconnection policy
//! - framing failures ([`ProtocolError`], [`MediaError`], [`AmfError`]) are
//!   recovered locally by the muxer when a resync point exists
//! - device and codec failures ([`CaptureError`], [`VideoUnitError`],
//!   [`AudioUnitError`]) are surfaced verbatim and never retried
//! - configuration failures ([`ConfigError`]) are rejected at the call

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Socket level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// RTMP chunk/command level failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// RTMP handshake failure
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// AMF encoding/decoding failure
    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    /// Media payload failure (FLV, AVC, AAC, MPEG-TS)
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// Connection lifecycle failure
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Rejected configuration request
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Capture device failure
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Video unit (codec or capture) failure
    #[error("video unit error: {0}")]
    Video(#[from] VideoUnitError),

    /// Audio unit (codec or capture) failure
    #[error("audio unit error: {0}")]
    Audio(#[from] AudioUnitError),

    /// Malformed URL
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Reconnection gave up
    #[error("retry budget exhausted after {attempts} connect attempts")]
    RetriesExhausted { attempts: u32 },
}

impl Error {
    /// Whether this error came from the transport (and may be retried)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection(_) | Error::Handshake(_)
        )
    }
}

/// RTMP chunk stream and command errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Chunk header could not be parsed
    #[error("invalid chunk header")]
    InvalidChunkHeader,

    /// A compressed chunk header referenced a chunk stream with no prior header
    #[error("chunk stream {0} has no previous header")]
    UnknownChunkStream(u32),

    /// Message length exceeds the accepted maximum
    #[error("message too large: {0} bytes")]
    MessageTooLarge(u32),

    /// Peer requested an invalid chunk size
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u32),

    /// Message arrived that is not valid in the current state
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Server answered a command with `_error`
    #[error("command {command} rejected: {description}")]
    CommandRejected {
        command: String,
        description: String,
    },
}

/// RTMP handshake errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Peer speaks an RTMP version we cannot accept
    #[error("invalid RTMP version: {0}")]
    InvalidVersion(u8),

    /// Peer closed the socket mid-handshake
    #[error("peer closed during handshake")]
    Interrupted,
}

/// AMF0 codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmfError {
    /// Buffer ended inside a value
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    /// Unknown or unsupported type marker
    #[error("unsupported AMF0 marker: {0:#04x}")]
    UnsupportedMarker(u8),

    /// String payload is not UTF-8
    #[error("invalid UTF-8 in AMF string")]
    InvalidUtf8,

    /// Objects nested deeper than the decoder allows
    #[error("AMF nesting too deep")]
    NestingTooDeep,
}

/// Media payload errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Malformed AAC packet or AudioSpecificConfig
    #[error("invalid AAC packet")]
    InvalidAacPacket,

    /// Malformed AVC packet or decoder configuration record
    #[error("invalid AVC packet")]
    InvalidAvcPacket,

    /// FLV tag body too short or inconsistent
    #[error("invalid FLV tag body")]
    InvalidFlvTag,

    /// Codec the muxer cannot carry
    #[error("unsupported codec id {0}")]
    UnsupportedCodec(u8),

    /// MPEG-TS packet or section is malformed
    #[error("invalid MPEG-TS data: {0}")]
    InvalidTransportStream(&'static str),
}

/// Connection lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Operation needs an established connection
    #[error("not connected")]
    NotConnected,

    /// Socket closed by the peer or locally
    #[error("connection closed")]
    Closed,

    /// Connect attempt exceeded its deadline
    #[error("connect timed out")]
    Timeout,

    /// URI scheme we cannot dial
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// URI without a host component
    #[error("missing host in URI")]
    MissingHost,

    /// SRT URI without a port
    #[error("missing port in URI")]
    MissingPort,

    /// Server rejected the NetConnection
    #[error("connect rejected: {0}")]
    Rejected(String),
}

/// Configuration request outside the supported range
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Frame rate not in (0, max]
    #[error("frame rate {requested} outside 0..={max}")]
    FrameRateOutOfRange { requested: f64, max: f64 },

    /// Zoom factor not in [1, max)
    #[error("zoom factor {requested} outside 1..{max}")]
    ZoomOutOfRange { requested: f64, max: f64 },

    /// Zero or oversized dimensions
    #[error("invalid video size {width}x{height}")]
    InvalidVideoSize { width: u32, height: u32 },

    /// Bitrate of zero
    #[error("invalid bitrate {0}")]
    InvalidBitrate(u32),
}

/// Capture session errors reported by the capture layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The device's active format is not usable by the session
    #[error("unsupported device active format")]
    UnsupportedActiveFormat,

    /// The platform media services were reset
    #[error("media services were reset")]
    MediaServicesReset,

    /// Device cannot be locked for configuration
    #[error("device configuration failed: {0}")]
    ConfigurationFailed(String),

    /// Any other runtime failure
    #[error("capture runtime error: {0}")]
    Runtime(String),
}

/// Video unit errors (capture attach or encoder)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VideoUnitError {
    /// Device could not be attached
    #[error("failed to attach video device: {0}")]
    FailedToAttach(String),

    /// Encoder failed to create a session
    #[error("failed to create video encoder: {0}")]
    FailedToCreate(String),

    /// Encoder rejected a frame
    #[error("failed to encode video frame: {0}")]
    FailedToEncode(String),

    /// Encoder rejected a configuration change
    #[error("failed to set video option: {0}")]
    FailedToSetOption(String),
}

/// Audio unit errors (capture attach or encoder)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioUnitError {
    /// Device could not be attached
    #[error("failed to attach audio device: {0}")]
    FailedToAttach(String),

    /// Encoder failed to create a converter
    #[error("failed to create audio converter: {0}")]
    FailedToCreate(String),

    /// Encoder rejected a buffer
    #[error("failed to convert audio: {0}")]
    FailedToConvert(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "x").into();
        assert!(io.is_transport());

        let closed: Error = ConnectionError::Closed.into();
        assert!(closed.is_transport());

        let media: Error = MediaError::InvalidAacPacket.into();
        assert!(!media.is_transport());

        let config: Error = ConfigError::InvalidBitrate(0).into();
        assert!(!config.is_transport());
    }

    #[test]
    fn test_error_display() {
        let err = Error::RetriesExhausted { attempts: 6 };
        assert_eq!(
            err.to_string(),
            "retry budget exhausted after 6 connect attempts"
        );

        let err: Error = ProtocolError::UnknownChunkStream(7).into();
        assert_eq!(
            err.to_string(),
            "protocol error: chunk stream 7 has no previous header"
        );
    }
}
