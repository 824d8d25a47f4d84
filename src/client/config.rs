//! Client configuration

use std::time::Duration;

use url::Url;

use crate::error::{ConnectionError, Result};
use crate::media::sample::MediaTime;
use crate::protocol::constants::*;
use crate::protocol::timestamp::DEFAULT_COMPOSITION_OFFSET;

/// Flash version string sent in `connect`
pub const DEFAULT_FLASH_VERSION: &str = "FMLE/3.0 (compatible; FMSc/1.0)";

/// Transport protocol picked from the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Rtmp,
    Srt,
}

/// Components of a stream URL
///
/// `rtmp://host[:port]/app[/instance]/stream_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Application path (everything but the last path segment)
    pub app: String,
    pub stream_key: Option<String>,
    /// `tcUrl` sent in `connect`
    pub tc_url: String,
}

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stream URL
    pub url: String,

    /// Outbound chunk size announced after the handshake
    pub chunk_size: u32,

    /// Deadline for dial + handshake + connect
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// `flashVer` sent in `connect`
    pub flash_version: String,

    /// Reconnect attempts after the first failure
    pub max_retry_count: u32,

    /// In-flight media submissions allowed per session
    pub media_queue_capacity: usize,

    /// Offset added to composition times of reordered frames
    pub composition_offset: MediaTime,

    /// Window acknowledgement size announced to the server
    pub window_ack_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            read_buffer_size: 64 * 1024,
            flash_version: DEFAULT_FLASH_VERSION.to_string(),
            max_retry_count: 5,
            media_queue_capacity: 256,
            composition_offset: DEFAULT_COMPOSITION_OFFSET,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set chunk size
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1024);
        self
    }

    pub fn flash_version(mut self, version: impl Into<String>) -> Self {
        self.flash_version = version.into();
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Set the media queue capacity (at least 1)
    pub fn media_queue_capacity(mut self, capacity: usize) -> Self {
        self.media_queue_capacity = capacity.max(1);
        self
    }

    pub fn composition_offset(mut self, offset: MediaTime) -> Self {
        self.composition_offset = offset;
        self
    }

    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size.max(1);
        self
    }

    /// Split the URL into host, port, app and stream key
    pub fn parse_url(&self) -> Result<ParsedUrl> {
        parse_url(&self.url)
    }
}

/// Parse a stream URL
///
/// `rtmps` is rejected since TLS is not supported. SRT URLs must carry a
/// port; the query string (stream id, latency) is left to the transport.
pub fn parse_url(raw: &str) -> Result<ParsedUrl> {
    let url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "rtmp" => Scheme::Rtmp,
        "srt" => Scheme::Srt,
        other => return Err(ConnectionError::UnsupportedScheme(other.to_string()).into()),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(ConnectionError::MissingHost)?
        .to_string();
    let port = match (scheme, url.port()) {
        (_, Some(port)) => port,
        (Scheme::Rtmp, None) => DEFAULT_PORT,
        (Scheme::Srt, None) => return Err(ConnectionError::MissingPort.into()),
    };

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let (app, stream_key) = match segments.split_last() {
        Some((last, rest)) if !rest.is_empty() => (rest.join("/"), Some(last.to_string())),
        Some((only, _)) => (only.to_string(), None),
        None => (String::new(), None),
    };

    let tc_url = match url.port() {
        Some(port) => format!("{}://{}:{}/{}", url.scheme(), host, port, app),
        None => format!("{}://{}/{}", url.scheme(), host, app),
    };

    Ok(ParsedUrl {
        scheme,
        host,
        port,
        app,
        stream_key,
        tc_url,
    })
}
