//! Statistics for streaming sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::net::ConnectionStats;

/// Live counters shared between a session, its muxer handle and callers
#[derive(Debug)]
pub struct SessionCounters {
    started_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    keyframes: AtomicU64,
    dropped_frames: AtomicU64,
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            video_frames: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_video(&self, keyframe: bool) {
        self.video_frames.fetch_add(1, Ordering::Relaxed);
        if keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_audio(&self) {
        self.audio_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Point-in-time copy with the average bitrate filled in
    pub fn snapshot(&self) -> SessionStats {
        let mut stats = SessionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            duration: self.started_at.elapsed(),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            bitrate: 0,
        };
        stats.calculate_bitrate();
        stats
    }
}

/// Session-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Media bytes handed to the connection
    pub bytes_sent: u64,
    /// Inbound bytes routed to the muxer
    pub bytes_received: u64,
    pub duration: Duration,
    /// Video frames sent (publishing) or received (playing)
    pub video_frames: u64,
    pub audio_frames: u64,
    pub keyframes: u64,
    /// Samples dropped because the session queue was full
    pub dropped_frames: u64,
    /// Average bitrate over the session (bits/sec)
    pub bitrate: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average bitrate from whichever direction carried traffic
    pub fn calculate_bitrate(&mut self) {
        let millis = self.duration.as_millis() as u64;
        if millis > 0 {
            let bytes = self.bytes_sent.max(self.bytes_received);
            self.bitrate = bytes * 8 * 1000 / millis;
        }
    }
}

/// One throughput measurement fed to a bitrate strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThroughputSample {
    /// Bytes written to the socket per second over the last interval
    pub bytes_out_per_second: u64,
    /// Bytes queued for the writer at sampling time
    pub queued_bytes: u64,
}

/// Turns cumulative connection counters into per-interval samples
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    last: Option<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample against the previous call; `None` on the first call
    pub fn sample(&mut self, stats: ConnectionStats) -> Option<ThroughputSample> {
        let now = Instant::now();
        let previous = self.last.replace((now, stats.bytes_out));
        let (at, bytes_out) = previous?;

        let elapsed = now.duration_since(at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let delta = stats.bytes_out.saturating_sub(bytes_out);
        Some(ThroughputSample {
            bytes_out_per_second: (delta as f64 / elapsed) as u64,
            queued_bytes: stats.queued_bytes,
        })
    }
}
