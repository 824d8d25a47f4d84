//! RTMP timestamp engine
//!
//! Turns the absolute clocks of independent producers into the relative
//! millisecond deltas RTMP chunk headers carry, and rebuilds absolute times
//! from inbound chunk headers.
//!
//! Deltas are truncated to whole milliseconds. The truncated fractions are
//! accumulated and carried into a later delta once they add up to 1ms, so
//! the sum of deltas tracks the real elapsed time. A clock that steps
//! backwards yields a zero delta while the reference time still moves to the
//! regressed value.

use std::marker::PhantomData;

use crate::media::sample::{HostTime, MediaTime};
use crate::protocol::chunk::ChunkType;

/// Composition time offset applied to reordered video frames
pub const DEFAULT_COMPOSITION_OFFSET: MediaTime = MediaTime::new(3, 30);

/// A clock reading the engine can convert to seconds
pub trait TimeConvertible: Copy {
    fn seconds(&self) -> f64;

    fn from_seconds(seconds: f64) -> Self;

    fn is_valid(&self) -> bool {
        true
    }
}

impl TimeConvertible for MediaTime {
    fn seconds(&self) -> f64 {
        MediaTime::seconds(self)
    }

    fn from_seconds(seconds: f64) -> Self {
        MediaTime::from_seconds(seconds, 1000)
    }

    fn is_valid(&self) -> bool {
        MediaTime::is_valid(self)
    }
}

impl TimeConvertible for HostTime {
    fn seconds(&self) -> f64 {
        HostTime::seconds(self)
    }

    fn from_seconds(seconds: f64) -> Self {
        HostTime::from_seconds(seconds)
    }
}

/// Per-track timestamp state
#[derive(Debug, Clone)]
pub struct Timestamp<T> {
    started_at: Option<f64>,
    updated_at: Option<f64>,
    fraction: f64,
    composition_offset: f64,
    _clock: PhantomData<T>,
}

impl<T: TimeConvertible> Default for Timestamp<T> {
    fn default() -> Self {
        Self::new(DEFAULT_COMPOSITION_OFFSET)
    }
}

impl<T: TimeConvertible> Timestamp<T> {
    pub fn new(composition_offset: MediaTime) -> Self {
        Self {
            started_at: None,
            updated_at: None,
            fraction: 0.0,
            composition_offset: composition_offset.seconds(),
            _clock: PhantomData,
        }
    }

    /// Whether the first sample has been seen
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Advance to `value`, returning the delta in milliseconds
    ///
    /// The first call anchors the clock and returns 0.
    pub fn update(&mut self, value: T) -> u32 {
        let seconds = value.seconds();
        let Some(updated_at) = self.updated_at else {
            self.started_at = Some(seconds);
            self.updated_at = Some(seconds);
            return 0;
        };

        let mut delta = ((seconds - updated_at) * 1000.0).max(0.0);
        self.fraction += delta.fract();
        if self.fraction >= 1.0 {
            self.fraction -= 1.0;
            delta += 1.0;
        }
        self.updated_at = Some(seconds);
        delta as u32
    }

    /// Advance from an inbound chunk header
    ///
    /// Type 0 headers carry an absolute timestamp; every other type carries a
    /// delta relative to the previous message on the chunk stream.
    pub fn update_message(&mut self, timestamp: u32, chunk_type: ChunkType) {
        let seconds = timestamp as f64 / 1000.0;
        match (chunk_type, self.updated_at) {
            (_, None) => {
                let start = if chunk_type == ChunkType::Full {
                    seconds
                } else {
                    0.0
                };
                self.started_at = Some(start);
                self.updated_at = Some(seconds);
            }
            (ChunkType::Full, Some(_)) => self.updated_at = Some(seconds),
            (_, Some(updated_at)) => self.updated_at = Some(updated_at + seconds),
        }
    }

    /// Composition time (PTS - DTS) in milliseconds for a video frame
    ///
    /// Frames without a decode time, or whose decode time equals their
    /// presentation time, are not reordered and get 0.
    pub fn composition_time(&self, presentation_time: T, decode_time: T) -> i32 {
        if !decode_time.is_valid() || decode_time.seconds() == presentation_time.seconds() {
            return 0;
        }
        let reference = self.updated_at.unwrap_or_else(|| decode_time.seconds());
        ((presentation_time.seconds() + self.composition_offset - reference) * 1000.0) as i32
    }

    /// Reference time in the source clock
    pub fn value(&self) -> T {
        T::from_seconds(self.updated_at.unwrap_or(0.0))
    }

    /// Milliseconds elapsed between the first and the latest update
    pub fn elapsed_ms(&self) -> i64 {
        match (self.started_at, self.updated_at) {
            (Some(start), Some(now)) => ((now - start) * 1000.0).round() as i64,
            _ => 0,
        }
    }

    pub fn clear(&mut self) {
        self.started_at = None;
        self.updated_at = None;
        self.fraction = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_returns_zero() {
        let mut ts = Timestamp::<MediaTime>::default();
        assert!(!ts.is_started());
        assert_eq!(ts.update(MediaTime::new(12_345, 1000)), 0);
        assert!(ts.is_started());
        assert_eq!(ts.value(), MediaTime::new(12_345, 1000));
    }

    #[test]
    fn test_zero_start_time_is_a_real_start() {
        let mut ts = Timestamp::<MediaTime>::default();
        assert_eq!(ts.update(MediaTime::ZERO), 0);
        assert_eq!(ts.update(MediaTime::from_millis(40)), 40);
    }

    #[test]
    fn test_deltas_sum_to_elapsed_time() {
        let mut ts = Timestamp::<MediaTime>::default();
        // 29.97 fps: 1001/30000 s per frame, 33.366..ms
        let mut sum: u64 = 0;
        for frame in 0..300i64 {
            sum += ts.update(MediaTime::new(frame * 1001, 30_000)) as u64;
        }
        let elapsed = 299.0 * 1001.0 / 30.0;
        assert!((sum as f64 - elapsed).abs() <= 1.0, "sum {sum} elapsed {elapsed}");
        assert_eq!(ts.elapsed_ms(), elapsed.round() as i64);
    }

    #[test]
    fn test_fraction_is_carried() {
        let mut ts = Timestamp::<HostTime>::default();
        ts.update(HostTime(0));
        // 62.5ms steps: truncated to 62, carry every second step
        let deltas: Vec<u32> = (1..=4)
            .map(|n| ts.update(HostTime(n * 62_500_000)))
            .collect();
        assert_eq!(deltas, vec![62, 63, 62, 63]);
    }

    #[test]
    fn test_regression_clamps_and_advances() {
        let mut ts = Timestamp::<MediaTime>::default();
        ts.update(MediaTime::from_millis(1000));
        assert_eq!(ts.update(MediaTime::from_millis(1100)), 100);

        assert_eq!(ts.update(MediaTime::from_millis(1050)), 0);
        assert_eq!(ts.value(), MediaTime::from_millis(1050));

        // Next delta is measured from the regressed value
        assert_eq!(ts.update(MediaTime::from_millis(1080)), 30);
    }

    #[test]
    fn test_clear_resets_anchor() {
        let mut ts = Timestamp::<MediaTime>::default();
        ts.update(MediaTime::from_millis(500));
        ts.update(MediaTime::from_millis(700));
        ts.clear();

        assert!(!ts.is_started());
        assert_eq!(ts.elapsed_ms(), 0);
        assert_eq!(ts.update(MediaTime::from_millis(9000)), 0);
    }

    #[test]
    fn test_message_mode() {
        let mut ts = Timestamp::<MediaTime>::default();
        ts.update_message(1000, ChunkType::Full);
        ts.update_message(33, ChunkType::SameStream);
        ts.update_message(33, ChunkType::TimestampOnly);
        ts.update_message(34, ChunkType::Continuation);
        assert_eq!(ts.elapsed_ms(), 100);
        assert_eq!(ts.value(), MediaTime::from_millis(1100));

        // An absolute header later re-anchors only the reference time
        ts.update_message(2000, ChunkType::Full);
        assert_eq!(ts.elapsed_ms(), 1000);
    }

    #[test]
    fn test_message_mode_starting_with_delta() {
        let mut ts = Timestamp::<MediaTime>::default();
        ts.update_message(40, ChunkType::SameStream);
        assert_eq!(ts.elapsed_ms(), 40);
    }

    #[test]
    fn test_composition_time() {
        let mut ts = Timestamp::<MediaTime>::new(MediaTime::ZERO);
        ts.update(MediaTime::from_millis(0));
        ts.update(MediaTime::from_millis(250));

        // Not reordered
        assert_eq!(
            ts.composition_time(MediaTime::from_millis(250), MediaTime::INVALID),
            0
        );
        assert_eq!(
            ts.composition_time(MediaTime::from_millis(250), MediaTime::from_millis(250)),
            0
        );

        // Presented 500ms after the decode reference
        assert_eq!(
            ts.composition_time(MediaTime::from_millis(750), MediaTime::from_millis(250)),
            500
        );
    }

    #[test]
    fn test_composition_time_default_offset() {
        let mut ts = Timestamp::<MediaTime>::default();
        ts.update(MediaTime::from_millis(1000));
        // 100ms offset (3/30 s) on top of pts - reference
        assert_eq!(
            ts.composition_time(MediaTime::from_millis(1250), MediaTime::from_millis(1000)),
            350
        );
    }
}
