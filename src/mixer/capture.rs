//! Capture session boundary

use std::ops::RangeInclusive;

use crate::error::CaptureError;

/// One format a capture device can be switched to
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub min_frame_rate: f64,
    pub max_frame_rate: f64,
}

impl CaptureFormat {
    pub fn new(width: u32, height: u32, min_frame_rate: f64, max_frame_rate: f64) -> Self {
        Self {
            width,
            height,
            min_frame_rate,
            max_frame_rate,
        }
    }

    pub fn supports_frame_rate(&self, rate: f64) -> bool {
        (self.min_frame_rate..=self.max_frame_rate).contains(&rate)
    }

    fn covers(&self, width: u32, height: u32) -> bool {
        self.width >= width && self.height >= height
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Device capture driven by the mixer
pub trait CaptureSession: Send + Sync {
    fn start_running(&self);

    fn stop_running(&self);

    fn is_running(&self) -> bool;

    fn active_format(&self) -> Option<CaptureFormat>;

    fn supported_formats(&self) -> Vec<CaptureFormat>;

    /// Switch formats; `frame_rate` also pins the frame duration
    fn set_active_format(
        &self,
        format: &CaptureFormat,
        frame_rate: Option<f64>,
    ) -> Result<(), CaptureError>;

    fn zoom_range(&self) -> RangeInclusive<f64>;

    fn set_zoom_factor(&self, factor: f64) -> Result<(), CaptureError>;
}

/// Smallest format covering `width`x`height`
///
/// Formats supporting `frame_rate` win over those that do not.
pub fn compatible_format(
    formats: &[CaptureFormat],
    width: u32,
    height: u32,
    frame_rate: f64,
) -> Option<CaptureFormat> {
    let covering = formats.iter().filter(|f| f.covers(width, height));
    let smallest = |candidates: Vec<&CaptureFormat>| {
        candidates.into_iter().min_by_key(|f| f.area()).cloned()
    };
    let candidates: Vec<_> = covering.collect();
    let with_rate = candidates
        .iter()
        .copied()
        .filter(|f| f.supports_frame_rate(frame_rate))
        .collect();
    smallest(with_rate).or_else(|| smallest(candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats() -> Vec<CaptureFormat> {
        vec![
            CaptureFormat::new(640, 480, 1.0, 60.0),
            CaptureFormat::new(1920, 1080, 1.0, 30.0),
            CaptureFormat::new(1280, 720, 1.0, 30.0),
            CaptureFormat::new(1280, 720, 1.0, 120.0),
            CaptureFormat::new(3840, 2160, 1.0, 60.0),
        ]
    }

    #[test]
    fn test_smallest_covering_format() {
        let format = compatible_format(&formats(), 1280, 720, 30.0).unwrap();
        assert_eq!((format.width, format.height), (1280, 720));
        assert_eq!(format.max_frame_rate, 30.0);
    }

    #[test]
    fn test_frame_rate_support_preferred() {
        let format = compatible_format(&formats(), 1280, 720, 60.0).unwrap();
        assert_eq!(format, CaptureFormat::new(1280, 720, 1.0, 120.0));

        let format = compatible_format(&formats(), 1920, 1080, 60.0).unwrap();
        assert_eq!((format.width, format.height), (3840, 2160));
    }

    #[test]
    fn test_falls_back_without_frame_rate() {
        let format = compatible_format(&formats(), 1920, 1080, 240.0).unwrap();
        assert_eq!((format.width, format.height), (1920, 1080));
    }

    #[test]
    fn test_nothing_covers() {
        assert!(compatible_format(&formats(), 7680, 4320, 30.0).is_none());
        assert!(compatible_format(&[], 640, 480, 30.0).is_none());
    }
}
