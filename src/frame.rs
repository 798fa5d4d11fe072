//! Frames and the pre-roll ring buffer.
//!
//! - `Frame`: decoded RGB pixels plus capture time and, for MJPEG sources, the
//!   original encoded bytes.
//! - `FrameRingBuffer`: bounded FIFO holding one second of frames so a recording can
//!   start before the motion that triggered it.

use chrono::{DateTime, Local};
use image::RgbImage;
use std::collections::VecDeque;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A captured video frame.
pub struct Frame {
    image: RgbImage,
    captured_at: DateTime<Local>,
    /// Encoded JPEG as received from the source, if any.
    jpeg: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Local>) -> Self {
        Self {
            image,
            captured_at,
            jpeg: None,
        }
    }

    /// Attach the raw encoded bytes the pixels were decoded from.
    pub fn with_jpeg(mut self, jpeg: Vec<u8>) -> Self {
        self.jpeg = Some(jpeg);
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Mutable pixel access. Drops the raw encoded bytes, which no longer match.
    pub fn image_mut(&mut self) -> &mut RgbImage {
        self.jpeg = None;
        &mut self.image
    }

    pub fn jpeg(&self) -> Option<&[u8]> {
        self.jpeg.as_deref()
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// Capture time in microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> i64 {
        self.captured_at.timestamp_micros()
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.image.as_raw().len() + self.jpeg.as_ref().map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at", &self.captured_at)
            .field("jpeg_bytes", &self.jpeg.as_ref().map(Vec::len))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameRingBuffer: bounded FIFO for pre-roll
// ----------------------------------------------------------------------------

/// Bounded ring buffer of recent frames.
///
/// Capacity is the sink frame rate, i.e. exactly one second of look-back. The
/// oldest frame is evicted first and the capacity never changes after construction.
pub struct FrameRingBuffer {
    buffer: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRingBuffer {
    /// Create a buffer holding `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a frame, evicting the oldest when full.
    pub fn push(&mut self, frame: Frame) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    /// Earliest unevicted frame. This is what gets written while recording.
    pub fn oldest(&self) -> Option<&Frame> {
        self.buffer.front()
    }

    /// Most recent frame.
    pub fn latest(&self) -> Option<&Frame> {
        self.buffer.back()
    }

    pub fn latest_mut(&mut self) -> Option<&mut Frame> {
        self.buffer.back_mut()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(Frame::byte_len).sum()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn make_test_frame(seq: i64) -> Frame {
        let base = Local.timestamp_opt(1_700_000_000, 0).unwrap();
        let image = RgbImage::from_pixel(4, 4, image::Rgb([seq as u8, 0, 0]));
        Frame::new(image, base + Duration::milliseconds(seq * 100))
    }

    #[test]
    fn ring_buffer_enforces_capacity() {
        let mut buf = FrameRingBuffer::new(5);
        for i in 0..23 {
            buf.push(make_test_frame(i));
            assert!(buf.len() <= buf.capacity());
        }
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn oldest_is_earliest_unevicted_frame() {
        let mut buf = FrameRingBuffer::new(3);
        let mut stamps = Vec::new();
        for i in 0..10 {
            let frame = make_test_frame(i);
            stamps.push(frame.timestamp_micros());
            buf.push(frame);
            let expected = stamps[stamps.len().saturating_sub(3)];
            assert_eq!(buf.oldest().unwrap().timestamp_micros(), expected);
        }
        assert_eq!(
            buf.latest().unwrap().timestamp_micros(),
            *stamps.last().unwrap()
        );
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut buf = FrameRingBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(make_test_frame(1));
        buf.push(make_test_frame(2));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.oldest().unwrap().image().get_pixel(0, 0)[0], 2);
    }

    #[test]
    fn mutable_access_drops_encoded_bytes() {
        let mut frame = make_test_frame(1).with_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(frame.jpeg().is_some());
        frame.image_mut().put_pixel(0, 0, image::Rgb([1, 2, 3]));
        assert!(frame.jpeg().is_none());
    }
}
