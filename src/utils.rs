use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Duration, Utc};

use crate::capture::{Frame, SampleMetadata};
use crate::sink::Peer;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Stand-in upstream peer that fabricates MJPEG-shaped frames.
///
/// Frames are a start-of-image marker, a deterministic filler body and an
/// end-of-image marker; timestamps advance by a fixed frame interval.
#[derive(Debug)]
pub struct SyntheticSource {
    name: String,
    camera: u32,
    interval: Duration,
    clock: Mutex<SourceClock>,
}

#[derive(Debug)]
struct SourceClock {
    next_timestamp: DateTime<Utc>,
    produced: u64,
}

impl SyntheticSource {
    pub fn new(name: &str, camera: u32, fps: u32) -> Self {
        Self {
            name: name.to_string(),
            camera,
            interval: Duration::microseconds(1_000_000 / i64::from(fps.max(1))),
            clock: Mutex::new(SourceClock {
                next_timestamp: Utc::now(),
                produced: 0,
            }),
        }
    }

    pub fn starting_at(self, timestamp: DateTime<Utc>) -> Self {
        self.lock().next_timestamp = timestamp;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SourceClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn produced(&self) -> u64 {
        self.lock().produced
    }

    /// Next frame, `len` bytes long including the markers (minimum 4)
    pub fn frame(&self, len: usize) -> Frame {
        let (timestamp, index) = {
            let mut clock = self.lock();
            let stamp = (clock.next_timestamp, clock.produced);
            clock.next_timestamp += self.interval;
            clock.produced += 1;
            stamp
        };

        let body = len.saturating_sub(SOI.len() + EOI.len());
        let mut data = BytesMut::with_capacity(body + 4);
        data.put_slice(&SOI);
        let seed = index as u8;
        data.extend((0..body).map(|i| seed.wrapping_add(i as u8) & 0x7F));
        data.put_slice(&EOI);

        Frame::new(data.freeze(), SampleMetadata::new(self.camera, timestamp))
    }

    pub fn frames(&self, sizes: &[usize]) -> Vec<Frame> {
        sizes.iter().map(|&len| self.frame(len)).collect()
    }
}

impl Peer for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::PinDirection;

    #[test]
    fn test_frames_are_marked_and_sized() {
        let source = SyntheticSource::new("synthetic", 2, 30);
        let frames = source.frames(&[100, 2000, 1]);
        assert_eq!(frames[0].len(), 100);
        assert_eq!(frames[1].len(), 2000);
        assert_eq!(frames[2].len(), 4);
        for frame in &frames {
            assert_eq!(&frame.data[..2], &SOI);
            assert_eq!(&frame.data[frame.len() - 2..], &EOI);
            assert_eq!(frame.meta.camera, 2);
        }
        assert_eq!(source.produced(), 3);
        assert_eq!(source.direction(), PinDirection::Output);
    }

    #[test]
    fn test_timestamps_increase() {
        let start = Utc::now();
        let source = SyntheticSource::new("synthetic", 0, 25).starting_at(start);
        let frames = source.frames(&[10, 10, 10]);
        assert_eq!(frames[0].meta.timestamp, start);
        assert_eq!(frames[1].meta.timestamp - frames[0].meta.timestamp, Duration::milliseconds(40));
        assert!(frames[2].meta.timestamp > frames[1].meta.timestamp);
    }
}
