use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Encoded frame as pushed by an upstream peer
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw encoded bytes, shared cheaply with whoever produced them
    pub data: Bytes,

    pub meta: SampleMetadata,
}

/// Per-sample metadata supplied by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMetadata {
    pub camera: u32,
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
}

impl SampleMetadata {
    pub fn new(camera: u32, timestamp: DateTime<Utc>) -> Self {
        Self { camera, timestamp }
    }

    /// Metadata stamped with the current wall clock
    pub fn now(camera: u32) -> Self {
        Self::new(camera, Utc::now())
    }
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: SampleMetadata) -> Self {
        Self {
            data: data.into(),
            meta,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
