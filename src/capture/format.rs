//! Stream format descriptors and the restartable enumerator handed to peers

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::enumerator::Enumerator;

/// Broad category of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MajorType {
    Video,
    Audio,
    Text,
    Unspecified,
}

/// Encoding of the samples within a major type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubType {
    Mjpeg,
    Yuy2,
    Rgb24,
    Nv12,
    Pcm,
    /// Wildcard: the peer has not committed to an encoding yet
    Unspecified,
}

/// Immutable description of a stream shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub major: MajorType,
    pub subtype: SubType,
    pub fixed_size_samples: bool,
    /// 0 when samples are variable sized
    pub sample_size: u32,
}

impl FormatDescriptor {
    pub const fn new(major: MajorType, subtype: SubType) -> Self {
        Self {
            major,
            subtype,
            fixed_size_samples: false,
            sample_size: 0,
        }
    }

    /// Variable-size MJPEG video, the shape this sink is built around
    pub const fn mjpeg() -> Self {
        Self::new(MajorType::Video, SubType::Mjpeg)
    }

    pub const fn with_fixed_size(mut self, sample_size: u32) -> Self {
        self.fixed_size_samples = true;
        self.sample_size = sample_size;
        self
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.major, self.subtype)?;
        if self.fixed_size_samples {
            write!(f, " ({} bytes/sample)", self.sample_size)
        } else {
            write!(f, " (variable)")
        }
    }
}

/// Cursor over the formats an endpoint accepts
pub type FormatEnumerator = Enumerator<FormatDescriptor>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn enumerator() -> FormatEnumerator {
        let formats: Arc<[FormatDescriptor]> = Arc::from(vec![
            FormatDescriptor::mjpeg(),
            FormatDescriptor::new(MajorType::Video, SubType::Unspecified),
        ]);
        FormatEnumerator::new(formats)
    }

    #[test]
    fn test_enumerates_in_order_then_ends() {
        let mut cursor = enumerator();
        assert_eq!(cursor.next(), Some(FormatDescriptor::mjpeg()));
        assert_eq!(cursor.next().map(|f| f.subtype), Some(SubType::Unspecified));
        assert_eq!(cursor.next(), None);
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut cursor = enumerator();
        assert_eq!(cursor.by_ref().count(), 2);
        cursor.reset();
        assert_eq!(cursor.len(), 2);
        assert_eq!(cursor.next(), Some(FormatDescriptor::mjpeg()));
    }

    #[test]
    fn test_skip_reports_remaining() {
        let mut cursor = enumerator();
        assert!(cursor.skip_ahead(1));
        assert!(!cursor.skip_ahead(1));
        assert!(!cursor.skip_ahead(10));
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut cursor = enumerator();
        cursor.next();
        let mut copy = cursor.clone();
        assert_eq!(copy.next().map(|f| f.subtype), Some(SubType::Unspecified));
        assert_eq!(copy.next(), None);
        // original has not moved
        assert_eq!(cursor.remaining(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(FormatDescriptor::mjpeg().to_string(), "Video/Mjpeg (variable)");
        let fixed = FormatDescriptor::new(MajorType::Video, SubType::Rgb24).with_fixed_size(12);
        assert_eq!(fixed.to_string(), "Video/Rgb24 (12 bytes/sample)");
    }
}
