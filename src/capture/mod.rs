pub mod format;
pub mod frame;

pub use format::{FormatDescriptor, FormatEnumerator, MajorType, SubType};
pub use frame::{Frame, SampleMetadata};
