//! Audio data path
//!
//! Everything here runs in the data context: it owns socket buffers and
//! the decode buffer, and never talks to the bus.

pub mod buffer;
pub mod h2;
pub mod rate_control;
pub mod sink;
pub mod source;

pub use buffer::{DecodeBuffer, DecodeBufferParams, DecodeBufferStats};
pub use rate_control::{PeakTracker, RateController};
pub use sink::MediaSink;
pub use source::MediaSource;
