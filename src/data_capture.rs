pub mod recorder;
pub mod types;

pub use recorder::ConnRecorder;
pub use types::{CaptureSnapshot, Direction, FailureTrace, IoTimeline};
