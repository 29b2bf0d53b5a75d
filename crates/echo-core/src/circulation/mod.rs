//! Buffer circulation between the capture and playback devices
//!
//! Four SPSC queues carry the pool's buffers:
//!
//! | Queue        | Producer       | Consumer       |
//! |--------------|----------------|----------------|
//! | Free         | playback path  | capture path   |
//! | Captured     | capture path   | playback path  |
//! | RecordShadow | capture path   | capture path   |
//! | PlayShadow   | playback path  | playback path  |
//!
//! The shadow queues mirror what each device currently holds, in the order
//! it will hand the buffers back. Moving a `Box<SampleBuffer>` between queues
//! is the ownership transfer; nothing else guards buffer contents.

mod capture;
mod census;
mod device;
mod playback;

pub use capture::CapturePath;
pub use census::BufferCensus;
pub(crate) use census::QueueProbes;
pub use device::{CaptureDevice, PlaybackDevice};
pub use playback::{Outgoing, PlaybackPath};
