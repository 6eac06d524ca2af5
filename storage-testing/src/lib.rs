//! Test support for the localdrive agent
//!
//! [`FakeHost`] stands in for udev, the mount table and the XFS tools with shared
//! in-memory state. [`RecordingRegistry`] wraps any registry to count writes and inject
//! failures. [`lab::LoopDevice`] backs destructive tests with a real loop device.

pub mod cmd;
pub mod errors;
pub mod fake_host;
pub mod fixtures;
pub mod lab;
pub mod recording;

pub use fake_host::{FakeHost, HostOp};
pub use recording::{RecordingRegistry, WriteCounts};
