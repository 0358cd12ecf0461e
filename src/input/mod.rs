//! Keyboard input: device discovery and raw event decoding

pub mod reader;
pub mod registry;

pub use reader::{EventSource, KeyEventReader, RawKeyEvent};
pub use registry::{DeviceIdentity, DeviceInfo, DeviceRegistry, ProcRegistry};
