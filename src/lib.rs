//! keyboard-midi: turn ordinary computer keyboards into MIDI controllers
//!
//! Keyboards are discovered through the kernel's input device listing and
//! hot-plugged while the process runs. Every keyboard gets its own JACK MIDI
//! output port and its own translation state (channel, transpose, program),
//! configured by a YAML key map.

pub mod audio;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod input;
pub mod midi;
pub mod monitor;
pub mod session;
pub mod sniffer;
pub mod status;

pub use error::{Error, Result};
