//! Raw key event reader
//!
//! Reads kernel input events through `evdev` and surfaces key transitions
//! only (`EV_KEY` with value 0 or 1); sync markers, scan-code reports and
//! autorepeat are skipped.

use std::fmt;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use evdev::{EventStream, EventType, InputEvent};
use tokio::sync::mpsc;
use tracing::trace;

use super::registry::DeviceIdentity;
use crate::error::Result;

/// One physical key press or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyEvent {
    pub device: DeviceIdentity,
    pub code: u8,
    pub released: bool,
}

impl fmt::Display for RawKeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code 0x{:02x} ({:3}) {} [{}]",
            self.code,
            self.code,
            if self.released { "released" } else { "pressed " },
            self.device
        )
    }
}

/// Anything yielding kernel input events for one device
#[async_trait]
pub trait EventSource: Send {
    /// Next event; an error ends the stream
    async fn next_input(&mut self) -> io::Result<InputEvent>;
}

#[async_trait]
impl EventSource for EventStream {
    async fn next_input(&mut self) -> io::Result<InputEvent> {
        self.next_event().await
    }
}

/// Events fed through a channel; the stream ends once every sender is gone
#[async_trait]
impl EventSource for mpsc::UnboundedReceiver<InputEvent> {
    async fn next_input(&mut self) -> io::Result<InputEvent> {
        self.recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "event source closed"))
    }
}

#[async_trait]
impl EventSource for Box<dyn EventSource> {
    async fn next_input(&mut self) -> io::Result<InputEvent> {
        (**self).next_input().await
    }
}

/// Open `path` as an async evdev stream (needs a running tokio runtime)
pub fn open_event_stream(path: &Path) -> io::Result<EventStream> {
    evdev::Device::open(path)?.into_event_stream()
}

/// `(code, released)` for key press/release events
pub fn key_transition(event: &InputEvent) -> Option<(u16, bool)> {
    if event.event_type() != EventType::KEY {
        return None;
    }
    match event.value() {
        0 => Some((event.code(), true)),
        1 => Some((event.code(), false)),
        _ => None,
    }
}

/// Lazy, non-restartable sequence of [`RawKeyEvent`]s from one device
pub struct KeyEventReader<S> {
    source: S,
    device: DeviceIdentity,
}

impl<S: EventSource> KeyEventReader<S> {
    pub fn new(source: S, device: DeviceIdentity) -> Self {
        Self { source, device }
    }

    /// Next key transition; [`crate::Error::Io`] once the stream fails or ends
    pub async fn next_event(&mut self) -> Result<RawKeyEvent> {
        loop {
            let event = self.source.next_input().await?;

            let Some((code, released)) = key_transition(&event) else {
                continue;
            };
            match u8::try_from(code) {
                Ok(code) => {
                    return Ok(RawKeyEvent {
                        device: self.device,
                        code,
                        released,
                    })
                }
                Err(_) => trace!("Skipping key code {} outside 0-255", code),
            }
        }
    }
}
