//! Status reporting
//!
//! Snapshots of the active devices, printed periodically as text through
//! `tracing` or as JSON lines on stdout.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::audio::SinkInfo;
use crate::engine::EngineStatus;
use crate::input::DeviceIdentity;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub identity: DeviceIdentity,
    pub name: String,
    pub event_path: PathBuf,
    pub port: String,
    pub key_map: Option<String>,
    pub attached_at: DateTime<Local>,
    #[serde(flatten)]
    pub engine: EngineStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Local>,
    pub backend: SinkInfo,
    pub queued_events: usize,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    Text,
    Json,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] → {}  channel {:2}  octave {:+}  transpose {:+3}  program {:3}  keys {}",
            self.name,
            self.identity,
            self.port,
            self.engine.channel + 1,
            self.engine.octave,
            self.engine.transpose,
            self.engine.program,
            self.engine.active_keys
        )
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} device(s), {} queued event(s), JACK {} frames @ {} Hz",
            self.devices.len(),
            self.queued_events,
            self.backend.buffer_size,
            self.backend.sample_rate
        )?;
        for device in &self.devices {
            write!(f, "\n  {}", device)?;
        }
        Ok(())
    }
}

/// Report the session state every `interval` while it changes
pub async fn run_reporter(
    session: Arc<Session>,
    interval: Duration,
    format: StatusFormat,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<Vec<DeviceStatus>> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let snapshot = session.snapshot();
                if last.as_ref() == Some(&snapshot.devices) {
                    continue;
                }
                match format {
                    StatusFormat::Text => info!("📊 {}", snapshot),
                    StatusFormat::Json => match serde_json::to_string(&snapshot) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Failed to serialize status: {}", e),
                    },
                }
                last = Some(snapshot.devices);
            }
        }
    }
}
