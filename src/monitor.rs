//! Device monitor
//!
//! Polls the device registry, compares what it sees with the session's
//! active set and attaches or detaches keyboards accordingly. Devices are
//! matched on their bus/vendor/product/version identity only.
//!
//! A device whose event stream died (unplugged and replugged between two
//! polls, so the identity never disappeared) is detached and attached again
//! in the same poll. If that keeps happening the re-attach is held back with
//! a growing delay until the device leaves the listing or stays up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audio::register_unique_port;
use crate::device::DeviceWorker;
use crate::engine::TranslationEngine;
use crate::error::{Error, Result};
use crate::input::{DeviceIdentity, DeviceInfo, DeviceRegistry, EventSource, KeyEventReader};
use crate::session::{ActiveDevice, Session};

/// Upper bound of the replug delay
const MAX_REPLUG_BACKOFF: Duration = Duration::from_secs(30);

/// A device attached this long is considered stable again
const REPLUG_STABLE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Attempts to open a new event stream (device nodes appear with a delay)
    pub open_attempts: u32,
    pub open_backoff: Duration,
    /// First delay before re-attaching a device whose stream keeps ending
    pub replug_backoff: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            open_attempts: 20,
            open_backoff: Duration::from_millis(50),
            replug_backoff: Duration::from_millis(500),
        }
    }
}

/// What a single poll changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub attached: Vec<DeviceIdentity>,
    pub detached: Vec<DeviceIdentity>,
    /// Plugged devices that could not be opened this time
    pub skipped: Vec<DeviceIdentity>,
    /// Listed devices held back after repeated stream failures
    pub deferred: Vec<DeviceIdentity>,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
            && self.detached.is_empty()
            && self.skipped.is_empty()
            && self.deferred.is_empty()
    }
}

/// Re-attach bookkeeping for a device whose stream ended while listed
#[derive(Debug, Clone, Copy)]
struct Replug {
    strikes: u32,
    retry_at: Instant,
}

pub struct DeviceMonitor<R> {
    registry: R,
    session: Arc<Session>,
    settings: MonitorSettings,
    /// Devices whose open failure was already reported at warn level
    failing: Mutex<HashSet<DeviceIdentity>>,
    replugs: Mutex<HashMap<DeviceIdentity, Replug>>,
}

impl<R: DeviceRegistry> DeviceMonitor<R> {
    pub fn new(registry: R, session: Arc<Session>, settings: MonitorSettings) -> Self {
        Self {
            registry,
            session,
            settings,
            failing: Mutex::new(HashSet::new()),
            replugs: Mutex::new(HashMap::new()),
        }
    }

    /// Poll until `shutdown` flips; returns early only on a fatal error
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("👀 Watching for keyboards every {:?}", self.settings.poll_interval);
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Device monitor stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if !report.is_empty() => debug!("Poll: {:?}", report),
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => warn!("{}", e),
                    }
                }
            }
        }
    }

    /// One registry read and the resulting attach/detach work
    pub async fn poll_once(&self) -> Result<PollReport> {
        let current = dedup_identities(self.registry.list_keyboard_devices().await?);
        let current_ids: HashSet<DeviceIdentity> = current.iter().map(|d| d.identity).collect();
        let mut report = PollReport::default();

        self.replugs.lock().retain(|id, _| current_ids.contains(id));

        let ended = self.session.ended_streams();
        let mut removed: Vec<DeviceIdentity> = self
            .session
            .active_identities()
            .into_iter()
            .filter(|id| !current_ids.contains(id) || ended.contains(id))
            .collect();
        removed.sort();

        for identity in removed {
            let Some(device) = self.session.remove(&identity) else {
                continue;
            };
            if current_ids.contains(&identity) {
                self.note_replug(&device);
            }
            self.session.detach(device).await?;
            report.detached.push(identity);
        }

        let now = Instant::now();
        for device in current.iter().filter(|d| !self.session.is_active(&d.identity)) {
            let retry_at = self.replugs.lock().get(&device.identity).map(|r| r.retry_at);
            if retry_at.is_some_and(|at| now < at) {
                report.deferred.push(device.identity);
                continue;
            }
            match self.attach(device).await {
                Ok(()) => {
                    self.failing.lock().remove(&device.identity);
                    report.attached.push(device.identity);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if self.failing.lock().insert(device.identity) {
                        warn!("Skipping \"{}\" [{}]: {}", device.name, device.identity, e);
                    } else {
                        debug!("Still unable to attach \"{}\": {}", device.name, e);
                    }
                    report.skipped.push(device.identity);
                }
            }
        }

        Ok(report)
    }

    /// Record a stream that ended while its device is still listed
    fn note_replug(&self, device: &ActiveDevice) {
        let identity = device.info.identity;
        let uptime = (Local::now() - device.attached_at).to_std().unwrap_or_default();

        let mut replugs = self.replugs.lock();
        let strikes = match replugs.get(&identity) {
            Some(replug) if uptime < REPLUG_STABLE_AFTER => replug.strikes + 1,
            _ => 1,
        };
        let delay = replug_delay(self.settings.replug_backoff, strikes);
        replugs.insert(
            identity,
            Replug {
                strikes,
                retry_at: Instant::now() + delay,
            },
        );

        if delay.is_zero() {
            debug!("Device {} stream ended while still listed, re-attaching", identity);
        } else {
            warn!(
                "\"{}\" [{}] keeps dropping its event stream, retrying in {:?}",
                device.info.name, identity, delay
            );
        }
    }

    async fn attach(&self, device: &DeviceInfo) -> Result<()> {
        let source = open_with_retry(
            &self.registry,
            device,
            self.settings.open_attempts,
            self.settings.open_backoff,
        )
        .await?;

        let keymaps = self.session.keymaps();
        let (config, matched) = keymaps.resolve(&device.name);
        let engine = TranslationEngine::new(device.name.clone(), &config);

        let sink = self.session.sink();
        let port = register_unique_port(sink.as_ref(), &config.port_name(&device.name)).await?;

        for target in &config.auto_connect {
            match sink.connect(&port, target).await {
                Ok(()) => info!("Connected {} → {}", port.full_name, target),
                Err(e) => warn!("Auto-connect failed: {}", e),
            }
        }

        let worker = DeviceWorker::spawn(
            device.name.clone(),
            engine,
            KeyEventReader::new(source, device.identity),
            port.id,
            self.session.dispatch().clone(),
        );

        info!(
            "🎹 Attached \"{}\" [{}] from {} as {}",
            device.name,
            device.identity,
            device.event_path.display(),
            port.full_name
        );

        self.session.insert(ActiveDevice {
            info: device.clone(),
            port,
            map_name: matched.then(|| config.identification.real_name.clone()),
            attached_at: Local::now(),
            worker,
        })
    }
}

/// Keep the first device of every identity
fn dedup_identities(devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    let mut seen = HashSet::with_capacity(devices.len());
    devices
        .into_iter()
        .filter(|device| {
            let first = seen.insert(device.identity);
            if !first {
                debug!(
                    "Ignoring \"{}\" at {}: identity {} already listed",
                    device.name,
                    device.event_path.display(),
                    device.identity
                );
            }
            first
        })
        .collect()
}

/// Delay before the `strikes`-th re-attach: none for the first, then doubling
fn replug_delay(base: Duration, strikes: u32) -> Duration {
    if strikes <= 1 {
        return Duration::ZERO;
    }
    let factor = 1u32 << (strikes - 2).min(16);
    base.saturating_mul(factor).min(MAX_REPLUG_BACKOFF)
}

/// Open a device's event stream, retrying while the device node settles
pub async fn open_with_retry<R: DeviceRegistry + ?Sized>(
    registry: &R,
    device: &DeviceInfo,
    attempts: u32,
    backoff: Duration,
) -> Result<Box<dyn EventSource>> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match registry.open_events(device).await {
            Ok(source) => return Ok(source),
            Err(source) if attempt >= attempts => {
                return Err(Error::DeviceOpen {
                    path: device.event_path.clone(),
                    attempts,
                    source,
                })
            }
            Err(e) => {
                debug!(
                    "Open {} failed (attempt {}/{}): {}",
                    device.event_path.display(),
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
