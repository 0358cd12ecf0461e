//! Session: everything the running process shares
//!
//! Owns the port sink, the dispatch producer, the current key maps and the
//! set of active devices. The monitor is the only writer of the active set;
//! status reporting only takes snapshots.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::audio::{PortHandle, PortSink, SinkError};
use crate::config::KeyMapStore;
use crate::device::DeviceWorker;
use crate::dispatch::DispatchSender;
use crate::error::{Error, Result};
use crate::input::{DeviceIdentity, DeviceInfo};
use crate::status::{DeviceStatus, StatusSnapshot};

/// Upper bounds for the cooperative teardown steps
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Waiting for a worker to emit its final message and exit
    pub close: Duration,
    /// Waiting for queued events to be written by the audio callback
    pub drain: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            close: Duration::from_millis(500),
            drain: Duration::from_millis(500),
        }
    }
}

/// An attached keyboard
pub struct ActiveDevice {
    pub info: DeviceInfo,
    pub port: PortHandle,
    /// `real_name` of the matched map, or `None` for the default map
    pub map_name: Option<String>,
    pub attached_at: DateTime<Local>,
    pub worker: DeviceWorker,
}

impl ActiveDevice {
    pub fn identity(&self) -> DeviceIdentity {
        self.info.identity
    }

    pub fn event_path(&self) -> &PathBuf {
        &self.info.event_path
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            identity: self.info.identity,
            name: self.info.name.clone(),
            event_path: self.info.event_path.clone(),
            port: self.port.full_name.clone(),
            key_map: self.map_name.clone(),
            attached_at: self.attached_at,
            engine: self.worker.status(),
        }
    }
}

pub struct Session {
    sink: Arc<dyn PortSink>,
    dispatch: DispatchSender,
    keymaps: RwLock<Arc<KeyMapStore>>,
    devices: RwLock<HashMap<DeviceIdentity, ActiveDevice>>,
    timeouts: SessionTimeouts,
}

impl Session {
    pub fn new(
        sink: Arc<dyn PortSink>,
        dispatch: DispatchSender,
        keymaps: KeyMapStore,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            sink,
            dispatch,
            keymaps: RwLock::new(Arc::new(keymaps)),
            devices: RwLock::new(HashMap::new()),
            timeouts,
        }
    }

    pub fn sink(&self) -> &Arc<dyn PortSink> {
        &self.sink
    }

    pub fn dispatch(&self) -> &DispatchSender {
        &self.dispatch
    }

    pub fn keymaps(&self) -> Arc<KeyMapStore> {
        self.keymaps.read().clone()
    }

    /// Swap in reloaded maps; attached devices keep their engines
    pub fn replace_keymaps(&self, store: KeyMapStore) {
        info!("Key maps updated ({} map(s)), applies to newly attached devices", store.len());
        *self.keymaps.write() = Arc::new(store);
    }

    pub fn active_identities(&self) -> HashSet<DeviceIdentity> {
        self.devices.read().keys().copied().collect()
    }

    /// Active devices whose event stream has ended
    pub fn ended_streams(&self) -> Vec<DeviceIdentity> {
        self.devices
            .read()
            .values()
            .filter(|d| d.worker.stream_ended())
            .map(ActiveDevice::identity)
            .collect()
    }

    pub fn is_active(&self, identity: &DeviceIdentity) -> bool {
        self.devices.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Add a freshly attached device; a second insert for the same identity is a bug
    pub fn insert(&self, device: ActiveDevice) -> Result<()> {
        let mut devices = self.devices.write();
        let identity = device.identity();
        if devices.contains_key(&identity) {
            return Err(Error::Invariant(format!("device {} attached twice", identity)));
        }
        devices.insert(identity, device);
        Ok(())
    }

    pub fn remove(&self, identity: &DeviceIdentity) -> Option<ActiveDevice> {
        self.devices.write().remove(identity)
    }

    /// Stop one device: close its worker, let the final events out, drop its port
    pub async fn detach(&self, device: ActiveDevice) -> Result<()> {
        let ActiveDevice { info, port, worker, .. } = device;

        if !worker.close(self.timeouts.close).await {
            warn!("{}: worker did not finish within {:?}", info.name, self.timeouts.close);
        }
        if !self.dispatch.drained(self.timeouts.drain).await {
            warn!(
                "{}: {} event(s) still queued after {:?}",
                info.name,
                self.dispatch.in_flight(),
                self.timeouts.drain
            );
        }

        self.release_port(&port).await?;
        info!(
            "🔌 Detached \"{}\" [{}], port {} removed",
            info.name, info.identity, port.full_name
        );
        Ok(())
    }

    /// Stop every device; workers are closed together, then drained, then ports go
    pub async fn close_all(&self) -> Result<()> {
        let devices: Vec<ActiveDevice> = self.devices.write().drain().map(|(_, d)| d).collect();
        if devices.is_empty() {
            return Ok(());
        }
        info!("Closing {} device(s)", devices.len());

        let mut ports = Vec::with_capacity(devices.len());
        let mut workers = Vec::with_capacity(devices.len());
        for mut device in devices {
            device.worker.signal_close();
            ports.push((device.info.name, device.port));
            workers.push(device.worker);
        }

        let deadline = tokio::time::Instant::now() + self.timeouts.close;
        for worker in workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !worker.join(remaining).await {
                warn!("Device worker did not finish before shutdown deadline");
            }
        }

        if !self.dispatch.drained(self.timeouts.drain).await {
            warn!("{} event(s) undelivered at shutdown", self.dispatch.in_flight());
        }

        let mut first_error = None;
        for (name, port) in ports {
            match self.release_port(&port).await {
                Ok(()) => debug!("{}: port {} removed", name, port.full_name),
                Err(e) => {
                    warn!("{}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut devices: Vec<DeviceStatus> =
            self.devices.read().values().map(ActiveDevice::status).collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then(a.identity.cmp(&b.identity)));

        StatusSnapshot {
            taken_at: Local::now(),
            backend: self.sink.info(),
            queued_events: self.dispatch.in_flight(),
            devices,
        }
    }

    async fn release_port(&self, port: &PortHandle) -> Result<()> {
        match self.sink.unregister_port(port.id).await {
            Ok(()) => Ok(()),
            Err(SinkError::UnknownPort(id)) => Err(Error::Invariant(format!(
                "port {} ({}) unknown to the audio backend",
                id, port.full_name
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
