//! JACK port sink
//!
//! One JACK client per process, one MIDI output port per attached keyboard.
//! Ports are created on the control side and handed to the process callback
//! over a lock-free command queue; removal goes the other way so a port is
//! only unregistered after the callback stopped writing to it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use jack::{
    AsyncClient, Client, ClientOptions, ClientStatus, Control, MidiOut, Port, ProcessScope, RawMidi,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{PortHandle, PortId, PortSink, SinkError, SinkInfo};
use crate::dispatch::{CycleClock, Dispatcher, PortWriter};

/// Ports the callback can hold without reallocating
const MAX_PORTS: usize = 256;

/// Pending add/remove commands between two cycles
const COMMAND_QUEUE: usize = 64;

/// How long unregistering waits for the callback to hand a port back
const REMOVE_TIMEOUT: Duration = Duration::from_millis(500);

enum PortCommand {
    Add(PortId, Port<MidiOut>),
    Remove(PortId, oneshot::Sender<Option<Port<MidiOut>>>),
}

/// Realtime side: owns the ports and the dispatch consumer
struct MidiProcessor {
    ports: Vec<(PortId, Port<MidiOut>)>,
    commands: Receiver<PortCommand>,
    dispatcher: Dispatcher,
    clock: CycleClock,
}

impl MidiProcessor {
    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PortCommand::Add(id, port) => self.ports.push((id, port)),
                PortCommand::Remove(id, reply) => {
                    let port = self
                        .ports
                        .iter()
                        .position(|(p, _)| *p == id)
                        .map(|index| self.ports.swap_remove(index).1);
                    let _ = reply.send(port);
                }
            }
        }
    }
}

struct JackWriter<'a>(jack::MidiWriter<'a>);

impl PortWriter for JackWriter<'_> {
    fn write(&mut self, time: u32, bytes: &[u8]) -> bool {
        self.0.write(&RawMidi { time, bytes }).is_ok()
    }
}

impl jack::ProcessHandler for MidiProcessor {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        let timing = self
            .clock
            .tick(Instant::now(), ps.n_frames(), client.sample_rate() as u32);
        self.apply_commands();
        self.dispatcher.collect();

        // Writers are created for every port so idle buffers get cleared
        for (id, port) in self.ports.iter_mut() {
            let mut writer = JackWriter(port.writer(ps));
            self.dispatcher.flush_port(*id, &timing, &mut writer);
        }

        let ports = &self.ports;
        self.dispatcher
            .discard_unrouted(|id| ports.iter().any(|(p, _)| *p == id));

        Control::Continue
    }
}

struct Notifications {
    shutdown_tx: mpsc::UnboundedSender<String>,
}

impl jack::NotificationHandler for Notifications {
    unsafe fn shutdown(&mut self, status: ClientStatus, reason: &str) {
        warn!("JACK server shut down the client: {:?} - {}", status, reason);
        let _ = self.shutdown_tx.send(reason.to_string());
    }

    fn xrun(&mut self, _: &Client) -> Control {
        debug!("JACK xrun");
        Control::Continue
    }
}

/// [`PortSink`] backed by a JACK client
pub struct JackSink {
    client: Mutex<Option<AsyncClient<Notifications, MidiProcessor>>>,
    commands: Sender<PortCommand>,
    next_id: AtomicU32,
}

impl JackSink {
    /// Connect to a running JACK server and start the process callback
    ///
    /// The returned receiver yields once if the server shuts the client down.
    pub fn open(
        client_name: &str,
        dispatcher: Dispatcher,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), SinkError> {
        let (client, status) = Client::new(client_name, ClientOptions::NO_START_SERVER)
            .map_err(|e| SinkError::Backend(format!("failed to create JACK client: {}", e)))?;
        debug!("JACK client status: {:?}", status);

        let (command_tx, command_rx) = channel::bounded(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let processor = MidiProcessor {
            ports: Vec::with_capacity(MAX_PORTS),
            commands: command_rx,
            dispatcher,
            clock: CycleClock::default(),
        };

        let active = client
            .activate_async(Notifications { shutdown_tx }, processor)
            .map_err(|e| SinkError::Backend(format!("failed to activate JACK client: {}", e)))?;

        info!(
            "🎛️  JACK client '{}' active ({} frames @ {} Hz)",
            active.as_client().name(),
            active.as_client().buffer_size(),
            active.as_client().sample_rate()
        );

        Ok((
            Self {
                client: Mutex::new(Some(active)),
                commands: command_tx,
                next_id: AtomicU32::new(0),
            },
            shutdown_rx,
        ))
    }

    /// Deactivate the client; later port operations fail
    pub fn close(&self) {
        if let Some(active) = self.client.lock().take() {
            match active.deactivate() {
                Ok(_) => info!("JACK client deactivated"),
                Err(e) => error!("Failed to deactivate JACK client: {}", e),
            }
        }
    }

    fn closed() -> SinkError {
        SinkError::Backend("JACK client closed".to_string())
    }
}

#[async_trait]
impl PortSink for JackSink {
    async fn register_output_port(&self, name: &str) -> Result<PortHandle, SinkError> {
        let id = PortId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let (port, full_name) = {
            let guard = self.client.lock();
            let client = guard.as_ref().ok_or_else(Self::closed)?.as_client();

            let qualified = format!("{}:{}", client.name(), name);
            if client.port_by_name(&qualified).is_some() {
                return Err(SinkError::NameTaken(name.to_string()));
            }

            let port = client
                .register_port(name, MidiOut::default())
                .map_err(|e| match e {
                    jack::Error::PortRegistrationError(_) => SinkError::NameTaken(name.to_string()),
                    other => SinkError::Backend(other.to_string()),
                })?;
            let full_name = port.name().unwrap_or(qualified);
            (port, full_name)
        };

        if let Err(e) = self.commands.try_send(PortCommand::Add(id, port)) {
            let port = match e {
                TrySendError::Full(PortCommand::Add(_, port))
                | TrySendError::Disconnected(PortCommand::Add(_, port)) => Some(port),
                _ => None,
            };
            if let (Some(port), Some(active)) = (port, self.client.lock().as_ref()) {
                let _ = active.as_client().unregister_port(port);
            }
            return Err(SinkError::Backend("port command queue unavailable".to_string()));
        }

        debug!("Registered port {} as {}", full_name, id);
        Ok(PortHandle {
            id,
            name: name.to_string(),
            full_name,
        })
    }

    async fn unregister_port(&self, id: PortId) -> Result<(), SinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .try_send(PortCommand::Remove(id, reply_tx))
            .map_err(|_| SinkError::Backend("port command queue unavailable".to_string()))?;

        let port = match tokio::time::timeout(REMOVE_TIMEOUT, reply_rx).await {
            Ok(Ok(Some(port))) => port,
            Ok(Ok(None)) => return Err(SinkError::UnknownPort(id)),
            Ok(Err(_)) | Err(_) => {
                return Err(SinkError::Backend(format!(
                    "process callback did not release port {}",
                    id
                )))
            }
        };

        let guard = self.client.lock();
        let client = guard.as_ref().ok_or_else(Self::closed)?.as_client();
        client
            .unregister_port(port)
            .map_err(|e| SinkError::Backend(e.to_string()))?;
        debug!("Unregistered port {}", id);
        Ok(())
    }

    async fn connect(&self, port: &PortHandle, target: &str) -> Result<(), SinkError> {
        let guard = self.client.lock();
        let client = guard.as_ref().ok_or_else(Self::closed)?.as_client();
        client
            .connect_ports_by_name(&port.full_name, target)
            .map_err(|e| SinkError::Connect {
                port: port.full_name.clone(),
                target: target.to_string(),
                message: e.to_string(),
            })
    }

    fn info(&self) -> SinkInfo {
        match self.client.lock().as_ref() {
            Some(active) => SinkInfo {
                buffer_size: active.as_client().buffer_size(),
                sample_rate: active.as_client().sample_rate() as u32,
            },
            None => SinkInfo::default(),
        }
    }
}
