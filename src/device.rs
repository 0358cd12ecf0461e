//! Device worker
//!
//! One tokio task per attached keyboard: read a key transition, run it
//! through the engine, forward the resulting messages. The task ends only
//! after it received the close signal, and its last message is always the
//! engine's all-notes-off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::PortId;
use crate::dispatch::DispatchSender;
use crate::engine::{EngineStatus, TranslationEngine};
use crate::input::{EventSource, KeyEventReader};

/// Handle to a running device worker
pub struct DeviceWorker {
    close_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    status: Arc<RwLock<EngineStatus>>,
    stream_ended: Arc<AtomicBool>,
}

impl DeviceWorker {
    pub fn spawn<S>(
        label: String,
        engine: TranslationEngine,
        reader: KeyEventReader<S>,
        port: PortId,
        dispatch: DispatchSender,
    ) -> Self
    where
        S: EventSource + 'static,
    {
        let (close_tx, close_rx) = oneshot::channel();
        let status = Arc::new(RwLock::new(engine.status()));
        let stream_ended = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_worker(
            label,
            engine,
            reader,
            port,
            dispatch,
            close_rx,
            status.clone(),
            stream_ended.clone(),
        ));

        Self {
            close_tx: Some(close_tx),
            handle,
            status,
            stream_ended,
        }
    }

    /// Latest engine state
    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    /// Whether the event stream failed or ended (device gone or replugged)
    pub fn stream_ended(&self) -> bool {
        self.stream_ended.load(Ordering::Acquire)
    }

    /// Ask the worker to stop; idempotent
    pub fn signal_close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the worker to finish; `false` if it did not within `timeout`
    pub async fn join(self, timeout: Duration) -> bool {
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Device worker failed: {}", e);
                true
            }
            Err(_) => {
                handle.abort();
                false
            }
        }
    }

    /// Signal close and wait for completion
    pub async fn close(mut self, timeout: Duration) -> bool {
        self.signal_close();
        self.join(timeout).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<S>(
    label: String,
    mut engine: TranslationEngine,
    mut reader: KeyEventReader<S>,
    port: PortId,
    dispatch: DispatchSender,
    mut close_rx: oneshot::Receiver<()>,
    status: Arc<RwLock<EngineStatus>>,
    stream_ended: Arc<AtomicBool>,
) where
    S: EventSource + 'static,
{
    let mut out = Vec::with_capacity(8);
    let mut close_received = false;

    loop {
        tokio::select! {
            biased;

            _ = &mut close_rx => {
                close_received = true;
                break;
            }
            result = reader.next_event() => match result {
                Ok(event) => {
                    engine.handle(&event, &mut out);
                    *status.write() = engine.status();
                    for message in out.drain(..) {
                        if dispatch.send(port, message).await.is_err() {
                            debug!("{}: dispatch closed, dropping {}", label, message);
                        }
                    }
                }
                Err(e) => {
                    info!("{}: event stream ended ({}), waiting for removal", label, e);
                    stream_ended.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }

    if !close_received {
        let _ = close_rx.await;
    }

    let panic = engine.close();
    *status.write() = engine.status();
    if dispatch.send(port, panic).await.is_err() {
        debug!("{}: dispatch closed before final all-notes-off", label);
    }
    debug!("{}: worker finished", label);
}
