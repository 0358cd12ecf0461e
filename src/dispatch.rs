//! Event dispatch between device workers and the realtime callback
//!
//! Workers push [`MidiEvent`]s into a bounded tokio channel and wait when it
//! is full. The [`Dispatcher`] end lives inside the audio callback: it never
//! blocks or allocates after construction. Events a port buffer rejects stay
//! pending, together with every later event for that port, so per-device
//! order survives a full buffer.
//!
//! Each event keeps the instant it was queued. [`CycleClock`] turns that into
//! a frame offset one period later, so the spacing between key presses
//! survives the trip through the queue instead of collapsing onto frame 0.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::trace;

use crate::audio::PortId;
use crate::midi::MidiMessage;

/// One message addressed to an output port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub port: PortId,
    pub message: MidiMessage,
    pub queued_at: Instant,
}

/// The receiving side has gone away (audio client closed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dispatch channel closed")]
pub struct DispatchClosed;

/// Destination buffer of one port for the current cycle
pub trait PortWriter {
    /// Write raw bytes at frame `time` of the cycle; `false` if the buffer is full
    fn write(&mut self, time: u32, bytes: &[u8]) -> bool;
}

/// Frame placement for the cycle being written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTiming {
    /// Start of the previous cycle; `None` on the first one
    pub reference: Option<Instant>,
    pub frames: u32,
    pub sample_rate: u32,
}

impl CycleTiming {
    /// Everything at frame 0
    pub const IMMEDIATE: CycleTiming = CycleTiming {
        reference: None,
        frames: 0,
        sample_rate: 0,
    };

    /// Offset of an event queued at `queued_at`, clamped into the cycle
    pub fn frame_of(&self, queued_at: Instant) -> u32 {
        let Some(reference) = self.reference else {
            return 0;
        };
        if self.frames == 0 {
            return 0;
        }
        let elapsed = queued_at.saturating_duration_since(reference);
        let frames = elapsed.as_nanos() * u128::from(self.sample_rate) / 1_000_000_000;
        u32::try_from(frames).unwrap_or(u32::MAX).min(self.frames - 1)
    }
}

/// Remembers when the previous cycle started
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleClock {
    last_start: Option<Instant>,
}

impl CycleClock {
    /// Start a cycle of `frames` at `now`
    pub fn tick(&mut self, now: Instant, frames: u32, sample_rate: u32) -> CycleTiming {
        let timing = CycleTiming {
            reference: self.last_start,
            frames,
            sample_rate,
        };
        self.last_start = Some(now);
        timing
    }
}

/// Create a dispatch channel holding up to `capacity` queued events
pub fn channel(capacity: usize) -> (DispatchSender, Dispatcher) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let in_flight = Arc::new(AtomicUsize::new(0));

    let sender = DispatchSender {
        tx,
        in_flight: in_flight.clone(),
    };
    let dispatcher = Dispatcher {
        rx,
        pending: Vec::with_capacity(capacity * 2),
        in_flight,
    };
    (sender, dispatcher)
}

/// Producer handle, cloned into every device worker
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::Sender<MidiEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl DispatchSender {
    /// Queue `message` for `port`, waiting while the channel is full
    pub async fn send(&self, port: PortId, message: MidiMessage) -> Result<(), DispatchClosed> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let event = MidiEvent {
            port,
            message,
            queued_at: Instant::now(),
        };
        if self.tx.send(event).await.is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(DispatchClosed);
        }
        Ok(())
    }

    /// Events queued or pending that have not been written or discarded
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every queued event is delivered; `false` on timeout
    pub async fn drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer end, owned by the realtime callback
#[derive(Debug)]
pub struct Dispatcher {
    rx: mpsc::Receiver<MidiEvent>,
    pending: Vec<MidiEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Move queued events into the pending buffer without growing it
    pub fn collect(&mut self) -> usize {
        let mut moved = 0;
        while self.pending.len() < self.pending.capacity() {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.pending.push(event);
                    moved += 1;
                }
                Err(_) => break,
            }
        }
        moved
    }

    /// Write pending events of `port` in order; stops at the first rejection
    ///
    /// Frame offsets never decrease within one port buffer.
    pub fn flush_port<W: PortWriter>(
        &mut self,
        port: PortId,
        timing: &CycleTiming,
        writer: &mut W,
    ) -> usize {
        let mut written = 0;
        let mut blocked = false;
        let mut last_frame = 0;
        self.pending.retain(|event| {
            if event.port != port || blocked {
                return true;
            }
            let frame = timing.frame_of(event.queued_at).max(last_frame);
            if writer.write(frame, event.message.encode().as_slice()) {
                last_frame = frame;
                written += 1;
                false
            } else {
                blocked = true;
                true
            }
        });
        if blocked {
            trace!("Port {} buffer full, {} event(s) deferred", port, self.pending_for(port));
        }
        self.in_flight.fetch_sub(written, Ordering::AcqRel);
        written
    }

    /// Drop pending events whose port is not live anymore
    pub fn discard_unrouted(&mut self, is_live: impl Fn(PortId) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|event| is_live(event.port));
        let dropped = before - self.pending.len();
        self.in_flight.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    pub fn pending(&self) -> &[MidiEvent] {
        &self.pending
    }

    fn pending_for(&self, port: PortId) -> usize {
        self.pending.iter().filter(|e| e.port == port).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Port buffer accepting a fixed number of writes per cycle
    struct LimitedWriter {
        room: usize,
        written: Vec<Vec<u8>>,
        frames: Vec<u32>,
    }

    impl LimitedWriter {
        fn new(room: usize) -> Self {
            Self { room, written: Vec::new(), frames: Vec::new() }
        }
    }

    impl PortWriter for LimitedWriter {
        fn write(&mut self, time: u32, bytes: &[u8]) -> bool {
            if self.room == 0 {
                return false;
            }
            self.room -= 1;
            self.written.push(bytes.to_vec());
            self.frames.push(time);
            true
        }
    }

    const NOW: CycleTiming = CycleTiming::IMMEDIATE;

    fn note_on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn { channel: 0, note, velocity: 100 }
    }

    #[tokio::test]
    async fn test_events_flow_in_order() {
        let (tx, mut dispatcher) = channel(16);
        tx.send(PortId(1), note_on(60)).await.unwrap();
        tx.send(PortId(1), note_on(62)).await.unwrap();
        assert_eq!(tx.in_flight(), 2);

        assert_eq!(dispatcher.collect(), 2);
        let mut writer = LimitedWriter::new(8);
        assert_eq!(dispatcher.flush_port(PortId(1), &NOW, &mut writer), 2);

        assert_eq!(writer.written, vec![vec![0x90, 60, 100], vec![0x90, 62, 100]]);
        assert_eq!(tx.in_flight(), 0);
        assert!(tx.drained(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_rejected_event_keeps_port_order() {
        let (tx, mut dispatcher) = channel(16);
        for note in [60, 61, 62] {
            tx.send(PortId(1), note_on(note)).await.unwrap();
        }
        tx.send(PortId(2), note_on(70)).await.unwrap();
        dispatcher.collect();

        let mut full = LimitedWriter::new(1);
        assert_eq!(dispatcher.flush_port(PortId(1), &NOW, &mut full), 1);
        let mut other = LimitedWriter::new(8);
        assert_eq!(dispatcher.flush_port(PortId(2), &NOW, &mut other), 1);
        assert_eq!(tx.in_flight(), 2);

        // Next cycle picks up where the full buffer stopped
        let mut next = LimitedWriter::new(8);
        assert_eq!(dispatcher.flush_port(PortId(1), &NOW, &mut next), 2);
        assert_eq!(next.written, vec![vec![0x90, 61, 100], vec![0x90, 62, 100]]);
        assert!(dispatcher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_events_for_removed_ports_are_discarded() {
        let (tx, mut dispatcher) = channel(4);
        tx.send(PortId(7), note_on(60)).await.unwrap();
        tx.send(PortId(8), note_on(60)).await.unwrap();
        dispatcher.collect();

        assert_eq!(dispatcher.discard_unrouted(|port| port == PortId(8)), 1);
        assert_eq!(tx.in_flight(), 1);
        assert!(!tx.drained(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_collect_never_grows_pending_buffer() {
        let (tx, mut dispatcher) = channel(1);
        let capacity = dispatcher.pending.capacity();

        let producer = tokio::spawn(async move {
            for note in 0..10 {
                tx.send(PortId(1), note_on(note)).await.unwrap();
            }
            tx
        });

        let mut seen = 0;
        while seen < 10 {
            dispatcher.collect();
            assert!(dispatcher.pending.capacity() == capacity);
            seen += dispatcher.flush_port(PortId(1), &NOW, &mut LimitedWriter::new(1));
            tokio::task::yield_now().await;
        }

        let tx = producer.await.unwrap();
        assert_eq!(tx.in_flight(), 0);
    }

    #[test]
    fn test_frame_of_queue_time() {
        let start = Instant::now();
        let timing = CycleTiming {
            reference: Some(start),
            frames: 256,
            sample_rate: 48_000,
        };

        assert_eq!(timing.frame_of(start), 0);
        assert_eq!(timing.frame_of(start + Duration::from_millis(1)), 48);
        assert_eq!(timing.frame_of(start + Duration::from_secs(1)), 255);
        assert_eq!(CycleTiming { reference: None, ..timing }.frame_of(start), 0);
        assert_eq!(CycleTiming { frames: 0, ..timing }.frame_of(start), 0);
    }

    #[test]
    fn test_clock_references_previous_cycle() {
        let mut clock = CycleClock::default();
        let first = Instant::now();
        let second = first + Duration::from_millis(5);

        assert_eq!(clock.tick(first, 128, 44_100).reference, None);
        let timing = clock.tick(second, 128, 44_100);
        assert_eq!(timing.reference, Some(first));
        assert_eq!(timing.frames, 128);
    }

    #[tokio::test]
    async fn test_flush_spreads_events_by_queue_time() {
        let (tx, mut dispatcher) = channel(8);
        for note in [60, 64, 67] {
            tx.send(PortId(1), note_on(note)).await.unwrap();
        }
        dispatcher.collect();

        let reference = Instant::now();
        dispatcher.pending[0].queued_at = reference + Duration::from_millis(1);
        dispatcher.pending[1].queued_at = reference + Duration::from_millis(3);
        // Clock skew must not move an event before its predecessor
        dispatcher.pending[2].queued_at = reference;

        let timing = CycleTiming {
            reference: Some(reference),
            frames: 1024,
            sample_rate: 48_000,
        };
        let mut writer = LimitedWriter::new(8);
        assert_eq!(dispatcher.flush_port(PortId(1), &timing, &mut writer), 3);
        assert_eq!(writer.frames, vec![48, 144, 144]);
    }

    #[tokio::test]
    async fn test_send_after_consumer_dropped() {
        let (tx, dispatcher) = channel(4);
        drop(dispatcher);
        assert_eq!(tx.send(PortId(1), note_on(60)).await, Err(DispatchClosed));
        assert_eq!(tx.in_flight(), 0);
        assert!(tx.is_closed());
    }
}
