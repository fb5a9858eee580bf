//! Detection event delivery.
//!
//! Workers hand payloads to [`EventPublisher::publish`], which never blocks:
//! payloads go onto a bounded queue drained by a fixed pool of threads. When
//! the queue is full the new payload is dropped and counted. [`PublishGate`]
//! keeps each slot to at most one publish per wall-clock second.

mod payload;
mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::SystemTime;

use anyhow::{Context, Result};

pub use payload::{AiResult, DetectionPayload, PayloadDetection, PayloadSummary};
pub use transport::{EventTransport, HttpTransport, AI_ANALYSIS_PATH};

/// Delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded pool of delivery threads.
pub struct EventPublisher {
    sender: Mutex<Option<SyncSender<DetectionPayload>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl EventPublisher {
    /// Spawn `workers` delivery threads sharing a queue of `capacity` payloads.
    pub fn start(
        transport: Arc<dyn EventTransport>,
        workers: usize,
        capacity: usize,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<DetectionPayload>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let transport = Arc::clone(&transport);
            let counters = Arc::clone(&counters);
            let handle = std::thread::Builder::new()
                .name(format!("publisher-{}", index))
                .spawn(move || delivery_loop(receiver, transport, counters))
                .context("failed to spawn publisher thread")?;
            handles.push(handle);
        }
        log::info!(
            "EventPublisher: {} workers, queue capacity {}",
            handles.len(),
            capacity.max(1)
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            counters,
        })
    }

    /// Queue a payload for delivery. Returns false when it was dropped.
    pub fn publish(&self, payload: DetectionPayload) -> bool {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            log::debug!("EventPublisher: shut down, dropping cctv{} payload", payload.cctv_id);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(payload)) => {
                log::warn!(
                    "EventPublisher: queue full, dropping cctv{} payload",
                    payload.cctv_id
                );
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting payloads, drain the queue, and join the pool.
    pub fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if handle.join().is_err() {
                log::error!("EventPublisher: delivery thread panicked");
            }
        }
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn delivery_loop(
    receiver: Arc<Mutex<Receiver<DetectionPayload>>>,
    transport: Arc<dyn EventTransport>,
    counters: Arc<Counters>,
) {
    loop {
        let next = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => {
                log::error!("EventPublisher: receiver lock poisoned");
                return;
            }
        };
        let Ok(payload) = next else {
            return;
        };
        match transport.send(&payload) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "EventPublisher: cctv{} sent {} detections",
                    payload.cctv_id,
                    payload.ai_result.detections.len()
                );
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("EventPublisher: cctv{} delivery failed: {:#}", payload.cctv_id, err);
            }
        }
    }
}

/// Allows one publish per `interval_secs` wall-clock seconds.
#[derive(Clone, Debug)]
pub struct PublishGate {
    interval_secs: u64,
    last_second: Option<u64>,
}

impl PublishGate {
    /// `interval_secs` below 1 is raised to 1.
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs: interval_secs.max(1),
            last_second: None,
        }
    }

    /// Claim the gate for `now`. Returns false if a publish already happened
    /// within the current interval.
    pub fn try_acquire(&mut self, now: SystemTime) -> bool {
        let second = crate::unix_secs(now);
        let open = match self.last_second {
            None => true,
            Some(last) if second < last => true,
            Some(last) => second >= last + self.interval_secs,
        };
        if open {
            self.last_second = Some(second);
        }
        open
    }
}
