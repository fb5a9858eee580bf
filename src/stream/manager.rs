use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::InferenceAdapter;
use crate::ingest::SourceOpener;
use crate::publish::EventPublisher;
use crate::sink::{playlist_url, SinkFactory};

use super::signal::StopSignal;
use super::slot::{SlotReporter, SlotSnapshot, SlotState, SlotTable, StreamParams};
use super::worker::{SessionParams, StreamWorker, WorkerSettings, WorkerState};

/// Collaborators handed to every worker.
#[derive(Clone)]
pub struct PipelineDeps {
    pub sources: Arc<dyn SourceOpener>,
    pub sinks: Arc<dyn SinkFactory>,
    pub inference: InferenceAdapter,
    pub publisher: Arc<EventPublisher>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    /// The slot is running or still stopping.
    AlreadyRunning,
    InvalidId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Accepted,
    NotRunning,
    InvalidId,
}

/// Owns the slot table and spawns one worker thread per running slot.
///
/// Every slot mutation happens under the single table lock, so two starts
/// on one id cannot race and a stop cannot interleave with a start.
pub struct StreamManager {
    table: Arc<Mutex<SlotTable>>,
    deps: PipelineDeps,
    settings: WorkerSettings,
}

impl StreamManager {
    /// `max_slots == 0` means slots are created on demand.
    pub fn new(max_slots: u32, settings: WorkerSettings, deps: PipelineDeps) -> Self {
        log::info!(
            "StreamManager: {} mode, output root {}",
            if max_slots > 0 {
                format!("bounded ({} slots)", max_slots)
            } else {
                "unbounded".to_string()
            },
            settings.output_root.display()
        );
        log::info!("StreamManager: inference {}", deps.inference.describe());
        Self {
            table: Arc::new(Mutex::new(SlotTable::new(max_slots))),
            deps,
            settings,
        }
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, SlotTable>> {
        self.table
            .lock()
            .map_err(|_| anyhow!("slot table lock poisoned"))
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn max_slots(&self) -> Result<u32> {
        Ok(self.lock_table()?.max_slots)
    }

    /// Public playlist URL for a slot.
    pub fn hls_url(&self, id: u32) -> String {
        playlist_url(&self.settings.stream_base_url, id)
    }

    /// Mark the slot running and spawn its worker. Never waits for the source.
    pub fn start_stream(&self, id: u32, params: StreamParams) -> Result<StartOutcome> {
        params.validate()?;
        let (session, stop, generation) = {
            let mut table = self.lock_table()?;
            let Some(slot) = table.slot_for_start(id) else {
                return Ok(StartOutcome::InvalidId);
            };
            if slot.state != SlotState::Idle {
                return Ok(StartOutcome::AlreadyRunning);
            }

            let session = SessionParams {
                source_url: params.source_url.clone(),
                location_id: params.location_id,
                det_conf: params.det_conf.unwrap_or(self.settings.default_det_conf),
                pose_conf: params.pose_conf.unwrap_or(self.settings.default_pose_conf),
            };
            let stop = StopSignal::new();
            let generation = slot.generation + 1;

            slot.state = SlotState::Running;
            slot.generation = generation;
            slot.source_url = Some(params.source_url);
            slot.location_id = params.location_id;
            slot.det_conf = Some(session.det_conf);
            slot.pose_conf = Some(session.pose_conf);
            slot.started_at = None;
            slot.frame_count = 0;
            slot.worker_state = Some(WorkerState::Connecting);
            slot.stop = Some(stop.clone());
            // An idle slot's previous worker has already exited.
            slot.handle = None;
            (session, stop, generation)
        };

        // Spawn outside the lock: a worker that fails to spawn is dropped
        // here, and its reporter needs the lock to mark the slot idle again.
        let worker = StreamWorker::new(
            id,
            session,
            self.settings.clone(),
            self.deps.clone(),
            stop,
            SlotReporter::new(Arc::clone(&self.table), id, generation),
        );
        let handle = std::thread::Builder::new()
            .name(format!("stream-{}", id))
            .spawn(move || worker.run())
            .with_context(|| format!("failed to spawn worker for slot {}", id))?;

        let mut table = self.lock_table()?;
        if let Some(slot) = table.slots.get_mut(&id) {
            if slot.generation == generation {
                slot.handle = Some(handle);
            }
        }
        log::info!("slot {}: start accepted", id);
        Ok(StartOutcome::Accepted)
    }

    /// Signal the worker and mark the slot stopping. Does not wait for exit.
    pub fn stop_stream(&self, id: u32) -> Result<StopOutcome> {
        let mut table = self.lock_table()?;
        if !table.is_valid_id(id) {
            return Ok(StopOutcome::InvalidId);
        }
        let Some(slot) = table.slots.get_mut(&id) else {
            return Ok(StopOutcome::NotRunning);
        };
        if slot.state != SlotState::Running {
            return Ok(StopOutcome::NotRunning);
        }
        if let Some(stop) = slot.stop.as_ref() {
            stop.set();
        }
        slot.state = SlotState::Stopping;
        log::info!("slot {}: stop requested", id);
        Ok(StopOutcome::Accepted)
    }

    /// Snapshot of one slot; `None` for ids that are invalid or never started.
    pub fn status(&self, id: u32) -> Result<Option<SlotSnapshot>> {
        let table = self.lock_table()?;
        Ok(table.slots.get(&id).map(|slot| slot.snapshot()))
    }

    /// Last-write-wins frame count update for a running slot.
    pub fn update_frame_count(&self, id: u32, count: u64) -> Result<bool> {
        let mut table = self.lock_table()?;
        match table.slots.get_mut(&id) {
            Some(slot) if slot.state == SlotState::Running => {
                slot.frame_count = count;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn list(&self) -> Result<Vec<SlotSnapshot>> {
        let table = self.lock_table()?;
        Ok(table.slots.values().map(|slot| slot.snapshot()).collect())
    }

    /// Forget an idle slot. Only possible when slots are created on demand.
    pub fn remove_stream(&self, id: u32) -> Result<bool> {
        let mut table = self.lock_table()?;
        if table.is_bounded() {
            return Ok(false);
        }
        match table.slots.get(&id) {
            Some(slot) if slot.state == SlotState::Idle => {
                table.slots.remove(&id);
                log::info!("slot {}: removed", id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stop every worker and wait up to `timeout` for them to exit.
    ///
    /// Returns the number of workers still running at the deadline; those are
    /// left detached.
    pub fn shutdown(&self, timeout: Duration) -> Result<usize> {
        let mut handles = Vec::new();
        {
            let mut table = self.lock_table()?;
            for slot in table.slots.values_mut() {
                if slot.state == SlotState::Running {
                    slot.state = SlotState::Stopping;
                }
                if let Some(stop) = slot.stop.as_ref() {
                    stop.set();
                }
                if let Some(handle) = slot.handle.take() {
                    handles.push((slot.id, handle));
                }
            }
        }

        let deadline = Instant::now() + timeout;
        let mut pending = handles;
        while !pending.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|(_, handle)| handle.is_finished());
            for (id, handle) in finished {
                if handle.join().is_err() {
                    log::error!("slot {}: worker panicked", id);
                }
            }
            pending = running;
            if !pending.is_empty() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        for (id, _) in &pending {
            log::warn!("slot {}: worker did not exit within {:?}", id, timeout);
        }
        Ok(pending.len())
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if let Ok(table) = self.table.lock() {
            for slot in table.slots.values() {
                if let Some(stop) = slot.stop.as_ref() {
                    stop.set();
                }
            }
        }
    }
}
