use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::signal::StopSignal;
use super::worker::WorkerState;

/// Lifecycle of a slot as seen by the control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Idle,
    Running,
    /// Stop requested; the worker has not exited yet.
    Stopping,
}

/// Parameters of a start request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamParams {
    pub source_url: String,
    pub location_id: Option<i64>,
    /// Detection confidence threshold; `None` uses the configured default.
    pub det_conf: Option<f32>,
    /// Pose confidence threshold; `None` uses the configured default.
    pub pose_conf: Option<f32>,
}

impl StreamParams {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_url.trim().is_empty() {
            return Err(anyhow!("source_url must not be empty"));
        }
        for (name, value) in [("conf_threshold", self.det_conf), ("pose_conf_threshold", self.pose_conf)] {
            if let Some(value) = value {
                if !(0.0..=1.0).contains(&value) {
                    return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
                }
            }
        }
        Ok(())
    }
}

/// Point-in-time view of one slot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub id: u32,
    pub state: SlotState,
    pub running: bool,
    pub source_url: Option<String>,
    pub location_id: Option<i64>,
    pub det_conf: Option<f32>,
    pub pose_conf: Option<f32>,
    /// Unix seconds of the first successful source open of the current session.
    pub started_at: Option<u64>,
    pub frame_count: u64,
    pub worker_state: Option<WorkerState>,
}

#[derive(Debug)]
pub(crate) struct StreamSlot {
    pub(crate) id: u32,
    pub(crate) state: SlotState,
    pub(crate) source_url: Option<String>,
    pub(crate) location_id: Option<i64>,
    pub(crate) det_conf: Option<f32>,
    pub(crate) pose_conf: Option<f32>,
    pub(crate) started_at: Option<u64>,
    pub(crate) frame_count: u64,
    pub(crate) worker_state: Option<WorkerState>,
    pub(crate) stop: Option<StopSignal>,
    pub(crate) generation: u64,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl StreamSlot {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            source_url: None,
            location_id: None,
            det_conf: None,
            pose_conf: None,
            started_at: None,
            frame_count: 0,
            worker_state: None,
            stop: None,
            generation: 0,
            handle: None,
        }
    }

    pub(crate) fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            id: self.id,
            state: self.state,
            running: self.state == SlotState::Running,
            source_url: self.source_url.clone(),
            location_id: self.location_id,
            det_conf: self.det_conf,
            pose_conf: self.pose_conf,
            started_at: self.started_at,
            frame_count: self.frame_count,
            worker_state: self.worker_state,
        }
    }
}

/// All slots, keyed by id.
///
/// With `max_slots > 0` ids `1..=max_slots` are pre-allocated and nothing else
/// is valid. With `max_slots == 0` slots are created on first start and may be
/// removed once idle.
#[derive(Debug)]
pub(crate) struct SlotTable {
    pub(crate) max_slots: u32,
    pub(crate) slots: BTreeMap<u32, StreamSlot>,
}

impl SlotTable {
    pub(crate) fn new(max_slots: u32) -> Self {
        let slots = (1..=max_slots).map(|id| (id, StreamSlot::new(id))).collect();
        Self { max_slots, slots }
    }

    pub(crate) fn is_bounded(&self) -> bool {
        self.max_slots > 0
    }

    pub(crate) fn is_valid_id(&self, id: u32) -> bool {
        id >= 1 && (!self.is_bounded() || id <= self.max_slots)
    }

    /// Existing slot, or a fresh one in unbounded mode.
    pub(crate) fn slot_for_start(&mut self, id: u32) -> Option<&mut StreamSlot> {
        if !self.is_valid_id(id) {
            return None;
        }
        Some(self.slots.entry(id).or_insert_with(|| StreamSlot::new(id)))
    }

    fn live_slot(&mut self, id: u32, generation: u64) -> Option<&mut StreamSlot> {
        self.slots
            .get_mut(&id)
            .filter(|slot| slot.generation == generation && slot.stop.is_some())
    }
}

/// The worker's handle for writing its own slot.
///
/// Every write is tagged with the session generation so a late write from a
/// finished session can never touch a newer one. Dropping the reporter marks
/// the slot idle, which also covers a worker that unwinds from a panic.
pub(crate) struct SlotReporter {
    table: Arc<Mutex<SlotTable>>,
    id: u32,
    generation: u64,
}

impl SlotReporter {
    pub(crate) fn new(table: Arc<Mutex<SlotTable>>, id: u32, generation: u64) -> Self {
        Self {
            table,
            id,
            generation,
        }
    }

    fn with_slot(&self, apply: impl FnOnce(&mut StreamSlot)) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = table.live_slot(self.id, self.generation) {
            apply(slot);
        }
    }

    /// Record the session start time unless one is already recorded.
    pub(crate) fn mark_started(&self, unix_secs: u64) {
        self.with_slot(|slot| {
            slot.started_at.get_or_insert(unix_secs);
        });
    }

    pub(crate) fn update_frame_count(&self, count: u64) {
        self.with_slot(|slot| slot.frame_count = count);
    }

    pub(crate) fn set_worker_state(&self, state: WorkerState) {
        self.with_slot(|slot| slot.worker_state = Some(state));
    }
}

impl Drop for SlotReporter {
    fn drop(&mut self) {
        let id = self.id;
        self.with_slot(|slot| {
            if std::thread::panicking() {
                log::error!("slot {}: worker panicked, marking slot stopped", id);
            }
            slot.state = SlotState::Idle;
            slot.worker_state = Some(WorkerState::Stopped);
            slot.stop = None;
        });
    }
}
