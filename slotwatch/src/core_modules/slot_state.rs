// THEORY:
// `SlotState` is the temporal memory of one parking slot. The ensemble gives a
// noisy yes/no every frame; this module decides when that stream has said the
// same thing for long enough to be believed.
//
// Key architectural principles:
// 1.  **Two kinds of agreement.** A status change needs a clear majority over a
//     rolling window of raw detections *and* an unbroken run of identical raw
//     detections. Either one alone is too easy to fool.
// 2.  **Wall-clock confirmation.** Pending transitions are confirmed by elapsed
//     time rather than frame count, so the behaviour does not drift with the
//     camera's frame rate. Occupancy takes longer to confirm than vacancy
//     because a false "occupied" is the more disruptive mistake.
// 3.  **Stationarity.** An object only becomes "occupied" once it has stopped
//     moving and still looks like the thing that started the transition.
// 4.  **Transient samples are not evidence.** A frame rejected because
//     something passed through the slot (a hand, a fast blur) updates the motion
//     memory but never counts towards or against the slot's contents.

use crate::config::TimingConfig;
use crate::core_modules::region::Region;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const SHADOW_LOCK_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyStatus {
    #[default]
    Vacant,
    Occupied,
}

impl OccupancyStatus {
    pub fn from_occupied(occupied: bool) -> Self {
        if occupied {
            OccupancyStatus::Occupied
        } else {
            OccupancyStatus::Vacant
        }
    }

    pub fn is_occupied(&self) -> bool {
        *self == OccupancyStatus::Occupied
    }
}

/// A committed status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub slot_number: u32,
    pub old_status: OccupancyStatus,
    pub new_status: OccupancyStatus,
    pub confidence: f64,
    pub timestamp: f64,
}

/// One frame's evidence for a slot.
#[derive(Debug, Clone)]
pub struct Observation {
    pub occupied: bool,
    pub confidence: f64,
    pub region: Region,
    /// Something passed through the slot; the sample is not evidence.
    pub transient: bool,
}

#[derive(Debug, Clone)]
pub struct SlotState {
    slot_number: u32,
    timing: TimingConfig,

    status: OccupancyStatus,
    confidence: f64,
    pending_status: Option<OccupancyStatus>,
    pending_start_time: Option<f64>,

    detections: VecDeque<bool>,
    motion: VecDeque<f64>,
    last_detection: Option<bool>,
    consecutive_same_state: u32,
    frames_since_change: u64,
    last_change_time: Option<f64>,
    shadow_lock_remaining: u32,

    reference: Option<Region>,
    previous: Option<Region>,
    /// Region captured when the pending transition started.
    stable_region: Option<Region>,
}

impl SlotState {
    pub fn new(slot_number: u32, timing: TimingConfig) -> Self {
        Self {
            slot_number,
            detections: VecDeque::with_capacity(timing.history_size),
            motion: VecDeque::with_capacity(timing.motion_history_size),
            timing,
            status: OccupancyStatus::Vacant,
            confidence: 0.0,
            pending_status: None,
            pending_start_time: None,
            last_detection: None,
            consecutive_same_state: 0,
            frames_since_change: 0,
            last_change_time: None,
            shadow_lock_remaining: 0,
            reference: None,
            previous: None,
            stable_region: None,
        }
    }

    pub fn slot_number(&self) -> u32 {
        self.slot_number
    }

    pub fn status(&self) -> OccupancyStatus {
        self.status
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn pending_status(&self) -> Option<OccupancyStatus> {
        self.pending_status
    }

    pub fn consecutive_same_state(&self) -> u32 {
        self.consecutive_same_state
    }

    pub fn frames_since_change(&self) -> u64 {
        self.frames_since_change
    }

    pub fn last_change_time(&self) -> Option<f64> {
        self.last_change_time
    }

    pub fn history_len(&self) -> usize {
        self.detections.len()
    }

    pub fn reference(&self) -> Option<&Region> {
        self.reference.as_ref()
    }

    pub fn previous(&self) -> Option<&Region> {
        self.previous.as_ref()
    }

    pub fn set_reference(&mut self, region: Region) {
        self.reference = Some(region);
    }

    pub fn is_shadow_locked(&self) -> bool {
        self.shadow_lock_remaining > 0
    }

    /// Fraction of the pending transition's required time that has elapsed.
    pub fn pending_progress(&self, now: f64) -> Option<f64> {
        let pending = self.pending_status?;
        let start = self.pending_start_time?;
        let required = match pending {
            OccupancyStatus::Occupied => self.timing.stability_seconds,
            OccupancyStatus::Vacant => self.timing.vacancy_seconds,
        };
        if required <= 0.0 {
            return Some(1.0);
        }
        Some(((now - start) / required).clamp(0.0, 1.0))
    }

    /// Holds the slot vacant for `lock_frames` frames after a hard shadow.
    /// Returns the (possibly overridden) raw detection.
    pub fn apply_shadow_lock(
        &mut self,
        occupied: bool,
        confidence: f64,
        shadow: bool,
        lock_frames: u32,
    ) -> (bool, f64) {
        if shadow {
            self.shadow_lock_remaining = lock_frames;
        }
        if self.shadow_lock_remaining == 0 {
            return (occupied, confidence);
        }
        self.shadow_lock_remaining -= 1;
        (false, confidence.max(SHADOW_LOCK_CONFIDENCE))
    }

    /// Counts a frame in which the slot produced no evidence.
    pub fn skip_frame(&mut self) {
        self.frames_since_change = self.frames_since_change.saturating_add(1);
    }

    /// Integrates one frame. Returns an event when a transition commits.
    pub fn update(&mut self, observation: Observation, now: f64) -> Option<StateChangeEvent> {
        let Observation {
            occupied,
            confidence,
            region,
            transient,
        } = observation;
        self.frames_since_change = self.frames_since_change.saturating_add(1);

        if let Some(level) = self
            .previous
            .as_ref()
            .and_then(|previous| region.mean_gray_diff(previous))
        {
            push_bounded(&mut self.motion, level, self.timing.motion_history_size);
        }
        self.previous = Some(region.clone());

        if transient {
            debug!("slot {}: transient sample ignored", self.slot_number);
            return None;
        }
        self.confidence = confidence;

        push_bounded(&mut self.detections, occupied, self.timing.history_size);
        if self.last_detection == Some(occupied) {
            self.consecutive_same_state += 1;
        } else {
            self.consecutive_same_state = 1;
            self.clear_pending();
        }
        self.last_detection = Some(occupied);

        if self.detections.len() < self.timing.min_history {
            return None;
        }

        let ratio = self.occupied_ratio();
        let suggested = if ratio >= self.timing.occupied_ratio {
            OccupancyStatus::Occupied
        } else if ratio <= self.timing.vacant_ratio {
            OccupancyStatus::Vacant
        } else {
            self.status
        };

        if suggested == self.status {
            self.clear_pending();
            return None;
        }

        if self.pending_status != Some(suggested) {
            debug!(
                "slot {}: pending {:?} (ratio {:.2})",
                self.slot_number, suggested, ratio
            );
            self.pending_status = Some(suggested);
            self.pending_start_time = Some(now);
            self.stable_region = Some(region);
            return None;
        }

        let elapsed = self.pending_start_time.map_or(0.0, |start| now - start);
        let confirmed = match suggested {
            OccupancyStatus::Occupied => {
                elapsed >= self.timing.stability_seconds
                    && self.consecutive_same_state >= self.timing.min_consecutive_frames
                    && self.is_stationary()
                    && self.matches_stable_region(&region)
            }
            OccupancyStatus::Vacant => {
                elapsed >= self.timing.vacancy_seconds
                    && self.consecutive_same_state >= self.timing.vacancy_consecutive_frames
            }
        };
        if !confirmed {
            return None;
        }
        Some(self.commit(suggested, confidence, now))
    }

    fn occupied_ratio(&self) -> f64 {
        if self.detections.is_empty() {
            return 0.0;
        }
        self.detections.iter().filter(|&&d| d).count() as f64 / self.detections.len() as f64
    }

    fn is_stationary(&self) -> bool {
        if self.motion.len() < self.timing.min_motion_samples {
            return false;
        }
        let average = self.motion.iter().sum::<f64>() / self.motion.len() as f64;
        average < self.timing.motion_threshold
    }

    fn matches_stable_region(&self, region: &Region) -> bool {
        match &self.stable_region {
            None => true,
            Some(stable) => stable
                .mean_gray_diff(region)
                .is_some_and(|diff| diff < self.timing.region_stability_threshold),
        }
    }

    fn clear_pending(&mut self) {
        self.pending_status = None;
        self.pending_start_time = None;
        self.stable_region = None;
    }

    fn commit(&mut self, new_status: OccupancyStatus, confidence: f64, now: f64) -> StateChangeEvent {
        let old_status = self.status;
        self.status = new_status;
        self.last_change_time = Some(now);
        self.frames_since_change = 0;
        self.clear_pending();
        info!(
            "slot {}: {:?} -> {:?} (confidence {:.2})",
            self.slot_number, old_status, new_status, confidence
        );
        StateChangeEvent {
            slot_number: self.slot_number,
            old_status,
            new_status,
            confidence,
            timestamp: now,
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while window.len() >= capacity {
        window.pop_front();
    }
    window.push_back(value);
}
