// THEORY:
// The `GridSession` is the orchestrator for one monitored spot, in the same way
// a grid manager owns every per-region analyzer of a frame. It is not an
// analyzer itself. It owns the slots, turns each incoming frame into one region
// per slot, hands the regions to the `EnsembleScorer`, feeds the scores to each
// slot's `SlotState` and aggregates the results into a `FrameReport`.
//
// Key architectural principles:
// 1.  **Resolve once**: slot geometry declared in normalized coordinates is
//     resolved exactly once, against the first frame the session sees. Purely
//     absolute grids are resolved as soon as the session is created.
// 2.  **Reference propagation**: the session keeps one reference (empty-lot)
//     frame, either set explicitly or captured from the first frame, and cuts
//     every slot's reference region from it.
// 3.  **Absorb, don't abort**: a slot whose region cannot be extracted or scored
//     (an image operation error, or a scorer that panics) simply reports its
//     last known status. One bad slot never fails a frame.
// 4.  **Parallel scoring, serial integration**: scoring only reads slot state,
//     so large grids are scored across worker threads. State updates and event
//     collection happen afterwards on the calling thread, in declaration order.
// 5.  **Reference until propagated**: a stored reference stays marked pending
//     until every resolved slot has been offered its cut, so an interrupted
//     propagation is retried on the next frame.

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::core_modules::annotate;
use crate::core_modules::ensemble::{EnsembleScore, EnsembleScorer};
use crate::core_modules::geometry::{ResolvedGeometry, SlotGeometry, clamp_box};
use crate::core_modules::region::{BgrFrame, Region};
use crate::core_modules::slot_state::{Observation, OccupancyStatus, SlotState, StateChangeEvent};
use crate::error::{Result, SlotwatchError};
use log::{debug, info, warn};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Grids smaller than this are scored on the calling thread.
const PARALLEL_THRESHOLD: usize = 8;
/// Object labels are refreshed on every n-th frame when requested.
const LABEL_INTERVAL: u64 = 5;
/// Row height used to order auto-detected slots top to bottom.
const AUTO_GRID_ROW_HEIGHT: f64 = 50.0;
const MIN_AUTO_GRID_CANDIDATES: usize = 2;

/// A slot boundary proposed by an external grid detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridCandidate {
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f64; 4],
    pub confidence: f64,
}

/// Proposes slot boundaries for sessions started without a declared grid.
pub trait GridDetector: Send + Sync {
    fn detect(&self, frame: &BgrFrame, aoi: Option<[f64; 4]>) -> Vec<GridCandidate>;
}

/// Names what is parked in an occupied slot. Purely informational.
pub trait ObjectLabeler: Send + Sync {
    fn label(&self, region: &Region) -> Option<String>;
}

/// Turns one slot region into a per-frame score. `Ok(None)` means the frame
/// carries no evidence for the slot.
pub trait RegionScorer: Send + Sync {
    fn score(
        &self,
        region: &Region,
        reference: Option<&Region>,
        previous: Option<&Region>,
    ) -> Result<Option<EnsembleScore>>;
}

impl RegionScorer for EnsembleScorer {
    fn score(
        &self,
        region: &Region,
        reference: Option<&Region>,
        previous: Option<&Region>,
    ) -> Result<Option<EnsembleScore>> {
        EnsembleScorer::score(self, region, reference, previous)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Render the annotated output frame.
    pub annotate: bool,
    /// Ask the object labeler for labels on this frame.
    pub use_ai: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotOccupancy {
    pub slot_number: u32,
    pub status: OccupancyStatus,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<OccupancyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OccupancySummary {
    pub total: usize,
    pub occupied: usize,
    pub vacant: usize,
}

/// Everything a caller learns from one processed frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame_count: u64,
    pub timestamp: f64,
    pub slots: Vec<SlotOccupancy>,
    pub events: Vec<StateChangeEvent>,
    pub summary: OccupancySummary,
    /// Some slot changed recently enough that the annotated frame is worth
    /// forwarding.
    pub send_frame: bool,
    #[serde(skip)]
    pub annotated: Option<BgrFrame>,
}

impl FrameReport {
    /// The first transition committed on this frame, if any.
    pub fn state_change(&self) -> Option<&StateChangeEvent> {
        self.events.first()
    }

    pub fn slot(&self, slot_number: u32) -> Option<&SlotOccupancy> {
        self.slots.iter().find(|s| s.slot_number == slot_number)
    }
}

/// One monitored parking space.
#[derive(Debug, Clone)]
pub struct Slot {
    geometry: SlotGeometry,
    resolved: Option<ResolvedGeometry>,
    state: SlotState,
    label: Option<String>,
}

impl Slot {
    fn new(slot_number: u32, geometry: SlotGeometry, config: &SessionConfig) -> Self {
        Self {
            geometry,
            resolved: None,
            state: SlotState::new(slot_number, config.timing.clone()),
            label: None,
        }
    }

    pub fn slot_number(&self) -> u32 {
        self.state.slot_number()
    }

    pub fn geometry(&self) -> &SlotGeometry {
        &self.geometry
    }

    pub fn resolved(&self) -> Option<&ResolvedGeometry> {
        self.resolved.as_ref()
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn occupancy(&self) -> SlotOccupancy {
        SlotOccupancy {
            slot_number: self.slot_number(),
            status: self.state.status(),
            confidence: self.state.confidence(),
            pending: self.state.pending_status(),
            label: self.label.clone(),
        }
    }
}

/// What scoring produced for one slot on one frame.
enum Evidence {
    /// Unresolved, too small, or degenerate crop.
    Skipped,
    /// Extraction or scoring returned an error or panicked.
    Failed,
    Scored {
        region: Region,
        score: Option<EnsembleScore>,
    },
}

pub struct GridSession {
    config: SessionConfig,
    scorer: Arc<dyn RegionScorer>,
    slots: Vec<Slot>,
    frame_count: u64,
    geometry_resolved: bool,
    reference_frame: Option<BgrFrame>,
    reference_pending: bool,
    aoi: Option<SlotGeometry>,
    aoi_bounds: Option<[f64; 4]>,
    frame_hint: Option<(u32, u32)>,
    detector: Option<Arc<dyn GridDetector>>,
    labeler: Option<Arc<dyn ObjectLabeler>>,
    clock: Arc<dyn Clock>,
}

impl GridSession {
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let (declarations, aoi, frame_hint) = match &config.grid {
            Some(grid) => (
                grid.declarations()?,
                grid.aoi.as_ref().and_then(|a| a.geometry()),
                grid.frame_width.zip(grid.frame_height),
            ),
            None => (Vec::new(), None, None),
        };
        let slots: Vec<Slot> = declarations
            .into_iter()
            .map(|(number, geometry)| Slot::new(number, geometry, &config))
            .collect();

        let mut session = Self {
            scorer: Arc::new(EnsembleScorer::new(config.ensemble.clone())),
            config,
            slots,
            frame_count: 0,
            geometry_resolved: false,
            reference_frame: None,
            reference_pending: false,
            aoi,
            aoi_bounds: None,
            frame_hint,
            detector: None,
            labeler: None,
            clock,
        };

        let deferred = session.slots.iter().any(|s| s.geometry.is_normalized())
            || session.aoi.as_ref().is_some_and(SlotGeometry::is_normalized);
        if !deferred {
            for slot in &mut session.slots {
                let resolved =
                    slot.geometry
                        .resolve(0, 0)
                        .ok_or_else(|| SlotwatchError::InvalidGeometry {
                            slot_number: slot.slot_number(),
                            reason: "coordinates are not finite".into(),
                        })?;
                slot.resolved = Some(resolved);
            }
            session.aoi_bounds = session
                .aoi
                .as_ref()
                .and_then(|a| a.resolve(0, 0))
                .map(|r| r.bounds());
            session.geometry_resolved = true;
        }
        Ok(session)
    }

    pub fn with_detector(mut self, detector: Arc<dyn GridDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_labeler(mut self, labeler: Arc<dyn ObjectLabeler>) -> Self {
        self.labeler = Some(labeler);
        self
    }

    /// Replaces the ensemble built from the session's configuration.
    pub fn with_scorer(mut self, scorer: Arc<dyn RegionScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn has_reference(&self) -> bool {
        self.reference_frame.is_some()
    }

    pub fn aoi_bounds(&self) -> Option<[f64; 4]> {
        self.aoi_bounds
    }

    /// Replaces the empty-lot reference and re-cuts every resolved slot's
    /// reference region from it.
    pub fn set_reference(&mut self, frame: BgrFrame) -> Result<()> {
        if frame.is_empty() {
            return Err(SlotwatchError::InvalidFrame("empty reference frame".into()));
        }
        self.reference_frame = Some(frame);
        self.reference_pending = true;
        self.propagate_reference();
        Ok(())
    }

    fn propagate_reference(&mut self) {
        let Some(reference) = &self.reference_frame else {
            return;
        };
        let mut cut = 0;
        for slot in &mut self.slots {
            let Some(resolved) = &slot.resolved else {
                continue;
            };
            match resolved.extract(reference) {
                Ok(Some(region)) => {
                    slot.state.set_reference(region);
                    cut += 1;
                }
                Ok(None) => warn!("slot {}: no reference region", slot.slot_number()),
                Err(e) => warn!("slot {}: reference cut failed: {}", slot.slot_number(), e),
            }
        }
        self.reference_pending = false;
        info!(
            "reference propagated to {}/{} slots",
            cut,
            self.slots.len()
        );
    }

    fn resolve_geometry(&mut self, width: u32, height: u32) {
        if let Some((hint_w, hint_h)) = self.frame_hint {
            if (hint_w, hint_h) != (width, height) {
                warn!(
                    "grid declared for {}x{} but frames are {}x{}",
                    hint_w, hint_h, width, height
                );
            }
        }
        if self.geometry_resolved {
            return;
        }
        for slot in &mut self.slots {
            slot.resolved = slot.geometry.resolve(width, height);
            if slot.resolved.is_none() {
                warn!("slot {}: geometry could not be resolved", slot.slot_number());
            }
        }
        self.aoi_bounds = self
            .aoi
            .as_ref()
            .and_then(|a| a.resolve(width, height))
            .map(|r| r.bounds());
        self.geometry_resolved = true;
        info!(
            "resolved {} slots against a {}x{} frame",
            self.slots.len(),
            width,
            height
        );
    }

    fn try_auto_grid(&mut self, frame: &BgrFrame) {
        let Some(detector) = &self.detector else {
            return;
        };
        let mut candidates = detector.detect(frame, self.aoi_bounds);
        if candidates.len() < MIN_AUTO_GRID_CANDIDATES {
            debug!("auto grid: {} candidates, waiting", candidates.len());
            return;
        }
        candidates.sort_by(|a, b| {
            let row = |c: &GridCandidate| (c.bbox[1] / AUTO_GRID_ROW_HEIGHT).floor();
            row(a)
                .total_cmp(&row(b))
                .then(a.bbox[0].total_cmp(&b.bbox[0]))
        });
        self.slots = candidates
            .iter()
            .zip(1u32..)
            .map(|(candidate, number)| {
                let geometry = SlotGeometry::AbsoluteBox(candidate.bbox);
                let mut slot = Slot::new(number, geometry, &self.config);
                slot.resolved = slot.geometry.resolve(frame.width(), frame.height());
                slot
            })
            .collect();
        info!("auto grid locked with {} slots", self.slots.len());
        self.reference_pending = self.reference_frame.is_some();
    }

    /// Runs one frame through every slot.
    pub fn process_frame(&mut self, frame: &BgrFrame, options: ProcessOptions) -> Result<FrameReport> {
        if frame.is_empty() {
            return Err(SlotwatchError::InvalidFrame(format!(
                "{}x{} frame",
                frame.width(),
                frame.height()
            )));
        }
        let now = self.clock.now();

        if self.frame_count == 0 {
            self.resolve_geometry(frame.width(), frame.height());
            if self.reference_frame.is_none() {
                info!("first frame captured as reference");
                self.reference_frame = Some(frame.clone());
                self.reference_pending = true;
            }
        }
        if self.slots.is_empty() {
            self.try_auto_grid(frame);
        }
        if self.reference_pending {
            self.propagate_reference();
        }
        self.frame_count += 1;

        let evidence = self.evaluate(frame);
        let label_frame = options.use_ai && self.frame_count % LABEL_INTERVAL == 0;
        let mut events = Vec::new();

        for (slot, evidence) in self.slots.iter_mut().zip(evidence) {
            let (region, score) = match evidence {
                Evidence::Scored { region, score } => (region, score),
                Evidence::Failed => {
                    debug!("slot {}: holding status", slot.slot_number());
                    slot.state.skip_frame();
                    continue;
                }
                Evidence::Skipped => {
                    slot.state.skip_frame();
                    continue;
                }
            };
            let Some(score) = score else {
                slot.state.skip_frame();
                continue;
            };

            let transient = score.gate.is_some_and(|g| g.is_transient());
            let (occupied, confidence) = if transient {
                (score.occupied, score.confidence)
            } else {
                slot.state.apply_shadow_lock(
                    score.occupied,
                    score.confidence,
                    score.shadow,
                    self.config.shadow_lock_frames,
                )
            };

            let label_region = (label_frame && self.labeler.is_some()).then(|| region.clone());
            let observation = Observation {
                occupied,
                confidence,
                region,
                transient,
            };
            if let Some(event) = slot.state.update(observation, now) {
                if !event.new_status.is_occupied() {
                    slot.label = None;
                }
                events.push(event);
            }
            // labels follow the status this frame ends with
            if let (Some(labeler), Some(region)) = (&self.labeler, label_region) {
                slot.label = match slot.state.status() {
                    OccupancyStatus::Occupied => labeler.label(&region),
                    OccupancyStatus::Vacant => None,
                };
            }
        }

        let slots: Vec<SlotOccupancy> = self.slots.iter().map(Slot::occupancy).collect();
        let occupied = slots.iter().filter(|s| s.status.is_occupied()).count();
        let summary = OccupancySummary {
            total: slots.len(),
            occupied,
            vacant: slots.len() - occupied,
        };
        let send_frame = self
            .slots
            .iter()
            .any(|s| s.state.frames_since_change() <= self.config.recent_change_frames);
        let annotated = if options.annotate {
            match annotate::render(frame, &self.slots, now) {
                Ok(out) => Some(out),
                Err(e) => {
                    warn!("annotation failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(FrameReport {
            frame_count: self.frame_count,
            timestamp: now,
            slots,
            events,
            summary,
            send_frame,
            annotated,
        })
    }

    fn evaluate(&self, frame: &BgrFrame) -> Vec<Evidence> {
        let scorer = self.scorer.as_ref();
        let min_size = self.config.min_slot_size;
        let score = move |slot: &Slot| {
            catch_unwind(AssertUnwindSafe(|| evaluate_slot(scorer, slot, frame, min_size)))
                .unwrap_or_else(|_| {
                    warn!("slot {}: scoring panicked", slot.slot_number());
                    Evidence::Failed
                })
        };

        if self.slots.len() < PARALLEL_THRESHOLD {
            return self.slots.iter().map(score).collect();
        }
        let workers = num_cpus::get().max(1);
        let chunk_size = self.slots.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .slots
                .chunks(chunk_size)
                .map(|chunk| {
                    let handle =
                        scope.spawn(move || chunk.iter().map(score).collect::<Vec<Evidence>>());
                    (chunk.len(), handle)
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|(len, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| (0..len).map(|_| Evidence::Failed).collect())
                })
                .collect()
        })
    }
}

fn evaluate_slot(scorer: &dyn RegionScorer, slot: &Slot, frame: &BgrFrame, min_size: u32) -> Evidence {
    let Some(resolved) = &slot.resolved else {
        return Evidence::Skipped;
    };
    let fits = clamp_box(resolved.bounds(), frame.width(), frame.height())
        .is_some_and(|rect| rect.width() >= min_size && rect.height() >= min_size);
    if !fits {
        debug!("slot {}: below minimum size, skipped", slot.slot_number());
        return Evidence::Skipped;
    }
    let region = match resolved.extract(frame) {
        Ok(Some(region)) => region,
        Ok(None) => {
            warn!("slot {}: degenerate region, skipped", slot.slot_number());
            return Evidence::Skipped;
        }
        Err(e) => {
            warn!("slot {}: extraction failed: {}", slot.slot_number(), e);
            return Evidence::Failed;
        }
    };
    match scorer.score(&region, slot.state.reference(), slot.state.previous()) {
        Ok(score) => Evidence::Scored { region, score },
        Err(e) => {
            warn!("slot {}: scoring failed: {}", slot.slot_number(), e);
            Evidence::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CellConfig, GridConfig, TimingConfig};
    use crate::core_modules::ensemble::Gate;
    use crate::core_modules::geometry::Point;
    use crate::core_modules::region::PixelRect;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU8, Ordering};

    const ASPHALT: [u8; 3] = [128, 128, 128];

    fn two_slot_grid() -> GridConfig {
        GridConfig {
            cells: vec![
                CellConfig {
                    slot_number: 1,
                    bbox: Some([0.0, 0.0, 40.0, 40.0]),
                    ..Default::default()
                },
                CellConfig {
                    slot_number: 2,
                    bbox: Some([50.0, 0.0, 90.0, 40.0]),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn responsive(grid: GridConfig) -> SessionConfig {
        SessionConfig {
            timing: TimingConfig::responsive(),
            ..SessionConfig::with_grid(grid)
        }
    }

    fn car_in_slot_one() -> BgrFrame {
        let mut frame = BgrFrame::filled(100, 50, ASPHALT);
        frame.fill_rect(
            PixelRect {
                x1: 5,
                y1: 5,
                x2: 35,
                y2: 35,
            },
            [150, 40, 20],
        );
        frame
    }

    struct Labels;

    impl ObjectLabeler for Labels {
        fn label(&self, _region: &Region) -> Option<String> {
            Some("car".into())
        }
    }

    struct FixedDetector(Vec<GridCandidate>);

    impl GridDetector for FixedDetector {
        fn detect(&self, _frame: &BgrFrame, _aoi: Option<[f64; 4]>) -> Vec<GridCandidate> {
            self.0.clone()
        }
    }

    struct FnScorer<F>(F);

    impl<F> RegionScorer for FnScorer<F>
    where
        F: Fn(&Region) -> Result<Option<EnsembleScore>> + Send + Sync,
    {
        fn score(
            &self,
            region: &Region,
            _reference: Option<&Region>,
            _previous: Option<&Region>,
        ) -> Result<Option<EnsembleScore>> {
            (self.0)(region)
        }
    }

    fn raw(occupied: bool, confidence: f64, shadow: bool, gate: Option<Gate>) -> EnsembleScore {
        EnsembleScore {
            occupied,
            confidence,
            shadow,
            gate,
        }
    }

    /// Plays `script` one score per call, then repeats `rest`.
    fn scripted(script: Vec<EnsembleScore>, rest: EnsembleScore) -> Arc<dyn RegionScorer> {
        let queue = Mutex::new(VecDeque::from(script));
        Arc::new(FnScorer(move |_: &Region| -> Result<Option<EnsembleScore>> {
            Ok(Some(queue.lock().unwrap().pop_front().unwrap_or(rest)))
        }))
    }

    fn one_slot(
        config: SessionConfig,
        scorer: Arc<dyn RegionScorer>,
    ) -> (GridSession, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0.0));
        let grid = GridConfig {
            cells: vec![CellConfig {
                slot_number: 1,
                bbox: Some([0.0, 0.0, 40.0, 40.0]),
                ..Default::default()
            }],
            ..Default::default()
        };
        let session = GridSession::new(
            SessionConfig {
                grid: Some(grid),
                ..config
            },
            clock.clone(),
        )
        .unwrap()
        .with_scorer(scorer);
        (session, clock)
    }

    /// One uniform frame, then one second passes.
    fn step(session: &mut GridSession, clock: &ManualClock, options: ProcessOptions) -> FrameReport {
        let report = session
            .process_frame(&BgrFrame::filled(50, 50, ASPHALT), options)
            .unwrap();
        clock.advance(1.0);
        report
    }

    fn candidate(bbox: [f64; 4]) -> GridCandidate {
        GridCandidate {
            bbox,
            confidence: 0.9,
        }
    }

    /// Reference set to an empty lot, then ten car frames one second apart.
    fn parked_session() -> (GridSession, Arc<ManualClock>, Vec<StateChangeEvent>) {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut session = GridSession::new(responsive(two_slot_grid()), clock.clone())
            .unwrap()
            .with_labeler(Arc::new(Labels));
        session
            .set_reference(BgrFrame::filled(100, 50, ASPHALT))
            .unwrap();
        let options = ProcessOptions {
            annotate: false,
            use_ai: true,
        };
        let mut events = Vec::new();
        for _ in 0..10 {
            let report = session.process_frame(&car_in_slot_one(), options).unwrap();
            events.extend(report.events);
            clock.advance(1.0);
        }
        (session, clock, events)
    }

    #[test]
    fn absolute_grid_resolves_immediately() {
        let session =
            GridSession::new(SessionConfig::with_grid(two_slot_grid()), Arc::new(ManualClock::new(0.0)))
                .unwrap();
        assert_eq!(session.slot_count(), 2);
        assert!(session.slots().iter().all(|s| s.resolved().is_some()));
    }

    #[test]
    fn normalized_grid_waits_for_the_first_frame() {
        let grid = GridConfig {
            cells: vec![CellConfig {
                slot_number: 7,
                bbox_normalized: Some([0.25, 0.0, 0.75, 1.0]),
                ..Default::default()
            }],
            frame_width: Some(1280),
            frame_height: Some(720),
            aoi: Some(crate::config::AoiConfig {
                bbox_normalized: Some([0.0, 0.0, 0.5, 0.5]),
                ..Default::default()
            }),
        };
        let mut session =
            GridSession::new(SessionConfig::with_grid(grid), Arc::new(ManualClock::new(0.0))).unwrap();
        assert!(session.slots()[0].resolved().is_none());
        assert!(!session.has_reference());

        session
            .process_frame(&BgrFrame::filled(80, 40, ASPHALT), ProcessOptions::default())
            .unwrap();
        assert_eq!(
            session.slots()[0].resolved(),
            Some(&ResolvedGeometry::Box([20.0, 0.0, 60.0, 40.0]))
        );
        assert_eq!(session.aoi_bounds(), Some([0.0, 0.0, 40.0, 20.0]));
        assert!(session.has_reference());
        assert!(session.slots()[0].state().reference().is_some());

        // a later frame of another size does not re-resolve
        session
            .process_frame(&BgrFrame::filled(160, 80, ASPHALT), ProcessOptions::default())
            .unwrap();
        assert_eq!(
            session.slots()[0].resolved(),
            Some(&ResolvedGeometry::Box([20.0, 0.0, 60.0, 40.0]))
        );
    }

    #[test]
    fn parked_car_is_confirmed_once() {
        let (session, _, events) = parked_session();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot_number, 1);
        assert_eq!(events[0].new_status, OccupancyStatus::Occupied);

        let slots = session.slots();
        assert_eq!(slots[0].state().status(), OccupancyStatus::Occupied);
        assert_eq!(slots[1].state().status(), OccupancyStatus::Vacant);
        assert_eq!(slots[0].label(), Some("car"));
        assert_eq!(slots[1].label(), None);
    }

    #[test]
    fn report_carries_summary_and_send_hint() {
        let (mut session, clock, _) = parked_session();
        clock.advance(1.0);
        let report = session
            .process_frame(
                &car_in_slot_one(),
                ProcessOptions {
                    annotate: true,
                    use_ai: false,
                },
            )
            .unwrap();
        assert_eq!(report.frame_count, 11);
        assert_eq!(
            report.summary,
            OccupancySummary {
                total: 2,
                occupied: 1,
                vacant: 1
            }
        );
        assert!(report.send_frame);
        assert!(report.state_change().is_none());
        assert_eq!(report.slot(1).unwrap().status, OccupancyStatus::Occupied);
        let annotated = report.annotated.unwrap();
        assert_eq!((annotated.width(), annotated.height()), (100, 50));
    }

    #[test]
    fn degenerate_extraction_holds_status_and_confidence() {
        let (mut session, clock, _) = parked_session();
        let before: Vec<SlotOccupancy> = session.slots().iter().map(Slot::occupancy).collect();
        clock.advance(1.0);
        let report = session
            .process_frame(&BgrFrame::filled(10, 10, ASPHALT), ProcessOptions::default())
            .unwrap();
        assert!(report.events.is_empty());
        assert_eq!(report.slots, before);
    }

    #[test]
    fn empty_frame_is_an_input_error() {
        let mut session =
            GridSession::new(SessionConfig::with_grid(two_slot_grid()), Arc::new(ManualClock::new(0.0)))
                .unwrap();
        let result = session.process_frame(&BgrFrame::filled(0, 0, ASPHALT), ProcessOptions::default());
        assert!(matches!(result, Err(SlotwatchError::InvalidFrame(_))));
        assert_eq!(session.frame_count(), 0);
    }

    #[test]
    fn quadrilateral_slots_are_unwarped() {
        let grid = GridConfig {
            cells: vec![CellConfig {
                slot_number: 1,
                corners_normalized: Some(vec![
                    Point::new(0.1, 0.1),
                    Point::new(0.6, 0.2),
                    Point::new(0.7, 0.9),
                    Point::new(0.0, 0.8),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut session =
            GridSession::new(SessionConfig::with_grid(grid), Arc::new(ManualClock::new(0.0))).unwrap();
        let report = session
            .process_frame(&BgrFrame::filled(200, 100, ASPHALT), ProcessOptions::default())
            .unwrap();
        assert_eq!(report.slots.len(), 1);
        let reference = session.slots()[0].state().reference().unwrap();
        assert_eq!((reference.width(), reference.height()), (100, 100));
        assert_eq!(session.slots()[0].state().history_len(), 1);
    }

    #[test]
    fn auto_grid_locks_after_two_candidates_in_reading_order() {
        let detector = FixedDetector(vec![
            candidate([60.0, 60.0, 90.0, 95.0]),
            candidate([50.0, 5.0, 80.0, 40.0]),
            candidate([5.0, 10.0, 40.0, 45.0]),
        ]);
        let mut session = GridSession::new(SessionConfig::default(), Arc::new(ManualClock::new(0.0)))
            .unwrap()
            .with_detector(Arc::new(detector));
        assert_eq!(session.slot_count(), 0);
        let report = session
            .process_frame(&BgrFrame::filled(100, 100, ASPHALT), ProcessOptions::default())
            .unwrap();
        assert_eq!(report.summary.total, 3);
        let bounds: Vec<(u32, [f64; 4])> = session
            .slots()
            .iter()
            .map(|s| (s.slot_number(), s.resolved().unwrap().bounds()))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (1, [5.0, 10.0, 40.0, 45.0]),
                (2, [50.0, 5.0, 80.0, 40.0]),
                (3, [60.0, 60.0, 90.0, 95.0]),
            ]
        );
        assert!(session.slots().iter().all(|s| s.state().reference().is_some()));
    }

    #[test]
    fn auto_grid_waits_for_enough_candidates() {
        let detector = FixedDetector(vec![candidate([5.0, 5.0, 40.0, 40.0])]);
        let mut session = GridSession::new(SessionConfig::default(), Arc::new(ManualClock::new(0.0)))
            .unwrap()
            .with_detector(Arc::new(detector));
        let report = session
            .process_frame(
                &BgrFrame::filled(100, 100, ASPHALT),
                ProcessOptions {
                    annotate: true,
                    use_ai: false,
                },
            )
            .unwrap();
        assert_eq!(report.summary.total, 0);
        assert!(report.annotated.is_some());
    }

    #[test]
    fn large_grids_score_in_parallel_with_stable_order() {
        let cells = (0..12u32)
            .map(|i| {
                let (x, y) = ((i % 4) as f64 * 25.0, (i / 4) as f64 * 25.0);
                CellConfig {
                    slot_number: 100 - i,
                    bbox: Some([x, y, x + 25.0, y + 25.0]),
                    ..Default::default()
                }
            })
            .collect();
        let grid = GridConfig {
            cells,
            ..Default::default()
        };
        let mut session =
            GridSession::new(SessionConfig::with_grid(grid), Arc::new(ManualClock::new(0.0))).unwrap();
        let report = session
            .process_frame(&BgrFrame::filled(100, 75, ASPHALT), ProcessOptions::default())
            .unwrap();
        let numbers: Vec<u32> = report.slots.iter().map(|s| s.slot_number).collect();
        assert_eq!(numbers, (0..12u32).map(|i| 100 - i).collect::<Vec<_>>());
        assert!(session.slots().iter().all(|s| s.state().history_len() <= 1));
    }

    #[test]
    fn hard_shadow_holds_the_slot_vacant_for_the_lock_frames() {
        let config = SessionConfig {
            shadow_lock_frames: 3,
            timing: TimingConfig::responsive(),
            ..SessionConfig::default()
        };
        let shadow = raw(false, 0.85, true, Some(Gate::Shadow));
        let car = raw(true, 0.7, false, None);
        let (mut session, clock) = one_slot(config, scripted(vec![shadow], car));

        step(&mut session, &clock, ProcessOptions::default());
        let state = session.slots()[0].state();
        assert!(state.is_shadow_locked());
        assert_eq!(state.consecutive_same_state(), 1);

        // the car votes are overridden while the lock lasts
        step(&mut session, &clock, ProcessOptions::default());
        step(&mut session, &clock, ProcessOptions::default());
        let state = session.slots()[0].state();
        assert!(!state.is_shadow_locked());
        assert_eq!(state.consecutive_same_state(), 3);
        assert_eq!(state.confidence(), 0.85);
        assert!(state.pending_status().is_none());

        // lock spent, the next car vote counts as occupied
        step(&mut session, &clock, ProcessOptions::default());
        let state = session.slots()[0].state();
        assert_eq!(state.consecutive_same_state(), 1);
        assert_eq!(state.confidence(), 0.7);
    }

    #[test]
    fn transient_gate_passes_through_the_lock_without_consuming_it() {
        let config = SessionConfig {
            shadow_lock_frames: 3,
            timing: TimingConfig::responsive(),
            ..SessionConfig::default()
        };
        let script = vec![
            raw(false, 0.85, true, Some(Gate::Shadow)),
            raw(false, 0.8, false, Some(Gate::RapidMotion)),
        ];
        let car = raw(true, 0.7, false, None);
        let (mut session, clock) = one_slot(config, scripted(script, car));

        step(&mut session, &clock, ProcessOptions::default());
        step(&mut session, &clock, ProcessOptions::default());
        let state = session.slots()[0].state();
        assert!(state.is_shadow_locked());
        assert_eq!(state.consecutive_same_state(), 1);
        assert_eq!(state.history_len(), 1);

        // the two frames left on the lock are spent on car votes
        step(&mut session, &clock, ProcessOptions::default());
        step(&mut session, &clock, ProcessOptions::default());
        let state = session.slots()[0].state();
        assert!(!state.is_shadow_locked());
        assert_eq!(state.consecutive_same_state(), 3);

        step(&mut session, &clock, ProcessOptions::default());
        assert_eq!(session.slots()[0].state().consecutive_same_state(), 1);
    }

    #[test]
    fn failed_scoring_holds_status_and_confidence() {
        const HEALTHY: u8 = 0;
        const ERRORS: u8 = 1;
        const PANICS: u8 = 2;
        let mode = Arc::new(AtomicU8::new(HEALTHY));
        let scorer = {
            let mode = mode.clone();
            Arc::new(FnScorer(move |_: &Region| -> Result<Option<EnsembleScore>> {
                match mode.load(Ordering::SeqCst) {
                    ERRORS => Err(SlotwatchError::Aborted("scorer offline".into())),
                    PANICS => panic!("scorer crashed"),
                    _ => Ok(Some(raw(true, 0.9, false, None))),
                }
            }))
        };
        let config = SessionConfig {
            timing: TimingConfig::responsive(),
            ..SessionConfig::default()
        };
        let (mut session, clock) = one_slot(config, scorer);
        for _ in 0..12 {
            step(&mut session, &clock, ProcessOptions::default());
        }
        let before: Vec<SlotOccupancy> = session.slots().iter().map(Slot::occupancy).collect();
        assert_eq!(before[0].status, OccupancyStatus::Occupied);
        let history = session.slots()[0].state().history_len();

        for failure in [ERRORS, PANICS] {
            mode.store(failure, Ordering::SeqCst);
            let report = step(&mut session, &clock, ProcessOptions::default());
            assert!(report.events.is_empty());
            assert_eq!(report.slots, before);
            assert_eq!(session.slots()[0].state().history_len(), history);
        }
        assert_eq!(session.frame_count(), 14);

        mode.store(HEALTHY, Ordering::SeqCst);
        step(&mut session, &clock, ProcessOptions::default());
        assert_eq!(session.slots()[0].state().history_len(), history + 1);
    }

    #[test]
    fn panicking_worker_fails_its_slots_not_the_frame() {
        let cells = (0..12u32)
            .map(|i| {
                let (x, y) = ((i % 4) as f64 * 25.0, (i / 4) as f64 * 25.0);
                CellConfig {
                    slot_number: i + 1,
                    bbox: Some([x, y, x + 25.0, y + 25.0]),
                    ..Default::default()
                }
            })
            .collect();
        let grid = GridConfig {
            cells,
            ..Default::default()
        };
        // only the top row panics
        let scorer = Arc::new(FnScorer(|region: &Region| -> Result<Option<EnsembleScore>> {
            if region.data().starts_with(&[0, 0, 255]) {
                panic!("scorer crashed");
            }
            Ok(Some(raw(false, 0.9, false, None)))
        }));
        let mut session =
            GridSession::new(SessionConfig::with_grid(grid), Arc::new(ManualClock::new(0.0)))
                .unwrap()
                .with_scorer(scorer);
        let mut frame = BgrFrame::filled(100, 75, ASPHALT);
        frame.fill_rect(
            PixelRect {
                x1: 0,
                y1: 0,
                x2: 100,
                y2: 25,
            },
            [0, 0, 255],
        );
        let report = session.process_frame(&frame, ProcessOptions::default()).unwrap();
        assert_eq!(report.slots.len(), 12);
        let histories: Vec<usize> = session
            .slots()
            .iter()
            .map(|s| s.state().history_len())
            .collect();
        assert_eq!(histories, [vec![0; 4], vec![1; 8]].concat());
    }

    #[test]
    fn the_committing_frame_is_labelled() {
        let config = SessionConfig {
            timing: TimingConfig::strict(),
            ..SessionConfig::default()
        };
        let (session, clock) = one_slot(config, scripted(Vec::new(), raw(true, 0.9, false, None)));
        let mut session = session.with_labeler(Arc::new(Labels));
        let options = ProcessOptions {
            annotate: false,
            use_ai: true,
        };
        let committed: Vec<FrameReport> = (0..LABEL_INTERVAL * 2)
            .map(|_| step(&mut session, &clock, options))
            .filter(|report| report.state_change().is_some())
            .collect();
        // strict timing commits on the tenth sample, which is also a label frame
        assert_eq!(committed.len(), 1);
        let report = &committed[0];
        assert_eq!(report.frame_count, LABEL_INTERVAL * 2);
        assert_eq!(report.slot(1).unwrap().status, OccupancyStatus::Occupied);
        assert_eq!(report.slot(1).unwrap().label.as_deref(), Some("car"));
    }

    #[test]
    fn rejected_frame_leaves_the_session_untouched() {
        let grid = GridConfig {
            cells: vec![CellConfig {
                slot_number: 1,
                bbox_normalized: Some([0.0, 0.0, 0.5, 1.0]),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut session =
            GridSession::new(SessionConfig::with_grid(grid), Arc::new(ManualClock::new(0.0))).unwrap();
        assert!(matches!(
            BgrFrame::from_raw(80, 40, vec![0; 10]),
            Err(SlotwatchError::InvalidFrame(_))
        ));
        let result = session.process_frame(&BgrFrame::filled(0, 40, ASPHALT), ProcessOptions::default());
        assert!(matches!(result, Err(SlotwatchError::InvalidFrame(_))));
        assert_eq!(session.frame_count(), 0);
        assert!(!session.has_reference());

        session
            .process_frame(&BgrFrame::filled(80, 40, ASPHALT), ProcessOptions::default())
            .unwrap();
        assert_eq!(session.frame_count(), 1);
        let reference = session.slots()[0].state().reference().unwrap();
        assert_eq!((reference.width(), reference.height()), (40, 40));
    }
}
