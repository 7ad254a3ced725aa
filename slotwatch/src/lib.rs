// THEORY:
// This file is the main entry point for the `slotwatch` library crate.
// It exposes the `ServiceContext` (the session registry a transport layer talks
// to), the `GridSession` that drives one monitored spot, and the configuration
// and report types that cross the crate boundary.
//
// The engine is layered the same way the frame flows through it:
//   region/filters  -> owned pixel containers and the OpenCV operators run on them
//   classifiers     -> stateless per-region votes
//   ensemble        -> one weighted decision per slot per frame
//   slot_state      -> hysteresis that turns noisy decisions into a stable status
//   grid_session    -> geometry, reference imagery and per-frame orchestration
// Everything under `core_modules` is usable directly, but most callers only
// need the re-exports below.

pub mod clock;
pub mod codec;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod service;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{EnsembleConfig, GridConfig, SessionConfig, TimingConfig};
pub use crate::core_modules::ensemble::{EnsembleScore, EnsembleScorer, Gate};
pub use crate::core_modules::geometry::SlotGeometry;
pub use crate::core_modules::grid_session::{
    FrameReport, GridCandidate, GridDetector, GridSession, ObjectLabeler, OccupancySummary,
    ProcessOptions, RegionScorer, SlotOccupancy,
};
pub use crate::core_modules::region::{BgrFrame, Region};
pub use crate::core_modules::slot_state::{OccupancyStatus, SlotState, StateChangeEvent};
pub use crate::error::{Result, SlotwatchError};
pub use crate::service::{CaptureHandle, ServiceContext};
