// THEORY:
// Configuration records for a monitoring session. The grid declaration is the
// one payload that arrives from outside (as JSON from a transport layer or a
// file on disk), so it is modelled as a permissive serde record and then parsed
// once into the strict `SlotGeometry` tagged union. Every tunable constant of
// the ensemble and of the temporal state machine lives here too, grouped so a
// whole preset can be swapped without touching the engine.

use crate::core_modules::geometry::{Point, SlotGeometry};
use crate::error::{Result, SlotwatchError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One declared cell of the grid. Exactly one geometry source is used, in
/// the order: normalized corners, absolute corners, normalized box, box.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    pub slot_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_normalized: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corners: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corners_normalized: Option<Vec<Point>>,
}

impl CellConfig {
    pub fn geometry(&self) -> Result<SlotGeometry> {
        let corners = |points: &[Point], normalized: bool| -> Result<SlotGeometry> {
            let points: [Point; 4] =
                points
                    .try_into()
                    .map_err(|_| SlotwatchError::InvalidGeometry {
                        slot_number: self.slot_number,
                        reason: format!("expected 4 corners, got {}", points.len()),
                    })?;
            Ok(SlotGeometry::Corners { points, normalized })
        };
        if let Some(points) = &self.corners_normalized {
            return corners(points, true);
        }
        if let Some(points) = &self.corners {
            return corners(points, false);
        }
        if let Some(b) = self.bbox_normalized {
            return Ok(SlotGeometry::NormalizedBox(b));
        }
        if let Some(b) = self.bbox {
            return Ok(SlotGeometry::AbsoluteBox(b));
        }
        Err(SlotwatchError::InvalidGeometry {
            slot_number: self.slot_number,
            reason: "no bbox, bbox_normalized, corners or corners_normalized".into(),
        })
    }
}

/// Area of interest passed to the grid auto-detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AoiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_normalized: Option<[f64; 4]>,
}

impl AoiConfig {
    pub fn geometry(&self) -> Option<SlotGeometry> {
        self.bbox_normalized
            .map(SlotGeometry::NormalizedBox)
            .or_else(|| self.bbox.map(SlotGeometry::AbsoluteBox))
    }
}

/// The declared grid for one monitored spot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub cells: Vec<CellConfig>,
    /// Size of the frame the grid was drawn on, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aoi: Option<AoiConfig>,
}

impl GridConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SlotwatchError::InvalidConfig(e.to_string()))
    }

    /// Parses every cell into a geometry, in declaration order.
    /// Slot numbers must be unique.
    pub fn declarations(&self) -> Result<Vec<(u32, SlotGeometry)>> {
        let mut seen = HashSet::new();
        self.cells
            .iter()
            .map(|cell| {
                if !seen.insert(cell.slot_number) {
                    return Err(SlotwatchError::InvalidConfig(format!(
                        "duplicate slot number {}",
                        cell.slot_number
                    )));
                }
                Ok((cell.slot_number, cell.geometry()?))
            })
            .collect()
    }
}

/// Confirmation gates for the per-slot state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Seconds a pending occupied transition must persist.
    pub stability_seconds: f64,
    /// Seconds a pending vacant transition must persist.
    pub vacancy_seconds: f64,
    /// Consecutive identical raw detections required to confirm occupied.
    pub min_consecutive_frames: u32,
    /// Consecutive identical raw detections required to confirm vacant.
    pub vacancy_consecutive_frames: u32,
    /// Average motion level below which an object counts as stationary.
    pub motion_threshold: f64,
    /// Maximum mean difference from the pending transition's baseline region.
    pub region_stability_threshold: f64,
    pub history_size: usize,
    pub motion_history_size: usize,
    /// Samples required before any decision is made.
    pub min_history: usize,
    /// Motion samples required before an object can count as stationary.
    pub min_motion_samples: usize,
    pub occupied_ratio: f64,
    pub vacant_ratio: f64,
}

impl TimingConfig {
    /// Canonical constants: slow, conservative occupancy confirmation.
    pub fn strict() -> Self {
        Self {
            stability_seconds: 5.0,
            vacancy_seconds: 1.0,
            min_consecutive_frames: 8,
            vacancy_consecutive_frames: 4,
            motion_threshold: 25.0,
            region_stability_threshold: 40.0,
            history_size: 15,
            motion_history_size: 5,
            min_history: 5,
            min_motion_samples: 3,
            occupied_ratio: 0.70,
            vacant_ratio: 0.30,
        }
    }

    /// Tuning preset for demos and low-frame-rate feeds.
    pub fn responsive() -> Self {
        Self {
            stability_seconds: 1.5,
            vacancy_seconds: 0.5,
            min_consecutive_frames: 4,
            vacancy_consecutive_frames: 2,
            ..Self::strict()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "strict" => Some(Self::strict()),
            "responsive" => Some(Self::responsive()),
            _ => None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::strict()
    }
}

/// Weights and thresholds of the per-frame ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub color_weight: f64,
    pub texture_weight: f64,
    pub difference_weight: f64,
    /// Weight of the vacant vote cast by a soft (non-gating) shadow.
    pub soft_shadow_weight: f64,
    /// Weight of the vacant vote cast by a partial skin-tone match.
    pub partial_skin_weight: f64,
    /// Occupied wins only if its weight exceeds vacant weight times this.
    pub decision_margin: f64,
    /// Skin fraction above which the frame is rejected outright.
    pub skin_gate_fraction: f64,
    /// Shadow confidence above which the frame is rejected outright.
    pub shadow_hard_threshold: f64,
    /// Shadow confidence above which a vacant vote is cast.
    pub shadow_soft_threshold: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            color_weight: 1.0,
            texture_weight: 1.0,
            difference_weight: 2.5,
            soft_shadow_weight: 2.0,
            partial_skin_weight: 1.5,
            decision_margin: 1.1,
            skin_gate_fraction: 0.25,
            shadow_hard_threshold: 0.75,
            shadow_soft_threshold: 0.65,
        }
    }
}

/// Everything needed to start one monitoring session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub grid: Option<GridConfig>,
    pub timing: TimingConfig,
    pub ensemble: EnsembleConfig,
    /// Frames a slot is held vacant after a hard shadow.
    pub shadow_lock_frames: u32,
    /// Slots narrower or shorter than this (in pixels) are skipped.
    pub min_slot_size: u32,
    /// A slot that changed within this many frames keeps the annotated
    /// output worth sending.
    pub recent_change_frames: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grid: None,
            timing: TimingConfig::default(),
            ensemble: EnsembleConfig::default(),
            shadow_lock_frames: 10,
            min_slot_size: 20,
            recent_change_frames: 15,
        }
    }
}

impl SessionConfig {
    pub fn with_grid(grid: GridConfig) -> Self {
        Self {
            grid: Some(grid),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_cell_shapes() {
        let json = r#"{
            "cells": [
                {"slot_number": 1, "bbox": [0, 0, 50, 50]},
                {"slot_number": 2, "bbox_normalized": [0.5, 0.0, 1.0, 0.5]},
                {"slot_number": 3, "bbox_normalized": [0, 0.5, 0.5, 1],
                 "corners_normalized": [{"x": 0, "y": 0.5}, {"x": 0.5, "y": 0.5},
                                        {"x": 0.5, "y": 1}, {"x": 0, "y": 1}]}
            ],
            "frame_width": 640,
            "frame_height": 480,
            "aoi": {"bbox_normalized": [0, 0, 1, 1]}
        }"#;
        let grid = GridConfig::from_json(json).unwrap();
        let declarations = grid.declarations().unwrap();
        assert_eq!(declarations.len(), 3);
        assert_eq!(
            declarations[0].1,
            SlotGeometry::AbsoluteBox([0.0, 0.0, 50.0, 50.0])
        );
        assert!(matches!(declarations[1].1, SlotGeometry::NormalizedBox(_)));
        assert!(matches!(
            declarations[2].1,
            SlotGeometry::Corners {
                normalized: true,
                ..
            }
        ));
        assert_eq!(
            grid.aoi.unwrap().geometry(),
            Some(SlotGeometry::NormalizedBox([0.0, 0.0, 1.0, 1.0]))
        );
    }

    #[test]
    fn rejects_duplicate_slot_numbers() {
        let grid = GridConfig {
            cells: vec![
                CellConfig {
                    slot_number: 4,
                    bbox: Some([0.0; 4]),
                    ..Default::default()
                },
                CellConfig {
                    slot_number: 4,
                    bbox: Some([1.0; 4]),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(matches!(
            grid.declarations(),
            Err(SlotwatchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_cells_without_geometry_or_with_wrong_corner_count() {
        let empty = CellConfig {
            slot_number: 9,
            ..Default::default()
        };
        assert!(matches!(
            empty.geometry(),
            Err(SlotwatchError::InvalidGeometry { slot_number: 9, .. })
        ));
        let triangle = CellConfig {
            slot_number: 2,
            corners: Some(vec![Point::new(0.0, 0.0); 3]),
            ..Default::default()
        };
        assert!(triangle.geometry().is_err());
    }

    #[test]
    fn responsive_preset_only_relaxes_timing_gates() {
        let strict = TimingConfig::strict();
        let responsive = TimingConfig::responsive();
        assert!(responsive.stability_seconds < strict.stability_seconds);
        assert!(responsive.min_consecutive_frames < strict.min_consecutive_frames);
        assert_eq!(responsive.history_size, strict.history_size);
        assert_eq!(TimingConfig::preset("strict"), Some(strict));
        assert!(TimingConfig::preset("bogus").is_none());
    }

    #[test]
    fn session_config_fills_missing_fields_from_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"timing": {"stability_seconds": 2.0}}"#).unwrap();
        assert_eq!(config.timing.stability_seconds, 2.0);
        assert_eq!(config.timing.min_consecutive_frames, 8);
        assert_eq!(config.shadow_lock_frames, 10);
        assert!(config.grid.is_none());
    }
}
