// THEORY:
// The classifiers are the "sensory" layer of the occupancy engine. Each one is a
// pure function of a single slot region (plus, where it needs one, the slot's
// empty-lot reference or its previous-frame snapshot) and knows nothing about
// history, other slots or the final decision.
//
// Two families live here:
// 1.  **Voters** (`color`, `texture`, `difference`) return a `ClassifierOutcome`:
//     either a vote with a confidence, or `Unavailable` when the inputs they need
//     are missing. An unavailable voter is simply absent from the ensemble; it
//     never counts as a vacant vote.
// 2.  **Gate assessors** (`shadow`, `rapid_motion`, `skin_tone`) return a richer
//     assessment that the ensemble uses to short-circuit the vote entirely. They
//     expose their raw measurements so the ensemble can apply its own thresholds.
//
// All thresholds are empirical and tuned for 8-bit BGR imagery where hue is
// stored on the 0..180 scale. An `Err` means an image operation itself failed,
// which the session treats like any other missing evidence.

use crate::core_modules::filters::{
    self, HoughCircleParams, abs_diff, canny, component_areas, density, fraction_above,
    gradient_magnitude, hue_distance, laplacian, mean, mean_std_dev, otsu_mask, std_dev,
};
use crate::core_modules::region::Region;
use crate::error::Result;
use opencv::{
    core::{self, Mat, Scalar},
    prelude::*,
};

/// The result of one voting classifier for one region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClassifierOutcome {
    Vote { occupied: bool, confidence: f64 },
    /// The classifier could not run (no reference, empty region).
    Unavailable,
}

impl ClassifierOutcome {
    fn vote(occupied: bool, confidence: f64) -> Self {
        ClassifierOutcome::Vote {
            occupied,
            confidence,
        }
    }

    pub fn occupied(&self) -> Option<bool> {
        match self {
            ClassifierOutcome::Vote { occupied, .. } => Some(*occupied),
            ClassifierOutcome::Unavailable => None,
        }
    }
}

// --- color ---
const COLOR_EDGE_LOW: f64 = 80.0;
const COLOR_EDGE_HIGH: f64 = 200.0;
const COLOR_EDGE_DENSITY: f64 = 0.04;
const SHADOW_SATURATION_MAX: f64 = 25.0;
const SHADOW_VALUE_BAND: (f64, f64) = (40.0, 160.0);
const COLORED_SATURATION_MIN: f64 = 45.0;
const COLORED_SATURATION_SPREAD: f64 = 15.0;
const DARK_VALUE_MAX: f64 = 60.0;

/// Votes from saturation, brightness and hard edges.
pub fn color(region: &Region) -> Result<ClassifierOutcome> {
    if region.is_empty() {
        return Ok(ClassifierOutcome::Unavailable);
    }
    let hsv = region.to_hsv()?;
    let (sat_mean, sat_std) = mean_std_dev(&hsv.saturation)?;
    let val_mean = mean(&hsv.value)?;
    let edge_density = density(&canny(&region.to_gray()?, COLOR_EDGE_LOW, COLOR_EDGE_HIGH)?)?;

    let outcome = if edge_density > COLOR_EDGE_DENSITY {
        ClassifierOutcome::vote(true, 0.75)
    } else if sat_mean < SHADOW_SATURATION_MAX
        && val_mean > SHADOW_VALUE_BAND.0
        && val_mean < SHADOW_VALUE_BAND.1
    {
        ClassifierOutcome::vote(false, 0.6)
    } else if sat_mean > COLORED_SATURATION_MIN && sat_std > COLORED_SATURATION_SPREAD {
        ClassifierOutcome::vote(true, 0.7)
    } else if val_mean < DARK_VALUE_MAX {
        ClassifierOutcome::vote(true, 0.6)
    } else {
        ClassifierOutcome::vote(false, 0.5)
    };
    Ok(outcome)
}

// --- texture ---
const STRONG_EDGES: (f64, f64) = (90.0, 220.0);
const WEAK_EDGES: (f64, f64) = (20.0, 60.0);
const SOFT_EDGE_RATIO: f64 = 0.3;
const SOFT_GRADIENT_STD: f64 = 30.0;
const STRONG_EDGE_DENSITY: f64 = 0.06;
const LAPLACIAN_VARIANCE_MIN: f64 = 200.0;
const TEXTURED_GRADIENT_STD: f64 = 35.0;
const FOREGROUND_AREA: (f64, f64) = (0.15, 0.9);

/// Votes from edge sharpness, gradient texture and object outlines.
pub fn texture(region: &Region) -> Result<ClassifierOutcome> {
    if region.is_empty() {
        return Ok(ClassifierOutcome::Unavailable);
    }
    let gray = filters::gaussian_blur(&region.to_gray()?)?;

    // wheels and round fixtures
    let circles = filters::hough_circles(
        &gray,
        HoughCircleParams {
            dp: 1.2,
            min_dist: 30.0,
            edge_threshold: 100.0,
            accumulator_threshold: 30.0,
            min_radius: 15,
            max_radius: (region.width().min(region.height()) / 2) as i32,
        },
    )?;
    if !circles.is_empty() {
        return Ok(ClassifierOutcome::vote(true, 0.75));
    }

    let strong = density(&canny(&gray, STRONG_EDGES.0, STRONG_EDGES.1)?)?;
    let weak = density(&canny(&gray, WEAK_EDGES.0, WEAK_EDGES.1)?)?;
    let edge_ratio = strong / (weak + 0.001);
    let gradient_std = std_dev(&gradient_magnitude(&gray)?)?;
    if edge_ratio < SOFT_EDGE_RATIO && gradient_std < SOFT_GRADIENT_STD {
        return Ok(ClassifierOutcome::vote(false, 0.55));
    }
    let laplacian_var = filters::variance(&laplacian(&gray)?)?;
    if strong > STRONG_EDGE_DENSITY
        || (laplacian_var > LAPLACIAN_VARIANCE_MIN && gradient_std > TEXTURED_GRADIENT_STD)
    {
        return Ok(ClassifierOutcome::vote(true, 0.65));
    }
    let foreground = largest_foreground_fraction(&gray)?;
    if foreground > FOREGROUND_AREA.0 && foreground < FOREGROUND_AREA.1 {
        return Ok(ClassifierOutcome::vote(true, 0.6));
    }
    Ok(ClassifierOutcome::vote(false, 0.6))
}

fn largest_foreground_fraction(gray: &Mat) -> Result<f64> {
    let total = gray.rows() as f64 * gray.cols() as f64;
    if total == 0.0 {
        return Ok(0.0);
    }
    let largest = component_areas(&otsu_mask(gray)?)?
        .into_iter()
        .max()
        .unwrap_or(0);
    Ok(largest as f64 / total)
}

// --- difference from reference ---
const DIFF_EDGES: (f64, f64) = (30.0, 100.0);
const NEW_EDGE_RATIO: f64 = 0.03;
const EDGE_INCREASE: f64 = 0.02;
const SHADOW_VALUE_SHIFT: f64 = 30.0;
const SHADOW_HUE_SHIFT: f64 = 15.0;
const SHADOW_SAT_SHIFT: f64 = 40.0;
const HS_PIXEL_THRESHOLD: u8 = 20;
const GRAY_PIXEL_THRESHOLD: u8 = 40;

/// Votes from how far the region has drifted from the slot's empty-lot
/// appearance. Unavailable without a reference.
pub fn difference(region: &Region, reference: Option<&Region>) -> Result<ClassifierOutcome> {
    let Some(reference) = reference else {
        return Ok(ClassifierOutcome::Unavailable);
    };
    if region.is_empty() || reference.is_empty() {
        return Ok(ClassifierOutcome::Unavailable);
    }
    let reference = reference.resized(region.width(), region.height())?;

    let cur = region.to_hsv()?;
    let refr = reference.to_hsv()?;
    let hue_diff = hue_distance(&cur.hue, &refr.hue)?;
    let sat_diff = abs_diff(&cur.saturation, &refr.saturation)?;
    let val_diff = abs_diff(&cur.value, &refr.value)?;
    let shadow_signature = mean(&val_diff)? > SHADOW_VALUE_SHIFT
        && mean(&hue_diff)? < SHADOW_HUE_SHIFT
        && mean(&sat_diff)? < SHADOW_SAT_SHIFT;

    let cur_gray = region.to_gray()?;
    let ref_gray = reference.to_gray()?;
    let cur_edges = canny(&cur_gray, DIFF_EDGES.0, DIFF_EDGES.1)?;
    let ref_edges = canny(&ref_gray, DIFF_EDGES.0, DIFF_EDGES.1)?;
    let new_edges = density(&filters::only_in(&cur_edges, &ref_edges)?)?;
    let edge_increase = density(&cur_edges)? - density(&ref_edges)?;

    if new_edges > NEW_EDGE_RATIO && edge_increase > EDGE_INCREASE {
        return Ok(ClassifierOutcome::vote(true, 0.7));
    }
    if shadow_signature {
        return Ok(ClassifierOutcome::vote(false, 0.65));
    }

    // hue counts twice as much as saturation
    let mut hs_diff = Mat::default();
    core::add_weighted(&hue_diff, 2.0 / 3.0, &sat_diff, 1.0 / 3.0, 0.0, &mut hs_diff, -1)?;
    let hs_ratio = fraction_above(&hs_diff, HS_PIXEL_THRESHOLD)?;
    let bgr_ratio = fraction_above(&abs_diff(&cur_gray, &ref_gray)?, GRAY_PIXEL_THRESHOLD)?;

    if hs_ratio > 0.12 && bgr_ratio > 0.15 {
        return Ok(ClassifierOutcome::vote(true, (0.75 + hs_ratio).min(0.95)));
    }
    if hs_ratio > 0.20 {
        return Ok(ClassifierOutcome::vote(true, (0.7 + hs_ratio).min(0.90)));
    }
    if bgr_ratio > 0.35 && hs_ratio > 0.1 {
        return Ok(ClassifierOutcome::vote(true, 0.65));
    }
    // a bright, smooth surface covering textured asphalt
    let (cur_mean, cur_std) = mean_std_dev(&cur_gray)?;
    let (ref_mean, ref_std) = mean_std_dev(&ref_gray)?;
    if cur_mean > ref_mean + 20.0 && cur_std < ref_std - 10.0 {
        return Ok(ClassifierOutcome::vote(true, 0.65));
    }
    Ok(ClassifierOutcome::vote(false, 0.7))
}

// --- shadow ---
const SHADOW_INDICATORS_REQUIRED: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowAssessment {
    /// How many shadow indicators fired.
    pub indicators: u32,
    pub is_shadow: bool,
    pub confidence: f64,
}

/// Counts independent shadow indicators: low saturation, mid brightness,
/// uniform brightness, soft edges without hard ones and, with a reference,
/// unchanged hue with dropped brightness.
pub fn shadow(region: &Region, reference: Option<&Region>) -> Result<ShadowAssessment> {
    if region.is_empty() {
        return Ok(ShadowAssessment {
            indicators: 0,
            is_shadow: false,
            confidence: 0.0,
        });
    }
    let hsv = region.to_hsv()?;
    let gray = region.to_gray()?;
    let (val_mean, val_std) = mean_std_dev(&hsv.value)?;

    let mut indicators = 0;
    if mean(&hsv.saturation)? < 30.0 {
        indicators += 1;
    }
    if val_mean > 40.0 && val_mean < 170.0 {
        indicators += 1;
    }
    if val_std < 35.0 {
        indicators += 1;
    }
    let weak = density(&canny(&gray, 30.0, 80.0)?)?;
    let strong = density(&canny(&gray, STRONG_EDGES.0, STRONG_EDGES.1)?)?;
    if weak > 0.02 && strong < 0.03 {
        indicators += 1;
    }
    if let Some(reference) = reference.filter(|r| !r.is_empty()) {
        let ref_hsv = reference.resized(region.width(), region.height())?.to_hsv()?;
        let hue_shift = mean(&hue_distance(&hsv.hue, &ref_hsv.hue)?)?;
        let darkening = mean(&ref_hsv.value)? - val_mean;
        if hue_shift < 12.0 && darkening > 25.0 {
            indicators += 1;
        }
    }

    Ok(ShadowAssessment {
        indicators,
        is_shadow: indicators >= SHADOW_INDICATORS_REQUIRED,
        confidence: (0.5 + 0.1 * indicators as f64).min(0.95),
    })
}

// --- rapid motion ---
const MOTION_MEAN_DIFF: f64 = 35.0;
const MOTION_PIXEL_THRESHOLD: u8 = 30;
const MOTION_AREA_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionAssessment {
    pub mean_diff: f64,
    pub changed_fraction: f64,
    pub is_rapid: bool,
}

/// Compares against the previous frame's region. `None` when there is no
/// previous region of the same shape.
pub fn rapid_motion(region: &Region, previous: Option<&Region>) -> Result<Option<MotionAssessment>> {
    let Some(previous) = previous else {
        return Ok(None);
    };
    if region.is_empty() || !region.same_shape(previous) {
        return Ok(None);
    }
    let diff = abs_diff(&region.to_gray()?, &previous.to_gray()?)?;
    let mean_diff = mean(&diff)?;
    let changed_fraction = fraction_above(&diff, MOTION_PIXEL_THRESHOLD)?;
    Ok(Some(MotionAssessment {
        mean_diff,
        changed_fraction,
        is_rapid: mean_diff > MOTION_MEAN_DIFF && changed_fraction > MOTION_AREA_FRACTION,
    }))
}

// --- skin tone ---
const CR_RANGE: (f64, f64) = (133.0, 173.0);
const CB_RANGE: (f64, f64) = (77.0, 127.0);
const SKIN_PRESENT_FRACTION: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkinAssessment {
    /// Fraction of pixels inside the skin chroma box.
    pub fraction: f64,
    /// Enough skin to be worth a vacant vote.
    pub present: bool,
}

pub fn skin_tone(region: &Region) -> Result<SkinAssessment> {
    if region.is_empty() {
        return Ok(SkinAssessment {
            fraction: 0.0,
            present: false,
        });
    }
    let planes = region.to_ycrcb()?;
    let mut cr = Mat::default();
    core::in_range(
        &planes.cr,
        &Scalar::all(CR_RANGE.0),
        &Scalar::all(CR_RANGE.1),
        &mut cr,
    )?;
    let mut cb = Mat::default();
    core::in_range(
        &planes.cb,
        &Scalar::all(CB_RANGE.0),
        &Scalar::all(CB_RANGE.1),
        &mut cb,
    )?;
    let mut mask = Mat::default();
    core::bitwise_and(&cr, &cb, &mut mask, &Mat::default())?;
    let fraction = density(&mask)?;
    Ok(SkinAssessment {
        fraction,
        present: fraction > SKIN_PRESENT_FRACTION,
    })
}
