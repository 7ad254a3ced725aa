// THEORY:
// The `geometry` module turns a declared slot shape into pixel coordinates and
// pulls the slot's pixels out of a frame.
//
// A slot is declared in one of three ways (`SlotGeometry`): an absolute pixel
// box, a box normalized to [0,1] of the frame, or four ordered corners
// (top-left, top-right, bottom-right, bottom-left) in either coordinate space.
// Normalized shapes can only be resolved once the frame size is known, so the
// session resolves every declaration exactly once against the first frame it
// observes and keeps the `ResolvedGeometry` for the rest of its life.
//
// Resolved coordinates stay in floating point. Truncation to whole pixels only
// happens at extraction time (`clamp_box`), which keeps normalize/denormalize
// round trips exact.
//
// Quadrilateral slots are unwarped to a fixed canonical rectangle with
// `imgproc::warp_perspective`, so a slot seen at an angle is compared against its reference at
// a stable size regardless of how the camera foreshortens it.

use crate::core_modules::region::{BgrFrame, PixelRect, Region};
use crate::error::Result;
use opencv::{
    core::{self, Mat, Point2f, Scalar, Size, Vector},
    imgproc,
};
use serde::{Deserialize, Serialize};

/// Output size of a perspective-unwarped quadrilateral slot.
pub const CANONICAL_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A slot shape as declared by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotGeometry {
    /// `[x1, y1, x2, y2]` in pixels.
    AbsoluteBox([f64; 4]),
    /// `[x1, y1, x2, y2]` as fractions of the frame width and height.
    NormalizedBox([f64; 4]),
    /// Corners ordered top-left, top-right, bottom-right, bottom-left.
    Corners { points: [Point; 4], normalized: bool },
}

/// A slot shape in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedGeometry {
    Box([f64; 4]),
    Quad { corners: [Point; 4], bounds: [f64; 4] },
}

impl SlotGeometry {
    pub fn is_normalized(&self) -> bool {
        match self {
            SlotGeometry::AbsoluteBox(_) => false,
            SlotGeometry::NormalizedBox(_) => true,
            SlotGeometry::Corners { normalized, .. } => *normalized,
        }
    }

    /// Resolves the declaration against a frame of `width` x `height` pixels.
    /// Absolute declarations ignore the frame size.
    pub fn resolve(&self, width: u32, height: u32) -> Option<ResolvedGeometry> {
        let (sx, sy) = if self.is_normalized() {
            (width as f64, height as f64)
        } else {
            (1.0, 1.0)
        };
        let resolved = match self {
            SlotGeometry::AbsoluteBox(b) | SlotGeometry::NormalizedBox(b) => {
                ResolvedGeometry::Box(scale_box(*b, sx, sy))
            }
            SlotGeometry::Corners { points, .. } => {
                let corners = points.map(|p| Point::new(p.x * sx, p.y * sy));
                ResolvedGeometry::Quad {
                    bounds: bounding_box(&corners),
                    corners,
                }
            }
        };
        resolved.is_finite().then_some(resolved)
    }
}

impl ResolvedGeometry {
    /// Axis-aligned bounds, used for the minimum-size check and annotation.
    pub fn bounds(&self) -> [f64; 4] {
        match self {
            ResolvedGeometry::Box(b) => *b,
            ResolvedGeometry::Quad { bounds, .. } => *bounds,
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            ResolvedGeometry::Box(b) => b.iter().all(|v| v.is_finite()),
            ResolvedGeometry::Quad { corners, .. } => {
                corners.iter().all(|p| p.x.is_finite() && p.y.is_finite())
            }
        }
    }

    /// Extracts the slot's pixels from a frame. Boxes are clamped crops;
    /// quadrilaterals are unwarped to `CANONICAL_SIZE` squares. `None` when the
    /// crop or the warp degenerates.
    pub fn extract(&self, frame: &BgrFrame) -> Result<Option<Region>> {
        match self {
            ResolvedGeometry::Box(b) => Ok(clamp_box(*b, frame.width(), frame.height())
                .and_then(|rect| frame.crop(rect))),
            ResolvedGeometry::Quad { corners, .. } => {
                warp_quad(frame, corners, CANONICAL_SIZE, CANONICAL_SIZE)
            }
        }
    }
}

pub fn scale_box(b: [f64; 4], sx: f64, sy: f64) -> [f64; 4] {
    [b[0] * sx, b[1] * sy, b[2] * sx, b[3] * sy]
}

/// Inverse of resolving a normalized box against a `width` x `height` frame.
pub fn normalize_box(b: [f64; 4], width: u32, height: u32) -> [f64; 4] {
    scale_box(b, 1.0 / width as f64, 1.0 / height as f64)
}

pub fn bounding_box(points: &[Point; 4]) -> [f64; 4] {
    let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    [min_x, min_y, max_x, max_y]
}

/// Orders the box, truncates to whole pixels and clamps it inside the frame.
/// The result always spans at least one pixel when the frame is non-empty.
pub fn clamp_box(b: [f64; 4], width: u32, height: u32) -> Option<PixelRect> {
    if width == 0 || height == 0 {
        return None;
    }
    let (mut x1, mut y1, mut x2, mut y2) = (b[0] as i64, b[1] as i64, b[2] as i64, b[3] as i64);
    if x1 > x2 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y1 > y2 {
        std::mem::swap(&mut y1, &mut y2);
    }
    let (w, h) = (width as i64, height as i64);
    let x1 = x1.clamp(0, w - 1);
    let x2 = x2.min(w).max(x1 + 1);
    let y1 = y1.clamp(0, h - 1);
    let y2 = y2.min(h).max(y1 + 1);
    Some(PixelRect {
        x1: x1 as u32,
        y1: y1 as u32,
        x2: x2 as u32,
        y2: y2 as u32,
    })
}

fn cv_points(points: &[Point; 4]) -> Vector<Point2f> {
    points
        .iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect()
}

fn output_corners(out_w: u32, out_h: u32) -> [Point; 4] {
    [
        Point::new(0.0, 0.0),
        Point::new((out_w - 1) as f64, 0.0),
        Point::new((out_w - 1) as f64, (out_h - 1) as f64),
        Point::new(0.0, (out_h - 1) as f64),
    ]
}

/// Perspective matrix taking the quadrilateral `corners` onto an
/// `out_w` x `out_h` rectangle.
pub fn unwarp_matrix(corners: &[Point; 4], out_w: u32, out_h: u32) -> Result<Mat> {
    Ok(imgproc::get_perspective_transform(
        &cv_points(corners),
        &cv_points(&output_corners(out_w, out_h)),
        core::DECOMP_LU,
    )?)
}

/// Unwarps the quadrilateral `corners` of `frame` into a `out_w` x `out_h`
/// rectangle with bilinear sampling. Samples falling outside the frame are
/// black. `None` for a degenerate (collinear) quadrilateral.
pub fn warp_quad(
    frame: &BgrFrame,
    corners: &[Point; 4],
    out_w: u32,
    out_h: u32,
) -> Result<Option<Region>> {
    if frame.is_empty() || out_w < 2 || out_h < 2 || quad_area(corners) < 1.0 {
        return Ok(None);
    }
    let matrix = unwarp_matrix(corners, out_w, out_h)?;
    let mut out = Mat::default();
    imgproc::warp_perspective(
        &frame.to_mat()?,
        &mut out,
        &matrix,
        Size::new(out_w as i32, out_h as i32),
        imgproc::INTER_LINEAR,
        core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;
    Ok(Some(Region::from_mat(&out)?))
}

/// Shoelace area of the quadrilateral.
pub fn quad_area(corners: &[Point; 4]) -> f64 {
    let mut twice = 0.0;
    for i in 0..4 {
        let (a, b) = (corners[i], corners[(i + 1) % 4]);
        twice += a.x * b.y - b.x * a.y;
    }
    twice.abs() / 2.0
}
