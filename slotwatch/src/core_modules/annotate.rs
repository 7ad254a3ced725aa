// THEORY:
// Visual overlay for a processed frame. The output is a copy of the input frame
// with every resolved slot outlined in its status colour and numbered, a thin
// confidence bar along the top edge of each slot and, while a transition is
// pending, a progress bar along the bottom edge. A session with no grid yet
// gets a banner instead. Drawing goes through `imgproc` on a matrix view of the
// frame; encoding is left to the caller.

use crate::core_modules::geometry::{Point, ResolvedGeometry, clamp_box};
use crate::core_modules::grid_session::Slot;
use crate::core_modules::region::{BgrFrame, PixelRect};
use crate::core_modules::slot_state::OccupancyStatus;
use crate::error::Result;
use opencv::{
    core::{self, Mat, Scalar, Vector},
    imgproc,
};

pub const OCCUPIED: [u8; 3] = [0, 0, 255];
pub const PENDING: [u8; 3] = [0, 165, 255];
pub const VACANT: [u8; 3] = [0, 255, 0];
const PROGRESS: [u8; 3] = [0, 255, 255];
const CONFIDENCE: [u8; 3] = [255, 255, 255];
const TEXT: [u8; 3] = [255, 255, 255];
const BANNER: [u8; 3] = [40, 40, 40];
const BANNER_EDGE: [u8; 3] = [0, 0, 255];

const OUTLINE_THICKNESS: u32 = 2;
const BAR_HEIGHT: u32 = 3;
const BANNER_MIN_HEIGHT: u32 = 14;
const FONT_SCALE: f64 = 0.35;

/// Outline colour for a slot's current state.
pub fn status_color(status: OccupancyStatus, pending: Option<OccupancyStatus>) -> [u8; 3] {
    match (status, pending) {
        (OccupancyStatus::Occupied, _) => OCCUPIED,
        (OccupancyStatus::Vacant, Some(OccupancyStatus::Occupied)) => PENDING,
        (OccupancyStatus::Vacant, _) => VACANT,
    }
}

fn scalar(bgr: [u8; 3]) -> Scalar {
    Scalar::new(bgr[0] as f64, bgr[1] as f64, bgr[2] as f64, 0.0)
}

fn cv_point(p: Point) -> core::Point {
    core::Point::new(p.x.round() as i32, p.y.round() as i32)
}

pub fn render(frame: &BgrFrame, slots: &[Slot], now: f64) -> Result<BgrFrame> {
    if frame.is_empty() {
        return Ok(frame.clone());
    }
    let mut canvas = frame.to_mat()?;
    if slots.is_empty() {
        draw_banner(&mut canvas, frame.width(), frame.height())?;
        return BgrFrame::from_mat(&canvas);
    }
    for slot in slots {
        let Some(resolved) = slot.resolved() else {
            continue;
        };
        let state = slot.state();
        let color = status_color(state.status(), state.pending_status());
        let corners = match resolved {
            ResolvedGeometry::Box(b) => [
                Point::new(b[0], b[1]),
                Point::new(b[2], b[1]),
                Point::new(b[2], b[3]),
                Point::new(b[0], b[3]),
            ],
            ResolvedGeometry::Quad { corners, .. } => *corners,
        };

        let Some(rect) = clamp_box(resolved.bounds(), frame.width(), frame.height()) else {
            draw_outline(&mut canvas, &corners, color)?;
            continue;
        };
        let inner = PixelRect {
            x1: rect.x1 + OUTLINE_THICKNESS,
            y1: rect.y1 + OUTLINE_THICKNESS,
            x2: rect.x2.saturating_sub(OUTLINE_THICKNESS),
            y2: rect.y2.saturating_sub(OUTLINE_THICKNESS),
        };
        if !inner.is_empty() && inner.height() >= 2 * BAR_HEIGHT {
            draw_number(&mut canvas, inner, slot.slot_number())?;
            let confidence = state.confidence().clamp(0.0, 1.0);
            fill_bar(&mut canvas, inner, inner.y1, confidence, CONFIDENCE)?;
            if let Some(progress) = state.pending_progress(now) {
                fill_bar(&mut canvas, inner, inner.y2 - BAR_HEIGHT, progress, PROGRESS)?;
            }
        }
        draw_outline(&mut canvas, &corners, color)?;
    }
    BgrFrame::from_mat(&canvas)
}

fn draw_outline(canvas: &mut Mat, corners: &[Point; 4], color: [u8; 3]) -> Result<()> {
    let polygon: Vector<core::Point> = corners.iter().copied().map(cv_point).collect();
    let mut polygons = Vector::<Vector<core::Point>>::new();
    polygons.push(polygon);
    imgproc::polylines(
        canvas,
        &polygons,
        true,
        scalar(color),
        OUTLINE_THICKNESS as i32,
        imgproc::LINE_8,
        0,
    )?;
    Ok(())
}

fn fill_bar(canvas: &mut Mat, inner: PixelRect, top: u32, fraction: f64, color: [u8; 3]) -> Result<()> {
    let width = (inner.width() as f64 * fraction).round() as u32;
    if width == 0 {
        return Ok(());
    }
    let bar = PixelRect {
        x1: inner.x1,
        y1: top,
        x2: inner.x1 + width,
        y2: top + BAR_HEIGHT,
    };
    imgproc::rectangle(canvas, bar.to_cv(), scalar(color), -1, imgproc::LINE_8, 0)?;
    Ok(())
}

fn draw_number(canvas: &mut Mat, inner: PixelRect, slot_number: u32) -> Result<()> {
    let origin = core::Point::new(inner.x1 as i32 + 1, (inner.y1 + BAR_HEIGHT) as i32 + 10);
    imgproc::put_text(
        canvas,
        &format!("#{slot_number}"),
        origin,
        imgproc::FONT_HERSHEY_SIMPLEX,
        FONT_SCALE,
        scalar(TEXT),
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

fn draw_banner(canvas: &mut Mat, width: u32, height: u32) -> Result<()> {
    let banner_height = (height / 12).max(BANNER_MIN_HEIGHT).min(height);
    let banner = PixelRect {
        x1: 0,
        y1: 0,
        x2: width,
        y2: banner_height,
    };
    imgproc::rectangle(canvas, banner.to_cv(), scalar(BANNER), -1, imgproc::LINE_8, 0)?;
    if banner_height >= BANNER_MIN_HEIGHT {
        imgproc::put_text(
            canvas,
            "NO GRID",
            core::Point::new(4, banner_height as i32 - 4),
            imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            scalar(TEXT),
            1,
            imgproc::LINE_8,
            false,
        )?;
    }
    let edge = PixelRect {
        y1: banner_height.saturating_sub(1),
        ..banner
    };
    imgproc::rectangle(canvas, edge.to_cv(), scalar(BANNER_EDGE), -1, imgproc::LINE_8, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CellConfig, GridConfig, SessionConfig};
    use crate::core_modules::grid_session::{GridSession, ProcessOptions};
    use std::sync::Arc;

    #[test]
    fn colors_follow_status() {
        assert_eq!(status_color(OccupancyStatus::Occupied, None), OCCUPIED);
        assert_eq!(
            status_color(OccupancyStatus::Vacant, Some(OccupancyStatus::Occupied)),
            PENDING
        );
        assert_eq!(status_color(OccupancyStatus::Vacant, None), VACANT);
        assert_eq!(
            status_color(OccupancyStatus::Occupied, Some(OccupancyStatus::Vacant)),
            OCCUPIED
        );
    }

    #[test]
    fn vacant_slot_is_outlined_in_green() {
        let grid = GridConfig {
            cells: vec![CellConfig {
                slot_number: 1,
                bbox: Some([10.0, 10.0, 50.0, 50.0]),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut session =
            GridSession::new(SessionConfig::with_grid(grid), Arc::new(ManualClock::new(0.0))).unwrap();
        let frame = BgrFrame::filled(64, 64, [128, 128, 128]);
        let report = session
            .process_frame(
                &frame,
                ProcessOptions {
                    annotate: true,
                    use_ai: false,
                },
            )
            .unwrap();
        let out = report.annotated.unwrap();
        assert_eq!(out.pixel(30, 10), Some(VACANT));
        assert_eq!(out.pixel(10, 30), Some(VACANT));
        assert_eq!(out.pixel(60, 60), Some([128, 128, 128]));
        assert_eq!(frame.pixel(30, 10), Some([128, 128, 128]));
    }

    #[test]
    fn empty_grid_gets_a_banner() {
        let frame = BgrFrame::filled(48, 48, [200, 200, 200]);
        let out = render(&frame, &[], 0.0).unwrap();
        assert_eq!(out.pixel(10, 0), Some(BANNER));
        assert_eq!(out.pixel(10, 13), Some(BANNER_EDGE));
        assert_eq!(out.pixel(10, 40), Some([200, 200, 200]));
    }
}
