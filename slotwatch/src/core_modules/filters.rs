// THEORY:
// The `filters` module is the image-operator toolbox the classifiers are built
// from. Each function wraps one or two OpenCV calls on a single-channel 8-bit
// matrix and returns either a new matrix or a scalar measurement. None of them
// know what a parking slot is.
//
// Conventions:
// - Every operator allocates its output; inputs are never modified.
// - Derivative operators (`gradient_magnitude`, `laplacian`) return floating
//   point matrices so that their statistics are not clipped at 255.
// - A "mask" is an 8-bit matrix where any non-zero sample is foreground, the
//   same convention `canny`, `threshold` and `in_range` produce.

use crate::error::Result;
use opencv::{
    core::{self, Mat, Scalar, Size, Vec3f, Vector},
    imgproc,
    prelude::*,
};

fn no_mask() -> Mat {
    Mat::default()
}

fn area(mat: &Mat) -> f64 {
    (mat.rows().max(0) as f64) * (mat.cols().max(0) as f64)
}

/// 3x3 Gaussian blur.
pub fn gaussian_blur(gray: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    imgproc::gaussian_blur(gray, &mut out, Size::new(3, 3), 0.0, 0.0, core::BORDER_DEFAULT)?;
    Ok(out)
}

/// Canny edge map: 255 on edges, 0 elsewhere.
pub fn canny(gray: &Mat, low: f64, high: f64) -> Result<Mat> {
    let mut edges = Mat::default();
    imgproc::canny(gray, &mut edges, low, high, 3, false)?;
    Ok(edges)
}

/// Euclidean magnitude of the 3x3 Sobel gradient, as `CV_32F`.
pub fn gradient_magnitude(gray: &Mat) -> Result<Mat> {
    let mut gx = Mat::default();
    let mut gy = Mat::default();
    imgproc::sobel(gray, &mut gx, core::CV_32F, 1, 0, 3, 1.0, 0.0, core::BORDER_DEFAULT)?;
    imgproc::sobel(gray, &mut gy, core::CV_32F, 0, 1, 3, 1.0, 0.0, core::BORDER_DEFAULT)?;
    let mut magnitude = Mat::default();
    core::magnitude(&gx, &gy, &mut magnitude)?;
    Ok(magnitude)
}

/// 3x3 Laplacian response, as `CV_64F`.
pub fn laplacian(gray: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    imgproc::laplacian(gray, &mut out, core::CV_64F, 1, 1.0, 0.0, core::BORDER_DEFAULT)?;
    Ok(out)
}

pub fn abs_diff(a: &Mat, b: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    core::absdiff(a, b, &mut out)?;
    Ok(out)
}

/// Circular distance between two hue planes on the 0..180 scale.
pub fn hue_distance(a: &Mat, b: &Mat) -> Result<Mat> {
    let direct = abs_diff(a, b)?;
    let full = Mat::new_rows_cols_with_default(
        direct.rows(),
        direct.cols(),
        core::CV_8UC1,
        Scalar::all(180.0),
    )?;
    let mut wrapped = Mat::default();
    core::subtract(&full, &direct, &mut wrapped, &no_mask(), -1)?;
    let mut out = Mat::default();
    core::min(&direct, &wrapped, &mut out)?;
    Ok(out)
}

/// Mask of the foreground in `a` that is background in `b`.
pub fn only_in(a: &Mat, b: &Mat) -> Result<Mat> {
    let mut inverted = Mat::default();
    core::bitwise_not(b, &mut inverted, &no_mask())?;
    let mut out = Mat::default();
    core::bitwise_and(a, &inverted, &mut out, &no_mask())?;
    Ok(out)
}

pub fn mean(mat: &Mat) -> Result<f64> {
    if mat.empty() {
        return Ok(0.0);
    }
    Ok(core::mean(mat, &no_mask())?[0])
}

/// Mean and population standard deviation of a single-channel matrix.
pub fn mean_std_dev(mat: &Mat) -> Result<(f64, f64)> {
    if mat.empty() {
        return Ok((0.0, 0.0));
    }
    let mut mean = Mat::default();
    let mut std_dev = Mat::default();
    core::mean_std_dev(mat, &mut mean, &mut std_dev, &no_mask())?;
    Ok((*mean.at::<f64>(0)?, *std_dev.at::<f64>(0)?))
}

pub fn std_dev(mat: &Mat) -> Result<f64> {
    Ok(mean_std_dev(mat)?.1)
}

pub fn variance(mat: &Mat) -> Result<f64> {
    Ok(mean_std_dev(mat)?.1.powi(2))
}

/// Fraction of non-zero samples in an edge map or mask.
pub fn density(mask: &Mat) -> Result<f64> {
    if mask.empty() {
        return Ok(0.0);
    }
    Ok(core::count_non_zero(mask)? as f64 / area(mask))
}

/// Fraction of 8-bit samples strictly above `threshold`.
pub fn fraction_above(plane: &Mat, threshold: u8) -> Result<f64> {
    if plane.empty() {
        return Ok(0.0);
    }
    let mut mask = Mat::default();
    imgproc::threshold(plane, &mut mask, threshold as f64, 255.0, imgproc::THRESH_BINARY)?;
    density(&mask)
}

/// Foreground mask from Otsu's between-class-variance threshold.
pub fn otsu_mask(gray: &Mat) -> Result<Mat> {
    let mut mask = Mat::default();
    imgproc::threshold(
        gray,
        &mut mask,
        0.0,
        255.0,
        imgproc::THRESH_BINARY | imgproc::THRESH_OTSU,
    )?;
    Ok(mask)
}

/// Pixel areas of the 8-connected foreground components of a mask.
pub fn component_areas(mask: &Mat) -> Result<Vec<i32>> {
    if mask.empty() {
        return Ok(Vec::new());
    }
    let mut labels = Mat::default();
    let mut stats = Mat::default();
    let mut centroids = Mat::default();
    let count = imgproc::connected_components_with_stats(
        mask,
        &mut labels,
        &mut stats,
        &mut centroids,
        8,
        core::CV_32S,
    )?;
    // label 0 is the background
    (1..count)
        .map(|label| Ok(*stats.at_2d::<i32>(label, imgproc::CC_STAT_AREA)?))
        .collect()
}

/// Parameters of the gradient Hough circle transform.
#[derive(Debug, Clone, Copy)]
pub struct HoughCircleParams {
    /// Inverse accumulator resolution (1.0 = one cell per pixel).
    pub dp: f64,
    /// Minimum distance between accepted centres, in pixels.
    pub min_dist: f64,
    /// Upper Canny threshold; the lower one is half of it.
    pub edge_threshold: f64,
    /// Minimum centre votes.
    pub accumulator_threshold: f64,
    pub min_radius: i32,
    pub max_radius: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

pub fn hough_circles(gray: &Mat, params: HoughCircleParams) -> Result<Vec<Circle>> {
    if gray.empty() || params.max_radius < params.min_radius {
        return Ok(Vec::new());
    }
    let mut found = Vector::<Vec3f>::new();
    imgproc::hough_circles(
        gray,
        &mut found,
        imgproc::HOUGH_GRADIENT,
        params.dp,
        params.min_dist,
        params.edge_threshold,
        params.accumulator_threshold,
        params.min_radius,
        params.max_radius,
    )?;
    Ok(found
        .iter()
        .map(|c| Circle {
            x: c[0] as f64,
            y: c[1] as f64,
            radius: c[2] as f64,
        })
        .collect())
}
