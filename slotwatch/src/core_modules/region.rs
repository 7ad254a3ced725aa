// THEORY:
// The `region` module holds the "dumb" pixel containers of the engine. Like a
// chunk of a frame, a `Region` knows how to re-express its own pixels
// (grayscale, HSV and YCrCb planes) but it never decides anything about
// occupancy. All comparison and classification logic lives in `classifiers`.
//
// Key principles:
// 1.  **Fixed layout**: every buffer is tightly packed 8-bit BGR, row-major,
//     three bytes per pixel. The layout is checked once, when the container is
//     built, and the fields are private so no caller can break it afterwards.
// 2.  **Owned bytes, borrowed matrices**: frames and regions own plain byte
//     buffers so they can move freely between tasks and worker threads. An
//     OpenCV `Mat` is built from them only for the duration of an operator.
// 3.  **8-bit color spaces**: conversions go through `imgproc::cvt_color`, so
//     hue is on the 0..180 scale and chroma is offset by 128. The empirically
//     tuned thresholds in `classifiers` assume exactly this convention.

use crate::core_modules::filters;
use crate::error::{Result, SlotwatchError};
use opencv::{
    core::{self, Mat, Scalar, Size, Vector},
    imgproc,
    prelude::*,
};

const CHANNELS: usize = 3;

/// An axis-aligned pixel rectangle, half-open on the right and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn to_cv(&self) -> core::Rect {
        core::Rect::new(
            self.x1 as i32,
            self.y1 as i32,
            self.width() as i32,
            self.height() as i32,
        )
    }
}

fn check_len(width: u32, height: u32, len: usize) -> Result<()> {
    let expected = width as usize * height as usize * CHANNELS;
    if len != expected {
        return Err(SlotwatchError::InvalidFrame(format!(
            "{}x{} BGR needs {} bytes, got {}",
            width, height, expected, len
        )));
    }
    Ok(())
}

fn packed(width: u32, height: u32, bgr: [u8; 3]) -> Vec<u8> {
    let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
    for _ in 0..(width as usize * height as usize) {
        data.extend_from_slice(&bgr);
    }
    data
}

fn bytes_to_mat(width: u32, height: u32, data: &[u8]) -> Result<Mat> {
    if width == 0 || height == 0 {
        return Ok(Mat::default());
    }
    let mut mat = Mat::new_rows_cols_with_default(
        height as i32,
        width as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(data);
    Ok(mat)
}

fn mat_to_bytes(mat: &Mat) -> Result<(u32, u32, Vec<u8>)> {
    if mat.empty() {
        return Ok((0, 0, Vec::new()));
    }
    if mat.typ() != core::CV_8UC3 {
        return Err(SlotwatchError::InvalidFrame(format!(
            "expected an 8-bit BGR matrix, got type {}",
            mat.typ()
        )));
    }
    let (width, height) = (mat.cols() as u32, mat.rows() as u32);
    let data = if mat.is_continuous() {
        mat.data_bytes()?.to_vec()
    } else {
        mat.try_clone()?.data_bytes()?.to_vec()
    };
    Ok((width, height, data))
}

/// A full decoded frame in packed BGR order.
#[derive(Debug, Clone, PartialEq)]
pub struct BgrFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl BgrFrame {
    /// Wraps a packed BGR buffer. A buffer whose length does not match the
    /// dimensions is an `InvalidFrame` error.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        check_len(width, height, data.len())?;
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        Self {
            width,
            height,
            data: packed(width, height, bgr),
        }
    }

    pub fn from_mat(mat: &Mat) -> Result<Self> {
        let (width, height, data) = mat_to_bytes(mat)?;
        Self::from_raw(width, height, data)
    }

    pub fn to_mat(&self) -> Result<Mat> {
        bytes_to_mat(self.width, self.height, &self.data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// BGR value at `(x, y)`, `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Copies the pixels inside `rect` into a new region.
    /// Returns `None` for a zero-area or out-of-bounds crop.
    pub fn crop(&self, rect: PixelRect) -> Option<Region> {
        if rect.is_empty() || rect.x2 > self.width || rect.y2 > self.height {
            return None;
        }
        let row_bytes = rect.width() as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * rect.height() as usize);
        for y in rect.y1..rect.y2 {
            let start = (y as usize * self.width as usize + rect.x1 as usize) * CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Some(Region {
            width: rect.width(),
            height: rect.height(),
            data,
        })
    }

    #[cfg(test)]
    pub(crate) fn fill_rect(&mut self, rect: PixelRect, bgr: [u8; 3]) {
        for y in rect.y1..rect.y2.min(self.height) {
            for x in rect.x1..rect.x2.min(self.width) {
                let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
                self.data[i..i + CHANNELS].copy_from_slice(&bgr);
            }
        }
    }
}

/// HSV planes: hue 0..180, saturation and value 0..255.
#[derive(Debug)]
pub struct HsvPlanes {
    pub hue: Mat,
    pub saturation: Mat,
    pub value: Mat,
}

/// YCrCb planes with the chroma channels offset by 128.
#[derive(Debug)]
pub struct YCrCbPlanes {
    pub luma: Mat,
    pub cr: Mat,
    pub cb: Mat,
}

/// A rectangular (or perspective-unwarped) sub-image of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Region {
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        check_len(width, height, data.len())?;
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        Self {
            width,
            height,
            data: packed(width, height, bgr),
        }
    }

    pub fn from_mat(mat: &Mat) -> Result<Self> {
        let (width, height, data) = mat_to_bytes(mat)?;
        Self::from_raw(width, height, data)
    }

    pub fn to_mat(&self) -> Result<Mat> {
        bytes_to_mat(self.width, self.height, &self.data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn same_shape(&self, other: &Region) -> bool {
        self.width == other.width && self.height == other.height
    }

    fn convert(&self, code: i32) -> Result<Mat> {
        let mut out = Mat::default();
        imgproc::cvt_color(&self.to_mat()?, &mut out, code, 0)?;
        Ok(out)
    }

    fn split(&self, code: i32) -> Result<(Mat, Mat, Mat)> {
        let mut planes = Vector::<Mat>::new();
        core::split(&self.convert(code)?, &mut planes)?;
        Ok((planes.get(0)?, planes.get(1)?, planes.get(2)?))
    }

    pub fn to_gray(&self) -> Result<Mat> {
        self.convert(imgproc::COLOR_BGR2GRAY)
    }

    pub fn to_hsv(&self) -> Result<HsvPlanes> {
        let (hue, saturation, value) = self.split(imgproc::COLOR_BGR2HSV)?;
        Ok(HsvPlanes {
            hue,
            saturation,
            value,
        })
    }

    pub fn to_ycrcb(&self) -> Result<YCrCbPlanes> {
        let (luma, cr, cb) = self.split(imgproc::COLOR_BGR2YCrCb)?;
        Ok(YCrCbPlanes { luma, cr, cb })
    }

    /// Bilinear resample used to align a reference snapshot with a current
    /// region whose size drifted.
    pub fn resized(&self, width: u32, height: u32) -> Result<Region> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        let mut out = Mat::default();
        imgproc::resize(
            &self.to_mat()?,
            &mut out,
            Size::new(width as i32, height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        Region::from_mat(&out)
    }

    /// Mean absolute grayscale difference against another region of the same
    /// shape. `None` if the shapes differ or either region cannot be converted.
    pub fn mean_gray_diff(&self, other: &Region) -> Option<f64> {
        if !self.same_shape(other) || self.is_empty() {
            return None;
        }
        let diff = || -> Result<f64> {
            filters::mean(&filters::abs_diff(&self.to_gray()?, &other.to_gray()?)?)
        };
        diff().ok()
    }
}
