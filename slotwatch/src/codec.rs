// THEORY:
// Adapters between the engine's packed BGR frames and encoded images. The
// engine itself never touches an encoded byte: a transport layer decodes an
// incoming blob with `decode_frame`, and encodes the annotated output with
// `encode_jpeg` before handing it back. A frame that fails to decode aborts only
// that frame's request.

use crate::core_modules::region::BgrFrame;
use crate::error::{Result, SlotwatchError};
use image::{ImageBuffer, RgbImage};
use std::io::Cursor;

/// Decodes any format the `image` crate is built with into a BGR frame.
pub fn decode_frame(bytes: &[u8]) -> Result<BgrFrame> {
    if bytes.is_empty() {
        return Err(SlotwatchError::Decode("empty buffer".into()));
    }
    let image = image::load_from_memory(bytes).map_err(|e| SlotwatchError::Decode(e.to_string()))?;
    from_rgb_image(&image.to_rgb8())
}

pub fn from_rgb_image(image: &RgbImage) -> Result<BgrFrame> {
    let mut data = image.as_raw().clone();
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    BgrFrame::from_raw(image.width(), image.height(), data)
}

pub fn to_rgb_image(frame: &BgrFrame) -> Result<RgbImage> {
    let mut data = frame.data().to_vec();
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    ImageBuffer::from_raw(frame.width(), frame.height(), data).ok_or_else(|| {
        SlotwatchError::InvalidFrame(format!(
            "buffer does not match {}x{}",
            frame.width(),
            frame.height()
        ))
    })
}

/// Encodes a frame as JPEG at `quality` (1..=100).
pub fn encode_jpeg(frame: &BgrFrame, quality: u8) -> Result<Vec<u8>> {
    if frame.is_empty() {
        return Err(SlotwatchError::InvalidFrame("cannot encode an empty frame".into()));
    }
    let image = to_rgb_image(frame)?;
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    image.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}
