//! Image decoding for network input and PNG data-URL encoding for output.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ColorType, GrayImage, ImageEncoder, Luma};
use ndarray::Array4;
use std::fmt;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 128;

/// Errors turning uploaded bytes into a network input.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInputError {
    Decode(String),
    /// Tensor is not 1 x H x W x 1
    Shape(Vec<usize>),
    InvalidSize(u32),
}

impl fmt::Display for ImageInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageInputError::Decode(e) => write!(f, "Could not decode image: {e}"),
            ImageInputError::Shape(shape) => {
                write!(f, "Expected a 1xHxWx1 image tensor, got {shape:?}")
            }
            ImageInputError::InvalidSize(size) => write!(f, "Invalid image size {size}"),
        }
    }
}

impl std::error::Error for ImageInputError {}

/// Errors serializing an image for transport.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeError {
    Png(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Png(e) => write!(f, "PNG encoding failed: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// ITU-R 601-2 luma, fixed point, as used by common imaging libraries for "L" mode.
fn luma_601(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

/// Decode image bytes to a `1 x size x size x 1` tensor of grayscale values in [0, 1].
pub fn decode_grayscale(bytes: &[u8], size: u32) -> Result<Array4<f32>, ImageInputError> {
    if size == 0 {
        return Err(ImageInputError::InvalidSize(size));
    }
    let decoded =
        image::load_from_memory(bytes).map_err(|e| ImageInputError::Decode(e.to_string()))?;

    let rgb = decoded.to_rgb8();
    let gray = GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        Luma([luma_601(p[0], p[1], p[2])])
    });
    let resized = image::imageops::resize(&gray, size, size, FilterType::CatmullRom);

    let side = size as usize;
    Ok(Array4::from_shape_fn((1, side, side, 1), |(_, y, x, _)| {
        resized.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    }))
}

/// The 8-bit image a network actually sees: `floor(v * 255)` per pixel.
pub fn preview_image(input: &Array4<f32>) -> Result<GrayImage, ImageInputError> {
    let (batch, height, width, channels) = input.dim();
    if batch != 1 || channels != 1 || height == 0 || width == 0 {
        return Err(ImageInputError::Shape(input.shape().to_vec()));
    }
    Ok(GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let v = input[[0, y as usize, x as usize, 0]];
        Luma([(v.clamp(0.0, 1.0) * 255.0).floor() as u8])
    }))
}

/// Lossless 8-bit grayscale PNG bytes.
pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::L8)
        .map_err(|e| EncodeError::Png(e.to_string()))?;
    Ok(buf)
}

/// `data:image/png;base64,...` URL for embedding in a response.
pub fn to_data_url(image: &GrayImage) -> Result<String, EncodeError> {
    let png = encode_png(image)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(image: &GrayImage) -> Vec<u8> {
        encode_png(image).unwrap()
    }

    #[test]
    fn test_decode_scales_to_unit_range() {
        let source = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 2 { 0 } else { 255 }]));
        let tensor = decode_grayscale(&png_bytes(&source), 4).unwrap();
        assert_eq!(tensor.dim(), (1, 4, 4, 1));
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 3, 0]], 1.0);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_decode_resizes() {
        let source = GrayImage::from_pixel(10, 6, Luma([200]));
        let tensor = decode_grayscale(&png_bytes(&source), 8).unwrap();
        assert_eq!(tensor.dim(), (1, 8, 8, 1));
        assert!(tensor.iter().all(|v| (v - 200.0 / 255.0).abs() < 1e-6));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_grayscale(b"not an image", INPUT_SIZE),
            Err(ImageInputError::Decode(_))
        ));
    }

    #[test]
    fn test_luma_weights() {
        assert_eq!(luma_601(255, 255, 255), 255);
        assert_eq!(luma_601(0, 0, 0), 0);
        assert_eq!(luma_601(255, 0, 0), 76);
        assert_eq!(luma_601(0, 255, 0), 150);
        assert_eq!(luma_601(0, 0, 255), 29);
    }

    #[test]
    fn test_preview_floors() {
        let mut input = Array4::<f32>::zeros((1, 1, 3, 1));
        input[[0, 0, 1, 0]] = 0.5;
        input[[0, 0, 2, 0]] = 1.0;
        let preview = preview_image(&input).unwrap();
        assert_eq!(preview.get_pixel(0, 0)[0], 0);
        assert_eq!(preview.get_pixel(1, 0)[0], 127);
        assert_eq!(preview.get_pixel(2, 0)[0], 255);
    }

    #[test]
    fn test_preview_rejects_multichannel() {
        let input = Array4::<f32>::zeros((1, 2, 2, 3));
        assert_eq!(
            preview_image(&input),
            Err(ImageInputError::Shape(vec![1, 2, 2, 3]))
        );
    }

    #[test]
    fn test_data_url_is_lossless() {
        let source = GrayImage::from_fn(5, 3, |x, y| Luma([(x * 40 + y * 7) as u8]));
        let url = to_data_url(&source).unwrap();
        let payload = url.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = STANDARD.decode(payload).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_luma8();
        assert_eq!(decoded, source);
    }
}
