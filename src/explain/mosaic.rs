//! Tile the channels of one activation tensor into a grayscale mosaic.

use image::{GrayImage, Luma};
use ndarray::{s, Array2, ArrayD, ArrayView2, Ix4};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mosaic layout limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MosaicConfig {
    /// Channels shown per layer; later channels are dropped
    pub max_channels: usize,
    /// Tiles per mosaic row
    pub tile_cols: usize,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            max_channels: 16,
            tile_cols: 4,
        }
    }
}

/// Reasons a single layer cannot be rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum MosaicError {
    /// Activation is not (batch, height, width, channels)
    Rank(usize),
    EmptyBatch,
    NoChannels,
    EmptySpatial,
    NonFinite { channel: usize },
    TooLarge { width: usize, height: usize },
    InvalidConfig(String),
    MissingActivation,
    Encode(String),
}

impl fmt::Display for MosaicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MosaicError::Rank(r) => write!(f, "activation has rank {r}, expected 4"),
            MosaicError::EmptyBatch => write!(f, "activation has an empty batch"),
            MosaicError::NoChannels => write!(f, "activation has no channels"),
            MosaicError::EmptySpatial => write!(f, "activation has zero height or width"),
            MosaicError::NonFinite { channel } => {
                write!(f, "channel {channel} contains non-finite values")
            }
            MosaicError::TooLarge { width, height } => {
                write!(f, "mosaic of {width}x{height} exceeds image limits")
            }
            MosaicError::InvalidConfig(e) => write!(f, "invalid mosaic config: {e}"),
            MosaicError::MissingActivation => write!(f, "no activation returned for layer"),
            MosaicError::Encode(e) => write!(f, "mosaic encoding failed: {e}"),
        }
    }
}

impl std::error::Error for MosaicError {}

/// Min-max normalize one channel to 0..=255; constant channels become all zero.
pub fn normalize_channel(channel: ArrayView2<f32>, index: usize) -> Result<Array2<u8>, MosaicError> {
    if channel.iter().any(|v| !v.is_finite()) {
        return Err(MosaicError::NonFinite { channel: index });
    }
    // f64 so that wide f32 spans do not overflow the range to infinity
    let min = channel.fold(f64::INFINITY, |acc, &v| acc.min(f64::from(v)));
    let max = channel.fold(f64::NEG_INFINITY, |acc, &v| acc.max(f64::from(v)));

    if max > min {
        let range = max - min;
        Ok(channel.mapv(|v| ((f64::from(v) - min) / range * 255.0) as u8))
    } else {
        Ok(Array2::zeros(channel.raw_dim()))
    }
}

/// Render the first batch item of a 4-D activation as a tiled mosaic.
///
/// Keeps at most `max_channels` channels, lays them out `tile_cols` wide and
/// `ceil(n / tile_cols)` tall. Unused trailing cells stay black.
pub fn to_mosaic(activation: &ArrayD<f32>, config: &MosaicConfig) -> Result<GrayImage, MosaicError> {
    if config.max_channels == 0 || config.tile_cols == 0 {
        return Err(MosaicError::InvalidConfig(
            "max_channels and tile_cols must be positive".to_string(),
        ));
    }

    let view = activation
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| MosaicError::Rank(activation.ndim()))?;
    let (batch, height, width, channels) = view.dim();
    if batch == 0 {
        return Err(MosaicError::EmptyBatch);
    }
    if channels == 0 {
        return Err(MosaicError::NoChannels);
    }
    if height == 0 || width == 0 {
        return Err(MosaicError::EmptySpatial);
    }

    let shown = channels.min(config.max_channels);
    let cols = config.tile_cols;
    let rows = (shown + cols - 1) / cols;
    let (mosaic_w, mosaic_h) = (cols * width, rows * height);
    let too_large = || MosaicError::TooLarge {
        width: mosaic_w,
        height: mosaic_h,
    };
    let mut mosaic = GrayImage::new(
        u32::try_from(mosaic_w).map_err(|_| too_large())?,
        u32::try_from(mosaic_h).map_err(|_| too_large())?,
    );

    for ch in 0..shown {
        let tile = normalize_channel(view.slice(s![0, .., .., ch]), ch)?;
        let (origin_x, origin_y) = ((ch % cols) * width, (ch / cols) * height);
        for ((y, x), value) in tile.indexed_iter() {
            mosaic.put_pixel((origin_x + x) as u32, (origin_y + y) as u32, Luma([*value]));
        }
    }

    Ok(mosaic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, IxDyn};

    #[test]
    fn test_constant_channel_is_black() {
        for c in [-3.0f32, 0.0, 7.5] {
            let channel = Array2::from_elem((3, 3), c);
            let tile = normalize_channel(channel.view(), 0).unwrap();
            assert!(tile.iter().all(|v| *v == 0));
        }
    }

    #[test]
    fn test_range_maps_to_full_scale() {
        let channel = Array2::from_shape_vec((1, 3), vec![-2.0f32, 0.0, 2.0]).unwrap();
        let tile = normalize_channel(channel.view(), 0).unwrap();
        assert_eq!(tile[[0, 0]], 0);
        assert!((tile[[0, 1]] as i32 - 127).abs() <= 1);
        assert_eq!(tile[[0, 2]], 255);
    }

    #[test]
    fn test_wide_span_keeps_full_scale() {
        let channel = Array2::from_shape_vec((1, 2), vec![-3.0e38f32, 3.0e38]).unwrap();
        let tile = normalize_channel(channel.view(), 0).unwrap();
        assert_eq!(tile.as_slice().unwrap(), &[0, 255]);

        let act = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 1]), vec![-3.0e38f32, 3.0e38]).unwrap();
        let mosaic = to_mosaic(&act, &MosaicConfig::default()).unwrap();
        assert_eq!(mosaic.get_pixel(0, 0)[0], 0);
        assert_eq!(mosaic.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn test_non_finite_channel_rejected() {
        let channel = Array2::from_shape_vec((1, 2), vec![1.0f32, f32::NAN]).unwrap();
        assert_eq!(
            normalize_channel(channel.view(), 5),
            Err(MosaicError::NonFinite { channel: 5 })
        );
    }

    #[test]
    fn test_grid_layout_and_truncation() {
        // 20 channels of 2x3; channel c is constant except pixel (0,0) = c + 1
        let mut act = Array4::<f32>::zeros((1, 2, 3, 20));
        for c in 0..20 {
            act[[0, 0, 0, c]] = c as f32 + 1.0;
        }
        let mosaic = to_mosaic(&act.into_dyn(), &MosaicConfig::default()).unwrap();

        // 16 channels shown: 4 columns x 4 rows of 3x2 tiles
        assert_eq!(mosaic.dimensions(), (12, 8));
        for ch in 0..16u32 {
            let (x0, y0) = ((ch % 4) * 3, (ch / 4) * 2);
            assert_eq!(mosaic.get_pixel(x0, y0)[0], 255);
            assert_eq!(mosaic.get_pixel(x0 + 1, y0 + 1)[0], 0);
        }
    }

    #[test]
    fn test_partial_last_row_left_blank() {
        let act = ArrayD::from_shape_fn(IxDyn(&[1, 2, 2, 5]), |idx| idx[1] as f32);
        let mosaic = to_mosaic(&act, &MosaicConfig::default()).unwrap();
        assert_eq!(mosaic.dimensions(), (8, 4));
        // channel 4 sits at row 1, column 0; bottom pixel row of each tile is max
        assert_eq!(mosaic.get_pixel(0, 3)[0], 255);
        // cells 5..8 are unused
        for x in 2..8 {
            assert_eq!(mosaic.get_pixel(x, 3)[0], 0);
        }
    }

    #[test]
    fn test_wrong_rank_is_layer_error() {
        let flat = ArrayD::<f32>::zeros(IxDyn(&[1, 10]));
        assert_eq!(
            to_mosaic(&flat, &MosaicConfig::default()),
            Err(MosaicError::Rank(2))
        );
    }

    #[test]
    fn test_invalid_config() {
        let act = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 2, 1]));
        let config = MosaicConfig {
            max_channels: 16,
            tile_cols: 0,
        };
        assert!(matches!(
            to_mosaic(&act, &config),
            Err(MosaicError::InvalidConfig(_))
        ));
    }
}
