use std::path::Path;

use image::{DynamicImage, GenericImageView};

use super::config::Interpolation;
use super::error::{DatasetError, DatasetResult};

/// A decoded image and its degraded copy, always the same size.
pub struct ImagePair {
    pub clean: DynamicImage,
    pub degraded: DynamicImage,
}

pub struct PairSynthesizer {
    resize_factor: f64,
    interpolation: Interpolation,
}

impl PairSynthesizer {
    pub fn new(resize_factor: f64, interpolation: Interpolation) -> Self {
        PairSynthesizer { resize_factor, interpolation }
    }

    pub fn synthesize(&self, path: &Path) -> DatasetResult<ImagePair> {
        let clean = decode(path)?;
        self.pair_from(clean)
    }

    pub fn pair_from(&self, clean: DynamicImage) -> DatasetResult<ImagePair> {
        let degraded = self.degrade(&clean)?;
        Ok(ImagePair { clean, degraded })
    }

    /// Shrinks by the resize factor and scales back up with the same filter.
    pub fn degrade(&self, clean: &DynamicImage) -> DatasetResult<DynamicImage> {
        let (width, height) = clean.dimensions();
        let small_width = scaled(width, self.resize_factor);
        let small_height = scaled(height, self.resize_factor);
        if small_width == 0 || small_height == 0 {
            return Err(DatasetError::invalid(format!(
                "resize_factor {} shrinks a {width}x{height} image to {small_width}x{small_height}",
                self.resize_factor
            )));
        }

        let filter = self.interpolation.filter();
        let small = clean.resize_exact(small_width, small_height, filter);
        Ok(small.resize_exact(width, height, filter))
    }
}

pub fn decode(path: &Path) -> DatasetResult<DynamicImage> {
    image::open(path).map_err(|source| DatasetError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn scaled(extent: u32, factor: f64) -> u32 {
    (extent as f64 * factor).round() as u32
}
