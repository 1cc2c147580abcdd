use std::path::Path;

use image::DynamicImage;

use super::config::PatchShape;
use super::error::{DatasetError, DatasetResult};
use crate::store::format::ElementType;

/// Interleaved pixel data in the storage element type, little-endian.
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub element: ElementType,
    pub data: Vec<u8>,
}

impl Raster {
    /// Converts `img` to `channels` interleaved channels (1 to 4) in the
    /// storage element type.
    pub fn from_image(img: &DynamicImage, channels: usize, element: ElementType) -> Self {
        let data = match element {
            ElementType::U8 => match channels {
                1 => img.to_luma8().into_raw(),
                2 => img.to_luma_alpha8().into_raw(),
                3 => img.to_rgb8().into_raw(),
                _ => img.to_rgba8().into_raw(),
            },
            ElementType::U16 => {
                let raw = match channels {
                    1 => img.to_luma16().into_raw(),
                    2 => img.to_luma_alpha16().into_raw(),
                    3 => img.to_rgb16().into_raw(),
                    _ => img.to_rgba16().into_raw(),
                };
                raw.iter().flat_map(|v| v.to_le_bytes()).collect()
            }
            ElementType::F32 => {
                let raw = match channels {
                    1 => img.to_luma32f().into_raw(),
                    2 => img.to_luma_alpha32f().into_raw(),
                    3 => img.to_rgb32f().into_raw(),
                    _ => img.to_rgba32f().into_raw(),
                };
                raw.iter().flat_map(|v| v.to_le_bytes()).collect()
            }
        };

        Raster {
            width: img.width(),
            height: img.height(),
            channels: channels.clamp(1, 4),
            element,
            data,
        }
    }

    fn bytes_per_pixel(&self) -> usize {
        self.channels * self.element.bytes_per_element()
    }
}

/// Patches of one image, stored back to back in scan order.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchBatch {
    pub shape: PatchShape,
    pub element: ElementType,
    count: usize,
    data: Vec<u8>,
}

impl PatchBatch {
    pub fn empty(shape: PatchShape, element: ElementType) -> Self {
        PatchBatch { shape, element, count: 0, data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn row_bytes(&self) -> usize {
        self.shape.elements() * self.element.bytes_per_element()
    }

    pub fn row(&self, index: usize) -> Option<&[u8]> {
        if index >= self.count {
            return None;
        }
        let n = self.row_bytes();
        Some(&self.data[index * n..(index + 1) * n])
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        // chunks_exact panics on a zero size, and an empty batch has no rows anyway
        let n = self.row_bytes().max(1);
        self.data.chunks_exact(n).take(self.count)
    }
}

/// Number of window origins along one axis.
fn windows(extent: u32, patch: u32, stride: u32) -> usize {
    if patch > extent {
        0
    } else {
        ((extent - patch) / stride) as usize + 1
    }
}

pub fn patch_count(height: u32, width: u32, shape: &PatchShape, stride: u32) -> usize {
    windows(height, shape.height, stride) * windows(width, shape.width, stride)
}

/// Channel count an image with `decoded` channels is stored with for a patch
/// of `wanted` channels. Only a trailing alpha channel is dropped; colour is
/// never folded into grey, and missing channels are left for the shape check.
fn storage_channels(decoded: usize, wanted: usize) -> usize {
    match (decoded, wanted) {
        (2, 1) | (4, 3) => wanted,
        _ => decoded,
    }
}

pub struct PatchExtractor {
    shape: PatchShape,
    stride: u32,
    element: ElementType,
}

impl PatchExtractor {
    pub fn new(shape: PatchShape, stride: u32, element: ElementType) -> Self {
        PatchExtractor { shape, stride, element }
    }

    /// Slides a window over `image`, top to bottom then left to right.
    /// `source` is only used to label errors.
    pub fn extract(&self, source: &Path, image: &DynamicImage) -> DatasetResult<PatchBatch> {
        let decoded = image.color().channel_count() as usize;
        let channels = storage_channels(decoded, self.shape.channels());
        let raster = Raster::from_image(image, channels, self.element);
        self.extract_raster(source, &raster)
    }

    pub fn extract_raster(&self, source: &Path, raster: &Raster) -> DatasetResult<PatchBatch> {
        let expected = self.shape.channels();
        if raster.channels != expected {
            return Err(DatasetError::ShapeMismatch {
                path: source.to_path_buf(),
                expected,
                found: raster.channels,
            });
        }

        let rows_y = windows(raster.height, self.shape.height, self.stride);
        let rows_x = windows(raster.width, self.shape.width, self.stride);
        let count = rows_y * rows_x;
        if count == 0 {
            return Ok(PatchBatch::empty(self.shape, self.element));
        }

        let pixel = raster.bytes_per_pixel();
        let image_line = raster.width as usize * pixel;
        let patch_line = self.shape.width as usize * pixel;
        let stride = self.stride as usize;

        let mut data = Vec::with_capacity(count * patch_line * self.shape.height as usize);
        for oy in 0..rows_y {
            for ox in 0..rows_x {
                let top = oy * stride;
                let left = ox * stride * pixel;
                for r in 0..self.shape.height as usize {
                    let start = (top + r) * image_line + left;
                    data.extend_from_slice(&raster.data[start..start + patch_line]);
                }
            }
        }

        Ok(PatchBatch { shape: self.shape, element: self.element, count, data })
    }
}
