use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use image::imageops::FilterType;

use super::error::{DatasetError, DatasetResult};
use crate::store::format::ElementType;

/// Extent of one patch: `(height, width)` for single channel data or
/// `(height, width, channels)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchShape {
    pub height: u32,
    pub width: u32,
    pub channels: Option<u32>,
}

impl PatchShape {
    pub fn new_2d(height: u32, width: u32) -> Self {
        PatchShape { height, width, channels: None }
    }

    pub fn new_3d(height: u32, width: u32, channels: u32) -> Self {
        PatchShape { height, width, channels: Some(channels) }
    }

    pub fn channels(&self) -> usize {
        self.channels.unwrap_or(1) as usize
    }

    /// Trailing dimensions of every `img`/`label` row.
    pub fn row_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.height as usize, self.width as usize];
        if let Some(c) = self.channels {
            shape.push(c as usize);
        }
        shape
    }

    pub fn elements(&self) -> usize {
        self.height as usize * self.width as usize * self.channels()
    }
}

impl FromStr for PatchShape {
    type Err = DatasetError;

    /// Accepts `64x64`, `64x64x3`, `64,64,3` or `(64, 64, 3)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let dims = trimmed
            .split(|c| c == 'x' || c == 'X' || c == ',')
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(|d| {
                d.parse::<u32>()
                    .map_err(|_| DatasetError::invalid(format!("bad patch dimension '{d}' in '{s}'")))
            })
            .collect::<DatasetResult<Vec<u32>>>()?;

        match dims.as_slice() {
            [h, w] => Ok(PatchShape::new_2d(*h, *w)),
            [h, w, c] => Ok(PatchShape::new_3d(*h, *w, *c)),
            _ => Err(DatasetError::invalid(format!(
                "patch shape must have 2 or 3 dimensions, got '{s}'"
            ))),
        }
    }
}

impl fmt::Display for PatchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channels {
            Some(c) => write!(f, "({}, {}, {})", self.height, self.width, c),
            None => write!(f, "({}, {})", self.height, self.width),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
    Gaussian,
    Lanczos3,
}

impl Interpolation {
    pub fn filter(&self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::Bicubic => FilterType::CatmullRom,
            Interpolation::Gaussian => FilterType::Gaussian,
            Interpolation::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

impl FromStr for Interpolation {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Interpolation::Nearest),
            "bilinear" | "linear" | "triangle" => Ok(Interpolation::Bilinear),
            "bicubic" | "cubic" | "catmullrom" => Ok(Interpolation::Bicubic),
            "gaussian" => Ok(Interpolation::Gaussian),
            "lanczos" | "lanczos3" => Ok(Interpolation::Lanczos3),
            other => Err(DatasetError::invalid(format!("unknown interpolation '{other}'"))),
        }
    }
}

/// What to do with a matched file that does not decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    #[default]
    Fail,
    Skip,
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub source_directory: PathBuf,
    pub filename_pattern: String,
    pub output_name: String,
    pub output_directory: PathBuf,
    pub patch_shape: PatchShape,
    pub stride: u32,
    pub interpolation: Interpolation,
    pub resize_factor: f64,
    pub element_type: ElementType,
    pub validation_fraction: f64,
    pub seed: Option<u64>,
    pub workers: usize,
    pub decode_errors: DecodeErrorPolicy,
}

impl DatasetConfig {
    /// Mandatory fields are taken here; everything else starts at its default
    /// and may be overwritten before calling [`DatasetConfig::build`].
    pub fn new(
        source_directory: impl Into<PathBuf>,
        filename_pattern: impl Into<String>,
        output_name: impl Into<String>,
        output_directory: impl Into<PathBuf>,
        patch_shape: PatchShape,
        stride: u32,
    ) -> Self {
        Self {
            source_directory: source_directory.into(),
            filename_pattern: filename_pattern.into(),
            output_name: output_name.into(),
            output_directory: output_directory.into(),
            patch_shape,
            stride,
            interpolation: Interpolation::default(),
            resize_factor: 0.5,
            element_type: ElementType::default(),
            validation_fraction: 0.1,
            seed: None,
            workers: 1,
            decode_errors: DecodeErrorPolicy::default(),
        }
    }

    pub fn build(self) -> DatasetResult<Self> {
        if self.filename_pattern.trim().is_empty() {
            return Err(DatasetError::invalid("filename_pattern must not be empty"));
        }
        if self.output_name.trim().is_empty() {
            return Err(DatasetError::invalid("output_name must not be empty"));
        }
        check_patch_geometry(&self.patch_shape, self.stride)?;
        check_resize_factor(self.resize_factor)?;
        check_validation_fraction(self.validation_fraction)?;
        if self.workers == 0 {
            return Err(DatasetError::invalid("workers must be at least 1"));
        }

        Ok(self)
    }
}

fn check_patch_geometry(shape: &PatchShape, stride: u32) -> DatasetResult<()> {
    if shape.height == 0 || shape.width == 0 || shape.channels == Some(0) {
        return Err(DatasetError::invalid(format!("patch shape {shape} has a zero extent")));
    }
    if stride == 0 {
        return Err(DatasetError::invalid("stride must be at least 1"));
    }
    if stride > shape.height || stride > shape.width {
        return Err(DatasetError::invalid(format!(
            "stride {stride} exceeds a spatial extent of patch shape {shape}"
        )));
    }
    Ok(())
}

fn check_resize_factor(factor: f64) -> DatasetResult<()> {
    if !(factor > 0.0 && factor <= 1.0) {
        return Err(DatasetError::invalid(format!(
            "resize_factor must be in (0, 1], got {factor}"
        )));
    }
    Ok(())
}

pub(crate) fn check_validation_fraction(fraction: f64) -> DatasetResult<()> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(DatasetError::invalid(format!(
            "validation_fraction must be strictly between 0 and 1, got {fraction}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DatasetConfig {
        DatasetConfig::new("/data", "*.jpg", "div2k", "/out", PatchShape::new_3d(64, 64, 3), 32)
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = base().build().unwrap();
        assert_eq!(cfg.interpolation, Interpolation::Bicubic);
        assert_eq!(cfg.resize_factor, 0.5);
        assert_eq!(cfg.element_type, ElementType::U8);
        assert_eq!(cfg.validation_fraction, 0.1);
        assert_eq!(cfg.seed, None);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.decode_errors, DecodeErrorPolicy::Fail);
    }

    #[test]
    fn validation_fraction_bounds_are_exclusive() {
        for bad in [0.0, 1.0, -0.2, 1.5, f64::NAN] {
            let mut cfg = base();
            cfg.validation_fraction = bad;
            assert!(matches!(cfg.build(), Err(DatasetError::InvalidConfiguration(_))), "{bad}");
        }
    }

    #[test]
    fn resize_factor_of_one_is_allowed() {
        let mut cfg = base();
        cfg.resize_factor = 1.0;
        assert!(cfg.build().is_ok());

        let mut cfg = base();
        cfg.resize_factor = 0.0;
        assert!(matches!(cfg.build(), Err(DatasetError::InvalidConfiguration(_))));
    }

    #[test]
    fn stride_must_fit_inside_patch() {
        let mut cfg = base();
        cfg.stride = 65;
        assert!(matches!(cfg.build(), Err(DatasetError::InvalidConfiguration(_))));

        let mut cfg = base();
        cfg.stride = 0;
        assert!(matches!(cfg.build(), Err(DatasetError::InvalidConfiguration(_))));
    }

    #[test]
    fn empty_output_name_is_rejected() {
        let cfg = DatasetConfig::new("/data", "*.png", " ", "/out", PatchShape::new_2d(8, 8), 8);
        assert!(matches!(cfg.build(), Err(DatasetError::InvalidConfiguration(_))));
    }

    #[test]
    fn patch_shape_parsing() {
        assert_eq!("64x64x3".parse::<PatchShape>().unwrap(), PatchShape::new_3d(64, 64, 3));
        assert_eq!("(32, 48)".parse::<PatchShape>().unwrap(), PatchShape::new_2d(32, 48));
        assert_eq!("16,16,1".parse::<PatchShape>().unwrap(), PatchShape::new_3d(16, 16, 1));
        assert!("64".parse::<PatchShape>().is_err());
        assert!("64x64x3x2".parse::<PatchShape>().is_err());
        assert!("64xabc".parse::<PatchShape>().is_err());
    }

    #[test]
    fn row_shape_follows_dimensionality() {
        assert_eq!(PatchShape::new_2d(4, 5).row_shape(), vec![4, 5]);
        assert_eq!(PatchShape::new_3d(4, 5, 3).row_shape(), vec![4, 5, 3]);
        assert_eq!(PatchShape::new_2d(4, 5).channels(), 1);
        assert_eq!(PatchShape::new_3d(4, 5, 3).elements(), 60);
    }
}
