//! On-disk layout of a phase store.
//!
//! A store is a single file: a fixed 24 byte header, a run of chunk records
//! (one row each, zlib compressed) and a JSON manifest footer that indexes
//! every chunk. The header starts in the `open` state and is only rewritten
//! to `finalized` once the footer is on disk.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::error::{DatasetError, DatasetResult};

pub const MAGIC: &[u8; 4] = b"PTBL";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 24;

pub const STATE_OPEN: u32 = 0;
pub const STATE_FINALIZED: u32 = 1;

/// Chunk record prefix: array id (u8), raw length (u32), compressed length (u32).
pub const CHUNK_PREFIX_LEN: usize = 9;

pub const COMPRESSION_CODEC: &str = "zlib";
pub const COMPRESSION_LEVEL: u32 = 5;
pub const CHUNK_ROWS: u32 = 1;

/// Fixed width of one `filename` row in bytes.
pub const FILENAME_WIDTH: usize = 255;

/// Storage type of the `img` and `label` arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ElementType {
    #[default]
    U8,
    U16,
    F32,
}

impl ElementType {
    pub fn bytes_per_element(&self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::F32 => 4,
        }
    }

    /// numpy-style type string, little-endian.
    pub fn dtype(&self) -> &'static str {
        match self {
            ElementType::U8 => "<u1",
            ElementType::U16 => "<u2",
            ElementType::F32 => "<f4",
        }
    }
}

impl FromStr for ElementType {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u8" | "uint8" => Ok(ElementType::U8),
            "u16" | "uint16" => Ok(ElementType::U16),
            "f32" | "float32" => Ok(ElementType::F32),
            other => Err(DatasetError::invalid(format!("unknown element type '{other}'"))),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// The three arrays held by every phase store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentType {
    Img,
    Label,
    Filename,
}

impl ContentType {
    pub const ALL: [ContentType; 3] = [ContentType::Img, ContentType::Label, ContentType::Filename];

    pub fn name(&self) -> &'static str {
        match self {
            ContentType::Img => "img",
            ContentType::Label => "label",
            ContentType::Filename => "filename",
        }
    }

    pub(crate) fn id(&self) -> u8 {
        match self {
            ContentType::Img => 0,
            ContentType::Label => 1,
            ContentType::Filename => 2,
        }
    }

    pub(crate) fn from_id(id: u8) -> Option<Self> {
        ContentType::ALL.into_iter().find(|c| c.id() == id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMeta {
    pub codec: String,
    pub level: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub name: String,
    pub dtype: String,
    pub row_shape: Vec<usize>,
    pub row_bytes: usize,
    pub rows: u64,
    pub chunk_rows: u32,
    /// File offset of every chunk record, in row order.
    pub chunks: Vec<u64>,
}

impl ArrayMeta {
    pub(crate) fn new(name: &str, dtype: String, row_shape: Vec<usize>, row_bytes: usize) -> Self {
        ArrayMeta {
            name: name.to_string(),
            dtype,
            row_shape,
            row_bytes,
            rows: 0,
            chunk_rows: CHUNK_ROWS,
            chunks: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub format_version: u32,
    pub compression: CompressionMeta,
    pub arrays: Vec<ArrayMeta>,
}

impl StoreManifest {
    pub fn array(&self, name: &str) -> Option<&ArrayMeta> {
        self.arrays.iter().find(|a| a.name == name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub state: u32,
    pub footer_offset: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.state.to_le_bytes());
        // 12..16 reserved
        buf[16..24].copy_from_slice(&self.footer_offset.to_le_bytes());
        buf
    }

    /// Returns `None` when the magic does not match.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Option<Self> {
        if &buf[0..4] != MAGIC {
            return None;
        }
        Some(Header {
            version: read_u32_le(&buf[4..8]),
            state: read_u32_le(&buf[8..12]),
            footer_offset: read_u64_le(&buf[16..24]),
        })
    }
}

pub(crate) fn read_u32_le(data: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[..4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64_le(data: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[..8]);
    u64::from_le_bytes(b)
}

/// Pads or truncates `name` to exactly [`FILENAME_WIDTH`] bytes.
/// Truncation backs off to a char boundary so the stored prefix stays valid UTF-8.
pub fn encode_filename(name: &str) -> [u8; FILENAME_WIDTH] {
    let mut end = name.len().min(FILENAME_WIDTH);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut row = [0u8; FILENAME_WIDTH];
    row[..end].copy_from_slice(&name.as_bytes()[..end]);
    row
}

pub fn decode_filename(row: &[u8]) -> String {
    let end = row.iter().position(|&b| b == 0).unwrap_or(row.len());
    String::from_utf8_lossy(&row[..end]).into_owned()
}

pub fn filename_dtype() -> String {
    format!("|S{FILENAME_WIDTH}")
}

pub(crate) fn check_version(path: &Path, version: u32) -> DatasetResult<()> {
    if version != FORMAT_VERSION {
        return Err(DatasetError::CorruptStore {
            path: path.to_path_buf(),
            reason: format!("unsupported format version {version}, expected {FORMAT_VERSION}"),
        });
    }
    Ok(())
}

/// Builds a chunk record prefix. Both lengths are stored as `u32`, so rows
/// that do not fit are refused rather than written with a wrapped length.
pub(crate) fn chunk_prefix(
    content: ContentType,
    raw_len: usize,
    compressed_len: usize,
) -> DatasetResult<[u8; CHUNK_PREFIX_LEN]> {
    let too_large = |len: usize| DatasetError::LayoutMismatch {
        array: content.name(),
        expected: format!("a chunk of at most {} bytes", u32::MAX),
        found: format!("{len} bytes"),
    };
    let raw = u32::try_from(raw_len).map_err(|_| too_large(raw_len))?;
    let compressed = u32::try_from(compressed_len).map_err(|_| too_large(compressed_len))?;

    let mut prefix = [0u8; CHUNK_PREFIX_LEN];
    prefix[0] = content.id();
    prefix[1..5].copy_from_slice(&raw.to_le_bytes());
    prefix[5..9].copy_from_slice(&compressed.to_le_bytes());
    Ok(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_survives_encode_decode() {
        let header = Header { version: FORMAT_VERSION, state: STATE_FINALIZED, footer_offset: 4096 };
        assert_eq!(Header::decode(&header.encode()), Some(header));
    }

    #[test]
    fn header_rejects_foreign_magic() {
        let mut buf = Header { version: 1, state: 0, footer_offset: 0 }.encode();
        buf[0] = b'X';
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn long_filenames_are_truncated_to_width() {
        let long = "a".repeat(400);
        let row = encode_filename(&long);
        assert_eq!(decode_filename(&row), "a".repeat(FILENAME_WIDTH));
    }

    #[test]
    fn truncation_keeps_utf8_valid() {
        // 254 ascii bytes followed by a two byte char straddling the limit
        let name = format!("{}é", "b".repeat(254));
        let row = encode_filename(&name);
        assert_eq!(decode_filename(&row), "b".repeat(254));
    }

    #[test]
    fn short_filenames_are_nul_padded() {
        let row = encode_filename("/data/img_01.jpg");
        assert_eq!(row.len(), FILENAME_WIDTH);
        assert!(row[16..].iter().all(|&b| b == 0));
        assert_eq!(decode_filename(&row), "/data/img_01.jpg");
    }

    #[test]
    fn chunk_prefix_packs_id_and_lengths() {
        let prefix = chunk_prefix(ContentType::Label, 300, 42).unwrap();
        assert_eq!(prefix[0], ContentType::Label.id());
        assert_eq!(read_u32_le(&prefix[1..5]), 300);
        assert_eq!(read_u32_le(&prefix[5..9]), 42);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn chunk_prefix_refuses_lengths_past_u32() {
        let huge = u32::MAX as usize + 1;
        let err = chunk_prefix(ContentType::Img, huge, 10).unwrap_err();
        assert!(matches!(err, DatasetError::LayoutMismatch { array: "img", .. }));
        let err = chunk_prefix(ContentType::Img, 10, huge).unwrap_err();
        assert!(matches!(err, DatasetError::LayoutMismatch { array: "img", .. }));
    }

    #[test]
    fn unknown_format_version_is_a_corrupt_store() {
        let path = Path::new("/out/x_train.pytable");
        assert!(check_version(path, FORMAT_VERSION).is_ok());
        let err = check_version(path, FORMAT_VERSION + 1).unwrap_err();
        assert!(matches!(err, DatasetError::CorruptStore { .. }));
    }

    #[test]
    fn element_types_parse_case_insensitively() {
        assert_eq!("U16".parse::<ElementType>().unwrap(), ElementType::U16);
        assert_eq!("float32".parse::<ElementType>().unwrap(), ElementType::F32);
        assert!("i64".parse::<ElementType>().is_err());
    }
}
