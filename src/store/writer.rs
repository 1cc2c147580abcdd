use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};

use super::format::{
    chunk_prefix, encode_filename, filename_dtype, ArrayMeta, CompressionMeta, ContentType, ElementType, Header,
    StoreManifest, CHUNK_PREFIX_LEN, COMPRESSION_CODEC, COMPRESSION_LEVEL, FILENAME_WIDTH,
    FORMAT_VERSION, HEADER_LEN, STATE_FINALIZED, STATE_OPEN,
};
use crate::dataset::config::PatchShape;
use crate::dataset::error::{DatasetError, DatasetResult};
use crate::dataset::patches::PatchBatch;
use crate::dataset::split::Phase;

/// Creates one phase store per phase under the output directory.
pub struct DatasetWriter {
    output_directory: PathBuf,
    output_name: String,
    patch_shape: PatchShape,
    element: ElementType,
}

impl DatasetWriter {
    pub fn new(
        output_directory: impl Into<PathBuf>,
        output_name: impl Into<String>,
        patch_shape: PatchShape,
        element: ElementType,
    ) -> Self {
        DatasetWriter {
            output_directory: output_directory.into(),
            output_name: output_name.into(),
            patch_shape,
            element,
        }
    }

    pub fn store_path(&self, phase: Phase) -> PathBuf {
        self.output_directory
            .join(format!("{}_{}.pytable", self.output_name, phase.name()))
    }

    /// Creates the store for `phase`, replacing whatever was at its path.
    pub fn open(&self, phase: Phase) -> DatasetResult<PhaseStore> {
        fs::create_dir_all(&self.output_directory)?;
        PhaseStore::create(self.store_path(phase), self.patch_shape, self.element)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreSummary {
    pub path: PathBuf,
    pub rows: u64,
}

/// Append-only handle on one phase store. Consumed by [`PhaseStore::close`]
/// or [`PhaseStore::abort`]; a handle dropped without either leaves the file
/// marked open, which readers refuse.
pub struct PhaseStore {
    path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    patch_shape: PatchShape,
    element: ElementType,
    compression: Compression,
    arrays: [ArrayMeta; 3],
}

impl PhaseStore {
    pub fn create(path: PathBuf, patch_shape: PatchShape, element: ElementType) -> DatasetResult<Self> {
        let mut file = BufWriter::new(File::create(&path)?);
        let header = Header { version: FORMAT_VERSION, state: STATE_OPEN, footer_offset: 0 };
        file.write_all(&header.encode())?;

        let row_shape = patch_shape.row_shape();
        let row_bytes = patch_shape.elements() * element.bytes_per_element();
        let arrays = [
            ArrayMeta::new(ContentType::Img.name(), element.dtype().to_string(), row_shape.clone(), row_bytes),
            ArrayMeta::new(ContentType::Label.name(), element.dtype().to_string(), row_shape, row_bytes),
            ArrayMeta::new(ContentType::Filename.name(), filename_dtype(), Vec::new(), FILENAME_WIDTH),
        ];

        debug!("Opened phase store {}", path.display());

        Ok(PhaseStore {
            path,
            file,
            offset: HEADER_LEN as u64,
            patch_shape,
            element,
            compression: Compression::new(COMPRESSION_LEVEL),
            arrays,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self, content: ContentType) -> u64 {
        self.arrays[content.id() as usize].rows
    }

    /// Grows `img` or `label` by one row per patch. Empty batches are a no-op.
    pub fn append(&mut self, content: ContentType, batch: &PatchBatch) -> DatasetResult<()> {
        if content == ContentType::Filename {
            return Err(DatasetError::LayoutMismatch {
                array: content.name(),
                expected: filename_dtype(),
                found: format!("patch batch {}", batch.shape),
            });
        }
        if batch.shape != self.patch_shape || batch.element != self.element {
            return Err(DatasetError::LayoutMismatch {
                array: content.name(),
                expected: format!("{} {}", self.patch_shape, self.element),
                found: format!("{} {}", batch.shape, batch.element),
            });
        }

        for row in batch.rows() {
            self.write_chunk(content, row)?;
        }
        Ok(())
    }

    /// Grows `filename` by `count` identical rows.
    pub fn append_filenames(&mut self, name: &str, count: usize) -> DatasetResult<()> {
        let row = encode_filename(name);
        for _ in 0..count {
            self.write_chunk(ContentType::Filename, &row)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, content: ContentType, row: &[u8]) -> DatasetResult<()> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(row.len() / 2), self.compression);
        encoder.write_all(row)?;
        let compressed = encoder.finish()?;

        let prefix = chunk_prefix(content, row.len(), compressed.len())?;
        self.file.write_all(&prefix)?;
        self.file.write_all(&compressed)?;

        let meta = &mut self.arrays[content.id() as usize];
        meta.chunks.push(self.offset);
        meta.rows += 1;
        self.offset += (CHUNK_PREFIX_LEN + compressed.len()) as u64;
        Ok(())
    }

    fn check_row_counts(&self) -> DatasetResult<u64> {
        let img = self.rows(ContentType::Img);
        let label = self.rows(ContentType::Label);
        let filename = self.rows(ContentType::Filename);
        if img != label || img != filename {
            return Err(DatasetError::RowCountMismatch {
                path: self.path.clone(),
                img,
                label,
                filename,
            });
        }
        Ok(img)
    }

    /// Writes the manifest and flips the header to finalized. Fails, leaving
    /// the file unfinalized, if the three arrays disagree in length.
    pub fn close(self) -> DatasetResult<StoreSummary> {
        let rows = self.check_row_counts()?;

        let PhaseStore { path, mut file, offset, arrays, .. } = self;
        let manifest = StoreManifest {
            format_version: FORMAT_VERSION,
            compression: CompressionMeta {
                codec: COMPRESSION_CODEC.to_string(),
                level: COMPRESSION_LEVEL,
            },
            arrays: arrays.into(),
        };
        serde_json::to_writer(&mut file, &manifest)?;

        let header = Header { version: FORMAT_VERSION, state: STATE_FINALIZED, footer_offset: offset };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        debug!("Finalized phase store {} with {} rows", path.display(), rows);
        Ok(StoreSummary { path, rows })
    }

    /// Discards a store that can no longer be completed.
    pub fn abort(self) -> DatasetResult<()> {
        let PhaseStore { path, file, .. } = self;
        drop(file);
        discard(&path)
    }
}

/// Removes a partial store. A missing file is not an error.
pub fn discard(path: &Path) -> DatasetResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!("Removed unfinished phase store {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
