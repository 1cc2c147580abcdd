use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;

use super::format::{
    check_version, decode_filename, read_u32_le, ArrayMeta, ContentType, Header, StoreManifest,
    CHUNK_PREFIX_LEN, HEADER_LEN, STATE_FINALIZED,
};
use crate::dataset::error::{DatasetError, DatasetResult};

/// Read access to a finalized phase store.
pub struct PhaseStoreReader {
    path: PathBuf,
    file: BufReader<File>,
    manifest: StoreManifest,
}

impl PhaseStoreReader {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(|_| corrupt(path, "file shorter than header"))?;
        let header = Header::decode(&buf).ok_or_else(|| corrupt(path, "bad magic"))?;
        check_version(path, header.version)?;
        if header.state != STATE_FINALIZED {
            return Err(DatasetError::StoreNotFinalized(path.to_path_buf()));
        }

        file.seek(SeekFrom::Start(header.footer_offset))?;
        let mut footer = Vec::new();
        file.read_to_end(&mut footer)?;
        let manifest: StoreManifest = serde_json::from_slice(&footer)?;

        for content in ContentType::ALL {
            let meta = manifest
                .array(content.name())
                .ok_or_else(|| corrupt(path, &format!("missing array '{}'", content.name())))?;
            if meta.chunks.len() as u64 != meta.rows {
                return Err(corrupt(path, &format!("array '{}' has an incomplete chunk index", meta.name)));
            }
        }

        Ok(PhaseStoreReader { path: path.to_path_buf(), file, manifest })
    }

    pub fn manifest(&self) -> &StoreManifest {
        &self.manifest
    }

    pub fn array(&self, name: &str) -> Option<&ArrayMeta> {
        self.manifest.array(name)
    }

    pub fn rows(&self, name: &str) -> Option<u64> {
        self.array(name).map(|a| a.rows)
    }

    /// Decompressed bytes of one row.
    pub fn read_row(&mut self, name: &str, index: u64) -> DatasetResult<Vec<u8>> {
        let meta = self.manifest.array(name).ok_or_else(|| DatasetError::UnknownArray {
            path: self.path.clone(),
            name: name.to_string(),
        })?;
        let offset = *meta.chunks.get(index as usize).ok_or_else(|| DatasetError::RowOutOfRange {
            path: self.path.clone(),
            array: name.to_string(),
            index,
            rows: meta.rows,
        })?;
        let row_bytes = meta.row_bytes;
        let expected_id = ContentType::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .map(|c| c.id());

        self.file.seek(SeekFrom::Start(offset))?;
        let mut prefix = [0u8; CHUNK_PREFIX_LEN];
        self.file.read_exact(&mut prefix)?;
        if ContentType::from_id(prefix[0]).map(|c| c.id()) != expected_id {
            return Err(corrupt(&self.path, &format!("chunk at {offset} does not belong to '{name}'")));
        }
        let raw_len = read_u32_le(&prefix[1..5]) as usize;
        let compressed_len = read_u32_le(&prefix[5..9]) as usize;
        if raw_len != row_bytes {
            return Err(corrupt(&self.path, &format!("chunk at {offset} holds {raw_len} bytes, expected {row_bytes}")));
        }

        let mut compressed = vec![0u8; compressed_len];
        self.file.read_exact(&mut compressed)?;
        let mut row = Vec::with_capacity(raw_len);
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut row)?;
        if row.len() != raw_len {
            return Err(corrupt(&self.path, &format!("chunk at {offset} decompressed to {} bytes", row.len())));
        }
        Ok(row)
    }

    pub fn filename(&mut self, index: u64) -> DatasetResult<String> {
        let row = self.read_row(ContentType::Filename.name(), index)?;
        Ok(decode_filename(&row))
    }

    pub fn filenames(&mut self) -> DatasetResult<Vec<String>> {
        let rows = self.rows(ContentType::Filename.name()).unwrap_or(0);
        (0..rows).map(|i| self.filename(i)).collect()
    }
}

fn corrupt(path: &Path, reason: &str) -> DatasetError {
    DatasetError::CorruptStore {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
