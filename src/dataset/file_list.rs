use std::ops::Index;
use std::path::{Path, PathBuf};

use glob::{glob_with, MatchOptions, Pattern};

use super::error::{DatasetError, DatasetResult};

/// Absolute paths of every regular file under the source directory that
/// matches the pattern, sorted so the index of a file is stable across runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileList {
    files: Vec<PathBuf>,
}

impl FileList {
    pub fn discover(dir: &Path, pattern: &str) -> DatasetResult<Self> {
        if !dir.is_dir() {
            return Err(DatasetError::DirectoryNotFound(dir.to_path_buf()));
        }
        let dir = std::fs::canonicalize(dir)?;

        // Only the user pattern may carry wildcards; metacharacters in the
        // directory itself are matched literally.
        let dir_str = dir
            .to_str()
            .ok_or_else(|| DatasetError::invalid(format!("source directory {} is not valid UTF-8", dir.display())))?;
        let full_pattern = format!("{}/{}", Pattern::escape(dir_str), pattern);

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: true,
        };

        let mut files: Vec<PathBuf> = glob_with(&full_pattern, options)
            .map_err(|e| DatasetError::invalid(format!("bad filename pattern '{pattern}': {e}")))?
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect();

        // glob already yields in order, but that is an implementation detail of the crate
        files.sort_unstable();

        Ok(FileList { files })
    }

    pub fn from_paths(files: Vec<PathBuf>) -> Self {
        FileList { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Path> {
        self.files.get(index).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }
}

impl Index<usize> for FileList {
    type Output = Path;

    fn index(&self, index: usize) -> &Path {
        &self.files[index]
    }
}
