use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{MirrorError, Result};

/// Writes mirrored files below one output directory.
#[derive(Clone)]
pub struct FileManager {
    base_dir: PathBuf,
}

impl FileManager {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let base_dir = base_dir.to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| MirrorError::filesystem(&base_dir, e))?;

        Ok(Self { base_dir })
    }

    /// Filesystem path for a `/`-separated path relative to the output root.
    /// Empty, `.` and `..` segments are dropped so nothing lands outside it.
    pub fn path_for(&self, relative_path: &str) -> PathBuf {
        let mut path = self.base_dir.clone();
        for segment in relative_path
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        {
            path.push(segment);
        }
        path
    }

    fn create_directories_for(&self, relative_path: &str) -> Result<PathBuf> {
        let path = self.path_for(relative_path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MirrorError::filesystem(parent, e))?;
        }

        Ok(path)
    }

    pub fn save_file(&self, relative_path: &str, content: &[u8]) -> Result<PathBuf> {
        let file_path = self.create_directories_for(relative_path)?;

        let mut file =
            fs::File::create(&file_path).map_err(|e| MirrorError::filesystem(&file_path, e))?;
        file.write_all(content)
            .map_err(|e| MirrorError::filesystem(&file_path, e))?;

        Ok(file_path)
    }

    pub fn file_exists(&self, relative_path: &str) -> bool {
        self.path_for(relative_path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_creates_parent_directories() {
        let temp_dir = tempdir().unwrap();
        let files = FileManager::new(temp_dir.path()).unwrap();

        let saved = files
            .save_file("assets/x.test/css/main.css", b"body{}")
            .unwrap();
        assert_eq!(saved, temp_dir.path().join("assets/x.test/css/main.css"));
        assert_eq!(fs::read(&saved).unwrap(), b"body{}");
        assert!(files.file_exists("assets/x.test/css/main.css"));
    }

    #[test]
    fn test_paths_cannot_escape_the_output_root() {
        let temp_dir = tempdir().unwrap();
        let files = FileManager::new(temp_dir.path()).unwrap();
        assert_eq!(
            files.path_for("../../etc/./passwd"),
            temp_dir.path().join("etc/passwd")
        );
    }

    #[test]
    fn test_write_failure_is_a_filesystem_error() {
        let temp_dir = tempdir().unwrap();
        let files = FileManager::new(temp_dir.path()).unwrap();
        files.save_file("blocker", b"file").unwrap();

        // A file where a directory is needed.
        let err = files.save_file("blocker/inner.png", b"x").unwrap_err();
        assert!(matches!(err, MirrorError::Filesystem { .. }));
    }
}
