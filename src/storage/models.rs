//! Downloaded model files
//!
//! Models live flat in one application-private directory, keyed by filename.

use crate::inference::has_gguf_extension;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A model file on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    pub filename: String,
    /// Full path to the model file
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
}

impl ModelFile {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            filename,
            path,
            size: metadata.len(),
        })
    }
}

/// The directory holding downloaded models
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a model with this filename is stored at.
    ///
    /// Filenames are plain names only; anything that could escape the
    /// directory is rejected.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let invalid = filename.is_empty()
            || filename == "."
            || filename == ".."
            || filename.contains(['/', '\\', '\0'])
            || filename.ends_with(".part");
        if invalid {
            return Err(StorageError::InvalidFilename(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }

    /// Stored model, if its file exists
    pub fn find(&self, filename: &str) -> Result<Option<ModelFile>, StorageError> {
        let path = self.resolve(filename)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(ModelFile::from_path(path)?))
    }

    /// Lists `.gguf` files, sorted by filename.
    pub fn list(&self) -> Result<Vec<ModelFile>, StorageError> {
        if !self.root.is_dir() {
            tracing::debug!("Models directory does not exist: {}", self.root.display());
            return Ok(vec![]);
        }

        let mut models = vec![];
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_file() || !has_gguf_extension(&path) {
                continue;
            }
            match ModelFile::from_path(path.clone()) {
                Ok(model) => models.push(model),
                Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
            }
        }

        models.sort_by(|a, b| a.filename.cmp(&b.filename));
        tracing::debug!("Found {} model(s) in {}", models.len(), self.root.display());
        Ok(models)
    }

    /// Deletes a stored model.
    pub fn delete(&self, filename: &str) -> Result<(), StorageError> {
        let path = self.resolve(filename)?;
        if !path.is_file() {
            return Err(StorageError::ModelNotFound(filename.to_string()));
        }
        fs::remove_file(&path)?;
        tracing::info!("Model deleted: {}", filename);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_list_only_gguf_sorted() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("zeta.gguf")).unwrap();
        File::create(temp_dir.path().join("alpha.gguf"))
            .unwrap()
            .write_all(b"1234")
            .unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();
        File::create(temp_dir.path().join("beta.gguf.part")).unwrap();
        fs::create_dir(temp_dir.path().join("dir.gguf")).unwrap();

        let store = ModelStore::new(temp_dir.path());
        let models = store.list().unwrap();

        let names: Vec<_> = models.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["alpha.gguf", "zeta.gguf"]);
        assert_eq!(models[0].size, 4);
        assert_eq!(models[0].path, temp_dir.path().join("alpha.gguf"));
    }

    #[test]
    fn test_list_missing_directory_is_empty() {
        let store = ModelStore::new("/this/path/does/not/exist");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = ModelStore::new("/data/models");
        assert_eq!(
            store.resolve("tiny.gguf").unwrap(),
            PathBuf::from("/data/models/tiny.gguf")
        );
        for bad in ["", ".", "..", "../x.gguf", "a/b.gguf", "a\\b.gguf", "x.gguf.part"] {
            assert!(
                matches!(store.resolve(bad), Err(StorageError::InvalidFilename(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_find_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = ModelStore::new(temp_dir.path());
        File::create(temp_dir.path().join("m.gguf")).unwrap();

        assert!(store.find("m.gguf").unwrap().is_some());
        assert!(store.find("other.gguf").unwrap().is_none());

        store.delete("m.gguf").unwrap();
        assert!(store.find("m.gguf").unwrap().is_none());
        assert!(matches!(
            store.delete("m.gguf"),
            Err(StorageError::ModelNotFound(_))
        ));
    }
}
