//! On-disk layout of trained classifiers.
//!
//! Embedding classifiers are stored as a directory holding the heavy network
//! weights as a MessagePack record and the light metadata as a JSON document,
//! plus a human-readable description and the training history. The metadata
//! carries the SHA-256 digest of the weights file, which is verified on load.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::classifier::error::{ClassifierError, Result};
use crate::classifier::history::TrainingHistory;

/// Network weights
pub const MODEL_FILE: &str = "model.mpk";
/// Label space, embedder and network configuration, weights digest
pub const CLASSIFIER_FILE: &str = "classifier.json";
pub const DESCRIPTION_FILE: &str = "description.txt";
pub const HISTORY_FILE: &str = "history.json";

/// Hex encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Pretty JSON with sorted keys and four-space indentation.
pub(crate) fn to_pretty_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>> {
    // Going through `Value` sorts every object's keys.
    let value = serde_json::to_value(value).map_err(|e| ClassifierError::io(path, e.into()))?;
    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| ClassifierError::io(path, e.into()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writes `bytes` to a temporary file next to `path` and renames it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(directory).map_err(|e| ClassifierError::io(path, e))?;
    file.write_all(bytes).map_err(|e| ClassifierError::io(path, e))?;
    file.as_file().sync_all().map_err(|e| ClassifierError::io(path, e))?;
    file.persist(path).map_err(|e| ClassifierError::io(path, e.error))?;
    log::debug!("Wrote {} bytes to {:?}", bytes.len(), path);
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &to_pretty_json(value, path)?)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ClassifierError::ArtifactNotFound(path.to_path_buf()),
        _ => ClassifierError::io(path, e),
    })
}

fn decode<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| ClassifierError::corrupt(path, e))
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    decode(path, &read_bytes(path)?)
}

/// A model directory. Every component is written atomically, so a reader sees
/// either the previous or the new version of a file.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Creates the directory if needed; an existing directory is reused.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| ClassifierError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Opens an existing directory.
    ///
    /// # Errors
    /// - `ArtifactNotFound` if `root` is not a directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ClassifierError::ArtifactNotFound(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_path(&self) -> PathBuf {
        self.root.join(MODEL_FILE)
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.root.join(CLASSIFIER_FILE)
    }

    pub fn description_path(&self) -> PathBuf {
        self.root.join(DESCRIPTION_FILE)
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    /// Writes the weights blob and returns its digest.
    pub fn write_weights(&self, weights: &[u8]) -> Result<String> {
        write_atomic(&self.model_path(), weights)?;
        Ok(sha256_hex(weights))
    }

    /// Digest of the weights blob currently on disk.
    pub fn weights_digest(&self) -> Result<String> {
        Ok(sha256_hex(&read_bytes(&self.model_path())?))
    }

    /// Reads the weights blob after checking it against `expected_digest`.
    ///
    /// # Errors
    /// - `CorruptArtifact` if the digest differs
    pub fn read_weights(&self, expected_digest: &str) -> Result<Vec<u8>> {
        let path = self.model_path();
        let bytes = read_bytes(&path)?;
        let digest = sha256_hex(&bytes);
        log::debug!("Weights digest {} (expected {})", digest, expected_digest);
        if digest != expected_digest {
            return Err(ClassifierError::corrupt(
                &path,
                format!("hash mismatch: expected {}, got {}", expected_digest, digest),
            ));
        }
        Ok(bytes)
    }

    pub fn write_metadata<M: Serialize>(&self, metadata: &M) -> Result<()> {
        write_json(&self.classifier_path(), metadata)
    }

    pub fn read_metadata<M: DeserializeOwned>(&self) -> Result<M> {
        read_json(&self.classifier_path())
    }

    pub fn write_description(&self, description: &str) -> Result<()> {
        write_atomic(&self.description_path(), description.as_bytes())
    }

    pub fn read_description(&self) -> Result<String> {
        let path = self.description_path();
        String::from_utf8(read_bytes(&path)?).map_err(|e| ClassifierError::corrupt(&path, e))
    }

    pub fn write_history(&self, history: &TrainingHistory) -> Result<()> {
        write_json(&self.history_path(), history)
    }

    /// The stored history, `None` for artifacts saved without one.
    pub fn read_history(&self) -> Result<Option<TrainingHistory>> {
        match read_json(&self.history_path()) {
            Ok(history) => Ok(Some(history)),
            Err(ClassifierError::ArtifactNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty_json_sorts_keys_and_indents() {
        #[derive(Serialize)]
        struct Unsorted {
            zebra: u8,
            apple: u8,
        }
        let bytes = to_pretty_json(&Unsorted { zebra: 1, apple: 2 }, Path::new("x.json")).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\n    \"apple\": 2,\n    \"zebra\": 1\n}\n");
    }

    #[test]
    fn test_weights_round_trip_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ArtifactDir::create(dir.path().join("model")).unwrap();
        let weights = vec![0x82, 0xa6, 0x6b, 0x65, 0x72, 0x6e, 0x65, 0x6c, 0x00];

        let digest = artifact.write_weights(&weights).unwrap();
        assert_eq!(digest, artifact.weights_digest().unwrap());
        assert_eq!(digest, sha256_hex(&weights));
        assert_eq!(artifact.read_weights(&digest).unwrap(), weights);
        assert!(artifact.model_path().ends_with("model.mpk"));
    }

    #[test]
    fn test_digest_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ArtifactDir::create(dir.path()).unwrap();
        artifact.write_weights(b"weights").unwrap();
        let err = artifact.read_weights(&sha256_hex(b"other")).unwrap_err();
        assert!(matches!(err, ClassifierError::CorruptArtifact { .. }));
    }

    #[test]
    fn test_missing_components() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ArtifactDir::open(dir.path().join("absent")),
            Err(ClassifierError::ArtifactNotFound(_))
        ));
        let artifact = ArtifactDir::open(dir.path()).unwrap();
        assert!(artifact.read_history().unwrap().is_none());
        assert!(matches!(
            artifact.read_metadata::<serde_json::Value>(),
            Err(ClassifierError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("description.txt");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
