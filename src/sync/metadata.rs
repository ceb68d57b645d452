use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::MetadataError;
use crate::io::{read_optional, remove_file, write_file};

pub const METADATA_VERSION: u32 = 1;

/// What the previous sync generated for one file id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: Utf8PathBuf,
    /// Fingerprint of the generated contents, after formatting.
    pub hash: Hash32,
}

/// The record of a successful sync: which file id was generated at which
/// path, and with what contents.
///
/// Persisted as JSON:
///
/// ```json
/// {"version":1,"files":{"readme":{"path":"README.md","hash":"af13..."}}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub version: u32,
    pub files: BTreeMap<String, FileRecord>,
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            files: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

impl SyncMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads metadata from `path`. A missing file means nothing has been
    /// synced yet and yields empty metadata.
    pub fn load(path: &Utf8Path) -> Result<Self, MetadataError> {
        let Some(bytes) = read_optional(path).map_err(|source| MetadataError::Io {
            path: path.to_owned(),
            source,
        })?
        else {
            return Ok(Self::default());
        };

        let parse = |source| MetadataError::Parse {
            path: path.to_owned(),
            source,
        };

        let header: Header = serde_json::from_slice(&bytes).map_err(parse)?;
        if header.version != METADATA_VERSION {
            return Err(MetadataError::UnsupportedVersion {
                path: path.to_owned(),
                version: header.version,
            });
        }

        serde_json::from_slice(&bytes).map_err(parse)
    }

    /// Writes the metadata to `path`, skipping the write when the file
    /// already holds the same contents.
    pub fn save(&self, path: &Utf8Path) -> Result<(), MetadataError> {
        let io_error = |source| MetadataError::Io {
            path: path.to_owned(),
            source,
        };

        let mut json = serde_json::to_string_pretty(self).map_err(|source| MetadataError::Parse {
            path: path.to_owned(),
            source,
        })?;
        json.push('\n');

        if read_optional(path).map_err(io_error)?.as_deref() == Some(json.as_bytes()) {
            return Ok(());
        }

        write_file(path, json.as_bytes()).map_err(io_error)
    }

    pub fn record(&self, id: &str) -> Option<&FileRecord> {
        self.files.get(id)
    }

    /// The id whose file was generated at `path`, if any.
    pub fn id_at(&self, path: &Utf8Path) -> Option<&str> {
        self.files
            .iter()
            .find(|(_, record)| record.path.as_path() == path)
            .map(|(id, _)| id.as_str())
    }
}

/// The generated contents of the previous sync, mirrored under the metadata
/// directory. These are the merge bases of the next sync.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    dir: Utf8PathBuf,
}

impl Snapshot {
    pub fn new(dir: Utf8PathBuf) -> Self {
        Self { dir }
    }

    pub fn read(&self, path: &Utf8Path) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.dir.join(path))
    }

    pub fn write(&self, path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
        write_file(&self.dir.join(path), bytes)
    }

    pub fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        remove_file(&self.dir.join(path), &self.dir)
    }

    /// Removes the snapshot directory if nothing is left in it.
    pub fn prune(&self) {
        let _ = fs::remove_dir(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_missing_file_is_empty() {
        let (_dir, root) = root();

        let metadata = SyncMetadata::load(&root.join("metadata.json")).unwrap();
        assert_eq!(metadata, SyncMetadata::default());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, root) = root();
        let path = root.join(".tsugite/metadata.json");

        let mut metadata = SyncMetadata::new();
        metadata.files.insert(
            "readme".into(),
            FileRecord {
                path: "README.md".into(),
                hash: Hash32::hash("# demo\n"),
            },
        );

        metadata.save(&path).unwrap();
        let loaded = SyncMetadata::load(&path).unwrap();

        assert_eq!(loaded, metadata);
        assert_eq!(loaded.id_at(Utf8Path::new("README.md")), Some("readme"));

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"version\": 1"));
        assert!(json.contains("\"path\": \"README.md\""));
    }

    #[test]
    fn test_unsupported_version() {
        let (_dir, root) = root();
        let path = root.join("metadata.json");
        fs::write(&path, r#"{"version":7,"files":{}}"#).unwrap();

        let err = SyncMetadata::load(&path).unwrap_err();
        assert!(matches!(err, MetadataError::UnsupportedVersion { version: 7, .. }));
    }

    #[test]
    fn test_malformed() {
        let (_dir, root) = root();
        let path = root.join("metadata.json");
        fs::write(&path, "not json").unwrap();

        let err = SyncMetadata::load(&path).unwrap_err();
        assert!(matches!(err, MetadataError::Parse { .. }));
    }
}
