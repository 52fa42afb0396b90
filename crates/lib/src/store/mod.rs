//! Content-addressed store for vendor directories and build outputs.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── vendor/<key>/     # merged vendor directories
//! ├── deps/<key>/       # phase 1 dependency layers
//! ├── build/<key>/      # phase 2 final artifacts
//! ├── tmp/              # staging area, same filesystem as the entries
//! └── .lock
//! ```
//!
//! Entries are written into `tmp/`, stamped with a completion marker carrying
//! their output hash, and then renamed into place. A reader therefore never
//! observes a half-written entry, and an entry without a valid marker is
//! treated as absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::COMPLETE_MARKER;
use crate::platform::paths::store_dir;
use crate::util::hash::{DirHashError, ObjectHash, hash_directory};

/// Files excluded when hashing entry outputs.
const ENTRY_HASH_EXCLUSIONS: &[&str] = &[COMPLETE_MARKER];

const STAGING_DIR: &str = "tmp";

/// The kinds of entries kept in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
  Vendor,
  Deps,
  Build,
}

impl EntryKind {
  pub fn dir_name(&self) -> &'static str {
    match self {
      EntryKind::Vendor => "vendor",
      EntryKind::Deps => "deps",
      EntryKind::Build => "build",
    }
  }
}

/// Marker file content written into every complete entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryMarker {
  /// Marker format version.
  pub version: u32,
  /// Always "complete".
  pub status: String,
  /// Full SHA256 hash of the entry contents (marker excluded).
  pub output_hash: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to create store directory '{path}': {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to hash store entry: {0}")]
  Hash(#[from] DirHashError),

  #[error("failed to write completion marker in '{path}': {source}")]
  WriteMarker {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to publish '{from}' as '{to}': {source}")]
  Publish {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Handle to a store root.
#[derive(Debug, Clone)]
pub struct Store {
  root: PathBuf,
}

impl Store {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Store at the default location (see `platform::paths::store_dir`).
  pub fn open_default() -> Self {
    Self::new(store_dir())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Final location of an entry, whether or not it exists yet.
  pub fn entry_path(&self, kind: EntryKind, key: &ObjectHash) -> PathBuf {
    self.root.join(kind.dir_name()).join(&key.0)
  }

  /// Returns `true` if `path` lies inside this store.
  pub fn contains(&self, path: &Path) -> bool {
    path.starts_with(&self.root)
  }

  /// Look up a complete entry.
  ///
  /// Entries with a missing, unreadable or mismatching marker are removed and
  /// reported as absent so the caller rebuilds them.
  pub fn lookup(&self, kind: EntryKind, key: &ObjectHash) -> Option<PathBuf> {
    let path = self.entry_path(kind, key);
    if !path.exists() {
      return None;
    }

    match read_marker(&path) {
      Some(marker) if verify_entry(&path, &marker) => {
        debug!(path = ?path, "store entry found (cache hit)");
        Some(path)
      }
      _ => {
        warn!(path = ?path, "removing incomplete or corrupted store entry");
        if let Err(e) = fs::remove_dir_all(&path) {
          warn!(path = ?path, error = %e, "failed to remove store entry");
        }
        None
      }
    }
  }

  /// Create a fresh staging directory for an entry of `kind`.
  ///
  /// The directory is removed when the returned handle is dropped, unless it
  /// has been published.
  pub fn stage(&self, kind: EntryKind) -> Result<TempDir, StoreError> {
    let staging_root = self.root.join(STAGING_DIR);
    fs::create_dir_all(&staging_root).map_err(|source| StoreError::CreateDir {
      path: staging_root.clone(),
      source,
    })?;
    tempfile::Builder::new()
      .prefix(&format!("{}-", kind.dir_name()))
      .tempdir_in(&staging_root)
      .map_err(|source| StoreError::CreateDir {
        path: staging_root,
        source,
      })
  }

  /// Stamp a staged directory and atomically move it to its final location.
  ///
  /// If another writer published the same key first, the staged copy is
  /// discarded and the existing entry is returned.
  pub fn publish(&self, kind: EntryKind, key: &ObjectHash, staging: TempDir) -> Result<PathBuf, StoreError> {
    let final_path = self.entry_path(kind, key);
    write_marker(staging.path())?;

    let parent = self.root.join(kind.dir_name());
    fs::create_dir_all(&parent).map_err(|source| StoreError::CreateDir { path: parent, source })?;

    let staged = staging.keep();
    match fs::rename(&staged, &final_path) {
      Ok(()) => {
        debug!(path = ?final_path, "published store entry");
        Ok(final_path)
      }
      Err(source) => {
        let _ = fs::remove_dir_all(&staged);
        if self.lookup(kind, key).is_some() {
          debug!(path = ?final_path, "entry published concurrently, discarding staged copy");
          return Ok(final_path);
        }
        Err(StoreError::Publish {
          from: staged,
          to: final_path,
          source,
        })
      }
    }
  }
}

fn write_marker(dir: &Path) -> Result<(), StoreError> {
  let output_hash = hash_directory(dir, ENTRY_HASH_EXCLUSIONS)?;
  let marker = EntryMarker {
    version: 1,
    status: "complete".to_string(),
    output_hash: output_hash.0,
  };
  let content = serde_json::to_string(&marker).map_err(|e| StoreError::WriteMarker {
    path: dir.to_path_buf(),
    source: io::Error::other(e),
  })?;
  fs::write(dir.join(COMPLETE_MARKER), format!("{}\n", content)).map_err(|source| StoreError::WriteMarker {
    path: dir.to_path_buf(),
    source,
  })
}

/// Read the completion marker of an entry, if present and parseable.
pub fn read_marker(entry: &Path) -> Option<EntryMarker> {
  let content = fs::read_to_string(entry.join(COMPLETE_MARKER)).ok()?;
  serde_json::from_str(&content).ok()
}

fn verify_entry(path: &Path, marker: &EntryMarker) -> bool {
  match hash_directory(path, ENTRY_HASH_EXCLUSIONS) {
    Ok(current) if current.0 == marker.output_hash => true,
    Ok(current) => {
      warn!(
        path = ?path,
        expected = %marker.output_hash,
        actual = %current.0,
        "store entry corrupted"
      );
      false
    }
    Err(e) => {
      warn!(path = ?path, error = %e, "failed to hash store entry");
      false
    }
  }
}
