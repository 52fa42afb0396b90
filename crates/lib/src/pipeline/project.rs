//! The Cargo project being built.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::PipelineError;
use crate::util::hash::{ContentHash, hash_bytes, hash_directory};

/// Root-level entries never part of the source tree hash.
const IGNORED_ENTRIES: &[&str] = &["target", ".git", ".jj", ".direnv", "result"];

const MANIFEST_FILES: &[&str] = &["Cargo.toml", "Cargo.lock"];

/// A project root with the hashes that key its build phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceProject {
  pub root: PathBuf,
  /// Hash of `Cargo.toml` and `Cargo.lock`. Keys the dependency layer.
  pub manifest_hash: ContentHash,
  /// Hash of the whole tree minus build outputs and VCS metadata.
  pub source_hash: ContentHash,
}

impl SourceProject {
  /// Hash the project at `root`. `Cargo.toml` must exist; `Cargo.lock` is
  /// optional.
  pub fn load(root: &Path) -> Result<Self, PipelineError> {
    let root = dunce::canonicalize(root).map_err(|e| PipelineError::Io {
      message: format!("{}: {}", root.display(), e),
    })?;

    let mut manifest = Vec::new();
    for name in MANIFEST_FILES {
      let path = root.join(name);
      match fs::read(&path) {
        Ok(content) => {
          manifest.extend_from_slice(name.as_bytes());
          manifest.push(0);
          manifest.extend_from_slice(&(content.len() as u64).to_le_bytes());
          manifest.extend_from_slice(&content);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && *name != "Cargo.toml" => {}
        Err(e) => {
          return Err(PipelineError::Io {
            message: format!("{}: {}", path.display(), e),
          });
        }
      }
    }

    let source_hash = hash_directory(&root, IGNORED_ENTRIES).map_err(|e| PipelineError::Io { message: e.to_string() })?;

    Ok(Self {
      manifest_hash: hash_bytes(&manifest),
      source_hash,
      root,
    })
  }

  pub fn manifest_path(&self) -> PathBuf {
    self.root.join("Cargo.toml")
  }
}
