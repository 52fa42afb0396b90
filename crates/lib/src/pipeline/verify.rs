//! Standalone verification.
//!
//! An artifact is standalone when none of its files mention a path inside the
//! store: a reference into the store would become a runtime dependency once
//! the binary is copied elsewhere. References to system locations such as
//! `/usr/lib` are tolerated.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Store entries referenced by `bytes`, as `<store>/<kind>/<key>` paths.
pub fn scan_store_references(bytes: &[u8], store_root: &Path) -> BTreeSet<PathBuf> {
  let needle = store_root.to_string_lossy();
  let needle = needle.trim_end_matches(['/', '\\']).as_bytes();
  let mut found = BTreeSet::new();
  if needle.is_empty() {
    return found;
  }

  let mut offset = 0;
  while let Some(pos) = find(&bytes[offset..], needle) {
    let start = offset + pos + needle.len();
    offset = start;
    // `<store>2/...` is a sibling directory, not an entry
    if !matches!(bytes.get(start), Some(b'/' | b'\\')) {
      continue;
    }
    let tail: Vec<&str> = path_tail(&bytes[start..])
      .split(['/', '\\'])
      .filter(|c| !c.is_empty())
      .take(2)
      .collect();

    let mut entry = store_root.to_path_buf();
    for component in tail {
      entry.push(component);
    }
    found.insert(entry);
  }

  found
}

/// Check every file under `dir`, returning the distinct store entries
/// referenced by any of them.
pub fn verify_standalone(dir: &Path, store_root: &Path) -> std::io::Result<Vec<PathBuf>> {
  let mut offending = BTreeSet::new();
  for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
    let entry = entry.map_err(std::io::Error::other)?;
    if !entry.file_type().is_file() {
      continue;
    }
    let bytes = fs::read(entry.path())?;
    let references = scan_store_references(&bytes, store_root);
    if !references.is_empty() {
      debug!(file = ?entry.path(), references = references.len(), "store references found");
    }
    offending.extend(references);
  }
  Ok(offending.into_iter().collect())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack.windows(needle.len()).position(|w| w == needle)
}

/// The printable path characters following a match.
fn path_tail(bytes: &[u8]) -> &str {
  let len = bytes
    .iter()
    .position(|&b| !(b.is_ascii_graphic() && b != b':' && b != b';' && b != b'"'))
    .unwrap_or(bytes.len());
  std::str::from_utf8(&bytes[..len]).unwrap_or("")
}
