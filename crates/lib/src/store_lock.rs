//! Cross-process lock serializing `xb build` and `xb vendor` on one store.
//!
//! A second invocation does not fail on contention: it logs who holds the
//! store (command, PID, targets) and blocks until the holder finishes, then
//! finds the holder's published entries in the cache.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::Store;

const LOCK_FILENAME: &str = ".lock";

/// The invocation holding the store, as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  /// Platform identifiers being built; empty for `vendor`.
  pub targets: Vec<String>,
  pub store: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("failed to create store directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock {path}: {source}")]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to record lock holder in {path}: {source}")]
  WriteHolder {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// An exclusive lock on a store, released on drop.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  lock_path: PathBuf,
  waited_for: Option<LockHolder>,
}

impl StoreLock {
  /// Lock `store` for `command` building `targets`, waiting for any other
  /// holder to finish first.
  pub fn acquire(store: &Store, command: &str, targets: &[&str]) -> Result<Self, StoreLockError> {
    let root = store.root();
    let lock_path = root.join(LOCK_FILENAME);

    std::fs::create_dir_all(root).map_err(|source| StoreLockError::CreateDir {
      path: root.to_path_buf(),
      source,
    })?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| StoreLockError::Open {
        path: lock_path.clone(),
        source,
      })?;

    let lock_error = |source| StoreLockError::Lock {
      path: lock_path.clone(),
      source,
    };

    let waited_for = match lock(&file, false) {
      Ok(()) => None,
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        let holder = read_holder(&lock_path);
        match &holder {
          Some(holder) => info!(
            command = %holder.command,
            pid = holder.pid,
            targets = ?holder.targets,
            "store is busy, waiting for it to finish"
          ),
          None => info!(lock = ?lock_path, "store is busy, waiting for it to be released"),
        }
        lock(&file, true).map_err(lock_error)?;
        holder
      }
      Err(e) => return Err(lock_error(e)),
    };

    let held = StoreLock {
      file,
      lock_path,
      waited_for,
    };
    held.write_holder(command, targets, root)?;
    debug!(lock = ?held.lock_path, command, "store locked");
    Ok(held)
  }

  /// The holder recorded by this lock, read through the held handle.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  /// The invocation this lock had to wait for, if any.
  pub fn waited_for(&self) -> Option<&LockHolder> {
    self.waited_for.as_ref()
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  fn write_holder(&self, command: &str, targets: &[&str], store: &Path) -> Result<(), StoreLockError> {
    let holder = LockHolder {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
      targets: targets.iter().map(|t| t.to_string()).collect(),
      store: store.to_path_buf(),
    };

    let write = || -> io::Result<()> {
      let mut file = &self.file;
      file.set_len(0)?;
      file.seek(SeekFrom::Start(0))?;
      let mut writer = io::BufWriter::new(file);
      serde_json::to_writer_pretty(&mut writer, &holder).map_err(io::Error::other)?;
      writer.flush()
    };
    write().map_err(|source| StoreLockError::WriteHolder {
      path: self.lock_path.clone(),
      source,
    })
  }
}

/// Best effort: the holder may be mid-write, and Windows refuses reads of a
/// locked range.
fn read_holder(lock_path: &Path) -> Option<LockHolder> {
  let contents = std::fs::read_to_string(lock_path).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn lock(file: &File, blocking: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = if blocking {
    FlockOperation::LockExclusive
  } else {
    FlockOperation::NonBlockingLockExclusive
  };
  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn lock(file: &File, blocking: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = if blocking {
    LOCKFILE_EXCLUSIVE_LOCK
  } else {
    LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY
  };

  // SAFETY: OVERLAPPED is valid when zero-initialized and the handle is open
  // for the duration of the call.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result != 0 {
    return Ok(());
  }
  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
    return Err(io::Error::from(io::ErrorKind::WouldBlock));
  }
  Err(err)
}
