//! Test utilities for crossbuild-lib.
//!
//! Fake compilers on a private search path, in-memory crate archives and
//! lock files, and counting doubles for the fetcher and build backend.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::pipeline::{BackendError, BuildBackend, BuildRequest, Cancellation, Phase, backend::LAYER_TARGET_DIR};
use crate::toolchain::SearchPath;
use crate::vendor::{LockedPackage, PackageFetcher, VendorError};

const CRATES_IO: &str = "registry+https://github.com/rust-lang/crates.io-index";

/// Write an executable script at `path`, creating parent directories.
pub fn write_executable(path: &Path, content: &str) {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::write(path, content).unwrap();
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
  }
}

/// A directory holding one fake executable per name, and a search path
/// containing only that directory.
pub fn fake_toolchain(names: &[&str]) -> (TempDir, SearchPath) {
  let temp = TempDir::new().unwrap();
  for name in names {
    let file = if cfg!(windows) {
      format!("{}.exe", name)
    } else {
      name.to_string()
    };
    write_executable(&temp.path().join(file), "#!/bin/sh\nexit 0\n");
  }
  let search = SearchPath::new(vec![temp.path().to_path_buf()]);
  (temp, search)
}

/// A gzipped `.crate` archive with `files` under `<name>-<version>/`.
pub fn crate_archive(name: &str, version: &str, files: &[(&str, &str)]) -> Vec<u8> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (path, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder
      .append_data(&mut header, format!("{}-{}/{}", name, version, path), content.as_bytes())
      .unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap()
}

/// A crates.io package whose checksum matches `archive`.
pub fn locked(name: &str, version: &str, archive: &[u8]) -> LockedPackage {
  LockedPackage {
    name: name.to_string(),
    version: version.to_string(),
    source: Some(CRATES_IO.to_string()),
    checksum: Some(hex::encode(Sha256::digest(archive))),
  }
}

/// `Cargo.lock` text listing `packages` in the given order.
pub fn cargo_lock(packages: &[LockedPackage]) -> String {
  let mut out = String::from("# This file is automatically @generated by Cargo.\nversion = 3\n");
  for package in packages {
    out.push_str(&format!(
      "\n[[package]]\nname = \"{}\"\nversion = \"{}\"\n",
      package.name, package.version
    ));
    if let Some(source) = &package.source {
      out.push_str(&format!("source = \"{}\"\n", source));
    }
    if let Some(checksum) = &package.checksum {
      out.push_str(&format!("checksum = \"{}\"\n", checksum));
    }
  }
  out
}

/// Serves archives from memory and counts every fetch.
#[derive(Clone, Default)]
pub struct CountingFetcher {
  pub calls: Arc<AtomicUsize>,
  archives: Arc<Mutex<HashMap<String, Vec<u8>>>>,
  failing: Arc<Mutex<HashSet<String>>>,
}

impl CountingFetcher {
  pub fn insert(&self, package: &LockedPackage, archive: Vec<u8>) {
    self.archives.lock().unwrap().insert(package.dir_name(), archive);
  }

  /// Make fetches of the crate `name` fail.
  pub fn fail(&self, name: &str) {
    self.failing.lock().unwrap().insert(name.to_string());
  }

  pub fn recover(&self, name: &str) {
    self.failing.lock().unwrap().remove(name);
  }
}

impl PackageFetcher for CountingFetcher {
  async fn fetch(&self, package: &LockedPackage) -> Result<Vec<u8>, VendorError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    // Give concurrent callers a chance to pile up
    tokio::task::yield_now().await;

    if self.failing.lock().unwrap().contains(&package.name) {
      return Err(VendorError::Fetch {
        package: package.to_string(),
        message: "connection refused".to_string(),
      });
    }
    self
      .archives
      .lock()
      .unwrap()
      .get(&package.dir_name())
      .cloned()
      .ok_or_else(|| VendorError::Fetch {
        package: package.to_string(),
        message: "HTTP 404".to_string(),
      })
  }
}

/// A backend that writes marker files instead of compiling.
#[derive(Clone)]
pub struct MockBackend {
  pub dependency_builds: Arc<AtomicUsize>,
  pub artifact_builds: Arc<AtomicUsize>,
  binary: Arc<Vec<u8>>,
  failure: Option<(Phase, String)>,
  hang_dependencies: Arc<AtomicBool>,
  cancel_after_dependencies: Option<Cancellation>,
}

impl Default for MockBackend {
  fn default() -> Self {
    Self {
      dependency_builds: Arc::default(),
      artifact_builds: Arc::default(),
      binary: Arc::new(b"\x7fELF static binary".to_vec()),
      failure: None,
      hang_dependencies: Arc::default(),
      cancel_after_dependencies: None,
    }
  }
}

impl MockBackend {
  /// Content of the produced `app` binary.
  pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
    self.binary = Arc::new(binary);
    self
  }

  pub fn failing(mut self, phase: Phase, diagnostic: &str) -> Self {
    self.failure = Some((phase, diagnostic.to_string()));
    self
  }

  /// Dependency builds never finish.
  pub fn hanging_dependencies(self) -> Self {
    self.hang_dependencies.store(true, Ordering::SeqCst);
    self
  }

  /// Trigger `cancel` as the dependency build completes.
  pub fn cancelling_after_dependencies(mut self, cancel: Cancellation) -> Self {
    self.cancel_after_dependencies = Some(cancel);
    self
  }

  fn fail_in(&self, phase: Phase) -> Result<(), BackendError> {
    match &self.failure {
      Some((failing, diagnostic)) if *failing == phase => Err(BackendError::Failed {
        diagnostic: diagnostic.clone(),
      }),
      _ => Ok(()),
    }
  }
}

impl BuildBackend for MockBackend {
  async fn build_dependencies(&self, request: &BuildRequest<'_>, out: &Path) -> Result<(), BackendError> {
    self.dependency_builds.fetch_add(1, Ordering::SeqCst);
    let target_dir = out.join(LAYER_TARGET_DIR);
    fs::create_dir_all(&target_dir)?;
    fs::write(target_dir.join("partial"), request.target.id())?;

    if self.hang_dependencies.load(Ordering::SeqCst) {
      std::future::pending::<()>().await;
    }
    self.fail_in(Phase::Dependencies)?;

    fs::write(target_dir.join("layer"), &request.target.toolchain_target_id)?;
    if let Some(cancel) = &self.cancel_after_dependencies {
      cancel.cancel();
    }
    Ok(())
  }

  async fn build_artifact(
    &self,
    _request: &BuildRequest<'_>,
    deps_layer: &Path,
    work: &Path,
  ) -> Result<Vec<PathBuf>, BackendError> {
    self.artifact_builds.fetch_add(1, Ordering::SeqCst);
    if !deps_layer.join(LAYER_TARGET_DIR).join("layer").is_file() {
      return Err(BackendError::Failed {
        diagnostic: "dependency layer missing".to_string(),
      });
    }
    self.fail_in(Phase::Artifact)?;

    let binary = work.join("app");
    fs::write(&binary, self.binary.as_slice())?;
    Ok(vec![binary])
  }
}
