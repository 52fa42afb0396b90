//! Two-phase build pipeline.
//!
//! Every target is built in two cached phases:
//!
//! 1. **Dependency layer** keyed by the toolchain target, the vendor key, the
//!    manifest hash and the platform extras. Source edits do not invalidate it.
//! 2. **Final artifact** keyed by the layer key and the source tree hash. Its
//!    binaries must pass the standalone verification before they are
//!    published.
//!
//! Both phases stage into the store and publish atomically, so an interrupted
//! or failed build never leaves a visible entry.

pub mod backend;
mod cancel;
mod project;
pub mod verify;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{PlatformExtras, PlatformRule};
use crate::matrix::{ResolvedTarget, TargetMatrix};
use crate::store::{EntryKind, Store, StoreError};
use crate::toolchain::{ToolchainConfig, ToolchainError, ToolchainProvider, configure_matrix};
use crate::util::hash::{ContentHash, Hashable, ObjectHash};
use crate::vendor::{DependencyLockSet, PackageFetcher, VendorCache, VendorCacheEntry, VendorError};

pub use backend::{BackendError, BuildBackend, BuildRequest, CargoBackend};
pub use cancel::Cancellation;
pub use project::SourceProject;

/// Directory of a final artifact entry holding the binaries.
pub const BIN_DIR: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  Dependencies,
  Artifact,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Phase::Dependencies => write!(f, "dependency"),
      Phase::Artifact => write!(f, "artifact"),
    }
  }
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("{phase} build failed for {target}:\n{diagnostic}")]
  Compile {
    target: String,
    phase: Phase,
    diagnostic: String,
  },

  #[error("artifact for {target} is not standalone, it references: {}", display_paths(.references))]
  NonStandaloneArtifact { target: String, references: Vec<PathBuf> },

  #[error("build cancelled for {target}")]
  Cancelled { target: String },

  #[error("I/O error: {message}")]
  Io { message: String },

  #[error("failed to compute build key: {message}")]
  Key { message: String },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error(transparent)]
  Vendor(#[from] VendorError),
}

fn display_paths(paths: &[PathBuf]) -> String {
  paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}

fn io_error(context: &Path, e: impl std::fmt::Display) -> PipelineError {
  PipelineError::Io {
    message: format!("{}: {}", context.display(), e),
  }
}

/// A published dependency layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerHandle {
  pub key: ObjectHash,
  pub path: PathBuf,
  pub cached: bool,
}

/// A published final artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHandle {
  pub key: ObjectHash,
  pub path: PathBuf,
  pub binaries: Vec<PathBuf>,
  pub cached: bool,
}

/// Outcome of the standalone verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
  Standalone,
  NotStandalone { references: Vec<PathBuf> },
}

impl Verification {
  /// Scan every binary in `bin_dir` for paths inside `store_root`.
  pub fn scan(bin_dir: &Path, store_root: &Path) -> Result<Self, PipelineError> {
    let references = verify::verify_standalone(bin_dir, store_root).map_err(|e| io_error(bin_dir, e))?;
    if references.is_empty() {
      Ok(Verification::Standalone)
    } else {
      Ok(Verification::NotStandalone { references })
    }
  }

  pub fn passed(&self) -> bool {
    matches!(self, Verification::Standalone)
  }

  fn into_result(self, target: &ResolvedTarget) -> Result<Self, PipelineError> {
    match self {
      Verification::Standalone => Ok(self),
      Verification::NotStandalone { references } => {
        warn!(target = %target.id(), references = references.len(), "artifact is not standalone");
        Err(PipelineError::NonStandaloneArtifact {
          target: target.id().to_string(),
          references,
        })
      }
    }
  }
}

/// The result of building one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArtifact {
  pub target: String,
  pub dependencies: LayerHandle,
  pub artifact: ArtifactHandle,
  pub verification: Verification,
}

/// Per-target result of a matrix build.
#[derive(Debug)]
pub struct TargetResult {
  pub target: ResolvedTarget,
  pub result: Result<BuildArtifact, PipelineError>,
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum Outcome<'a> {
  Built { artifact: &'a BuildArtifact },
  Failed { error: String },
}

#[derive(Serialize)]
struct TargetResultRepr<'a> {
  target: &'a ResolvedTarget,
  #[serde(flatten)]
  outcome: Outcome<'a>,
}

impl Serialize for TargetResult {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let outcome = match &self.result {
      Ok(artifact) => Outcome::Built { artifact },
      Err(e) => Outcome::Failed { error: e.to_string() },
    };
    TargetResultRepr {
      target: &self.target,
      outcome,
    }
    .serialize(serializer)
  }
}

/// Everything one invocation produced.
#[derive(Debug, Serialize)]
pub struct MatrixReport {
  pub vendor: VendorCacheEntry,
  pub results: Vec<TargetResult>,
}

impl MatrixReport {
  pub fn succeeded(&self) -> impl Iterator<Item = &BuildArtifact> {
    self.results.iter().filter_map(|r| r.result.as_ref().ok())
  }

  pub fn failed(&self) -> impl Iterator<Item = (&ResolvedTarget, &PipelineError)> {
    self.results.iter().filter_map(|r| r.result.as_ref().err().map(|e| (&r.target, e)))
  }

  pub fn is_success(&self) -> bool {
    self.results.iter().all(|r| r.result.is_ok())
  }
}

#[derive(Serialize)]
struct DependencyLayerInputs<'a> {
  toolchain_target_id: &'a str,
  vendor_key: &'a ObjectHash,
  manifest_hash: &'a ContentHash,
  extras: &'a PlatformExtras,
}

impl Hashable for DependencyLayerInputs<'_> {}

#[derive(Serialize)]
struct ArtifactInputs<'a> {
  dependency_layer: &'a ObjectHash,
  source_hash: &'a ContentHash,
}

impl Hashable for ArtifactInputs<'_> {}

/// Key of the dependency layer of `target`.
pub fn dependency_layer_key(
  target: &ResolvedTarget,
  vendor_key: &ObjectHash,
  project: &SourceProject,
  extras: &PlatformExtras,
) -> Result<ObjectHash, PipelineError> {
  DependencyLayerInputs {
    toolchain_target_id: &target.toolchain_target_id,
    vendor_key,
    manifest_hash: &project.manifest_hash,
    extras,
  }
  .compute_hash()
  .map_err(|e| PipelineError::Key { message: e.to_string() })
}

/// Key of the final artifact built on `layer_key`.
pub fn artifact_key(layer_key: &ObjectHash, project: &SourceProject) -> Result<ObjectHash, PipelineError> {
  ArtifactInputs {
    dependency_layer: layer_key,
    source_hash: &project.source_hash,
  }
  .compute_hash()
  .map_err(|e| PipelineError::Key { message: e.to_string() })
}

/// Drives builds against a store through a backend.
pub struct Pipeline<B> {
  store: Store,
  backend: Arc<B>,
  parallelism: usize,
  platform_rules: Arc<[PlatformRule]>,
}

impl<B> Clone for Pipeline<B> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      backend: Arc::clone(&self.backend),
      parallelism: self.parallelism,
      platform_rules: Arc::clone(&self.platform_rules),
    }
  }
}

impl<B: BuildBackend> Pipeline<B> {
  pub fn new(store: Store, backend: B) -> Self {
    Self {
      store,
      backend: Arc::new(backend),
      parallelism: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
      platform_rules: Arc::from(Vec::new()),
    }
  }

  /// Maximum number of targets built at once. Clamped to at least one.
  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  pub fn with_platform_rules(mut self, rules: Vec<PlatformRule>) -> Self {
    self.platform_rules = Arc::from(rules);
    self
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn parallelism(&self) -> usize {
    self.parallelism
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  /// Build `target`, reusing cached phases where possible.
  pub async fn build(
    &self,
    target: &ResolvedTarget,
    toolchain: &ToolchainConfig,
    vendor: &VendorCacheEntry,
    project: &SourceProject,
    cancel: &Cancellation,
  ) -> Result<BuildArtifact, PipelineError> {
    let extras = PlatformExtras::collect(&self.platform_rules, target.id());
    let request = BuildRequest {
      target,
      toolchain,
      vendor,
      project,
      extras: &extras,
    };

    check_cancelled(target, cancel)?;
    let dependencies = self.dependency_layer(&request, cancel).await?;

    // A cancelled dependency phase never starts the artifact phase
    check_cancelled(target, cancel)?;
    let (artifact, verification) = self.final_artifact(&request, &dependencies, cancel).await?;

    info!(
      target = %target.id(),
      deps_cached = dependencies.cached,
      artifact_cached = artifact.cached,
      binaries = artifact.binaries.len(),
      "target built"
    );

    Ok(BuildArtifact {
      target: target.id().to_string(),
      dependencies,
      artifact,
      verification,
    })
  }

  async fn dependency_layer(
    &self,
    request: &BuildRequest<'_>,
    cancel: &Cancellation,
  ) -> Result<LayerHandle, PipelineError> {
    let target = request.target;
    let key = dependency_layer_key(target, &request.vendor.key, request.project, request.extras)?;

    if let Some(path) = self.store.lookup(EntryKind::Deps, &key) {
      debug!(target = %target.id(), key = %key, "dependency layer cache hit");
      return Ok(LayerHandle { key, path, cached: true });
    }

    info!(target = %target.id(), key = %key, "phase 1: building dependency layer");
    let staging = self.store.stage(EntryKind::Deps)?;

    let built = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(cancelled(target)),
      result = self.backend.build_dependencies(request, staging.path()) => result,
    };
    built.map_err(|e| backend_error(target, Phase::Dependencies, e))?;

    let path = publish(&self.store, EntryKind::Deps, &key, staging).await?;
    Ok(LayerHandle { key, path, cached: false })
  }

  async fn final_artifact(
    &self,
    request: &BuildRequest<'_>,
    layer: &LayerHandle,
    cancel: &Cancellation,
  ) -> Result<(ArtifactHandle, Verification), PipelineError> {
    let target = request.target;
    let key = artifact_key(&layer.key, request.project)?;

    if let Some(path) = self.store.lookup(EntryKind::Build, &key) {
      debug!(target = %target.id(), key = %key, "artifact cache hit");
      let verification = Verification::scan(&path.join(BIN_DIR), self.store.root())?.into_result(target)?;
      let binaries = list_binaries(&path)?;
      let handle = ArtifactHandle {
        key,
        path,
        binaries,
        cached: true,
      };
      return Ok((handle, verification));
    }

    info!(target = %target.id(), key = %key, "phase 2: building artifact");
    let staging = self.store.stage(EntryKind::Build)?;
    let work = self.store.stage(EntryKind::Build)?;

    let built = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(cancelled(target)),
      result = self.backend.build_artifact(request, &layer.path, work.path()) => result,
    };
    let produced = built.map_err(|e| backend_error(target, Phase::Artifact, e))?;

    let bin_dir = staging.path().join(BIN_DIR);
    fs::create_dir_all(&bin_dir).map_err(|e| io_error(&bin_dir, e))?;
    for binary in &produced {
      let Some(name) = binary.file_name() else { continue };
      fs::copy(binary, bin_dir.join(name)).map_err(|e| io_error(binary, e))?;
    }
    drop(work);

    let verification = Verification::scan(&bin_dir, self.store.root())?.into_result(target)?;

    let path = publish(&self.store, EntryKind::Build, &key, staging).await?;
    let binaries = list_binaries(&path)?;
    let handle = ArtifactHandle {
      key,
      path,
      binaries,
      cached: false,
    };
    Ok((handle, verification))
  }

  /// Vendor once, configure every target, then build the configured targets
  /// concurrently, at most `parallelism` at a time.
  ///
  /// A vendoring failure aborts the whole invocation. Every other failure is
  /// reported for its target only.
  pub async fn build_matrix<F: PackageFetcher>(
    &self,
    matrix: &TargetMatrix,
    vendor_cache: &VendorCache<F>,
    lock_set: &DependencyLockSet,
    provider: &impl ToolchainProvider,
    project: &SourceProject,
    cancel: &Cancellation,
  ) -> Result<MatrixReport, PipelineError> {
    let vendor = vendor_cache.vendor(lock_set).await?;
    info!(key = %vendor.key, reused = vendor.reused, targets = matrix.len(), "vendor directory ready");

    let semaphore = Arc::new(Semaphore::new(self.parallelism));
    let mut tasks = JoinSet::new();
    let mut results = Vec::with_capacity(matrix.len());

    for (index, (target, configured)) in configure_matrix(matrix, provider).into_iter().enumerate() {
      let toolchain = match configured {
        Ok(toolchain) => toolchain,
        Err(e) => {
          warn!(target = %target.id(), error = %e, "skipping target");
          results.push(TargetResult {
            target,
            result: Err(e.into()),
          });
          continue;
        }
      };
      // Replaced when the task reports back
      results.push(TargetResult {
        target: target.clone(),
        result: Err(PipelineError::Io {
          message: "build task did not complete".to_string(),
        }),
      });

      let pipeline = self.clone();
      let semaphore = Arc::clone(&semaphore);
      let vendor = vendor.clone();
      let project = project.clone();
      let cancel = cancel.clone();
      tasks.spawn(async move {
        let result = match semaphore.acquire_owned().await {
          Ok(_permit) => pipeline.build(&target, &toolchain, &vendor, &project, &cancel).await,
          Err(e) => Err(PipelineError::Io { message: e.to_string() }),
        };
        (index, TargetResult { target, result })
      });
    }

    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((index, result)) => results[index] = result,
        Err(e) => warn!(error = %e, "build task failed"),
      }
    }

    Ok(MatrixReport {
      vendor,
      results,
    })
  }
}

fn check_cancelled(target: &ResolvedTarget, cancel: &Cancellation) -> Result<(), PipelineError> {
  if cancel.is_cancelled() {
    return Err(cancelled(target));
  }
  Ok(())
}

fn cancelled(target: &ResolvedTarget) -> PipelineError {
  info!(target = %target.id(), "build cancelled");
  PipelineError::Cancelled {
    target: target.id().to_string(),
  }
}

fn backend_error(target: &ResolvedTarget, phase: Phase, e: BackendError) -> PipelineError {
  match e {
    BackendError::Failed { diagnostic } => PipelineError::Compile {
      target: target.id().to_string(),
      phase,
      diagnostic,
    },
    BackendError::Io(e) => PipelineError::Io { message: e.to_string() },
  }
}

async fn publish(
  store: &Store,
  kind: EntryKind,
  key: &ObjectHash,
  staging: tempfile::TempDir,
) -> Result<PathBuf, PipelineError> {
  let store = store.clone();
  let key = key.clone();
  tokio::task::spawn_blocking(move || store.publish(kind, &key, staging))
    .await
    .map_err(|e| PipelineError::Io { message: e.to_string() })?
    .map_err(PipelineError::from)
}

fn list_binaries(entry: &Path) -> Result<Vec<PathBuf>, PipelineError> {
  let bin_dir = entry.join(BIN_DIR);
  let mut binaries = Vec::new();
  let read_dir = fs::read_dir(&bin_dir).map_err(|e| io_error(&bin_dir, e))?;
  for dir_entry in read_dir {
    let dir_entry = dir_entry.map_err(|e| io_error(&bin_dir, e))?;
    binaries.push(dir_entry.path());
  }
  binaries.sort();
  Ok(binaries)
}
