//! Build backends.
//!
//! The pipeline decides what to build and where the results go; a backend
//! only knows how to run the compiler. `CargoBackend` drives `cargo` in an
//! isolated environment.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::project::SourceProject;
use crate::config::PlatformExtras;
use crate::matrix::ResolvedTarget;
use crate::toolchain::ToolchainConfig;
use crate::vendor::VendorCacheEntry;

/// 1980-01-01T00:00:00Z, the earliest timestamp ZIP can represent.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// Directory of the dependency layer holding cargo's target dir.
pub const LAYER_TARGET_DIR: &str = "target";

/// Everything a backend needs to build one target.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
  pub target: &'a ResolvedTarget,
  pub toolchain: &'a ToolchainConfig,
  pub vendor: &'a VendorCacheEntry,
  pub project: &'a SourceProject,
  pub extras: &'a PlatformExtras,
}

#[derive(Debug, Error)]
pub enum BackendError {
  /// The compiler rejected the build. Holds its diagnostics verbatim.
  #[error("{diagnostic}")]
  Failed { diagnostic: String },

  #[error(transparent)]
  Io(#[from] io::Error),
}

pub trait BuildBackend: Send + Sync + 'static {
  /// Build only the project's dependencies, writing the layer into `out`.
  fn build_dependencies(
    &self,
    request: &BuildRequest<'_>,
    out: &Path,
  ) -> impl Future<Output = Result<(), BackendError>> + Send;

  /// Build the project on top of `deps_layer` using `work` as scratch space.
  /// Returns the produced binaries.
  fn build_artifact(
    &self,
    request: &BuildRequest<'_>,
    deps_layer: &Path,
    work: &Path,
  ) -> impl Future<Output = Result<Vec<PathBuf>, BackendError>> + Send;
}

/// Runs `cargo build --release --offline` per target.
#[derive(Debug, Clone)]
pub struct CargoBackend {
  cargo: PathBuf,
  path: Vec<PathBuf>,
  /// Variables forwarded from the invoking environment (rustup selection).
  forwarded: BTreeMap<String, String>,
}

impl CargoBackend {
  /// A backend whose builds see `path` as their `PATH`.
  pub fn new(path: Vec<PathBuf>) -> Self {
    let mut forwarded = BTreeMap::new();
    for name in ["RUSTUP_HOME", "RUSTUP_TOOLCHAIN"] {
      if let Ok(value) = env::var(name) {
        forwarded.insert(name.to_string(), value);
      }
    }
    if !forwarded.contains_key("RUSTUP_HOME") {
      let home = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE"));
      if let Some(home) = home {
        let rustup_home = PathBuf::from(home).join(".rustup");
        forwarded.insert("RUSTUP_HOME".to_string(), rustup_home.to_string_lossy().into_owned());
      }
    }

    Self {
      cargo: PathBuf::from("cargo"),
      path,
      forwarded,
    }
  }

  /// A backend using the inherited `PATH`.
  pub fn from_env() -> Self {
    let path = env::var_os("PATH").map(|p| env::split_paths(&p).collect()).unwrap_or_default();
    Self::new(path)
  }

  pub fn with_cargo(mut self, cargo: PathBuf) -> Self {
    self.cargo = cargo;
    self
  }

  /// The complete environment of a cargo invocation.
  pub fn environment(&self, request: &BuildRequest<'_>, home: &Path, target_dir: &Path) -> BTreeMap<String, String> {
    let mut vars = self.forwarded.clone();

    let mut path: Vec<PathBuf> = request.extras.build_tools.iter().map(|tool| tool.join("bin")).collect();
    path.extend(self.path.iter().cloned());
    vars.insert("PATH".to_string(), join_paths(&path));

    vars.insert("HOME".to_string(), home.to_string_lossy().into_owned());
    vars.insert("CARGO_HOME".to_string(), home.join("cargo").to_string_lossy().into_owned());
    vars.insert("CARGO_TARGET_DIR".to_string(), target_dir.to_string_lossy().into_owned());
    vars.insert("TMPDIR".to_string(), home.join("tmp").to_string_lossy().into_owned());
    vars.insert("LANG".to_string(), "C".to_string());
    vars.insert("LC_ALL".to_string(), "C".to_string());
    vars.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());

    if !request.extras.link_inputs.is_empty() {
      vars.insert("LIBRARY_PATH".to_string(), join_paths(&request.extras.link_inputs));
    }

    // Keep build-machine paths out of panic locations and debug info. The
    // target dir goes last so code generated into `OUT_DIR` maps to it.
    let remaps = [
      (request.vendor.path.as_path(), "/vendor"),
      (request.project.root.as_path(), "/source"),
      (home, "/home"),
      (target_dir, "/target"),
    ];
    let rustflags: Vec<String> = remaps
      .iter()
      .map(|(from, to)| format!("--remap-path-prefix={}={}", from.display(), to))
      .collect();
    vars.insert("CARGO_ENCODED_RUSTFLAGS".to_string(), rustflags.join("\u{1f}"));

    for (name, value) in &request.toolchain.env {
      vars.insert(name.clone(), value.clone());
    }

    vars
  }

  fn args(&self, request: &BuildRequest<'_>, manifest: &Path) -> Vec<String> {
    let mut args = vec![
      "build".to_string(),
      "--release".to_string(),
      "--offline".to_string(),
      "--target".to_string(),
      request.target.toolchain_target_id.clone(),
      "--manifest-path".to_string(),
      manifest.to_string_lossy().into_owned(),
    ];
    args.extend(request.vendor.cargo_config_args());
    args
  }

  async fn run(&self, request: &BuildRequest<'_>, manifest: &Path, target_dir: &Path) -> Result<(), BackendError> {
    let home = tempfile::tempdir()?;
    fs::create_dir_all(home.path().join("tmp"))?;

    let mut command = Command::new(&self.cargo);
    command
      .args(self.args(request, manifest))
      .current_dir(manifest.parent().unwrap_or(Path::new(".")))
      .env_clear()
      .envs(self.environment(request, home.path(), target_dir))
      .kill_on_drop(true);

    debug!(target = %request.target.id(), manifest = ?manifest, "spawning cargo");
    let output = command.output().await?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      let diagnostic = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
      } else {
        stderr.into_owned()
      };
      return Err(BackendError::Failed { diagnostic });
    }
    Ok(())
  }
}

impl BuildBackend for CargoBackend {
  async fn build_dependencies(&self, request: &BuildRequest<'_>, out: &Path) -> Result<(), BackendError> {
    info!(target = %request.target.id(), "building dependency layer");
    let skeleton = tempfile::tempdir()?;
    write_skeleton(&request.project.root, skeleton.path())?;
    self
      .run(request, &skeleton.path().join("Cargo.toml"), &out.join(LAYER_TARGET_DIR))
      .await
  }

  async fn build_artifact(
    &self,
    request: &BuildRequest<'_>,
    deps_layer: &Path,
    work: &Path,
  ) -> Result<Vec<PathBuf>, BackendError> {
    info!(target = %request.target.id(), "building artifact");
    let target_dir = work.join(LAYER_TARGET_DIR);
    copy_dir(&deps_layer.join(LAYER_TARGET_DIR), &target_dir)?;

    self.run(request, &request.project.manifest_path(), &target_dir).await?;

    let release = target_dir.join(&request.target.toolchain_target_id).join("release");
    Ok(collect_binaries(&release)?)
  }
}

/// Copy the manifests of `project` into `dest`, replacing every source file
/// under `src/` with a stub. Build scripts are kept as they run at
/// dependency build time.
pub fn write_skeleton(project: &Path, dest: &Path) -> io::Result<()> {
  for name in ["Cargo.toml", "Cargo.lock", "build.rs"] {
    let from = project.join(name);
    if from.is_file() {
      fs::copy(&from, dest.join(name))?;
    }
  }

  let src = project.join("src");
  if !src.is_dir() {
    return Ok(());
  }
  for entry in WalkDir::new(&src).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(project).unwrap_or(entry.path());
    let target = dest.join(rel);
    if entry.file_type().is_dir() {
      fs::create_dir_all(&target)?;
    } else if entry.path().extension().is_some_and(|ext| ext == "rs") {
      fs::write(&target, stub_for(rel))?;
    }
  }
  Ok(())
}

fn stub_for(rel: &Path) -> &'static str {
  let is_bin = rel.file_name().is_some_and(|name| name == "main.rs") || rel.components().any(|c| c.as_os_str() == "bin");
  if is_bin { "fn main() {}\n" } else { "" }
}

/// Recursively copy `from` into `to`. A missing `from` yields an empty `to`.
pub fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
  fs::create_dir_all(to)?;
  if !from.exists() {
    return Ok(());
  }
  for entry in WalkDir::new(from) {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
    let target = to.join(rel);
    if entry.file_type().is_dir() {
      fs::create_dir_all(&target)?;
    } else if entry.file_type().is_file() {
      fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

/// Executables directly inside cargo's `release` directory.
pub fn collect_binaries(release: &Path) -> io::Result<Vec<PathBuf>> {
  let mut binaries = Vec::new();
  for entry in fs::read_dir(release)? {
    let entry = entry?;
    if !entry.file_type()?.is_file() {
      continue;
    }
    let path = entry.path();
    let is_binary = match path.extension().and_then(|e| e.to_str()) {
      None => true,
      Some(ext) => ext == "exe",
    };
    let hidden = entry.file_name().to_string_lossy().starts_with('.');
    if is_binary && !hidden {
      binaries.push(path);
    }
  }
  binaries.sort();
  Ok(binaries)
}

fn join_paths(paths: &[PathBuf]) -> String {
  match env::join_paths(paths) {
    Ok(joined) => joined.to_string_lossy().into_owned(),
    Err(_) => paths
      .iter()
      .map(|p| p.to_string_lossy().into_owned())
      .collect::<Vec<_>>()
      .join(if cfg!(windows) { ";" } else { ":" }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::{ContentHash, ObjectHash};
  use tempfile::TempDir;

  struct Fixture {
    target: ResolvedTarget,
    toolchain: ToolchainConfig,
    vendor: VendorCacheEntry,
    project: SourceProject,
    extras: PlatformExtras,
  }

  impl Fixture {
    fn new() -> Self {
      let target = ResolvedTarget::new("aarch64-linux", false);
      let mut env = BTreeMap::new();
      env.insert(
        "CARGO_TARGET_AARCH64_UNKNOWN_LINUX_MUSL_LINKER".to_string(),
        "/opt/cross/aarch64-unknown-linux-gnu-cc".to_string(),
      );
      Self {
        toolchain: ToolchainConfig {
          target: target.id().to_string(),
          toolchain_target_id: target.toolchain_target_id.clone(),
          compiler: PathBuf::from("/opt/cross/aarch64-unknown-linux-gnu-cc"),
          env,
        },
        target,
        vendor: VendorCacheEntry {
          key: ObjectHash("vvvv".to_string()),
          path: PathBuf::from("/store/vendor/vvvv"),
          reused: true,
        },
        project: SourceProject {
          root: PathBuf::from("/work/app"),
          manifest_hash: ContentHash("m".to_string()),
          source_hash: ContentHash("s".to_string()),
        },
        extras: PlatformExtras {
          link_inputs: vec![PathBuf::from("/sdk/lib")],
          build_tools: vec![PathBuf::from("/opt/iconv")],
        },
      }
    }

    fn request(&self) -> BuildRequest<'_> {
      BuildRequest {
        target: &self.target,
        toolchain: &self.toolchain,
        vendor: &self.vendor,
        project: &self.project,
        extras: &self.extras,
      }
    }
  }

  #[test]
  fn environment_is_isolated_and_complete() {
    let fixture = Fixture::new();
    let backend = CargoBackend::new(vec![PathBuf::from("/usr/bin")]);
    let vars = backend.environment(&fixture.request(), Path::new("/scratch"), Path::new("/scratch/target"));

    assert_eq!(
      vars["CARGO_TARGET_AARCH64_UNKNOWN_LINUX_MUSL_LINKER"],
      "/opt/cross/aarch64-unknown-linux-gnu-cc"
    );
    assert_eq!(vars["HOME"], "/scratch");
    assert_eq!(vars["CARGO_TARGET_DIR"], "/scratch/target");
    assert_eq!(vars["SOURCE_DATE_EPOCH"], SOURCE_DATE_EPOCH);
    assert_eq!(vars["LIBRARY_PATH"], "/sdk/lib");
    assert!(vars["PATH"].starts_with("/opt/iconv/bin"));
    assert!(vars["CARGO_ENCODED_RUSTFLAGS"].contains("--remap-path-prefix=/store/vendor/vvvv=/vendor"));
  }

  #[test]
  fn staged_target_dir_is_remapped() {
    let fixture = Fixture::new();
    let backend = CargoBackend::new(Vec::new());
    let target_dir = Path::new("/store/tmp/build-x9Mi3W/target");
    let vars = backend.environment(&fixture.request(), Path::new("/scratch"), target_dir);

    let flags: Vec<&str> = vars["CARGO_ENCODED_RUSTFLAGS"].split('\u{1f}').collect();
    assert_eq!(flags.last(), Some(&"--remap-path-prefix=/store/tmp/build-x9Mi3W/target=/target"));
  }

  #[test]
  fn args_select_target_and_vendor_source() {
    let fixture = Fixture::new();
    let backend = CargoBackend::new(Vec::new());
    let args = backend.args(&fixture.request(), Path::new("/work/app/Cargo.toml"));

    assert_eq!(&args[..3], ["build", "--release", "--offline"]);
    assert!(args.windows(2).any(|w| w[0] == "--target" && w[1] == "aarch64-unknown-linux-musl"));
    assert!(args.iter().any(|a| a.starts_with("source.crates-io.replace-with")));
  }

  #[test]
  fn skeleton_stubs_sources_and_keeps_manifests() {
    let project = TempDir::new().unwrap();
    let root = project.path();
    fs::write(root.join("Cargo.toml"), "[package]\nname = \"app\"\n").unwrap();
    fs::write(root.join("build.rs"), "fn main() {}").unwrap();
    fs::create_dir_all(root.join("src/bin")).unwrap();
    fs::write(root.join("src/main.rs"), "fn main() { app::run() }").unwrap();
    fs::write(root.join("src/lib.rs"), "pub fn run() {}").unwrap();
    fs::write(root.join("src/bin/tool.rs"), "fn main() { todo!() }").unwrap();

    let dest = TempDir::new().unwrap();
    write_skeleton(root, dest.path()).unwrap();

    let read = |p: &str| fs::read_to_string(dest.path().join(p)).unwrap();
    assert_eq!(read("Cargo.toml"), "[package]\nname = \"app\"\n");
    assert_eq!(read("build.rs"), "fn main() {}");
    assert_eq!(read("src/main.rs"), "fn main() {}\n");
    assert_eq!(read("src/bin/tool.rs"), "fn main() {}\n");
    assert_eq!(read("src/lib.rs"), "");
    assert!(!dest.path().join("Cargo.lock").exists());
  }

  #[test]
  fn collects_only_binaries() {
    let release = TempDir::new().unwrap();
    let dir = release.path();
    fs::write(dir.join("app"), "elf").unwrap();
    fs::write(dir.join("app.d"), "deps").unwrap();
    fs::write(dir.join("libapp.rlib"), "rlib").unwrap();
    fs::write(dir.join(".cargo-lock"), "").unwrap();
    fs::create_dir(dir.join("deps")).unwrap();

    assert_eq!(collect_binaries(dir).unwrap(), vec![dir.join("app")]);
  }

  #[test]
  fn copy_dir_of_missing_source_creates_destination() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("out");
    copy_dir(&temp.path().join("missing"), &dest).unwrap();
    assert!(dest.is_dir());
  }
}
