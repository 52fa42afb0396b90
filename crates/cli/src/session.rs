//! Configuration, store and host shared by every command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crossbuild_lib::config::{Config, LoadedConfig, default_config_path};
use crossbuild_lib::consts::HOST_ENV;
use crossbuild_lib::matrix::{FamilyAllowList, TargetMatrix, resolve};
use crossbuild_lib::platform::{host_triple, platform_triple};
use crossbuild_lib::store::Store;
use crossbuild_lib::toolchain::SearchPath;
use crossbuild_lib::vendor::{DependencyLockSet, RegistryFetcher};

pub struct Session {
  pub config_path: PathBuf,
  pub loaded: LoadedConfig,
  pub store: Store,
  pub host: String,
}

impl Session {
  pub fn load(config: Option<&Path>) -> Result<Self> {
    let config_path = config.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let loaded = Config::load(&config_path).with_context(|| format!("Failed to load {}", config_path.display()))?;

    // CROSSBUILD_HOST > [matrix] host > detection
    let host = match std::env::var(HOST_ENV) {
      Ok(host) if !host.trim().is_empty() => host_triple(),
      _ => loaded.config.matrix.host.clone().or_else(platform_triple),
    }
    .context("Could not detect the host platform; set [matrix] host or CROSSBUILD_HOST")?;

    let store = Store::open_default();
    debug!(config = ?config_path, host = %host, store = ?store.root(), "session loaded");

    Ok(Self {
      config_path,
      loaded,
      store,
      host,
    })
  }

  /// The configured matrix, narrowed to `only` when non-empty.
  pub fn matrix(&self, only: &[String]) -> Result<TargetMatrix> {
    let matrix_config = &self.loaded.config.matrix;
    let policy = FamilyAllowList::new(&matrix_config.cross_families);
    let mut matrix = resolve(&self.host, &matrix_config.targets, &policy)?;

    if !only.is_empty() {
      let unknown: Vec<&str> = only
        .iter()
        .map(String::as_str)
        .filter(|id| matrix.get(id).is_none())
        .collect();
      if !unknown.is_empty() {
        anyhow::bail!(
          "Not in the target matrix for host {}: {} (available: {})",
          self.host,
          unknown.join(", "),
          matrix.ids().join(", ")
        );
      }
      matrix.retain_ids(only);
    }
    Ok(matrix)
  }

  pub fn toolchain_provider(&self) -> SearchPath {
    SearchPath::with_inherited_path(&self.loaded.search_paths())
  }

  pub fn lock_set(&self) -> DependencyLockSet {
    DependencyLockSet::new(self.loaded.lock_files())
  }

  pub fn fetcher(&self) -> RegistryFetcher {
    RegistryFetcher::new(&self.loaded.config.vendor.registry)
  }
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}
