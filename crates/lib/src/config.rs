//! Project configuration (`crossbuild.toml`).
//!
//! ```toml
//! [matrix]
//! targets = ["x86_64-linux", "aarch64-linux", "x86_64-darwin"]
//! cross_families = ["linux"]
//!
//! [vendor]
//! lock_files = ["Cargo.lock"]
//!
//! [[platform]]
//! family = "darwin"
//! link_inputs = ["/opt/sdk/Security.framework"]
//! ```
//!
//! Every section is optional. Relative paths are resolved against the
//! directory containing the configuration file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{CONFIG_ENV, CONFIG_FILENAME};

/// Default crate download endpoint.
pub const DEFAULT_REGISTRY: &str = "https://static.crates.io/crates";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config file '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  pub matrix: MatrixConfig,
  pub toolchain: ToolchainSection,
  pub vendor: VendorConfig,
  pub build: BuildConfig,
  #[serde(rename = "platform")]
  pub platforms: Vec<PlatformRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatrixConfig {
  /// Host platform override; detected when unset.
  pub host: Option<String>,
  /// Requested target platforms.
  pub targets: Vec<String>,
  /// Substrings marking a platform as cross-buildable from this host.
  pub cross_families: Vec<String>,
}

impl Default for MatrixConfig {
  fn default() -> Self {
    Self {
      host: None,
      targets: vec![
        "x86_64-linux".to_string(),
        "aarch64-linux".to_string(),
        "x86_64-darwin".to_string(),
        "aarch64-darwin".to_string(),
      ],
      cross_families: vec!["linux".to_string()],
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainSection {
  /// Directories searched for compilers before `PATH`.
  pub search_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VendorConfig {
  /// Lock descriptors, in merge precedence order.
  pub lock_files: Vec<PathBuf>,
  /// Base URL crates are downloaded from.
  pub registry: String,
}

impl Default for VendorConfig {
  fn default() -> Self {
    Self {
      lock_files: vec![PathBuf::from("Cargo.lock")],
      registry: DEFAULT_REGISTRY.to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
  /// Project root; defaults to the config file's directory.
  pub project: Option<PathBuf>,
  /// Maximum number of targets built at once; defaults to available CPUs.
  pub parallelism: Option<usize>,
  /// `PATH` handed to the build backend; defaults to the inherited `PATH`.
  pub path: Option<Vec<PathBuf>>,
}

/// Extra native inputs applied to targets whose identifier contains `family`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformRule {
  pub family: String,
  /// Library search directories or frameworks needed at link time.
  pub link_inputs: Vec<PathBuf>,
  /// Tool prefixes whose `bin/` is put on `PATH` during the build.
  pub build_tools: Vec<PathBuf>,
}

impl PlatformRule {
  pub fn matches(&self, platform_id: &str) -> bool {
    !self.family.is_empty() && platform_id.contains(&self.family)
  }
}

/// Native inputs collected from every rule matching one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformExtras {
  pub link_inputs: Vec<PathBuf>,
  pub build_tools: Vec<PathBuf>,
}

impl PlatformExtras {
  /// Extras from every rule matching `platform_id`, in rule order.
  pub fn collect(rules: &[PlatformRule], platform_id: &str) -> Self {
    let mut extras = Self::default();
    for rule in rules.iter().filter(|r| r.matches(platform_id)) {
      extras.link_inputs.extend(rule.link_inputs.iter().cloned());
      extras.build_tools.extend(rule.build_tools.iter().cloned());
    }
    extras
  }

  pub fn is_empty(&self) -> bool {
    self.link_inputs.is_empty() && self.build_tools.is_empty()
  }
}

/// A loaded configuration together with the directory it was read from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
  pub config: Config,
  pub base_dir: PathBuf,
}

impl Config {
  /// Parse a configuration from TOML text.
  pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
    toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load the configuration file at `path`.
  ///
  /// A missing file yields the defaults.
  pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let base_dir = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));

    let config = match fs::read_to_string(path) {
      Ok(content) => Self::from_toml(&content, path)?,
      Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    Ok(LoadedConfig { config, base_dir })
  }

  /// Extras from every `[[platform]]` rule matching `platform_id`, in order.
  pub fn extras_for(&self, platform_id: &str) -> PlatformExtras {
    PlatformExtras::collect(&self.platforms, platform_id)
  }
}

impl LoadedConfig {
  /// Resolve a path from the configuration against its directory.
  pub fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.base_dir.join(path)
    }
  }

  pub fn project_root(&self) -> PathBuf {
    match &self.config.build.project {
      Some(project) => self.resolve(project),
      None => self.base_dir.clone(),
    }
  }

  pub fn lock_files(&self) -> Vec<PathBuf> {
    self.config.vendor.lock_files.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn search_paths(&self) -> Vec<PathBuf> {
    self.config.toolchain.search_paths.iter().map(|p| self.resolve(p)).collect()
  }

  /// `[[platform]]` rules with their paths resolved.
  pub fn platform_rules(&self) -> Vec<PlatformRule> {
    self
      .config
      .platforms
      .iter()
      .map(|rule| PlatformRule {
        family: rule.family.clone(),
        link_inputs: rule.link_inputs.iter().map(|p| self.resolve(p)).collect(),
        build_tools: rule.build_tools.iter().map(|p| self.resolve(p)).collect(),
      })
      .collect()
  }
}

/// Path of the configuration file to use when none is given explicitly.
pub fn default_config_path() -> PathBuf {
  match std::env::var(CONFIG_ENV) {
    Ok(path) if !path.is_empty() => PathBuf::from(path),
    _ => PathBuf::from(CONFIG_FILENAME),
  }
}
