//! Per-target toolchain configuration.
//!
//! For every resolved target this derives the C compiler used as linker and
//! the environment variables that point Cargo (and the `cc` crate) at it. The
//! result is a plain value handed to the build; nothing here touches the
//! process environment.

mod provider;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::matrix::{ResolvedTarget, TargetMatrix};

pub use provider::{SearchPath, ToolchainProvider};

/// Tool whose per-target linker variable is emitted (`CARGO_TARGET_<SUFFIX>_LINKER`).
pub const LINKER_TOOL: &str = "CARGO";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolchainError {
  #[error("toolchain unavailable for {target}: {reason}")]
  Unavailable { target: String, reason: String },
}

/// Compiler and environment for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolchainConfig {
  /// Platform identifier this configuration belongs to.
  pub target: String,
  pub toolchain_target_id: String,
  /// C compiler, also used as the linker.
  pub compiler: PathBuf,
  pub env: BTreeMap<String, String>,
}

impl ToolchainConfig {
  pub fn linker_var(&self) -> String {
    linker_var(&self.env_key_suffix())
  }

  fn env_key_suffix(&self) -> String {
    crate::platform::env_key_suffix(&self.toolchain_target_id)
  }
}

fn linker_var(suffix: &str) -> String {
  format!("{}_TARGET_{}_LINKER", LINKER_TOOL, suffix)
}

fn compiler_var(suffix: &str) -> String {
  format!("CC_{}", suffix)
}

/// Derive the toolchain configuration for `target`.
///
/// The host uses the plain `cc`; other targets use their cross prefix
/// (e.g. `aarch64-unknown-linux-gnu-cc`).
pub fn configure(target: &ResolvedTarget, provider: &impl ToolchainProvider) -> Result<ToolchainConfig, ToolchainError> {
  let Some(platform) = target.parsed else {
    return Err(ToolchainError::Unavailable {
      target: target.id().to_string(),
      reason: "no toolchain naming convention for this platform".to_string(),
    });
  };

  let prefix = if target.is_host() {
    String::new()
  } else {
    platform.cross_prefix()
  };
  let executable = format!("{}cc", prefix);

  let compiler = provider.locate(&executable).ok_or_else(|| ToolchainError::Unavailable {
    target: target.id().to_string(),
    reason: format!("'{}' not found in {}", executable, provider.search_description()),
  })?;

  let value = compiler.to_string_lossy().to_string();
  let mut env = BTreeMap::new();
  env.insert(linker_var(&target.env_key_suffix), value.clone());
  env.insert(compiler_var(&target.env_key_suffix), value);

  debug!(target = %target.id(), compiler = ?compiler, "configured toolchain");

  Ok(ToolchainConfig {
    target: target.id().to_string(),
    toolchain_target_id: target.toolchain_target_id.clone(),
    compiler,
    env,
  })
}

/// Configure every target of a matrix. Failures are reported per target.
pub fn configure_matrix(
  matrix: &TargetMatrix,
  provider: &impl ToolchainProvider,
) -> Vec<(ResolvedTarget, Result<ToolchainConfig, ToolchainError>)> {
  matrix
    .targets()
    .iter()
    .map(|target| (target.clone(), configure(target, provider)))
    .collect()
}

/// Environment variables of a whole matrix, for a multi-target dev shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CrossEnvironment {
  vars: BTreeMap<String, String>,
}

impl CrossEnvironment {
  /// Fold the configs left to right; the first value for a name wins.
  pub fn merge<'a, I>(configs: I) -> Self
  where
    I: IntoIterator<Item = &'a ToolchainConfig>,
  {
    let mut vars = BTreeMap::new();
    for config in configs {
      for (name, value) in &config.env {
        vars.entry(name.clone()).or_insert_with(|| value.clone());
      }
    }
    Self { vars }
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.vars.get(name).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.vars.len()
  }

  pub fn is_empty(&self) -> bool {
    self.vars.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::matrix::{FamilyAllowList, resolve};
  use crate::util::testutil::fake_toolchain;
  use proptest::prelude::*;

  #[test]
  fn host_uses_plain_cc() {
    let (_temp, provider) = fake_toolchain(&["cc"]);
    let target = ResolvedTarget::new("x86_64-linux", true);

    let config = configure(&target, &provider).unwrap();
    assert!(config.compiler.ends_with("cc"));
    assert_eq!(config.toolchain_target_id, "x86_64-unknown-linux-musl");
  }

  #[test]
  fn cross_target_uses_prefixed_compiler() {
    let (_temp, provider) = fake_toolchain(&["cc", "aarch64-unknown-linux-gnu-cc"]);
    let target = ResolvedTarget::new("aarch64-linux", false);

    let config = configure(&target, &provider).unwrap();
    let compiler = config.compiler.to_string_lossy().to_string();
    assert!(config.compiler.ends_with("aarch64-unknown-linux-gnu-cc"));
    assert_eq!(config.env.len(), 2);
    assert_eq!(
      config.env.get("CARGO_TARGET_AARCH64_UNKNOWN_LINUX_MUSL_LINKER"),
      Some(&compiler)
    );
    assert_eq!(config.env.get("CC_AARCH64_UNKNOWN_LINUX_MUSL"), Some(&compiler));
    assert_eq!(config.linker_var(), "CARGO_TARGET_AARCH64_UNKNOWN_LINUX_MUSL_LINKER");
  }

  #[test]
  fn missing_compiler_is_unavailable() {
    let (_temp, provider) = fake_toolchain(&["cc"]);
    let target = ResolvedTarget::new("aarch64-linux", false);

    let err = configure(&target, &provider).unwrap_err();
    let ToolchainError::Unavailable { target, reason } = err;
    assert_eq!(target, "aarch64-linux");
    assert!(reason.contains("aarch64-unknown-linux-gnu-cc"));
  }

  #[test]
  fn unmapped_platform_is_unavailable() {
    let (_temp, provider) = fake_toolchain(&["cc"]);
    let target = ResolvedTarget::new("riscv64-linux", false);
    assert!(matches!(
      configure(&target, &provider),
      Err(ToolchainError::Unavailable { .. })
    ));
  }

  #[test]
  fn matrix_failures_are_per_target() {
    let (_temp, provider) = fake_toolchain(&["cc"]);
    let matrix = resolve("x86_64-linux", &["aarch64-linux"], &FamilyAllowList::default()).unwrap();

    let results = configure_matrix(&matrix, &provider);
    assert_eq!(results.len(), 2);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_err());
  }

  #[test]
  fn cross_environment_is_left_biased() {
    let first = ToolchainConfig {
      target: "a".to_string(),
      toolchain_target_id: "a".to_string(),
      compiler: PathBuf::from("/a/cc"),
      env: BTreeMap::from([
        ("SHARED".to_string(), "first".to_string()),
        ("ONLY_A".to_string(), "a".to_string()),
      ]),
    };
    let second = ToolchainConfig {
      target: "b".to_string(),
      toolchain_target_id: "b".to_string(),
      compiler: PathBuf::from("/b/cc"),
      env: BTreeMap::from([
        ("SHARED".to_string(), "second".to_string()),
        ("ONLY_B".to_string(), "b".to_string()),
      ]),
    };

    let env = CrossEnvironment::merge([&first, &second]);
    assert_eq!(env.get("SHARED"), Some("first"));
    assert_eq!(env.get("ONLY_A"), Some("a"));
    assert_eq!(env.get("ONLY_B"), Some("b"));
    assert_eq!(env.len(), 3);
  }

  #[test]
  fn cross_environment_covers_every_target() {
    let (_temp, provider) = fake_toolchain(&["cc", "aarch64-unknown-linux-gnu-cc"]);
    let matrix = resolve("x86_64-linux", &["aarch64-linux"], &FamilyAllowList::default()).unwrap();
    let configs: Vec<_> = configure_matrix(&matrix, &provider)
      .into_iter()
      .filter_map(|(_, r)| r.ok())
      .collect();

    let env = CrossEnvironment::merge(&configs);
    assert_eq!(env.len(), 4);
    assert!(env.get("CC_X86_64_UNKNOWN_LINUX_MUSL").is_some());
    assert!(env.get("CARGO_TARGET_AARCH64_UNKNOWN_LINUX_MUSL_LINKER").is_some());
  }

  fn is_env_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
  }

  proptest! {
    #[test]
    fn env_names_are_uppercase_identifiers(id in "[a-z0-9_.+-]{1,12}-linux", is_host in any::<bool>()) {
      let (_temp, provider) = fake_toolchain(&[]);
      let target = ResolvedTarget::new(&id, is_host);
      prop_assert!(is_env_name(&target.env_key_suffix));
      prop_assert!(is_env_name(&linker_var(&target.env_key_suffix)));
      prop_assert!(is_env_name(&compiler_var(&target.env_key_suffix)));
      if let Ok(config) = configure(&target, &provider) {
        for name in config.env.keys() {
          prop_assert!(is_env_name(name));
        }
      }
    }
  }

  #[test]
  fn configured_names_for_known_platforms_are_uppercase() {
    let (_temp, provider) = fake_toolchain(&[
      "cc",
      "aarch64-unknown-linux-gnu-cc",
      "x86_64-apple-darwin-cc",
      "aarch64-apple-darwin-cc",
    ]);
    for id in ["aarch64-linux", "x86_64-darwin", "aarch64-darwin"] {
      let config = configure(&ResolvedTarget::new(id, false), &provider).unwrap();
      assert!(config.env.keys().all(|name| is_env_name(name)), "{:?}", config.env);
    }
  }
}
