//! Target matrix resolution.
//!
//! Given the host platform and a free-form list of requested platforms, decide
//! which targets this host can build. The host is always built; other
//! platforms are built only when the eligibility policy accepts them.
//! Rejected platforms are dropped without error.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::platform::{Platform, env_key_suffix};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  /// Two platforms normalized to the same environment key. This indicates a
  /// broken naming convention, not bad user input.
  #[error("configuration error: platforms '{first}' and '{second}' both normalize to env key suffix '{suffix}'")]
  Configuration {
    first: String,
    second: String,
    suffix: String,
  },
}

/// A platform requested for building.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetPlatform {
  pub id: String,
  pub is_host: bool,
}

/// A target platform plus the names derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTarget {
  pub platform: TargetPlatform,
  /// Identifier used for toolchain lookups (e.g. `aarch64-unknown-linux-musl`).
  /// Falls back to the raw platform id when the naming convention has no
  /// mapping for it.
  pub toolchain_target_id: String,
  /// Uppercased, underscored `toolchain_target_id`.
  pub env_key_suffix: String,
  /// Parsed platform, `None` when the identifier is not recognized.
  #[serde(skip)]
  pub parsed: Option<Platform>,
}

impl ResolvedTarget {
  pub fn new(id: &str, is_host: bool) -> Self {
    let parsed = id.parse::<Platform>().ok();
    let toolchain_target_id = parsed
      .map(|p| p.toolchain_target_id())
      .unwrap_or_else(|| id.to_string());
    let env_key_suffix = env_key_suffix(&toolchain_target_id);

    Self {
      platform: TargetPlatform {
        id: id.to_string(),
        is_host,
      },
      toolchain_target_id,
      env_key_suffix,
      parsed,
    }
  }

  pub fn id(&self) -> &str {
    &self.platform.id
  }

  pub fn is_host(&self) -> bool {
    self.platform.is_host
  }
}

/// Decides whether a non-host platform may be built from the host.
pub trait Eligibility {
  fn is_eligible(&self, host: &str, candidate: &str) -> bool;
}

impl<F> Eligibility for F
where
  F: Fn(&str, &str) -> bool,
{
  fn is_eligible(&self, host: &str, candidate: &str) -> bool {
    self(host, candidate)
  }
}

/// Accepts platforms whose identifier contains one of the listed kernel
/// families. Only families with packaged cross toolchains belong here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyAllowList {
  families: Vec<String>,
}

impl FamilyAllowList {
  pub fn new<I, S>(families: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      families: families.into_iter().map(Into::into).filter(|f: &String| !f.is_empty()).collect(),
    }
  }

  pub fn families(&self) -> &[String] {
    &self.families
  }
}

impl Default for FamilyAllowList {
  fn default() -> Self {
    Self::new(["linux"])
  }
}

impl Eligibility for FamilyAllowList {
  fn is_eligible(&self, _host: &str, candidate: &str) -> bool {
    self.families.iter().any(|family| candidate.contains(family.as_str()))
  }
}

/// The deduplicated set of targets to build, host first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetMatrix {
  targets: Vec<ResolvedTarget>,
}

impl TargetMatrix {
  pub fn targets(&self) -> &[ResolvedTarget] {
    &self.targets
  }

  pub fn ids(&self) -> Vec<&str> {
    self.targets.iter().map(ResolvedTarget::id).collect()
  }

  pub fn host(&self) -> Option<&ResolvedTarget> {
    self.targets.iter().find(|t| t.is_host())
  }

  pub fn get(&self, id: &str) -> Option<&ResolvedTarget> {
    self.targets.iter().find(|t| t.id() == id)
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }

  /// Keep only the targets whose id is in `ids`.
  pub fn retain_ids(&mut self, ids: &[String]) {
    self.targets.retain(|t| ids.iter().any(|id| id == t.id()));
  }
}

impl<'a> IntoIterator for &'a TargetMatrix {
  type Item = &'a ResolvedTarget;
  type IntoIter = std::slice::Iter<'a, ResolvedTarget>;

  fn into_iter(self) -> Self::IntoIter {
    self.targets.iter()
  }
}

/// Resolve the target matrix for `host`.
///
/// The host is included unconditionally. A requested platform is included if
/// it equals the host or `policy` accepts it; duplicates keep their first
/// occurrence. Fails if two distinct platforms share an env key suffix.
pub fn resolve<S: AsRef<str>>(
  host: &str,
  requested: &[S],
  policy: &impl Eligibility,
) -> Result<TargetMatrix, ResolveError> {
  let host = host.trim();
  let mut targets = vec![ResolvedTarget::new(host, true)];

  for candidate in requested.iter().map(|s| s.as_ref().trim()) {
    if candidate.is_empty() || targets.iter().any(|t| t.id() == candidate) {
      continue;
    }
    if !policy.is_eligible(host, candidate) {
      debug!(platform = %candidate, host = %host, "platform not buildable from host, skipping");
      continue;
    }
    targets.push(ResolvedTarget::new(candidate, false));
  }

  let mut seen: HashMap<&str, &str> = HashMap::new();
  for target in &targets {
    if let Some(first) = seen.insert(&target.env_key_suffix, target.id()) {
      return Err(ResolveError::Configuration {
        first: first.to_string(),
        second: target.id().to_string(),
        suffix: target.env_key_suffix.clone(),
      });
    }
  }

  debug!(targets = ?targets.iter().map(ResolvedTarget::id).collect::<Vec<_>>(), "resolved target matrix");
  Ok(TargetMatrix { targets })
}
