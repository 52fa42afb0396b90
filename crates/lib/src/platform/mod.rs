pub mod arch;
pub mod os;
pub mod paths;

use arch::Arch;
use os::Os;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::consts::HOST_ENV;

/// Platform identifier combining architecture and OS (e.g., "aarch64-linux")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

/// A platform identifier that the naming convention cannot map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized platform identifier '{0}' (expected '<arch>-<os>', e.g. 'x86_64-linux')")]
pub struct ParsePlatformError(pub String);

impl Platform {
  /// Create a new platform identifier
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the current platform at runtime
  ///
  /// Returns `None` if the OS or architecture is not supported
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// Returns the platform triple string (e.g., "aarch64-darwin")
  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }

  /// The Rust target identifier used for toolchain lookups.
  ///
  /// Linux targets always resolve to the musl ABI so the produced binaries are
  /// statically linked.
  pub fn toolchain_target_id(&self) -> String {
    match self.os {
      Os::Linux => format!("{}-unknown-linux-musl", self.arch),
      Os::MacOs => format!("{}-apple-darwin", self.arch),
      Os::Windows => format!("{}-pc-windows-gnu", self.arch),
    }
  }

  /// Executable prefix of the C cross compiler for this platform
  /// (e.g. `aarch64-unknown-linux-gnu-`).
  pub fn cross_prefix(&self) -> String {
    match self.os {
      Os::Linux => format!("{}-unknown-linux-gnu-", self.arch),
      Os::MacOs => format!("{}-apple-darwin-", self.arch),
      Os::Windows => format!("{}-w64-mingw32-", self.arch),
    }
  }
}

impl FromStr for Platform {
  type Err = ParsePlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let err = || ParsePlatformError(s.to_string());
    let (arch, os) = s.split_once('-').ok_or_else(err)?;
    Ok(Self {
      arch: arch.parse().map_err(|_| err())?,
      os: os.parse().map_err(|_| err())?,
    })
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triple())
  }
}

/// Environment-variable-safe form of a toolchain target id.
///
/// Uppercases and replaces every character outside `[A-Za-z0-9]` with `_`,
/// e.g. `x86_64-unknown-linux-musl` becomes `X86_64_UNKNOWN_LINUX_MUSL`.
pub fn env_key_suffix(toolchain_target_id: &str) -> String {
  toolchain_target_id
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect()
}

/// Returns the platform triple for the current system (e.g., "aarch64-darwin")
///
/// Returns `None` if the current platform is not supported
pub fn platform_triple() -> Option<String> {
  Platform::current().map(|p| p.triple())
}

/// Returns the host platform identifier used for target resolution.
///
/// `CROSSBUILD_HOST` takes precedence over runtime detection.
pub fn host_triple() -> Option<String> {
  match std::env::var(HOST_ENV) {
    Ok(host) if !host.trim().is_empty() => Some(host.trim().to_string()),
    _ => platform_triple(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  fn platform_triple_format() {
    let platform = Platform::new(Arch::Aarch64, Os::MacOs);
    assert_eq!(platform.triple(), "aarch64-darwin");

    let platform = Platform::new(Arch::X86_64, Os::Linux);
    assert_eq!(platform.triple(), "x86_64-linux");
  }

  #[test]
  fn parse_round_trips_through_display() {
    let platform: Platform = "aarch64-linux".parse().unwrap();
    assert_eq!(platform, Platform::new(Arch::Aarch64, Os::Linux));
    assert_eq!(platform.to_string(), "aarch64-linux");
  }

  #[test]
  fn parse_rejects_unknown_identifiers() {
    assert!("mips-linux".parse::<Platform>().is_err());
    assert!("linux".parse::<Platform>().is_err());
    assert!("x86_64-plan9".parse::<Platform>().is_err());
  }

  #[test]
  fn linux_targets_use_static_musl_abi() {
    let platform = Platform::new(Arch::X86_64, Os::Linux);
    assert_eq!(platform.toolchain_target_id(), "x86_64-unknown-linux-musl");
    assert_eq!(platform.cross_prefix(), "x86_64-unknown-linux-gnu-");
  }

  #[test]
  fn darwin_targets_use_apple_vendor() {
    let platform = Platform::new(Arch::Aarch64, Os::MacOs);
    assert_eq!(platform.toolchain_target_id(), "aarch64-apple-darwin");
  }

  #[test]
  fn env_key_suffix_is_uppercase_and_underscored() {
    assert_eq!(env_key_suffix("x86_64-unknown-linux-musl"), "X86_64_UNKNOWN_LINUX_MUSL");
    assert_eq!(env_key_suffix("thumbv7em-none-eabi.hf"), "THUMBV7EM_NONE_EABI_HF");
  }

  #[test]
  #[serial]
  fn host_env_overrides_detection() {
    temp_env::with_var(HOST_ENV, Some("aarch64-linux"), || {
      assert_eq!(host_triple().as_deref(), Some("aarch64-linux"));
    });
  }
}
