//! Locating compiler executables on the host.

use std::env;
use std::path::PathBuf;

/// Source of compiler executables.
pub trait ToolchainProvider {
  /// Full path of the executable named `name`, if available.
  fn locate(&self, name: &str) -> Option<PathBuf>;

  /// Where `locate` looks, for error messages.
  fn search_description(&self) -> String;
}

/// Searches an ordered list of directories, like `PATH` lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
  dirs: Vec<PathBuf>,
}

impl SearchPath {
  pub fn new(dirs: Vec<PathBuf>) -> Self {
    Self { dirs }
  }

  /// `extra` directories first, followed by the entries of `PATH`.
  pub fn with_inherited_path(extra: &[PathBuf]) -> Self {
    let mut dirs = extra.to_vec();
    if let Some(path) = env::var_os("PATH") {
      dirs.extend(env::split_paths(&path));
    }
    Self { dirs }
  }

  pub fn dirs(&self) -> &[PathBuf] {
    &self.dirs
  }
}

impl ToolchainProvider for SearchPath {
  fn locate(&self, name: &str) -> Option<PathBuf> {
    let cwd = env::current_dir().unwrap_or_default();
    // Per directory so the first match in order wins
    self
      .dirs
      .iter()
      .find_map(|dir| which::which_in(name, Some(dir), &cwd).ok())
  }

  fn search_description(&self) -> String {
    if self.dirs.is_empty() {
      return "an empty search path".to_string();
    }
    let dirs: Vec<_> = self.dirs.iter().map(|d| d.display().to_string()).collect();
    format!("[{}]", dirs.join(", "))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::fake_toolchain;
  use serial_test::serial;
  use tempfile::TempDir;

  #[test]
  fn earlier_directories_win() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let (first, _) = fake_toolchain(&["cc"]);
    let (second, _) = fake_toolchain(&["cc"]);

    let search = SearchPath::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
    let found = search.locate("cc").unwrap();
    assert_eq!(found.parent(), Some(first.path()));
  }

  #[test]
  fn missing_compiler_is_not_found() {
    let (temp, search) = fake_toolchain(&["cc"]);
    assert_eq!(search.locate("aarch64-unknown-linux-gnu-cc"), None);
    assert!(temp.path().join(if cfg!(windows) { "cc.exe" } else { "cc" }).is_file());
  }

  #[cfg(unix)]
  #[test]
  fn non_executable_files_are_skipped() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("cc"), "").unwrap();

    let search = SearchPath::new(vec![temp.path().to_path_buf()]);
    assert_eq!(search.locate("cc"), None);
  }

  #[test]
  #[serial]
  fn inherited_path_follows_extra_dirs() {
    temp_env::with_var("PATH", Some("/usr/bin"), || {
      let search = SearchPath::with_inherited_path(&[PathBuf::from("/opt/cross/bin")]);
      assert_eq!(search.dirs(), &[PathBuf::from("/opt/cross/bin"), PathBuf::from("/usr/bin")]);
    });
  }

  #[test]
  fn description_lists_directories() {
    let search = SearchPath::new(vec![PathBuf::from("/opt/cross/bin")]);
    assert!(search.search_description().contains("/opt/cross/bin"));
    assert_eq!(SearchPath::default().search_description(), "an empty search path");
  }
}
