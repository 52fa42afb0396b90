//! Rendering a `CrossEnvironment` as a sourceable shell script.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::toolchain::CrossEnvironment;

/// Supported shell types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
  Bash,
  Zsh,
  Fish,
  PowerShell,
  Sh,
}

impl Shell {
  /// Detect the current shell from `$SHELL`, falling back to the platform
  /// default.
  pub fn detect() -> Self {
    if let Ok(shell) = env::var("SHELL") {
      let name = PathBuf::from(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
      return name.parse().unwrap_or(Shell::Sh);
    }

    if cfg!(windows) { Shell::PowerShell } else { Shell::Sh }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Shell::Bash => "bash",
      Shell::Zsh => "zsh",
      Shell::Fish => "fish",
      Shell::PowerShell => "powershell",
      Shell::Sh => "sh",
    }
  }

  /// Statement setting `name` to the literal `value`.
  pub fn export_var(&self, name: &str, value: &str) -> String {
    match self {
      Shell::Fish => format!("set -gx {} {}", name, single_quote(value, "\\'")),
      Shell::PowerShell => format!("$env:{} = {}", name, single_quote(value, "''")),
      Shell::Bash | Shell::Zsh | Shell::Sh => format!("export {}={}", name, single_quote(value, "'\\''")),
    }
  }

  pub fn comment(&self, text: &str) -> String {
    format!("# {}", text)
  }

  pub fn header(&self) -> &'static str {
    match self {
      Shell::Bash => "#!/usr/bin/env bash",
      Shell::Zsh => "#!/usr/bin/env zsh",
      Shell::Fish => "# Fish shell environment",
      Shell::PowerShell => "# PowerShell environment",
      Shell::Sh => "#!/bin/sh",
    }
  }

  /// A complete script exporting every variable of `environment`.
  pub fn render(&self, environment: &CrossEnvironment, targets: &[&str]) -> String {
    let mut lines = vec![
      self.header().to_string(),
      self.comment(&format!("crossbuild environment for: {}", targets.join(", "))),
    ];
    lines.extend(environment.iter().map(|(name, value)| self.export_var(name, value)));
    lines.push(String::new());
    lines.join("\n")
  }
}

/// Wrap `value` in single quotes, replacing embedded quotes with `escaped`.
fn single_quote(value: &str, escaped: &str) -> String {
  format!("'{}'", value.replace('\'', escaped))
}

impl FromStr for Shell {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let name = s.to_lowercase();
    match name.as_str() {
      "bash" => Ok(Shell::Bash),
      "zsh" => Ok(Shell::Zsh),
      "fish" => Ok(Shell::Fish),
      "sh" | "dash" => Ok(Shell::Sh),
      "pwsh" | "powershell" => Ok(Shell::PowerShell),
      _ if name.contains("zsh") => Ok(Shell::Zsh),
      _ if name.contains("bash") => Ok(Shell::Bash),
      _ if name.contains("fish") => Ok(Shell::Fish),
      _ => Err(format!("unsupported shell '{}'", s)),
    }
  }
}

impl std::fmt::Display for Shell {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
