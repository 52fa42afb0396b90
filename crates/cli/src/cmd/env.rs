//! Implementation of `xb env`.
//!
//! Prints the merged cross environment of the whole matrix, so a developer
//! shell can build any target with plain `cargo build --target ...`.

use std::path::Path;

use anyhow::Result;

use crossbuild_lib::shell::Shell;
use crossbuild_lib::toolchain::{CrossEnvironment, configure_matrix};

use crate::output::{print_json, print_warning};
use crate::session::Session;

pub fn cmd_env(config: Option<&Path>, shell: Option<Shell>, json: bool) -> Result<()> {
  let session = Session::load(config)?;
  let matrix = session.matrix(&[])?;
  let provider = session.toolchain_provider();

  let mut configured = Vec::new();
  for (target, result) in configure_matrix(&matrix, &provider) {
    match result {
      Ok(toolchain) => configured.push(toolchain),
      Err(e) => print_warning(&format!("Skipping {}: {}", target.id(), e)),
    }
  }

  let environment = CrossEnvironment::merge(&configured);
  if json {
    return print_json(&environment);
  }

  let targets: Vec<&str> = configured.iter().map(|c| c.target.as_str()).collect();
  let shell = shell.unwrap_or_else(Shell::detect);
  print!("{}", shell.render(&environment, &targets));
  Ok(())
}
