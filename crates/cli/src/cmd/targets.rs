use std::path::Path;

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};

use crate::output::print_json;
use crate::session::Session;

pub fn cmd_targets(config: Option<&Path>, json: bool) -> Result<()> {
  let session = Session::load(config)?;
  let matrix = session.matrix(&[])?;

  if json {
    return print_json(&matrix.targets());
  }

  for target in &matrix {
    let host = if target.is_host() { " (host)" } else { "" };
    println!(
      "{}{}\n  toolchain: {}\n  env suffix: {}",
      target.id().if_supports_color(Stream::Stdout, |s| s.bold()),
      host,
      target.toolchain_target_id,
      target.env_key_suffix
    );
  }
  Ok(())
}
