use std::path::Path;

use anyhow::Result;

use crossbuild_lib::platform::platform_triple;

use crate::output::print_stat;
use crate::session::Session;

pub fn cmd_info(config: Option<&Path>) -> Result<()> {
  let session = Session::load(config)?;

  println!("System:");
  print_stat("Detected platform", platform_triple().as_deref().unwrap_or("unsupported"));
  print_stat("Host", &session.host);
  print_stat("Store", &session.store.root().display().to_string());
  let config_state = if session.config_path.exists() { "" } else { " (not found, using defaults)" };
  print_stat("Config", &format!("{}{}", session.config_path.display(), config_state));
  print_stat("Project", &session.loaded.project_root().display().to_string());
  Ok(())
}
