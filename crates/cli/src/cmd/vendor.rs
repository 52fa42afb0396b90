use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use crossbuild_lib::store_lock::StoreLock;
use crossbuild_lib::vendor::VendorCache;

use crate::output::{format_elapsed, print_cached, print_json, print_stat, print_success, truncate_hash};
use crate::session::{Session, runtime};

pub fn cmd_vendor(config: Option<&Path>, json: bool) -> Result<()> {
  let start = Instant::now();
  let session = Session::load(config)?;
  let _lock = StoreLock::acquire(&session.store, "vendor", &[]).context("Failed to acquire store lock")?;

  let cache = VendorCache::new(session.store.clone(), session.fetcher());
  let lock_set = session.lock_set();
  let entry = runtime()?
    .block_on(cache.vendor(&lock_set))
    .context("Vendoring failed")?;

  if json {
    return print_json(&entry);
  }

  let summary = format!("Vendor directory {}", truncate_hash(&entry.key.0));
  if entry.reused {
    print_cached(&format!("{} (cached)", summary));
  } else {
    print_success(&summary);
  }
  print_stat("Path", &entry.path.display().to_string());
  print_stat("Lock files", &lock_set.descriptors().len().to_string());
  print_stat("Duration", &format_elapsed(start));
  Ok(())
}
