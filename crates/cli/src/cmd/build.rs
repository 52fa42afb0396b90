//! Implementation of `xb build`.
//!
//! Vendors dependencies once, then builds every selected target of the matrix
//! through the two-phase pipeline. Ctrl-C cancels the running builds; nothing
//! half-built is published. The exit status is non-zero if any target failed.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crossbuild_lib::pipeline::{Cancellation, CargoBackend, MatrixReport, Pipeline, SourceProject};
use crossbuild_lib::store_lock::StoreLock;
use crossbuild_lib::vendor::VendorCache;

use crate::output::{format_elapsed, print_cached, print_failure, print_json, print_stat, print_success, truncate_hash};
use crate::session::{Session, runtime};

pub fn cmd_build(config: Option<&Path>, only: &[String], jobs: Option<usize>, json: bool) -> Result<()> {
  let start = Instant::now();
  let session = Session::load(config)?;
  let matrix = session.matrix(only)?;
  let _lock = StoreLock::acquire(&session.store, "build", &matrix.ids()).context("Failed to acquire store lock")?;

  let project_root = session.loaded.project_root();
  let project = SourceProject::load(&project_root).with_context(|| format!("Failed to read project at {}", project_root.display()))?;

  let build_config = &session.loaded.config.build;
  let backend = match &build_config.path {
    Some(path) => CargoBackend::new(path.iter().map(|p| session.loaded.resolve(p)).collect()),
    None => CargoBackend::from_env(),
  };
  let mut pipeline = Pipeline::new(session.store.clone(), backend).with_platform_rules(session.loaded.platform_rules());
  if let Some(parallelism) = jobs.or(build_config.parallelism) {
    pipeline = pipeline.with_parallelism(parallelism);
  }

  let cache = VendorCache::new(session.store.clone(), session.fetcher());
  let lock_set = session.lock_set();
  let provider = session.toolchain_provider();
  let cancel = Cancellation::new();

  info!(targets = matrix.len(), parallelism = pipeline.parallelism(), "starting build");
  let report = runtime()?.block_on(async {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        on_interrupt.cancel();
      }
    });
    pipeline
      .build_matrix(&matrix, &cache, &lock_set, &provider, &project, &cancel)
      .await
  });
  let report = report.context("Build failed")?;

  if json {
    print_json(&report)?;
  } else {
    print_report(&report);
    print_stat("Duration", &format_elapsed(start));
  }

  let failed = report.failed().count();
  if failed > 0 {
    anyhow::bail!("{} of {} targets failed", failed, report.results.len());
  }
  Ok(())
}

fn print_report(report: &MatrixReport) {
  println!();
  let vendor = format!("vendor {}", truncate_hash(&report.vendor.key.0));
  if report.vendor.reused {
    print_cached(&format!("{} (cached)", vendor));
  } else {
    print_success(&vendor);
  }

  for result in &report.results {
    match &result.result {
      Ok(artifact) => {
        let line = format!("{} {}", artifact.target, truncate_hash(&artifact.artifact.key.0));
        if artifact.artifact.cached {
          print_cached(&format!("{} (cached)", line));
        } else {
          print_success(&line);
        }
        for binary in &artifact.artifact.binaries {
          print_stat("binary", &binary.display().to_string());
        }
      }
      Err(e) => print_failure(&format!("{}: {}", result.target.id(), e)),
    }
  }
}
