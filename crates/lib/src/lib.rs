//! crossbuild-lib: cross-compilation pipeline for a single Cargo project.
//!
//! The crate is organised leaf-first, following the data flow of a build:
//! - `matrix`: which target platforms are buildable on this host
//! - `toolchain`: the compiler/linker environment for each target
//! - `vendor`: a content-addressed, single-flight vendor directory cache
//! - `pipeline`: the two-phase build and standalone verification

pub mod config;
pub mod consts;
pub mod matrix;
pub mod pipeline;
pub mod platform;
pub mod shell;
pub mod store;
pub mod store_lock;
pub mod toolchain;
pub mod util;
pub mod vendor;
