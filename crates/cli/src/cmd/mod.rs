mod build;
mod env;
mod info;
mod targets;
mod vendor;

pub use build::cmd_build;
pub use env::cmd_env;
pub use info::cmd_info;
pub use targets::cmd_targets;
pub use vendor::cmd_vendor;
