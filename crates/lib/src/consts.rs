//! Crate-wide constants.

/// Application name, used for well-known directories and file names.
pub const APP_NAME: &str = "crossbuild";

/// Number of hex characters kept from a SHA-256 digest for store entry names.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Default configuration file name, looked up in the current directory.
pub const CONFIG_FILENAME: &str = "crossbuild.toml";

/// Marker file written into a store entry once it is complete.
pub const COMPLETE_MARKER: &str = ".crossbuild-complete";

/// Environment variable overriding the store root.
pub const STORE_ENV: &str = "CROSSBUILD_STORE";

/// Environment variable overriding the detected host platform.
pub const HOST_ENV: &str = "CROSSBUILD_HOST";

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "CROSSBUILD_CONFIG";
