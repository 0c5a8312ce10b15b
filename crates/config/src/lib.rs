//! Configuration loading, validation, and env substitution.
//!
//! Config files: `ccmux.toml`, `ccmux.yaml`, or `ccmux.json`
//! Searched in `./` then `~/.config/ccmux/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{data_dir, discover_and_load, ensure_runtime_dirs, load_config, logs_dir},
    schema::{
        AuthConfig, BinariesConfig, CcmuxConfig, ReposConfig, ServerConfig, TunnelConfig,
        WebtermConfig,
    },
};
