//! Shared error taxonomy and utilities used across all ccmux crates.

pub mod error;

pub use error::{Error, InternalContext, Result};
