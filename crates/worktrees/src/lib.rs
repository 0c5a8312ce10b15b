//! Safe wrappers over `git worktree` plus a repository scanner.
//!
//! Every path and branch name crossing this crate's boundary is validated
//! before any subprocess is spawned; see [`safety`].

pub mod safety;
pub mod scan;
pub mod service;

mod git;

pub use {
    scan::scan_repos,
    service::{WorktreeService, path_id},
};
