//! Argument validation for everything handed to `git`.
//!
//! Paths are resolved to absolute form and rejected when they contain shell
//! metacharacters; branch names are restricted to a conservative alphabet.
//! Violations fail with `InvalidArgument` before any subprocess is spawned.

use std::path::{Path, PathBuf};

use ccmux_common::{Error, Result};

/// Characters never allowed in a path argument.
const FORBIDDEN_PATH_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '!',
];

/// Resolve `path` to absolute form and reject shell metacharacters.
pub fn validate_path(path: &str) -> Result<PathBuf> {
    if path.trim().is_empty() {
        return Err(Error::invalid_argument("path cannot be empty"));
    }
    if path.contains(FORBIDDEN_PATH_CHARS) {
        return Err(Error::invalid_argument(format!(
            "path contains forbidden characters: {path}"
        )));
    }
    let p = Path::new(path);
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()?.join(p)
    };
    Ok(absolute)
}

/// Validate a branch name: `[A-Za-z0-9._/-]+`, no leading `-`, no `..`.
pub fn validate_branch(branch: &str) -> Result<()> {
    if branch.is_empty() {
        return Err(Error::invalid_argument("branch name cannot be empty"));
    }
    if branch.starts_with('-') {
        return Err(Error::invalid_argument(format!(
            "branch name cannot start with '-': {branch}"
        )));
    }
    if branch.contains("..") {
        return Err(Error::invalid_argument(format!(
            "branch name cannot contain '..': {branch}"
        )));
    }
    if !branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return Err(Error::invalid_argument(format!(
            "invalid branch name: {branch}"
        )));
    }
    Ok(())
}
