use std::path::Path;

use {
    ccmux_common::{Error, InternalContext, Result},
    tokio::process::Command,
};

/// Run `git` with `args` in `dir` and return trimmed stdout.
///
/// Failures surface stderr verbatim; the caller maps well-known cases to
/// user-reportable kinds.
pub(crate) async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .internal_context("failed to run git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not a git repository") {
            return Err(Error::invalid_argument(format!(
                "not a Git repository: {}",
                dir.display()
            )));
        }
        return Err(Error::internal(stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
