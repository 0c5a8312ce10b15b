//! Repository scanner: locate directories containing `.git` under a base
//! path, preferring an external fast-find when present.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    ccmux_common::{Error, Result},
    ccmux_protocol::RepoInfo,
    tokio::{process::Command, sync::Semaphore},
    tracing::debug,
};

use crate::{git::run_git, safety::validate_path};

/// Directories never descended into.
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".cache",
    "vendor",
    "__pycache__",
    ".venv",
    "target",
    "dist",
    "build",
];

/// Concurrent directory reads in the fallback walker.
const SCAN_CONCURRENCY: usize = 10;

/// Scan `base_path` for Git repositories up to `max_depth` levels deep.
///
/// Uses `fd` when installed (fast, honors the exclusion set); otherwise a
/// bounded recursive enumeration with the same exclusions, skipping dot
/// directories. Results are sorted by path.
pub async fn scan_repos(
    base_path: &str,
    max_depth: usize,
    fd_bin: Option<&str>,
) -> Result<Vec<RepoInfo>> {
    let base = validate_path(base_path)?;
    if !base.is_dir() {
        return Err(Error::not_found(format!("path not found: {base_path}")));
    }

    let fd = fd_bin
        .map(String::from)
        .or_else(|| which::which("fd").ok().map(|p| p.display().to_string()));

    let mut repo_dirs = match fd {
        Some(fd) => match scan_with_fd(&fd, &base, max_depth).await {
            Ok(dirs) => dirs,
            Err(e) => {
                debug!(error = %e, "fd scan failed, falling back to walker");
                scan_fallback(&base, max_depth).await
            },
        },
        None => scan_fallback(&base, max_depth).await,
    };
    repo_dirs.sort();
    repo_dirs.dedup();

    let mut repos = Vec::with_capacity(repo_dirs.len());
    for dir in repo_dirs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let branch = run_git(&dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap_or_default();
        repos.push(RepoInfo {
            path: dir.display().to_string(),
            name,
            branch,
        });
    }
    Ok(repos)
}

/// Fast path: `fd` locates `.git` entries, exclusions passed through.
async fn scan_with_fd(fd: &str, base: &Path, max_depth: usize) -> Result<Vec<PathBuf>> {
    let depth = (max_depth + 1).to_string();
    let mut cmd = Command::new(fd);
    cmd.args(["--hidden", "--no-ignore", "--max-depth", &depth, "--glob", ".git"]);
    for excluded in EXCLUDED_DIRS {
        cmd.args(["--exclude", excluded]);
    }
    cmd.arg(base);

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::internal(format!("failed to run fd: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::internal(format!("fd scan failed: {stderr}")));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(|line| {
            let p = Path::new(line.trim_end_matches('/'));
            if p.file_name().and_then(|n| n.to_str()) == Some(".git") {
                p.parent().map(Path::to_path_buf)
            } else {
                None
            }
        })
        .collect())
}

/// Fallback: breadth-first enumeration, ≤ `SCAN_CONCURRENCY` directory reads
/// in flight, skipping excluded and dot-prefixed directories.
async fn scan_fallback(base: &Path, max_depth: usize) -> Vec<PathBuf> {
    let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let mut frontier = vec![(base.to_path_buf(), 0usize)];
    let mut repos = Vec::new();

    while !frontier.is_empty() {
        let batch: Vec<_> = frontier
            .drain(..)
            .map(|(dir, depth)| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    read_level(&dir, depth).await
                }
            })
            .collect();

        for result in futures::future::join_all(batch).await.into_iter().flatten() {
            if result.is_repo {
                repos.push(result.dir);
            }
            for sub in result.subdirs {
                if result.depth < max_depth {
                    frontier.push((sub, result.depth + 1));
                }
            }
        }
    }

    repos
}

struct LevelResult {
    dir: PathBuf,
    depth: usize,
    is_repo: bool,
    subdirs: Vec<PathBuf>,
}

async fn read_level(dir: &Path, depth: usize) -> Option<LevelResult> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut is_repo = false;
    let mut subdirs = Vec::new();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == ".git" {
            // Marker may be a directory or (in linked worktrees) a file.
            is_repo = true;
            continue;
        }
        if name.starts_with('.') || EXCLUDED_DIRS.contains(&name.as_ref()) {
            continue;
        }
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            subdirs.push(entry.path());
        }
    }

    Some(LevelResult {
        dir: dir.to_path_buf(),
        depth,
        is_repo,
        subdirs,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::process::Command};

    async fn git_init(dir: &Path) {
        Command::new("git")
            .args(["init", "-b", "main"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finds_nested_repos_sorted() {
        let base = tempfile::tempdir().unwrap();
        let a = base.path().join("alpha");
        let b = base.path().join("nested/beta");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        git_init(&a).await;
        git_init(&b).await;

        let repos = scan_repos(base.path().to_str().unwrap(), 3, None)
            .await
            .unwrap();
        assert_eq!(repos.len(), 2);
        assert!(repos[0].path < repos[1].path);
        assert!(repos.iter().any(|r| r.name == "alpha"));
        assert!(repos.iter().any(|r| r.name == "beta"));
    }

    #[tokio::test]
    async fn respects_max_depth() {
        let base = tempfile::tempdir().unwrap();
        let deep = base.path().join("a/b/c/d/repo");
        std::fs::create_dir_all(&deep).unwrap();
        git_init(&deep).await;

        let repos = scan_fallback(base.path(), 2).await;
        assert!(repos.is_empty());

        let repos = scan_fallback(base.path(), 5).await;
        assert_eq!(repos.len(), 1);
    }

    #[tokio::test]
    async fn skips_excluded_and_dot_dirs() {
        let base = tempfile::tempdir().unwrap();
        for skipped in ["node_modules/pkg", ".hidden/repo", "target/debug"] {
            let dir = base.path().join(skipped);
            std::fs::create_dir_all(&dir).unwrap();
            git_init(&dir).await;
        }
        let kept = base.path().join("kept");
        std::fs::create_dir_all(&kept).unwrap();
        git_init(&kept).await;

        let repos = scan_fallback(base.path(), 3).await;
        assert_eq!(repos.len(), 1);
        assert!(repos[0].ends_with("kept"));
    }

    #[tokio::test]
    async fn missing_base_is_not_found() {
        let err = scan_repos("/definitely/not/here", 3, None).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
