use std::path::Path;

use {
    ccmux_common::{Error, Result},
    ccmux_protocol::Worktree,
    tracing::{debug, warn},
};

use crate::{
    git::run_git,
    safety::{validate_branch, validate_path},
};

/// Stable identifier derived from a worktree path (FNV-1a, hex).
#[must_use]
pub fn path_id(path: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in path.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// Safe wrappers over `git worktree` porcelain operations.
pub struct WorktreeService;

impl WorktreeService {
    /// True iff `repo_path` is the working tree of a Git repository.
    pub async fn is_repo(repo_path: &str) -> bool {
        let Ok(path) = validate_path(repo_path) else {
            return false;
        };
        if !path.is_dir() {
            return false;
        }
        matches!(
            run_git(&path, &["rev-parse", "--is-inside-work-tree"]).await,
            Ok(out) if out == "true"
        )
    }

    /// List all worktrees of a repository, main worktree first.
    pub async fn list(repo_path: &str) -> Result<Vec<Worktree>> {
        let path = validate_path(repo_path)?;
        if !path.is_dir() {
            return Err(Error::not_found(format!("path not found: {repo_path}")));
        }
        let out = run_git(&path, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_porcelain(&out))
    }

    /// Create a worktree on a new branch and return its listing entry.
    ///
    /// The destination is `<repoRoot>-<branch>` with `/` in the branch name
    /// flattened to `-`. The branch is created from `base_branch` (default
    /// `HEAD`).
    pub async fn create(
        repo_path: &str,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<Worktree> {
        let path = validate_path(repo_path)?;
        validate_branch(branch)?;
        if let Some(base) = base_branch {
            validate_branch(base)?;
        }

        let root = run_git(&path, &["rev-parse", "--show-toplevel"]).await?;
        let dest = format!("{}-{}", root, branch.replace('/', "-"));
        if Path::new(&dest).exists() {
            return Err(Error::conflict(format!(
                "destination already exists: {dest}"
            )));
        }

        let base = base_branch.unwrap_or("HEAD");
        run_git(&path, &["worktree", "add", "-b", branch, &dest, base]).await?;
        debug!(dest = %dest, branch = %branch, base = %base, "created worktree");

        let list = Self::list(repo_path).await?;
        list.into_iter()
            .find(|w| w.path == dest)
            .ok_or_else(|| Error::internal("created worktree missing from listing"))
    }

    /// Remove a worktree and best-effort delete its branch.
    ///
    /// The main worktree cannot be removed.
    pub async fn delete(repo_path: &str, worktree_path: &str) -> Result<()> {
        let repo = validate_path(repo_path)?;
        let target = validate_path(worktree_path)?;
        let target_str = target.display().to_string();

        let list = Self::list(repo_path).await?;
        let entry = list
            .iter()
            .find(|w| w.path == target_str)
            .ok_or_else(|| Error::not_found(format!("worktree not found: {target_str}")))?;
        if entry.is_main {
            return Err(Error::invalid_argument(
                "cannot delete the main worktree",
            ));
        }
        let branch = entry.branch.clone();

        run_git(&repo, &["worktree", "remove", &target_str, "--force"]).await?;

        if branch != "(detached)" && !branch.is_empty() {
            match run_git(&repo, &["branch", "-D", &branch]).await {
                Ok(_) => debug!(branch = %branch, "deleted worktree branch"),
                Err(e) => warn!(branch = %branch, error = %e, "branch delete skipped"),
            }
        }
        Ok(())
    }
}

/// Parse `git worktree list --porcelain` output.
///
/// The first entry is the main worktree. A `detached` line yields branch
/// `(detached)`; `refs/heads/` is stripped from branch refs.
pub fn parse_porcelain(raw: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut path: Option<String> = None;
    let mut commit = String::new();
    let mut branch: Option<String> = None;
    let mut is_bare = false;
    let mut detached = false;

    let mut flush = |path: &mut Option<String>,
                     commit: &mut String,
                     branch: &mut Option<String>,
                     is_bare: &mut bool,
                     detached: &mut bool,
                     worktrees: &mut Vec<Worktree>| {
        if let Some(p) = path.take() {
            let branch = if *detached {
                "(detached)".to_string()
            } else {
                branch.take().unwrap_or_default()
            };
            worktrees.push(Worktree {
                id: path_id(&p),
                path: p,
                branch,
                commit: std::mem::take(commit),
                is_main: worktrees.is_empty(),
                is_bare: *is_bare,
            });
        }
        *is_bare = false;
        *detached = false;
    };

    for line in raw.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            flush(
                &mut path,
                &mut commit,
                &mut branch,
                &mut is_bare,
                &mut detached,
                &mut worktrees,
            );
            path = Some(p.to_string());
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            commit = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_string());
        } else if line == "bare" {
            is_bare = true;
        } else if line == "detached" {
            detached = true;
        }
    }
    flush(
        &mut path,
        &mut commit,
        &mut branch,
        &mut is_bare,
        &mut detached,
        &mut worktrees,
    );

    worktrees
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::process::Command};

    #[test]
    fn path_id_is_stable_and_distinct() {
        assert_eq!(path_id("/tmp/a"), path_id("/tmp/a"));
        assert_ne!(path_id("/tmp/a"), path_id("/tmp/b"));
        assert_eq!(path_id("/tmp/a").len(), 16);
    }

    #[test]
    fn porcelain_parse_main_linked_detached() {
        let raw = "worktree /repo\n\
                   HEAD 1111111111111111111111111111111111111111\n\
                   branch refs/heads/main\n\
                   \n\
                   worktree /repo-feat-x\n\
                   HEAD 2222222222222222222222222222222222222222\n\
                   branch refs/heads/feat/x\n\
                   \n\
                   worktree /repo-detached\n\
                   HEAD 3333333333333333333333333333333333333333\n\
                   detached\n";
        let list = parse_porcelain(raw);
        assert_eq!(list.len(), 3);
        assert!(list[0].is_main);
        assert_eq!(list[0].branch, "main");
        assert!(!list[1].is_main);
        assert_eq!(list[1].branch, "feat/x");
        assert_eq!(list[1].path, "/repo-feat-x");
        assert_eq!(list[2].branch, "(detached)");
    }

    #[test]
    fn porcelain_parse_bare() {
        let raw = "worktree /repo.git\nbare\n";
        let list = parse_porcelain(raw);
        assert_eq!(list.len(), 1);
        assert!(list[0].is_bare);
    }

    #[test]
    fn porcelain_parse_empty() {
        assert!(parse_porcelain("").is_empty());
    }

    async fn init_test_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "init"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .await
                .unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_is_repo() {
        let dir = init_test_repo().await;
        assert!(WorktreeService::is_repo(dir.path().to_str().unwrap()).await);

        let plain = tempfile::tempdir().unwrap();
        assert!(!WorktreeService::is_repo(plain.path().to_str().unwrap()).await);
        assert!(!WorktreeService::is_repo("/definitely/not/here").await);
    }

    #[tokio::test]
    async fn test_create_list_delete_worktree() {
        let dir = init_test_repo().await;
        let repo = dir.path().to_str().unwrap();

        let wt = WorktreeService::create(repo, "feat/x", None).await.unwrap();
        assert!(wt.path.ends_with("-feat-x"));
        assert_eq!(wt.branch, "feat/x");
        assert!(!wt.is_main);

        let list = WorktreeService::list(repo).await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].is_main);
        assert!(list.iter().any(|w| w.path == wt.path));

        WorktreeService::delete(repo, &wt.path).await.unwrap();
        let list = WorktreeService::list(repo).await.unwrap();
        assert_eq!(list.len(), 1);

        // Branch is gone too.
        let out = Command::new("git")
            .args(["branch", "--list", "feat/x"])
            .current_dir(dir.path())
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());

        // Cleanup the worktree directory left next to the tempdir.
        let _ = std::fs::remove_dir_all(&wt.path);
    }

    #[tokio::test]
    async fn test_create_duplicate_destination_conflicts() {
        let dir = init_test_repo().await;
        let repo = dir.path().to_str().unwrap();

        let wt = WorktreeService::create(repo, "dup", None).await.unwrap();
        let err = WorktreeService::create(repo, "dup", None).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        WorktreeService::delete(repo, &wt.path).await.unwrap();
        let _ = std::fs::remove_dir_all(&wt.path);
    }

    #[tokio::test]
    async fn test_delete_main_worktree_refused() {
        let dir = init_test_repo().await;
        let repo = dir.path().to_str().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let main_path = canonical.to_str().unwrap();

        let err = WorktreeService::delete(repo, main_path).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_injection_branch_spawns_nothing() {
        let dir = init_test_repo().await;
        let repo = dir.path().to_str().unwrap();
        let err = WorktreeService::create(repo, "..; rm -rf /", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        // Repository untouched.
        let list = WorktreeService::list(repo).await.unwrap();
        assert_eq!(list.len(), 1);
    }
}
