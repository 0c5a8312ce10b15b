//! Terminal Supervisor: the single authority for multiplexer window
//! lifecycle.
//!
//! A window is a detached tmux session named `ccm-<sid>` running on a
//! dedicated tmux server socket. Windows deliberately outlive the
//! orchestrator process; `discover` reattaches to whatever survived a
//! restart.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use {
    ccmux_common::{Error, Result},
    ccmux_protocol::{BusEvent, WINDOW_PREFIX, window_name},
    tokio::{process::Command, sync::RwLock, sync::mpsc},
    tracing::{debug, info, warn},
};

pub mod escape;
pub mod hints;

pub use escape::{escape_send_text, key_token};

/// Default tmux server socket name (isolates orchestrator windows from the
/// user's own tmux server).
pub const DEFAULT_SOCKET: &str = "ccmux";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate an 8-character opaque session id.
#[must_use]
pub fn generate_sid() -> String {
    let id = uuid::Uuid::new_v4();
    id.simple().to_string()[..ccmux_protocol::SID_LEN].to_string()
}

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

/// Supervisor record for one multiplexer window.
#[derive(Debug, Clone)]
pub struct TerminalWindow {
    pub sid: String,
    pub window_name: String,
    pub worktree_path: PathBuf,
    pub created_at: u64,
    pub last_activity: u64,
    pub status: WindowStatus,
}

// ── Supervisor ───────────────────────────────────────────────────────────────

pub struct TmuxSupervisor {
    tmux_bin: String,
    socket: String,
    agent_command: String,
    available: bool,
    windows: RwLock<HashMap<String, TerminalWindow>>,
    events: mpsc::UnboundedSender<BusEvent>,
}

impl TmuxSupervisor {
    /// Create a supervisor. Logs an install hint when tmux is missing; in
    /// that case all mutating operations fail with `MultiplexerUnavailable`.
    pub fn new(
        tmux_bin: Option<String>,
        socket: impl Into<String>,
        agent_command: impl Into<String>,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Self {
        let tmux_bin = tmux_bin.unwrap_or_else(|| "tmux".into());
        let available = which::which(&tmux_bin).is_ok();
        if !available {
            match hints::tmux_install_hint() {
                Some(hint) => warn!(bin = %tmux_bin, "tmux not found; install it with: {hint}"),
                None => warn!(bin = %tmux_bin, "tmux not found and is not supported on this OS"),
            }
        }
        Self {
            tmux_bin,
            socket: socket.into(),
            agent_command: agent_command.into(),
            available,
            windows: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::MultiplexerUnavailable)
        }
    }

    /// Run a tmux command on the supervisor's socket and return trimmed
    /// stdout.
    async fn run_tmux(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.tmux_bin)
            .arg("-L")
            .arg(&self.socket)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::internal(format!("failed to run tmux: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("can't find session")
                || stderr.contains("can't find pane")
                || stderr.contains("can't find window")
                || stderr.contains("no such session")
                || stderr.contains("session not found")
            {
                return Err(Error::not_found(stderr));
            }
            return Err(Error::internal(format!("tmux failed: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create a detached window rooted at `worktree_path` and type the agent
    /// CLI invocation into it.
    ///
    /// `sid` lets the caller revive a previously registered session id;
    /// otherwise a fresh one is generated.
    pub async fn create(&self, worktree_path: &Path, sid: Option<&str>) -> Result<TerminalWindow> {
        self.ensure_available()?;
        let sid = match sid {
            Some(s) => s.to_string(),
            None => generate_sid(),
        };
        let name = window_name(&sid);
        let cwd = worktree_path.display().to_string();

        self.run_tmux(&["new-session", "-d", "-s", &name, "-c", &cwd])
            .await?;

        if !self.agent_command.is_empty() {
            let typed = escape_send_text(&self.agent_command);
            self.run_tmux(&["send-keys", "-t", &name, "-l", &typed])
                .await?;
            self.run_tmux(&["send-keys", "-t", &name, "Enter"]).await?;
        }
        if let Err(e) = self.run_tmux(&["set-option", "-t", &name, "mouse", "on"]).await {
            debug!(window = %name, error = %e, "failed to enable mouse mode");
        }

        let now = now_ms();
        let window = TerminalWindow {
            sid: sid.clone(),
            window_name: name.clone(),
            worktree_path: worktree_path.to_path_buf(),
            created_at: now,
            last_activity: now,
            status: WindowStatus::Running,
        };
        self.windows.write().await.insert(sid.clone(), window.clone());
        info!(sid = %sid, window = %name, cwd = %cwd, "created terminal window");

        let _ = self.events.send(BusEvent::WindowCreated {
            sid,
            window_name: name,
        });
        Ok(window)
    }

    /// Enumerate surviving `ccm-*` windows and reconstruct their records.
    ///
    /// Run once at startup. The working directory is best effort; a window
    /// whose directory vanished is recorded with an empty path.
    pub async fn discover(&self) -> Result<usize> {
        if !self.available {
            return Ok(0);
        }
        let listing = match self
            .run_tmux(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(out) => out,
            // No server running yet means no surviving windows.
            Err(_) => return Ok(0),
        };

        let mut discovered = 0usize;
        for sid in orphan_sids(&listing) {
            let name = window_name(&sid);
            let cwd = self
                .run_tmux(&["display-message", "-p", "-t", &name, "#{pane_current_path}"])
                .await
                .unwrap_or_default();
            if let Err(e) = self.run_tmux(&["set-option", "-t", &name, "mouse", "on"]).await {
                debug!(window = %name, error = %e, "failed to enable mouse mode");
            }

            let now = now_ms();
            let window = TerminalWindow {
                sid: sid.clone(),
                window_name: name.clone(),
                worktree_path: PathBuf::from(cwd),
                created_at: now,
                last_activity: now,
                status: WindowStatus::Running,
            };
            info!(sid = %sid, window = %name, path = %window.worktree_path.display(), "discovered surviving window");
            self.windows.write().await.insert(sid, window);
            discovered += 1;
        }
        Ok(discovered)
    }

    /// Send literal text followed by a line terminator.
    pub async fn send_text(&self, sid: &str, text: &str) -> Result<()> {
        self.ensure_available()?;
        let name = self.window_name_of(sid).await?;
        let escaped = escape_send_text(text);

        let send = async {
            self.run_tmux(&["send-keys", "-t", &name, "-l", &escaped])
                .await?;
            self.run_tmux(&["send-keys", "-t", &name, "Enter"]).await
        };
        match send.await {
            Ok(_) => {
                self.touch(sid).await;
                Ok(())
            },
            Err(e) => {
                self.handle_send_failure(sid, &e).await;
                Err(e)
            },
        }
    }

    /// Send a special key from the interactive-prompt allow list.
    pub async fn send_key(&self, sid: &str, key: &str) -> Result<()> {
        self.ensure_available()?;
        let token = key_token(key)
            .ok_or_else(|| Error::invalid_argument(format!("unsupported key: {key}")))?;
        let name = self.window_name_of(sid).await?;

        match self.run_tmux(&["send-keys", "-t", &name, token]).await {
            Ok(_) => {
                self.touch(sid).await;
                Ok(())
            },
            Err(e) => {
                self.handle_send_failure(sid, &e).await;
                Err(e)
            },
        }
    }

    pub async fn exists(&self, sid: &str) -> bool {
        self.windows.read().await.contains_key(sid)
    }

    pub async fn get(&self, sid: &str) -> Option<TerminalWindow> {
        self.windows.read().await.get(sid).cloned()
    }

    pub async fn get_by_worktree(&self, path: &Path) -> Option<TerminalWindow> {
        self.windows
            .read()
            .await
            .values()
            .find(|w| w.worktree_path == path)
            .cloned()
    }

    pub async fn all(&self) -> Vec<TerminalWindow> {
        let mut windows: Vec<_> = self.windows.read().await.values().cloned().collect();
        windows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        windows
    }

    /// Terminate the external window and drop its record.
    pub async fn kill(&self, sid: &str) -> Result<()> {
        self.ensure_available()?;
        let name = self.window_name_of(sid).await?;
        if let Err(e) = self.run_tmux(&["kill-session", "-t", &name]).await {
            // Already gone externally; still drop the record below.
            debug!(sid = %sid, error = %e, "kill-session failed");
        }
        self.windows.write().await.remove(sid);
        info!(sid = %sid, window = %name, "killed terminal window");
        let _ = self.events.send(BusEvent::WindowStopped {
            sid: sid.to_string(),
        });
        Ok(())
    }

    async fn window_name_of(&self, sid: &str) -> Result<String> {
        self.windows
            .read()
            .await
            .get(sid)
            .map(|w| w.window_name.clone())
            .ok_or_else(|| Error::not_found(format!("session not found: {sid}")))
    }

    async fn touch(&self, sid: &str) {
        if let Some(w) = self.windows.write().await.get_mut(sid) {
            w.last_activity = now_ms();
            w.status = WindowStatus::Running;
        }
    }

    /// A send that failed because the window vanished externally drops the
    /// stale record and marks nothing else; the orchestrator owns the
    /// session-level consequences.
    async fn handle_send_failure(&self, sid: &str, err: &Error) {
        if err.code() == "NOT_FOUND" {
            warn!(sid = %sid, "window vanished externally, dropping record");
            self.windows.write().await.remove(sid);
        }
    }
}

/// Extract session ids from a `list-sessions` listing, keeping only names
/// carrying the orchestrator prefix.
fn orphan_sids(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix(WINDOW_PREFIX))
        .filter(|sid| !sid.is_empty())
        .map(String::from)
        .collect()
}
