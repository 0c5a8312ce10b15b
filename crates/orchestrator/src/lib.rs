//! Session Orchestrator: composes the terminal supervisor, the web-terminal
//! supervisor, and the registry into one lifecycle API.
//!
//! The two supervisors are the canonical stores (window set, instance set);
//! a `Session` is the on-demand join of a window, its gateway instance, and
//! the registry row. There are no denormalized caches.
//!
//! A per-key async lock serializes `start`/`restore` (keyed by worktree
//! path) and `send`/`send_key`/`stop` (keyed by sid) so no two commands race
//! the supervisors for the same session.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
};

use {
    ccmux_common::{Error, Result},
    ccmux_protocol::{BusEvent, Session, SessionStatus, session_url},
    ccmux_registry::{SessionRegistry, SessionRow},
    ccmux_terminal::{TerminalWindow, TmuxSupervisor, WindowStatus},
    ccmux_webterm::{GatewayInstance, TtydSupervisor},
    tokio::sync::{Mutex, mpsc},
    tracing::{info, warn},
};

/// Map a multiplexer window status to the session status surfaced to
/// clients.
#[must_use]
pub fn map_status(status: WindowStatus) -> SessionStatus {
    match status {
        WindowStatus::Running => SessionStatus::Active,
        WindowStatus::Starting => SessionStatus::Idle,
        WindowStatus::Stopped => SessionStatus::Stopped,
        WindowStatus::Error => SessionStatus::Error,
    }
}

/// Project the join of a window, its gateway instance, and the registry row
/// into the wire `Session`.
#[must_use]
pub fn project(
    window: &TerminalWindow,
    instance: Option<&GatewayInstance>,
    row: Option<&SessionRow>,
) -> Session {
    Session {
        id: window.sid.clone(),
        worktree_id: row.map(|r| r.worktree_id.clone()).unwrap_or_default(),
        worktree_path: window.worktree_path.display().to_string(),
        window_name: window.window_name.clone(),
        gateway_port: instance.map(|i| i.port),
        status: map_status(window.status),
        url: session_url(&window.sid),
        created_at: row
            .map(|r| r.created_at as u64)
            .unwrap_or(window.created_at),
    }
}

pub struct SessionOrchestrator {
    terminal: Arc<TmuxSupervisor>,
    webterm: Arc<TtydSupervisor>,
    registry: SessionRegistry,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: mpsc::UnboundedSender<BusEvent>,
}

impl SessionOrchestrator {
    /// Build the orchestrator and run startup discovery: surviving `ccm-*`
    /// windows become visible through `all()`/`restore` without any events
    /// being emitted proactively.
    pub async fn new(
        terminal: Arc<TmuxSupervisor>,
        webterm: Arc<TtydSupervisor>,
        registry: SessionRegistry,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Result<Self> {
        let discovered = terminal.discover().await?;
        if discovered > 0 {
            info!(count = discovered, "reattached surviving terminal windows");
        }
        Ok(Self {
            terminal,
            webterm,
            registry,
            locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Start (or idempotently return) the session for a worktree.
    pub async fn start(&self, worktree_id: &str, worktree_path: &str) -> Result<Session> {
        let path_lock = self.lock_for(worktree_path).await;
        let _path_guard = path_lock.lock().await;
        let path = Path::new(worktree_path);

        // Reuse a live window; otherwise create one, reviving the stored sid
        // for this path so transcripts stay attached.
        let (window, created_here) = match self.terminal.get_by_worktree(path).await {
            Some(window) => (window, false),
            None => {
                let stored_sid = self
                    .registry
                    .get_by_worktree_path(worktree_path)
                    .await?
                    .map(|row| row.id);
                let window = self.terminal.create(path, stored_sid.as_deref()).await?;
                (window, true)
            },
        };

        let sid_lock = self.lock_for(&window.sid).await;
        let _sid_guard = sid_lock.lock().await;

        if self.webterm.get(&window.sid).await.is_none() {
            if let Err(e) = self.webterm.start(&window.sid, &window.window_name).await {
                // A window we created in this call must not leak; a reused
                // window is left alone.
                if created_here {
                    if let Err(kill_err) = self.terminal.kill(&window.sid).await {
                        warn!(sid = %window.sid, error = %kill_err, "rollback kill failed");
                    }
                }
                return Err(e);
            }
        }

        let row = self.upsert_row(&window, worktree_id, worktree_path).await?;
        let instance = self.webterm.get(&window.sid).await;
        let session = project(&window, instance.as_ref(), Some(&row));
        let _ = self.events.send(BusEvent::SessionCreated(session.clone()));
        Ok(session)
    }

    /// Reattach to a discovered window: bring its gateway back up and emit
    /// `session:restored`. Returns `None` when no window exists for the
    /// path.
    pub async fn restore(&self, worktree_path: &str) -> Result<Option<Session>> {
        let path_lock = self.lock_for(worktree_path).await;
        let _path_guard = path_lock.lock().await;

        let Some(window) = self.terminal.get_by_worktree(Path::new(worktree_path)).await else {
            return Ok(None);
        };

        let sid_lock = self.lock_for(&window.sid).await;
        let _sid_guard = sid_lock.lock().await;

        if self.webterm.get(&window.sid).await.is_none() {
            self.webterm.start(&window.sid, &window.window_name).await?;
        }
        let row = self
            .upsert_row(&window, &window_worktree_id(&window), worktree_path)
            .await?;
        let instance = self.webterm.get(&window.sid).await;
        let session = project(&window, instance.as_ref(), Some(&row));
        let _ = self.events.send(BusEvent::SessionRestored(session.clone()));
        Ok(Some(session))
    }

    /// Send literal text to the session's window.
    pub async fn send(&self, sid: &str, text: &str) -> Result<()> {
        let lock = self.lock_for(sid).await;
        let _guard = lock.lock().await;
        self.deliver(sid, self.terminal.send_text(sid, text).await)
            .await
    }

    /// Send a special key to the session's window.
    pub async fn send_key(&self, sid: &str, key: &str) -> Result<()> {
        let lock = self.lock_for(sid).await;
        let _guard = lock.lock().await;
        self.deliver(sid, self.terminal.send_key(sid, key).await)
            .await
    }

    async fn deliver(&self, sid: &str, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => {
                if self.registry.get_by_id(sid).await?.is_some() {
                    self.registry
                        .update_status(sid, SessionStatus::Active.as_str())
                        .await?;
                }
                Ok(())
            },
            Err(e) => {
                if e.code() == "NOT_FOUND" && self.registry.get_by_id(sid).await?.is_some() {
                    self.registry
                        .update_status(sid, SessionStatus::Error.as_str())
                        .await?;
                }
                Err(e)
            },
        }
    }

    /// Stop the session: gateway down, window killed, registry row marked
    /// stopped. Repeated stops are no-ops and emit nothing.
    pub async fn stop(&self, sid: &str) -> Result<()> {
        let lock = self.lock_for(sid).await;
        let _guard = lock.lock().await;

        let had_window = self.terminal.exists(sid).await;
        let had_instance = self.webterm.get(sid).await.is_some();
        let row = self.registry.get_by_id(sid).await?;
        let row_live = row
            .as_ref()
            .is_some_and(|r| r.status != SessionStatus::Stopped.as_str());

        if !had_window && !had_instance && !row_live {
            return Ok(());
        }

        if had_instance {
            self.webterm.stop(sid).await?;
        }
        if had_window {
            self.terminal.kill(sid).await?;
        }
        if row.is_some() {
            self.registry
                .update_status(sid, SessionStatus::Stopped.as_str())
                .await?;
        }
        info!(sid, "stopped session");
        let _ = self.events.send(BusEvent::SessionStopped {
            sid: sid.to_string(),
        });
        Ok(())
    }

    pub async fn get(&self, sid: &str) -> Option<Session> {
        let window = self.terminal.get(sid).await?;
        let instance = self.webterm.get(sid).await;
        let row = self.registry.get_by_id(sid).await.ok().flatten();
        Some(project(&window, instance.as_ref(), row.as_ref()))
    }

    pub async fn get_by_worktree(&self, worktree_path: &str) -> Option<Session> {
        let window = self
            .terminal
            .get_by_worktree(Path::new(worktree_path))
            .await?;
        let instance = self.webterm.get(&window.sid).await;
        let row = self.registry.get_by_id(&window.sid).await.ok().flatten();
        Some(project(&window, instance.as_ref(), row.as_ref()))
    }

    pub async fn all(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for window in self.terminal.all().await {
            let instance = self.webterm.get(&window.sid).await;
            let row = self.registry.get_by_id(&window.sid).await.ok().flatten();
            sessions.push(project(&window, instance.as_ref(), row.as_ref()));
        }
        sessions
    }

    /// Transcript access for replay.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Stop all gateways. Deliberately does not kill windows: surviving
    /// windows are reattached on the next startup.
    pub async fn cleanup(&self) {
        self.webterm.cleanup().await;
    }

    /// Registry upsert keyed by worktree path: an existing row keeps its sid
    /// and flips to `active`; otherwise a fresh row is inserted.
    async fn upsert_row(
        &self,
        window: &TerminalWindow,
        worktree_id: &str,
        worktree_path: &str,
    ) -> Result<SessionRow> {
        if let Some(existing) = self.registry.get_by_worktree_path(worktree_path).await? {
            if existing.id == window.sid {
                self.registry
                    .update_status(&existing.id, SessionStatus::Active.as_str())
                    .await?;
                return Ok(SessionRow {
                    status: SessionStatus::Active.as_str().to_string(),
                    ..existing
                });
            }
            // The stored sid no longer matches any live window (it was
            // killed externally and a new window took the path). Replace the
            // row; the old transcript goes with it.
            self.registry.delete(&existing.id).await?;
        }

        match self
            .registry
            .create(
                &window.sid,
                worktree_id,
                worktree_path,
                SessionStatus::Active.as_str(),
            )
            .await
        {
            Ok(row) => Ok(row),
            Err(e) if e.code() == "CONFLICT" => self
                .registry
                .get_by_worktree_path(worktree_path)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }
}

/// Restored windows have no client-supplied worktree id; derive one.
fn window_worktree_id(window: &TerminalWindow) -> String {
    format!("wt-{}", window.sid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(sid: &str, status: WindowStatus) -> TerminalWindow {
        TerminalWindow {
            sid: sid.into(),
            window_name: format!("ccm-{sid}"),
            worktree_path: "/tmp/r".into(),
            created_at: 42,
            last_activity: 42,
            status,
        }
    }

    #[test]
    fn status_mapping_table() {
        assert_eq!(map_status(WindowStatus::Running), SessionStatus::Active);
        assert_eq!(map_status(WindowStatus::Starting), SessionStatus::Idle);
        assert_eq!(map_status(WindowStatus::Stopped), SessionStatus::Stopped);
        assert_eq!(map_status(WindowStatus::Error), SessionStatus::Error);
    }

    #[test]
    fn projection_includes_url_and_port() {
        let w = window("a1b2c3d4", WindowStatus::Running);
        let instance = GatewayInstance {
            sid: "a1b2c3d4".into(),
            port: 7681,
            pid: 12345,
            window_name: "ccm-a1b2c3d4".into(),
            started_at: 43,
        };
        let row = SessionRow {
            id: "a1b2c3d4".into(),
            worktree_id: "w1".into(),
            worktree_path: "/tmp/r".into(),
            status: "active".into(),
            created_at: 40,
            updated_at: 41,
        };

        let s = project(&w, Some(&instance), Some(&row));
        assert_eq!(s.url, "/t/a1b2c3d4/");
        assert_eq!(s.gateway_port, Some(7681));
        assert_eq!(s.worktree_id, "w1");
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.created_at, 40);
    }

    #[test]
    fn projection_without_gateway_has_null_port() {
        let w = window("a1b2c3d4", WindowStatus::Running);
        let s = project(&w, None, None);
        assert_eq!(s.gateway_port, None);
        assert_eq!(s.created_at, 42);
        assert!(s.worktree_id.is_empty());
    }
}
