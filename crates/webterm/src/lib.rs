//! Terminal-Gateway Supervisor: one web-terminal subprocess per session.
//!
//! Each instance is a ttyd child bound to a loopback port, attached to the
//! session's multiplexer window. Readiness is observed on the child's
//! stderr; an exit watcher releases the port and removes the record as soon
//! as the child dies, whether or not we asked it to.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    ccmux_common::{Error, Result},
    ccmux_protocol::BusEvent,
    nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    },
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        process::Command,
        sync::{RwLock, mpsc},
        time::timeout,
    },
    tracing::{debug, info, warn},
};

pub mod ports;

pub use ports::PortAllocator;

/// How long the child has to announce readiness on stderr.
const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(2);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Supervisor record for one running web-terminal child.
#[derive(Debug, Clone)]
pub struct GatewayInstance {
    pub sid: String,
    pub port: u16,
    pub pid: u32,
    pub window_name: String,
    pub started_at: u64,
}

pub struct TtydSupervisor {
    ttyd_bin: String,
    tmux_bin: String,
    tmux_socket: String,
    theme: Option<String>,
    ready_timeout: Duration,
    available: bool,
    ports: Arc<PortAllocator>,
    instances: Arc<RwLock<HashMap<String, GatewayInstance>>>,
    events: mpsc::UnboundedSender<BusEvent>,
}

impl TtydSupervisor {
    pub fn new(
        ttyd_bin: Option<String>,
        tmux_bin: Option<String>,
        tmux_socket: impl Into<String>,
        theme: Option<String>,
        ports: PortAllocator,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Self {
        let ttyd_bin = ttyd_bin.unwrap_or_else(|| "ttyd".into());
        let available = which::which(&ttyd_bin).is_ok();
        if !available {
            warn!(bin = %ttyd_bin, "ttyd not found; web terminals will be unavailable");
        }
        Self {
            ttyd_bin,
            tmux_bin: tmux_bin.unwrap_or_else(|| "tmux".into()),
            tmux_socket: tmux_socket.into(),
            theme,
            ready_timeout: READY_TIMEOUT,
            available,
            ports: Arc::new(ports),
            instances: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Override the readiness timeout (tests).
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// The shared port pool (consulted by the port scanner).
    pub fn port_allocator(&self) -> Arc<PortAllocator> {
        Arc::clone(&self.ports)
    }

    /// Spawn a web terminal for `sid` attached to `window_name`.
    ///
    /// Idempotent: an existing live instance is returned as-is.
    pub async fn start(&self, sid: &str, window_name: &str) -> Result<GatewayInstance> {
        if !self.available {
            return Err(Error::GatewayUnavailable);
        }
        if let Some(existing) = self.instances.read().await.get(sid) {
            return Ok(existing.clone());
        }

        let port = self.ports.acquire(sid)?;
        match self.spawn_child(sid, window_name, port).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.ports.release(port);
                Err(e)
            },
        }
    }

    async fn spawn_child(
        &self,
        sid: &str,
        window_name: &str,
        port: u16,
    ) -> Result<GatewayInstance> {
        let port_str = port.to_string();
        let mut cmd = Command::new(&self.ttyd_bin);
        cmd.args(["--writable", "--interface", "127.0.0.1", "--port", &port_str]);
        if let Some(ref theme) = self.theme {
            cmd.args(["-t", &format!("theme={theme}")]);
        }
        cmd.arg(&self.tmux_bin)
            .args(["-L", &self.tmux_socket, "attach-session", "-t", window_name])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::GatewayStartFailed(format!("failed to spawn ttyd: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::GatewayStartFailed("ttyd stderr unavailable".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        // Wait for the readiness marker on stderr.
        let ready = timeout(self.ready_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(sid, line = %line, "ttyd");
                if line.to_lowercase().contains("listening") {
                    return true;
                }
            }
            false
        })
        .await;

        match ready {
            Ok(true) => {},
            Ok(false) => {
                let _ = child.kill().await;
                return Err(Error::GatewayStartFailed(format!(
                    "ttyd for {sid} exited before becoming ready"
                )));
            },
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::GatewayStartFailed(format!(
                    "ttyd for {sid} did not become ready within {:?}",
                    self.ready_timeout
                )));
            },
        }

        let pid = child.id().unwrap_or_default();
        let instance = GatewayInstance {
            sid: sid.to_string(),
            port,
            pid,
            window_name: window_name.to_string(),
            started_at: now_ms(),
        };
        self.instances
            .write()
            .await
            .insert(sid.to_string(), instance.clone());
        info!(sid, port, pid, window = window_name, "web terminal ready");

        // Exit watcher: the single place that releases the port and removes
        // the record once the child is gone.
        let sid_owned = sid.to_string();
        let instances = Arc::clone(&self.instances);
        let ports = Arc::clone(&self.ports);
        let events = self.events.clone();
        tokio::spawn(async move {
            // Drain on its own task; a grandchild holding the stderr pipe
            // open must not delay exit detection.
            let drain_sid = sid_owned.clone();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(sid = %drain_sid, line = %line, "ttyd");
                }
            });
            let status = child.wait().await;
            debug!(sid = %sid_owned, status = ?status.as_ref().ok(), "ttyd exited");

            if instances.write().await.remove(&sid_owned).is_some() {
                ports.release(port);
                let _ = events.send(BusEvent::GatewayStopped {
                    sid: sid_owned,
                    port,
                });
            } else {
                // Stop already tore the record down; just free the port.
                ports.release(port);
            }
        });

        Ok(instance)
    }

    pub async fn get(&self, sid: &str) -> Option<GatewayInstance> {
        self.instances.read().await.get(sid).cloned()
    }

    pub async fn all(&self) -> Vec<GatewayInstance> {
        let mut all: Vec<_> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    /// Terminate the child: SIGTERM, grace period, then SIGKILL. The exit
    /// watcher removes the record and releases the port.
    pub async fn stop(&self, sid: &str) -> Result<()> {
        let Some(instance) = self.get(sid).await else {
            return Ok(());
        };

        signal_pid(instance.pid, Signal::SIGTERM);
        if self.wait_gone(sid, STOP_GRACE).await {
            return Ok(());
        }

        warn!(sid, pid = instance.pid, "gateway did not exit gracefully, killing");
        signal_pid(instance.pid, Signal::SIGKILL);
        if self.wait_gone(sid, Duration::from_secs(1)).await {
            return Ok(());
        }

        // Unkillable child; drop our bookkeeping anyway.
        if self.instances.write().await.remove(sid).is_some() {
            self.ports.release(instance.port);
            let _ = self.events.send(BusEvent::GatewayStopped {
                sid: sid.to_string(),
                port: instance.port,
            });
        }
        Ok(())
    }

    /// Stop every instance.
    pub async fn cleanup(&self) {
        let sids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for sid in sids {
            if let Err(e) = self.stop(&sid).await {
                warn!(sid = %sid, error = %e, "failed to stop gateway");
            }
        }
    }

    /// Poll until the instance record disappears (removed by the exit
    /// watcher) or the deadline passes.
    async fn wait_gone(&self, sid: &str, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.instances.read().await.get(sid).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.instances.read().await.get(sid).is_none()
    }
}

fn signal_pid(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, signal = %signal, error = %e, "signal delivery failed");
    }
}
