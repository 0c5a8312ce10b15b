//! Public-URL tunnel controller wrapping the cloudflared binary.
//!
//! Quick mode asks for an ephemeral URL and parses it from the child's
//! stderr; named mode runs a preconfigured tunnel and waits for its
//! connection registration. Either way the child's exit tears the state
//! down and emits `tunnel:close`.

use std::{
    process::Stdio,
    sync::{Arc, LazyLock},
    time::Duration,
};

use {
    ccmux_common::{Error, Result},
    ccmux_config::TunnelConfig,
    ccmux_protocol::BusEvent,
    nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    },
    regex::Regex,
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        process::Command,
        sync::{RwLock, mpsc},
        time::timeout,
    },
    tracing::{debug, info, warn},
};

const QUICK_TIMEOUT: Duration = Duration::from_secs(30);
const NAMED_TIMEOUT: Duration = Duration::from_secs(60);
const NAMED_READY_MARKER: &str = "Registered tunnel connection";

static QUICK_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("valid url pattern")
});

#[derive(Debug, Clone)]
struct ActiveTunnel {
    pid: u32,
    url: String,
}

pub struct TunnelController {
    bin: String,
    config: TunnelConfig,
    quick_timeout: Duration,
    named_timeout: Duration,
    active: Arc<RwLock<Option<ActiveTunnel>>>,
    events: mpsc::UnboundedSender<BusEvent>,
}

impl TunnelController {
    pub fn new(
        bin: Option<String>,
        config: TunnelConfig,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Self {
        Self {
            bin: bin.unwrap_or_else(|| "cloudflared".into()),
            config,
            quick_timeout: QUICK_TIMEOUT,
            named_timeout: NAMED_TIMEOUT,
            active: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// Override readiness timeouts (tests).
    pub fn with_timeouts(mut self, quick: Duration, named: Duration) -> Self {
        self.quick_timeout = quick;
        self.named_timeout = named;
        self
    }

    /// The public URL of the running tunnel, if any.
    pub async fn url(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|t| t.url.clone())
    }

    /// Start the tunnel (idempotent) and return its public URL.
    pub async fn start(&self, local_port: u16) -> Result<String> {
        if let Some(active) = self.active.read().await.as_ref() {
            return Ok(active.url.clone());
        }
        if which::which(&self.bin).is_err() {
            return Err(Error::TunnelStartFailed(format!(
                "tunnel binary not found: {}",
                self.bin
            )));
        }

        let (mut child, url) = match self.config.name.clone() {
            Some(name) => {
                let url = self.config.url.clone().ok_or_else(|| {
                    Error::TunnelStartFailed(
                        "tunnel.url must be configured for a named tunnel".into(),
                    )
                })?;
                self.spawn(&["tunnel", "run", &name], self.named_timeout, |line| {
                    line.contains(NAMED_READY_MARKER).then(|| url.clone())
                })
                .await?
            },
            None => {
                let target = format!("http://127.0.0.1:{local_port}");
                self.spawn(&["tunnel", "--url", &target], self.quick_timeout, |line| {
                    QUICK_URL.find(line).map(|m| m.as_str().to_string())
                })
                .await?
            },
        };

        let pid = child.id().unwrap_or_default();
        *self.active.write().await = Some(ActiveTunnel {
            pid,
            url: url.clone(),
        });
        info!(url = %url, pid, "tunnel established");
        let _ = self.events.send(BusEvent::TunnelStarted { url: url.clone() });

        // Exit watcher: clear state and notify when the child dies.
        let active = Arc::clone(&self.active);
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!(status = ?status.as_ref().ok(), "tunnel child exited");
            *active.write().await = None;
            let _ = events.send(BusEvent::TunnelClosed);
        });

        Ok(url)
    }

    /// Spawn the child and scan stderr until `extract` yields the URL.
    async fn spawn(
        &self,
        args: &[&str],
        ready_timeout: Duration,
        extract: impl Fn(&str) -> Option<String>,
    ) -> Result<(tokio::process::Child, String)> {
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TunnelStartFailed(format!("failed to spawn tunnel: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::TunnelStartFailed("tunnel stderr unavailable".into()))?;
        let mut lines = BufReader::new(stderr).lines();

        let url = timeout(ready_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "cloudflared");
                if let Some(url) = extract(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await;

        match url {
            Ok(Some(url)) => {
                // Keep draining so the child never blocks on a full pipe.
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(line = %line, "cloudflared");
                    }
                });
                Ok((child, url))
            },
            Ok(None) => {
                let _ = child.kill().await;
                Err(Error::TunnelStartFailed(
                    "tunnel exited before becoming ready".into(),
                ))
            },
            Err(_) => {
                let _ = child.kill().await;
                Err(Error::TunnelStartFailed(format!(
                    "tunnel did not become ready within {ready_timeout:?}"
                )))
            },
        }
    }

    /// Stop the tunnel child; the exit watcher clears the record.
    pub async fn stop(&self) {
        let Some(active) = self.active.read().await.clone() else {
            return;
        };
        if active.pid != 0
            && let Err(e) = kill(Pid::from_raw(active.pid as i32), Signal::SIGTERM)
        {
            warn!(pid = active.pid, error = %e, "failed to signal tunnel child");
        }
        let _ = self.events.send(BusEvent::TunnelStopped);
    }
}
