//! Config schema types (server, auth, repos, web terminal, binaries, tunnel).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CcmuxConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub repos: ReposConfig,
    pub webterm: WebtermConfig,
    pub binaries: BinariesConfig,
    pub tunnel: TunnelConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Directory holding `sessions.db`. Defaults to `./data`.
    pub data_dir: Option<PathBuf>,
    /// Directory for log files. Defaults to `./logs`.
    pub logs_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3100,
            data_dir: None,
            logs_dir: None,
        }
    }
}

/// Authentication gate.
///
/// When enabled, non-local requests must present the startup token. Local
/// requests always pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
}

/// Repository selection policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReposConfig {
    /// When non-empty, `repo:select` only accepts these paths.
    pub allowed: Vec<String>,
}

/// Per-session web terminal subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebtermConfig {
    /// Inclusive start of the loopback port range handed to gateways.
    pub start_port: u16,
    /// Inclusive end of the port range.
    pub max_port: u16,
    /// Optional ttyd theme JSON, passed as `-t theme=<value>`.
    pub theme: Option<String>,
}

impl Default for WebtermConfig {
    fn default() -> Self {
        Self {
            start_port: 7681,
            max_port: 7781,
            theme: None,
        }
    }
}

/// External binary overrides. Each falls back to a `$PATH` lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinariesConfig {
    pub tmux: Option<String>,
    pub ttyd: Option<String>,
    pub cloudflared: Option<String>,
    pub fd: Option<String>,
    /// Agent CLI typed into a freshly created window.
    pub agent: String,
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            tmux: None,
            ttyd: None,
            cloudflared: None,
            fd: None,
            agent: "claude".into(),
        }
    }
}

/// Public-URL tunnel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Named tunnel to run. When unset, quick (ephemeral) mode is used.
    pub name: Option<String>,
    /// Public URL of the named tunnel (required with `name`).
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CcmuxConfig::default();
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.server.port, 3100);
        assert!(!cfg.auth.enabled);
        assert!(cfg.repos.allowed.is_empty());
        assert!(cfg.webterm.start_port < cfg.webterm.max_port);
        assert_eq!(cfg.binaries.agent, "claude");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: CcmuxConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [repos]
            allowed = ["/srv/a", "/srv/b"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.repos.allowed.len(), 2);
        assert_eq!(cfg.webterm.start_port, 7681);
    }
}
