use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::CcmuxConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["ccmux.toml", "ccmux.yaml", "ccmux.yml", "ccmux.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<CcmuxConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply environment
/// overrides.
///
/// Search order:
/// 1. `./ccmux.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/ccmux/ccmux.{toml,yaml,yml,json}` (user-global)
///
/// Returns `CcmuxConfig::default()` if no config file is found.
pub fn discover_and_load() -> CcmuxConfig {
    let mut config = if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                CcmuxConfig::default()
            },
        }
    } else {
        debug!("no config file found, using defaults");
        CcmuxConfig::default()
    };
    apply_env_overrides(&mut config);
    config
}

/// Environment overrides applied after file loading.
///
/// `PORT` is the launcher contract for the orchestrator port; the `CCMUX_*`
/// variables override binary paths and directories.
fn apply_env_overrides(config: &mut CcmuxConfig) {
    if let Ok(port) = std::env::var("PORT")
        && let Ok(port) = port.trim().parse::<u16>()
    {
        config.server.port = port;
    }
    if let Ok(bind) = std::env::var("CCMUX_BIND") {
        config.server.bind = bind;
    }
    if let Ok(dir) = std::env::var("CCMUX_DATA_DIR") {
        config.server.data_dir = Some(PathBuf::from(dir));
    }
    if let Ok(dir) = std::env::var("CCMUX_LOGS_DIR") {
        config.server.logs_dir = Some(PathBuf::from(dir));
    }
    if let Ok(bin) = std::env::var("CCMUX_TMUX_BIN") {
        config.binaries.tmux = Some(bin);
    }
    if let Ok(bin) = std::env::var("CCMUX_TTYD_BIN") {
        config.binaries.ttyd = Some(bin);
    }
    if let Ok(bin) = std::env::var("CCMUX_CLOUDFLARED_BIN") {
        config.binaries.cloudflared = Some(bin);
    }
    if let Ok(repos) = std::env::var("CCMUX_REPOS") {
        config.repos.allowed = split_csv(&repos);
    }
}

/// Split a comma-separated list, trimming and dropping empties.
pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    // User-global: ~/.config/ccmux/
    if let Some(dirs) = directories::ProjectDirs::from("", "", "ccmux") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Directory holding the session database.
pub fn data_dir(config: &CcmuxConfig) -> PathBuf {
    config
        .server
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// Directory holding `out.log` and `error.log`.
pub fn logs_dir(config: &CcmuxConfig) -> PathBuf {
    config
        .server
        .logs_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Create `data/` and `logs/` on first run (mode 0755 on Unix).
pub fn ensure_runtime_dirs(config: &CcmuxConfig) -> anyhow::Result<()> {
    for dir in [data_dir(config), logs_dir(config)] {
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&dir, perms)?;
        }
    }
    Ok(())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CcmuxConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
