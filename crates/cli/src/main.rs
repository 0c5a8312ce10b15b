use {
    ccmux_gateway::logs::FileLogLayer,
    clap::Parser,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "ccmux",
    version,
    about = "ccmux — coding-agent sessions in tmux windows, served to the browser"
)]
struct Cli {
    /// Enable the public tunnel and token authentication.
    #[arg(short, long)]
    remote: bool,

    /// Comma-separated allow-list of selectable repository paths.
    #[arg(long, value_name = "CSV")]
    repos: Option<String>,

    /// Address to bind to (overrides config value).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Custom data directory (holds sessions.db).
    #[arg(long, env = "CCMUX_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ccmux_config::discover_and_load();
    if cli.remote {
        config.auth.enabled = true;
    }
    if let Some(repos) = &cli.repos {
        config.repos.allowed = repos
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.data_dir {
        config.server.data_dir = Some(dir);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    let file_layer = FileLogLayer::new(&ccmux_config::logs_dir(&config))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    tracing::info!(version = VERSION, remote = cli.remote, "starting ccmux");
    ccmux_gateway::server::start_gateway(config, VERSION).await
}
