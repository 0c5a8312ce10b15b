use thiserror::Error;

/// Error taxonomy for the orchestrator.
///
/// Every failure surfaced to a client carries one of these kinds; the wire
/// representation is `code()` plus the `Display` message. Stack traces and
/// debug formatting never leave the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Path or branch validation rejected the input.
    #[error("{0}")]
    InvalidArgument(String),

    /// Missing session, repository, or worktree.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate worktree path or session.
    #[error("{0}")]
    Conflict(String),

    /// The terminal multiplexer binary is not installed.
    #[error("terminal multiplexer (tmux) is not available")]
    MultiplexerUnavailable,

    /// The web-terminal binary is not installed.
    #[error("web terminal (ttyd) is not available")]
    GatewayUnavailable,

    /// The web-terminal child failed to reach readiness.
    #[error("{0}")]
    GatewayStartFailed(String),

    /// The tunnel child failed to reach readiness.
    #[error("{0}")]
    TunnelStartFailed(String),

    /// The port allocator range is fully leased.
    #[error("no free port in the configured range")]
    NoFreePort,

    /// The reverse proxy could not reach the per-session gateway.
    #[error("{0}")]
    UpstreamUnreachable(String),

    /// Auth gate rejection.
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Uncategorized failure; logged in full, surfaced as a generic message.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable wire code for this error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::MultiplexerUnavailable => "MULTIPLEXER_UNAVAILABLE",
            Self::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            Self::GatewayStartFailed(_) => "GATEWAY_START_FAILED",
            Self::TunnelStartFailed(_) => "TUNNEL_START_FAILED",
            Self::NoFreePort => "NO_FREE_PORT",
            Self::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Io(_) | Self::Internal(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Internal-context ergonomics ─────────────────────────────────────────────

/// Collapse a foreign failure into [`Error::Internal`] with a short prefix
/// naming what was being attempted.
///
/// Reserved for errors outside the taxonomy (spawn failures, I/O on
/// subprocess pipes); anything user-reportable gets its own kind instead.
pub trait InternalContext<T> {
    fn internal_context(self, doing: impl Into<String>) -> Result<T>;
}

impl<T, E: std::fmt::Display> InternalContext<T> for std::result::Result<T, E> {
    fn internal_context(self, doing: impl Into<String>) -> Result<T> {
        self.map_err(|source| Error::Internal(format!("{}: {source}", doing.into())))
    }
}
