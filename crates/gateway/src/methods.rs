//! Inbound command dispatch.
//!
//! Each client command maps to a handler; handlers broadcast or send events
//! and also return the effect as the response payload. Every command that
//! names a session id verifies existence first.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use {
    ccmux_common::Error,
    ccmux_protocol::{ErrorShape, ResponseFrame, events},
    ccmux_worktrees::{WorktreeService, scan_repos},
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use crate::{broadcast::broadcast, portscan, state::GatewayState};

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: Value,
    pub conn_id: String,
    pub state: Arc<GatewayState>,
}

pub type MethodResult = Result<Value, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

fn wrap<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(MethodContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

fn shape(e: &Error) -> ErrorShape {
    ErrorShape::new(e.code(), e.to_string())
}

/// Accept either a bare string payload or an object field.
fn str_param(params: &Value, key: &str) -> Option<String> {
    match params {
        Value::String(s) => Some(s.clone()),
        _ => params
            .get(key)
            .and_then(Value::as_str)
            .map(String::from),
    }
}

fn required(params: &Value, key: &str) -> Result<String, ErrorShape> {
    str_param(params, key)
        .ok_or_else(|| ErrorShape::new("INVALID_ARGUMENT", format!("missing parameter: {key}")))
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register_defaults();
        registry
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub async fn dispatch(&self, ctx: MethodContext) -> ResponseFrame {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.conn_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return ResponseFrame::err(
                &request_id,
                ErrorShape::new("INVALID_ARGUMENT", format!("unknown method: {method}")),
            );
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => ResponseFrame::ok(&request_id, payload),
            Err(err) => {
                warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                ResponseFrame::err(&request_id, err)
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn register_defaults(&mut self) {
        self.register("repo:select", wrap(repo_select));
        self.register("repo:scan", wrap(repo_scan));
        self.register("worktree:list", wrap(worktree_list));
        self.register("worktree:create", wrap(worktree_create));
        self.register("worktree:delete", wrap(worktree_delete));
        self.register("session:start", wrap(session_start));
        self.register("session:restore", wrap(session_restore));
        self.register("session:send", wrap(session_send));
        self.register("session:key", wrap(session_key));
        self.register("session:stop", wrap(session_stop));
        self.register("tunnel:start", wrap(tunnel_start));
        self.register("tunnel:stop", wrap(tunnel_stop));
        self.register("ports:scan", wrap(ports_scan));
    }
}

// ── Repo handlers ────────────────────────────────────────────────────────────

async fn repo_select(ctx: MethodContext) -> MethodResult {
    let path = required(&ctx.params, "path")?;
    let allowed = &ctx.state.config.repos.allowed;

    if !allowed.is_empty() && !allowed.iter().any(|a| a == &path) {
        let message = "Repository not in allowed list";
        ctx.state
            .send_event_to(&ctx.conn_id, events::REPO_ERROR, json!({ "message": message }))
            .await;
        return Err(ErrorShape::new("UNAUTHORIZED", message));
    }
    if !WorktreeService::is_repo(&path).await {
        let message = format!("not a Git repository: {path}");
        ctx.state
            .send_event_to(&ctx.conn_id, events::REPO_ERROR, json!({ "message": message }))
            .await;
        return Err(ErrorShape::new("INVALID_ARGUMENT", message));
    }

    ctx.state
        .send_event_to(&ctx.conn_id, events::REPO_SET, json!(path))
        .await;
    push_worktree_list(&ctx, &path).await?;
    Ok(json!({ "path": path }))
}

async fn repo_scan(ctx: MethodContext) -> MethodResult {
    let base_path = required(&ctx.params, "basePath")?;
    ctx.state
        .send_event_to(&ctx.conn_id, events::REPOS_SCANNING, json!({ "status": "start" }))
        .await;

    let fd_bin = ctx.state.config.binaries.fd.clone();
    match scan_repos(&base_path, 3, fd_bin.as_deref()).await {
        Ok(repos) => {
            let payload = serde_json::to_value(&repos).unwrap_or_default();
            ctx.state
                .send_event_to(&ctx.conn_id, events::REPOS_SCANNED, payload.clone())
                .await;
            ctx.state
                .send_event_to(
                    &ctx.conn_id,
                    events::REPOS_SCANNING,
                    json!({ "status": "complete" }),
                )
                .await;
            Ok(payload)
        },
        Err(e) => {
            ctx.state
                .send_event_to(
                    &ctx.conn_id,
                    events::REPOS_SCANNING,
                    json!({ "status": "error", "message": e.to_string() }),
                )
                .await;
            Err(shape(&e))
        },
    }
}

async fn push_worktree_list(ctx: &MethodContext, repo_path: &str) -> Result<Value, ErrorShape> {
    let worktrees = WorktreeService::list(repo_path).await.map_err(|e| shape(&e))?;
    let payload = json!({
        "repoPath": repo_path,
        "worktrees": worktrees,
    });
    ctx.state
        .send_event_to(&ctx.conn_id, events::WORKTREE_LIST, payload.clone())
        .await;
    Ok(payload)
}

// ── Worktree handlers ────────────────────────────────────────────────────────

async fn worktree_list(ctx: MethodContext) -> MethodResult {
    let repo_path = required(&ctx.params, "repoPath")?;
    push_worktree_list(&ctx, &repo_path).await
}

async fn worktree_create(ctx: MethodContext) -> MethodResult {
    let repo_path = required(&ctx.params, "repoPath")?;
    let branch = required(&ctx.params, "branchName")?;
    let base_branch = str_param(&ctx.params, "baseBranch");

    match WorktreeService::create(&repo_path, &branch, base_branch.as_deref()).await {
        Ok(worktree) => {
            let payload = serde_json::to_value(&worktree).unwrap_or_default();
            broadcast(&ctx.state, events::WORKTREE_CREATED, payload.clone()).await;
            push_worktree_list(&ctx, &repo_path).await?;
            Ok(payload)
        },
        Err(e) => {
            ctx.state
                .send_event_to(
                    &ctx.conn_id,
                    events::WORKTREE_ERROR,
                    json!({ "message": e.to_string() }),
                )
                .await;
            Err(shape(&e))
        },
    }
}

async fn worktree_delete(ctx: MethodContext) -> MethodResult {
    let repo_path = required(&ctx.params, "repoPath")?;
    let worktree_path = required(&ctx.params, "worktreePath")?;

    // A session bound to the worktree is stopped and deleted first; a
    // failure past this point leaves it deleted, matching the user's intent
    // to remove both.
    if let Some(session) = ctx.state.orchestrator.get_by_worktree(&worktree_path).await {
        ctx.state
            .orchestrator
            .stop(&session.id)
            .await
            .map_err(|e| shape(&e))?;
        ctx.state
            .orchestrator
            .registry()
            .delete(&session.id)
            .await
            .map_err(|e| shape(&e))?;
    }

    match WorktreeService::delete(&repo_path, &worktree_path).await {
        Ok(()) => {
            broadcast(
                &ctx.state,
                events::WORKTREE_DELETED,
                json!({ "worktreePath": worktree_path }),
            )
            .await;
            push_worktree_list(&ctx, &repo_path).await?;
            Ok(json!({ "worktreePath": worktree_path }))
        },
        Err(e) => {
            ctx.state
                .send_event_to(
                    &ctx.conn_id,
                    events::WORKTREE_ERROR,
                    json!({ "message": e.to_string() }),
                )
                .await;
            Err(shape(&e))
        },
    }
}

// ── Session handlers ─────────────────────────────────────────────────────────

async fn session_error(ctx: &MethodContext, sid: Option<&str>, error: &Error) {
    broadcast(
        &ctx.state,
        events::SESSION_ERROR,
        json!({ "sid": sid, "message": error.to_string(), "code": error.code() }),
    )
    .await;
}

async fn verify_sid(ctx: &MethodContext, sid: &str) -> Result<(), ErrorShape> {
    if ctx.state.orchestrator.get(sid).await.is_some() {
        return Ok(());
    }
    let e = Error::not_found(format!("session not found: {sid}"));
    session_error(ctx, Some(sid), &e).await;
    Err(shape(&e))
}

async fn session_start(ctx: MethodContext) -> MethodResult {
    let worktree_id = required(&ctx.params, "worktreeId")?;
    let worktree_path = required(&ctx.params, "worktreePath")?;

    match ctx.state.orchestrator.start(&worktree_id, &worktree_path).await {
        Ok(session) => Ok(serde_json::to_value(&session).unwrap_or_default()),
        Err(e) => {
            session_error(&ctx, None, &e).await;
            Err(shape(&e))
        },
    }
}

async fn session_restore(ctx: MethodContext) -> MethodResult {
    let worktree_path = required(&ctx.params, "worktreePath")?;

    match ctx.state.orchestrator.restore(&worktree_path).await {
        Ok(Some(session)) => Ok(serde_json::to_value(&session).unwrap_or_default()),
        Ok(None) => {
            ctx.state
                .send_event_to(
                    &ctx.conn_id,
                    events::SESSION_RESTORE_FAILED,
                    json!({ "worktreePath": worktree_path }),
                )
                .await;
            Err(ErrorShape::new(
                "NOT_FOUND",
                format!("no session to restore for {worktree_path}"),
            ))
        },
        Err(e) => {
            session_error(&ctx, None, &e).await;
            Err(shape(&e))
        },
    }
}

async fn session_send(ctx: MethodContext) -> MethodResult {
    let sid = required(&ctx.params, "sid")?;
    let text = required(&ctx.params, "text")?;
    verify_sid(&ctx, &sid).await?;

    match ctx.state.orchestrator.send(&sid, &text).await {
        Ok(()) => {
            // Transcript: keep the user side of the exchange for replay.
            if let Err(e) = ctx
                .state
                .orchestrator
                .registry()
                .add_message(&sid, "user", &text, "text")
                .await
            {
                debug!(sid = %sid, error = %e, "transcript append skipped");
            }
            Ok(json!({ "sid": sid }))
        },
        Err(e) => {
            session_error(&ctx, Some(&sid), &e).await;
            Err(shape(&e))
        },
    }
}

async fn session_key(ctx: MethodContext) -> MethodResult {
    let sid = required(&ctx.params, "sid")?;
    let key = required(&ctx.params, "key")?;
    verify_sid(&ctx, &sid).await?;

    match ctx.state.orchestrator.send_key(&sid, &key).await {
        Ok(()) => Ok(json!({ "sid": sid })),
        Err(e) => {
            session_error(&ctx, Some(&sid), &e).await;
            Err(shape(&e))
        },
    }
}

async fn session_stop(ctx: MethodContext) -> MethodResult {
    let sid = required(&ctx.params, "sid")?;
    verify_sid(&ctx, &sid).await?;

    match ctx.state.orchestrator.stop(&sid).await {
        Ok(()) => Ok(json!({ "sid": sid })),
        Err(e) => {
            session_error(&ctx, Some(&sid), &e).await;
            Err(shape(&e))
        },
    }
}

// ── Tunnel and ports handlers ────────────────────────────────────────────────

async fn tunnel_start(ctx: MethodContext) -> MethodResult {
    let port = ctx.state.config.server.port;
    match ctx.state.tunnel.start(port).await {
        Ok(url) => Ok(json!({ "url": url })),
        Err(e) => {
            broadcast(
                &ctx.state,
                events::TUNNEL_ERROR,
                json!({ "message": e.to_string() }),
            )
            .await;
            Err(shape(&e))
        },
    }
}

async fn tunnel_stop(ctx: MethodContext) -> MethodResult {
    ctx.state.tunnel.stop().await;
    Ok(json!({}))
}

async fn ports_scan(ctx: MethodContext) -> MethodResult {
    let (start, max) = (
        ctx.state.config.webterm.start_port,
        ctx.state.config.webterm.max_port,
    );
    let leases: Vec<(u16, String)> = ctx
        .state
        .orchestrator
        .all()
        .await
        .into_iter()
        .filter_map(|s| s.gateway_port.map(|p| (p, s.id)))
        .collect();

    let open = portscan::scan_listening(start, max, &leases).await;
    let payload = serde_json::to_value(&open).unwrap_or_default();
    ctx.state
        .send_event_to(&ctx.conn_id, events::PORTS_LIST, payload.clone())
        .await;
    Ok(payload)
}
