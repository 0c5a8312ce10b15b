//! Static asset serving: filesystem (dev) or embedded (release), plus the
//! SPA entry fallback.

use std::{path::PathBuf, sync::LazyLock};

use {
    axum::{
        extract::Path,
        http::{StatusCode, Uri, header},
        response::{Html, IntoResponse, Response},
    },
    tracing::info,
};

static ASSETS: include_dir::Dir = include_dir::include_dir!("$CARGO_MANIFEST_DIR/static");

/// Filesystem path to serve assets from, if available. Checked once at
/// startup; set via `CCMUX_ASSETS_DIR`, or auto-detected when running from
/// the source tree.
static FS_ASSETS_DIR: LazyLock<Option<PathBuf>> = LazyLock::new(|| {
    if let Ok(dir) = std::env::var("CCMUX_ASSETS_DIR") {
        let p = PathBuf::from(dir);
        if p.is_dir() {
            info!("serving assets from filesystem: {}", p.display());
            return Some(p);
        }
    }

    let cargo_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("static");
    if cargo_dir.is_dir() {
        return Some(cargo_dir);
    }

    info!("serving assets from embedded binary");
    None
});

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "text/javascript",
        Some("css") => "text/css",
        Some("json" | "map" | "webmanifest") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}

fn serve(path: &str) -> Option<(&'static str, Vec<u8>)> {
    if path.contains("..") {
        return None;
    }
    if let Some(dir) = FS_ASSETS_DIR.as_ref() {
        let full = dir.join(path);
        if let Ok(bytes) = std::fs::read(&full) {
            return Some((content_type_for(path), bytes));
        }
    }
    ASSETS
        .get_file(path)
        .map(|f| (content_type_for(path), f.contents().to_vec()))
}

/// `/assets/{*path}` — bundle files.
pub async fn asset_handler(Path(path): Path<String>) -> Response {
    match serve(&format!("assets/{path}")) {
        Some((content_type, bytes)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        },
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// All non-API, non-asset paths serve the SPA entry.
pub async fn spa_fallback(uri: Uri) -> Response {
    let path = uri.path();
    if path.starts_with("/assets/") || path.contains('.') {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    match serve("index.html") {
        Some((_, bytes)) => Html(bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "ui not bundled").into_response(),
    }
}
