//! HTTP surface: WHEP signalling, source discovery and selection, snapshot,
//! health, and configuration endpoints. CORS is permitted for all origins
//! and OPTIONS preflights answer 204 everywhere.

pub mod pages;

use crate::config::Config;
use crate::errors::CastError;
use crate::mount::{is_splash, MountManager, Selection, SharedStream, VariantRequest};
use crate::ndi::discovery;
use crate::session::{CloseHook, Session, SessionManager};
use crate::source::{NdiSource, PixelFormat, SourceDescriptor, SplashSource};
use crate::stream::metrics;
use crate::yuv;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const FRAME_POLL: Duration = Duration::from_millis(50);

pub struct AppState {
    pub cfg: Config,
    pub sessions: Arc<SessionManager>,
    pub mounts: Arc<MountManager>,
    pub shared: Arc<SharedStream>,
    pub selection: Mutex<Selection>,
}

impl AppState {
    pub fn selection_snapshot(&self) -> Selection {
        self.selection.lock().expect("selection lock").clone()
    }
}

/// Accept loop with graceful shutdown: stops accepting on the signal, then
/// gives in-flight connections a short grace period.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let Ok((stream, _addr)) = accepted else { continue };
                let state = Arc::clone(&state);
                let active = Arc::clone(&active);
                active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, std::convert::Infallible>(handle(req, state).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(HEADER_READ_TIMEOUT)
                        .serve_connection(io, service)
                        .await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Route table. Responses get CORS headers appended uniformly.
pub async fn handle<B: hyper::body::Body>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string();
    let path = req.uri().path().to_string();

    let mut resp = match path.as_str() {
        "/" => text(StatusCode::OK, "text/html; charset=utf-8", pages::INDEX_HTML),
        "/whep" => whep_default(req, &state).await,
        "/ndi/sources" => ndi_sources(req).await,
        "/ndi/select" => ndi_select(req, &state).await,
        "/ndi/select_url" => ndi_select_url(req, &state).await,
        "/frame" => frame_png(req, &state).await,
        "/health" => health(req, &state).await,
        "/config" | "/config/" => config_page(req, &state).await,
        _ if path.starts_with("/whep/ndi/") => whep_ndi(req, &state, path["/whep/ndi/".len()..].to_string()).await,
        _ if path.starts_with("/whep/") => whep_resource(req, &state, path["/whep/".len()..].to_string()).await,
        _ => text(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };

    let headers = resp.headers_mut();
    if let Ok(value) = origin.parse() {
        headers.insert("Access-Control-Allow-Origin", value);
    }
    headers.insert(
        "Access-Control-Allow-Methods",
        "GET, POST, PATCH, DELETE, OPTIONS".parse().expect("static header"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        "Content-Type, Authorization".parse().expect("static header"),
    );
    resp
}

// --- WHEP handlers ---

/// POST /whep: session on the shared pipeline for the global selection.
async fn whep_default<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::OPTIONS => return empty(StatusCode::NO_CONTENT),
        Method::POST => {}
        _ => return text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }
    let offer = match read_body(req).await {
        Some(body) if !body.is_empty() => body,
        _ => return text(StatusCode::BAD_REQUEST, "text/plain", "empty offer"),
    };

    let codec = state.cfg.codec();
    let selection = state.selection_snapshot();
    let broadcaster = match state.shared.ensure(codec, &selection).await {
        Ok(bc) => bc,
        Err(e) => {
            return text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                &format!("shared pipeline start: {}", e),
            )
        }
    };

    let shared = Arc::clone(&state.shared);
    let hook: CloseHook = Box::new(move |_session: &Session, remaining| {
        tokio::spawn(async move { shared.stop_if_idle(remaining).await });
    });

    match state.sessions.create(offer, codec, &broadcaster, None, hook).await {
        Ok(new) => Response::builder()
            .status(StatusCode::CREATED)
            .header("Content-Type", "application/sdp")
            .header("Location", format!("/whep/{}", new.id))
            .body(Full::new(Bytes::from(new.answer_sdp)))
            .expect("whep response"),
        Err(e) => session_error(&e),
    }
}

/// PATCH/DELETE/OPTIONS on /whep/{id}.
async fn whep_resource<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>, id: String) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::PATCH => empty(StatusCode::NO_CONTENT), // trickle ICE: accepted, ignored
        Method::DELETE => {
            state.sessions.close(&id).await;
            empty(StatusCode::NO_CONTENT)
        }
        Method::OPTIONS => empty(StatusCode::NO_CONTENT),
        _ => text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }
}

/// POST /whep/ndi/{key}?w=&h=&fps=&bitrateKbps= creates a session on a
/// per-source mount; /whep/ndi/{key}/sessions/{id} is the session resource.
async fn whep_ndi<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>, path: String) -> Response<Full<Bytes>> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() >= 3 && parts[1] == "sessions" {
        let id = parts[2].to_string();
        return whep_resource(req, state, id).await;
    }

    match *req.method() {
        Method::OPTIONS => return empty(StatusCode::NO_CONTENT),
        Method::POST => {}
        _ => return text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }

    let key = path.trim_end_matches('/').to_string();
    if key.is_empty() {
        return text(StatusCode::BAD_REQUEST, "text/plain", "missing source key");
    }

    let want = VariantRequest {
        width: query_usize(&req, "w").unwrap_or(0),
        height: query_usize(&req, "h").unwrap_or(0),
        fps: query_usize(&req, "fps").unwrap_or(0) as u32,
        bitrate_kbps: query_usize(&req, "bitrateKbps").unwrap_or(0) as u32,
    };

    let offer = match read_body(req).await {
        Some(body) if !body.is_empty() => body,
        _ => return text(StatusCode::BAD_REQUEST, "text/plain", "empty offer"),
    };

    // "splash" always resolves to the synthetic generator, whatever the
    // canonical slug says.
    let desc = if key.eq_ignore_ascii_case("splash") {
        Some(SourceDescriptor::splash())
    } else {
        source_index().into_iter().find(|d| d.id == key)
    };
    let Some(desc) = desc else {
        return text(
            StatusCode::NOT_FOUND,
            "text/plain",
            &format!("source not found: {}", key),
        );
    };

    let mount = match state.mounts.ensure(&desc, want).await {
        Ok(mount) => mount,
        Err(e) => {
            return text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                &format!("mount start: {}", e),
            )
        }
    };

    let mounts = Arc::clone(&state.mounts);
    let shared = Arc::clone(&state.shared);
    let hook: CloseHook = Box::new(move |session: &Session, remaining| {
        if let Some(mount_key) = session.mount_key.clone() {
            mounts.detach(&mount_key, &session.id);
        }
        tokio::spawn(async move { shared.stop_if_idle(remaining).await });
    });

    let new = match state
        .sessions
        .create(offer, mount.codec, &mount.broadcaster, Some(mount.key.clone()), hook)
        .await
    {
        Ok(new) => new,
        Err(e) => return session_error(&e),
    };
    state.mounts.attach(&mount, &new.id);
    // The session may already have died (instant state change); don't hold a
    // refcount for a ghost.
    if !state.sessions.contains(&new.id) {
        state.mounts.detach(&mount.key, &new.id);
    }

    let mut builder = Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Type", "application/sdp")
        .header("Location", format!("/whep/ndi/{}/sessions/{}", key, new.id));
    let (actual_w, actual_h) = mount.actual_resolution();
    if actual_w > 0 && actual_h > 0 {
        builder = builder.header("X-Resolution", format!("{}x{}@{}", actual_w, actual_h, mount.key.fps));
    }
    if mount.key.bitrate_kbps > 0 {
        builder = builder.header("X-Bitrate-Kbps", mount.key.bitrate_kbps.to_string());
    }
    builder.body(Full::new(Bytes::from(new.answer_sdp))).expect("whep response")
}

// --- Source discovery and selection ---

/// Cached discovery results plus the synthetic Splash entry.
fn source_index() -> Vec<SourceDescriptor> {
    let mut out = vec![SourceDescriptor::splash()];
    for info in discovery::cached_sources() {
        out.push(SourceDescriptor::new(&info.name, &info.url));
    }
    out
}

async fn ndi_sources<B: hyper::body::Body>(req: Request<B>) -> Response<Full<Bytes>> {
    if *req.method() == Method::OPTIONS {
        return empty(StatusCode::NO_CONTENT);
    }
    let index = source_index();
    let sources: Vec<_> = index
        .iter()
        .map(|d| serde_json::json!({"name": d.name, "url": d.url}))
        .collect();
    let mounts: Vec<_> = index
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "name": d.name,
                "url": d.url,
                "whepEndpoint": format!("/whep/ndi/{}", d.id),
            })
        })
        .collect();
    json(serde_json::json!({"sources": sources, "mounts": mounts}))
}

#[derive(Deserialize)]
struct SelectBody {
    source: String,
}

/// POST /ndi/select { "source": "substring or exact URL" }.
async fn ndi_select<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::OPTIONS => return empty(StatusCode::NO_CONTENT),
        Method::POST => {}
        _ => return text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }
    let Some(body) = read_body(req).await else {
        return text(StatusCode::BAD_REQUEST, "text/plain", "invalid JSON or missing 'source'");
    };
    let parsed: Result<SelectBody, _> = serde_json::from_str(&body);
    let Ok(select) = parsed else {
        return text(StatusCode::BAD_REQUEST, "text/plain", "invalid JSON or missing 'source'");
    };
    if select.source.is_empty() {
        return text(StatusCode::BAD_REQUEST, "text/plain", "invalid JSON or missing 'source'");
    }

    let index = source_index();
    let needle = select.source.to_lowercase();
    let picked = index
        .iter()
        .find(|d| d.name.to_lowercase().contains(&needle) || d.url.eq_ignore_ascii_case(&select.source))
        .or_else(|| index.first())
        .cloned();
    let Some(picked) = picked else {
        return text(StatusCode::BAD_REQUEST, "text/plain", "no sources available");
    };

    let selection = Selection {
        name: picked.name.clone(),
        url: picked.url.clone(),
    };
    *state.selection.lock().expect("selection lock") = selection.clone();
    if state.cfg.select_applies_live {
        if let Err(e) = state.shared.restart_with(&selection).await {
            log::warn!("shared pipeline restart after select failed: {}", e);
        }
    }
    json(serde_json::json!({"ok": true, "selected": picked.name, "url": picked.url}))
}

#[derive(Deserialize)]
struct SelectUrlBody {
    url: String,
}

/// POST /ndi/select_url { "url": "ndi://..." }.
async fn ndi_select_url<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::OPTIONS => return empty(StatusCode::NO_CONTENT),
        Method::POST => {}
        _ => return text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }
    let Some(body) = read_body(req).await else {
        return text(StatusCode::BAD_REQUEST, "text/plain", "invalid JSON or missing 'url'");
    };
    let parsed: Result<SelectUrlBody, _> = serde_json::from_str(&body);
    let Ok(select) = parsed else {
        return text(StatusCode::BAD_REQUEST, "text/plain", "invalid JSON or missing 'url'");
    };
    if select.url.is_empty() {
        return text(StatusCode::BAD_REQUEST, "text/plain", "invalid JSON or missing 'url'");
    }

    let selection = {
        let mut guard = state.selection.lock().expect("selection lock");
        guard.url = select.url.clone();
        guard.clone()
    };
    if state.cfg.select_applies_live {
        if let Err(e) = state.shared.restart_with(&selection).await {
            log::warn!("shared pipeline restart after select failed: {}", e);
        }
    }
    json(serde_json::json!({"ok": true, "url": select.url}))
}

// --- Snapshot, health, config ---

/// GET /frame?timeout=ms: latest frame from the selected source as PNG.
async fn frame_png<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::OPTIONS => return empty(StatusCode::NO_CONTENT),
        Method::GET => {}
        _ => return text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }
    let timeout_ms = query_usize(&req, "timeout").unwrap_or(2000);
    let selection = state.selection_snapshot();

    if is_splash(&selection.name, &selection.url) {
        let splash = SplashSource::new(state.cfg.width.max(2), state.cfg.height.max(2));
        let frame = splash.render();
        return match png_from_bgra(&frame.data, frame.width, frame.height) {
            Some(png) => binary(StatusCode::OK, "image/png", png),
            None => text(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "png encode failed"),
        };
    }

    let source = match NdiSource::new(&selection.url, &selection.name) {
        Ok(source) => source,
        Err(_) => {
            return text(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                "NDI not available or source not found",
            )
        }
    };
    let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
    let png = loop {
        if let Some(frame) = source.last() {
            let bgra = match frame.format {
                PixelFormat::Bgra => frame.data.clone(),
                PixelFormat::Uyvy422 => {
                    let (w, h) = (frame.width, frame.height);
                    let mut y = vec![0u8; w * h];
                    let mut u = vec![0u8; (w / 2) * (h / 2)];
                    let mut v = vec![0u8; (w / 2) * (h / 2)];
                    yuv::uyvy_to_i420(&frame.data, w, h, &mut y, &mut u, &mut v);
                    let mut out = vec![0u8; w * h * 4];
                    yuv::i420_to_packed(&y, &u, &v, w, h, &mut out);
                    out
                }
            };
            break png_from_bgra(&bgra, frame.width, frame.height);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(FRAME_POLL).await;
    };
    source.stop();
    match png {
        Some(png) => binary(StatusCode::OK, "image/png", png),
        None => text(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "no frame available"),
    }
}

async fn health<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    if *req.method() == Method::OPTIONS {
        return empty(StatusCode::NO_CONTENT);
    }
    let selection = state.selection_snapshot();
    let counters = metrics::counters();
    let dropped = counters.frames_dropped;
    json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count(),
        "ndi": {"selected": selection.name, "url": selection.url},
        "metrics": counters,
        "gauges": metrics::gauges(),
        "runtime": metrics::runtime_stats(),
        "sessions_detail": state.sessions.details(),
        "dropped_frames": dropped,
    }))
}

async fn config_page<B: hyper::body::Body>(req: Request<B>, state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::OPTIONS => empty(StatusCode::NO_CONTENT),
        Method::GET => {
            let selection = state.selection_snapshot();
            text(
                StatusCode::OK,
                "text/html; charset=utf-8",
                &pages::config_html(&state.cfg, &selection),
            )
        }
        _ => text(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed"),
    }
}

// --- Helpers ---

async fn read_body<B: hyper::body::Body>(req: Request<B>) -> Option<String> {
    let bytes = req.into_body().collect().await.ok()?.to_bytes();
    String::from_utf8(bytes.to_vec()).ok()
}

fn query_usize<B>(req: &Request<B>, name: &str) -> Option<usize> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let mut it = pair.splitn(2, '=');
        if it.next() == Some(name) {
            return it.next().and_then(|v| v.parse::<usize>().ok()).filter(|n| *n > 0);
        }
    }
    None
}

fn session_error(e: &CastError) -> Response<Full<Bytes>> {
    let msg = e.to_string();
    let status = if msg.contains("bad SDP offer") || msg.contains("set_remote_description") {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    text(status, "text/plain", &msg)
}

fn text(status: StatusCode, content_type: &str, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("text response")
}

fn binary(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("binary response")
}

fn json(value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("json response")
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("empty response")
}

/// BGRA → PNG via an RGBA image buffer.
fn png_from_bgra(data: &[u8], width: usize, height: usize) -> Option<Vec<u8>> {
    if data.len() < width * height * 4 {
        return None;
    }
    let mut rgba = vec![0u8; width * height * 4];
    for (src, dst) in data.chunks_exact(4).zip(rgba.chunks_exact_mut(4)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
        dst[3] = src[3];
    }
    let img = image::RgbaImage::from_raw(width as u32, height as u32, rgba)?;
    let mut cursor = std::io::Cursor::new(Vec::new());
    img.write_to(&mut cursor, image::ImageFormat::Png).ok()?;
    Some(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_from_bgra_produces_png_magic() {
        let data = vec![128u8; 8 * 8 * 4];
        let png = png_from_bgra(&data, 8, 8).expect("png");
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn test_png_from_bgra_rejects_short_buffer() {
        assert!(png_from_bgra(&[0u8; 16], 8, 8).is_none());
    }

    #[test]
    fn test_source_index_always_contains_splash() {
        let index = source_index();
        assert_eq!(index[0].name, "Splash");
        assert_eq!(index[0].id, "ndi-splash");
    }
}
