use crate::record::list_recordings;
use crate::session::CameraSession;
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const INDEX_HTML: &str = include_str!("index.html");
const UNAUTHORIZED_MESSAGE: &str = "unauthorized: missing or invalid token";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open streams see the same flag and end.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Process-lifetime shared secret. Generated once, never rotated.
#[derive(Clone)]
pub struct AccessToken {
    hex: String,
}

impl AccessToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self {
            hex: hex::encode(token),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Exact string comparison against the presented value.
    pub fn matches(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        let expected = self.hex.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    session: Arc<CameraSession>,
    token: AccessToken,
}

impl ApiServer {
    /// The token is minted by the caller so its lifetime is the process's,
    /// not the listener's.
    pub fn new(cfg: ApiConfig, session: Arc<CameraSession>, token: AccessToken) -> Self {
        Self {
            cfg,
            session,
            token,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let token = self.token;
        let token_hex = token.as_str().to_string();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let session = self.session;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, session, token, shutdown_thread) {
                log::error!("camera api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            token: token_hex,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    session: Arc<CameraSession>,
    token: AccessToken,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ConnectionContext {
                    session: session.clone(),
                    token: token.clone(),
                    shutdown: shutdown.clone(),
                };
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &ctx) {
                        log::warn!("camera api request from {} rejected: {}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

struct ConnectionContext {
    session: Arc<CameraSession>,
    token: AccessToken,
    shutdown: Arc<AtomicBool>,
}

// ---- Routing ----

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Index,
    VideoFeed,
    StartRecording,
    StopRecording,
    Status,
    Recordings,
}

impl Route {
    fn resolve(path: &str) -> Option<Self> {
        match path {
            "/" => Some(Route::Index),
            "/video_feed" => Some(Route::VideoFeed),
            "/start_recording" => Some(Route::StartRecording),
            "/stop_recording" => Some(Route::StopRecording),
            "/status" => Some(Route::Status),
            "/recordings" => Some(Route::Recordings),
            _ => None,
        }
    }

    fn method(self) -> &'static str {
        match self {
            Route::StartRecording | Route::StopRecording => "POST",
            _ => "GET",
        }
    }

    /// Page and stream routes answer auth failures in plain text.
    fn json_unauthorized(self) -> bool {
        !matches!(self, Route::Index | Route::VideoFeed)
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    // Accepted sockets may inherit the listener's nonblocking mode.
    stream.set_nonblocking(false)?;

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let _ = write_json_response(&mut stream, 400, &json!({"error": "bad_request"}));
            return Err(err);
        }
    };

    let route = match Route::resolve(&request.path) {
        Some(route) => route,
        None => {
            return write_json_response(&mut stream, 404, &json!({"error": "not_found"}));
        }
    };
    if request.method != route.method() {
        return write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}));
    }

    if !ctx.token.matches(request.query_param("token")) {
        log::debug!("camera api: rejected {} {}", request.method, request.path);
        return if route.json_unauthorized() {
            write_json_response(&mut stream, 401, &json!({"error": UNAUTHORIZED_MESSAGE}))
        } else {
            write_response(
                &mut stream,
                401,
                "text/plain; charset=utf-8",
                UNAUTHORIZED_MESSAGE.as_bytes(),
            )
        };
    }

    match route {
        Route::Index => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            INDEX_HTML.as_bytes(),
        ),
        Route::VideoFeed => stream_video(stream, ctx),
        Route::StartRecording => match ctx.session.start_recording() {
            Ok(started) => write_json_response(
                &mut stream,
                200,
                &json!({"message": "Recording started", "filename": started.filename}),
            ),
            Err(err) => write_json_response(&mut stream, 400, &json!({"error": err.to_string()})),
        },
        Route::StopRecording => match ctx.session.stop_recording() {
            Ok(_) => {
                write_json_response(&mut stream, 200, &json!({"message": "Recording stopped"}))
            }
            Err(err) => write_json_response(&mut stream, 400, &json!({"error": err.to_string()})),
        },
        Route::Status => {
            let payload = serde_json::to_vec(&ctx.session.status())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        Route::Recordings => match list_recordings(&ctx.session.config().recordings_dir) {
            Ok(recordings) => {
                write_json_response(&mut stream, 200, &json!({"recordings": recordings}))
            }
            Err(err) => {
                log::error!("camera api: listing recordings failed: {}", err);
                write_json_response(&mut stream, 500, &json!({"error": err.to_string()}))
            }
        },
    }
}

// ---- Streaming ----

/// Multipart MJPEG until the client goes away or the server shuts down.
fn stream_video(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    let header = "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n";
    stream.write_all(header.as_bytes())?;

    let frames = ctx.session.subscribe().with_cancel(ctx.shutdown.clone());
    let mut sent = 0u64;
    for frame in frames {
        let part = stream
            .write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")
            .and_then(|_| stream.write_all(frame.as_bytes()))
            .and_then(|_| stream.write_all(b"\r\n"))
            .and_then(|_| stream.flush());
        if let Err(err) = part {
            log::debug!("camera api: stream client gone after {} frames: {}", sent, err);
            break;
        }
        sent += 1;
    }
    Ok(())
}

// ---- HTTP plumbing ----

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_32_bytes_of_hex_and_unique() {
        let a = AccessToken::generate();
        let b = AccessToken::generate();
        assert_eq!(a.as_str().len(), 64);
        assert!(hex::decode(a.as_str()).is_ok());
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn token_match_is_exact() {
        let token = AccessToken::generate();
        let good = token.as_str().to_string();
        assert!(token.matches(Some(&good)));
        assert!(!token.matches(None));
        assert!(!token.matches(Some("")));
        assert!(!token.matches(Some(&good.to_uppercase())));
        assert!(!token.matches(Some(&good[..63])));
        assert!(!token.matches(Some(&format!("{good}0"))));
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = AccessToken::generate();
        assert!(!format!("{token:?}").contains(token.as_str()));
    }

    #[test]
    fn routes_resolve_with_methods() {
        assert_eq!(Route::resolve("/"), Some(Route::Index));
        assert_eq!(Route::resolve("/video_feed").map(Route::method), Some("GET"));
        assert_eq!(
            Route::resolve("/start_recording").map(Route::method),
            Some("POST")
        );
        assert_eq!(Route::resolve("/stop_recording").map(Route::method), Some("POST"));
        assert_eq!(Route::resolve("/status/"), None);
        assert_eq!(Route::resolve("/recordings/x.mp4"), None);
    }

    #[test]
    fn unauthorized_body_kind_per_route() {
        assert!(!Route::Index.json_unauthorized());
        assert!(!Route::VideoFeed.json_unauthorized());
        assert!(Route::Status.json_unauthorized());
        assert!(Route::Recordings.json_unauthorized());
        assert!(Route::StartRecording.json_unauthorized());
        assert!(Route::StopRecording.json_unauthorized());
    }
}
