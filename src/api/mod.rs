//! Control API: a small HTTP/1.1 server over [`StreamManager`].
//!
//! Requests are served one at a time on a background thread. Every handler
//! returns promptly; pipeline failures after a start is accepted are only
//! visible through `GET /streams/{id}`.

use crate::stream::{SlotSnapshot, StartOutcome, StopOutcome, StreamManager, StreamParams};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    manager: Arc<StreamManager>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, manager: Arc<StreamManager>) -> Self {
        Self { cfg, manager }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let manager = self.manager;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &manager, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, manager: &StreamManager, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, manager) {
                    log::warn!("control api request rejected: {}", err);
                }
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

#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(alias = "rtsp_url")]
    source_url: String,
    #[serde(default)]
    location_id: Option<i64>,
    #[serde(default)]
    conf_threshold: Option<f32>,
    #[serde(default)]
    pose_conf_threshold: Option<f32>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    cctv_id: u32,
    status: &'static str,
    hls_url: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    cctv_id: u32,
    is_streaming: bool,
    state: crate::stream::SlotState,
    rtsp_url: Option<String>,
    location_id: Option<i64>,
    started_at: Option<u64>,
    frame_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hls_url: Option<String>,
}

impl StatusResponse {
    fn from_snapshot(snapshot: SlotSnapshot, manager: &StreamManager) -> Self {
        Self {
            cctv_id: snapshot.id,
            is_streaming: snapshot.running,
            state: snapshot.state,
            hls_url: snapshot.running.then(|| manager.hls_url(snapshot.id)),
            rtsp_url: snapshot.source_url,
            location_id: snapshot.location_id,
            started_at: snapshot.started_at,
            frame_count: snapshot.frame_count,
        }
    }
}

enum Route {
    Health,
    List,
    Status(u32),
    Start(u32),
    Stop(u32),
    Remove(u32),
}

fn route(method: &str, path: &str) -> Option<std::result::Result<Route, u16>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let route = match (method, segments.as_slice()) {
        ("GET", ["health"]) => Route::Health,
        ("GET", ["streams"]) => Route::List,
        (_, ["streams", id, ..]) => {
            let Ok(id) = id.parse::<u32>() else {
                return Some(Err(404));
            };
            match (method, &segments[2..]) {
                ("GET", []) => Route::Status(id),
                ("DELETE", []) => Route::Remove(id),
                ("POST", ["start"]) => Route::Start(id),
                ("POST", ["stop"]) => Route::Stop(id),
                (_, []) | (_, ["start"]) | (_, ["stop"]) => return Some(Err(405)),
                _ => return None,
            }
        }
        (_, ["health"]) | (_, ["streams"]) => return Some(Err(405)),
        _ => return None,
    };
    Some(Ok(route))
}

fn handle_connection(mut stream: TcpStream, manager: &StreamManager) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    let route = match route(&request.method, &request.path) {
        Some(Ok(route)) => route,
        Some(Err(405)) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
            return Ok(());
        }
        _ => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
    };

    match route {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::List => {
            let slots: Vec<StatusResponse> = manager
                .list()?
                .into_iter()
                .map(|snapshot| StatusResponse::from_snapshot(snapshot, manager))
                .collect();
            write_json(&mut stream, 200, &slots)
        }
        Route::Status(id) => match manager.status(id)? {
            Some(snapshot) => {
                write_json(&mut stream, 200, &StatusResponse::from_snapshot(snapshot, manager))
            }
            None => write_json_response(&mut stream, 404, r#"{"error":"unknown_stream"}"#),
        },
        Route::Start(id) => {
            let body: StartRequest = match serde_json::from_slice(&request.body) {
                Ok(body) => body,
                Err(err) => {
                    log::debug!("control api: bad start body: {}", err);
                    return write_json_response(&mut stream, 400, r#"{"error":"invalid_body"}"#);
                }
            };
            let params = StreamParams {
                source_url: body.source_url,
                location_id: body.location_id,
                det_conf: body.conf_threshold,
                pose_conf: body.pose_conf_threshold,
            };
            if let Err(err) = params.validate() {
                let body = serde_json::json!({ "error": "invalid_body", "detail": err.to_string() });
                return write_json(&mut stream, 400, &body);
            }
            match manager.start_stream(id, params)? {
                StartOutcome::Accepted => write_json(
                    &mut stream,
                    202,
                    &StartResponse {
                        cctv_id: id,
                        status: "starting",
                        hls_url: manager.hls_url(id),
                    },
                ),
                StartOutcome::AlreadyRunning => {
                    write_json_response(&mut stream, 409, r#"{"error":"already_streaming"}"#)
                }
                StartOutcome::InvalidId => {
                    write_json_response(&mut stream, 404, r#"{"error":"invalid_cctv_id"}"#)
                }
            }
        }
        Route::Stop(id) => match manager.stop_stream(id)? {
            StopOutcome::Accepted => write_json(
                &mut stream,
                202,
                &serde_json::json!({ "cctv_id": id, "status": "stopping" }),
            ),
            StopOutcome::NotRunning | StopOutcome::InvalidId => {
                write_json_response(&mut stream, 404, r#"{"error":"not_streaming"}"#)
            }
        },
        Route::Remove(id) => {
            if manager.remove_stream(id)? {
                write_json(&mut stream, 200, &serde_json::json!({ "cctv_id": id, "removed": true }))
            } else {
                write_json_response(&mut stream, 409, r#"{"error":"not_removable"}"#)
            }
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("request body truncated"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
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
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed(method: &str, path: &str) -> Option<std::result::Result<&'static str, u16>> {
        route(method, path).map(|r| {
            r.map(|route| match route {
                Route::Health => "health",
                Route::List => "list",
                Route::Status(_) => "status",
                Route::Start(_) => "start",
                Route::Stop(_) => "stop",
                Route::Remove(_) => "remove",
            })
        })
    }

    #[test]
    fn routes_map_methods_and_paths() {
        assert_eq!(routed("GET", "/health"), Some(Ok("health")));
        assert_eq!(routed("GET", "/streams"), Some(Ok("list")));
        assert_eq!(routed("GET", "/streams/3"), Some(Ok("status")));
        assert_eq!(routed("POST", "/streams/3/start"), Some(Ok("start")));
        assert_eq!(routed("POST", "/streams/3/stop"), Some(Ok("stop")));
        assert_eq!(routed("DELETE", "/streams/3"), Some(Ok("remove")));
        assert_eq!(routed("GET", "/streams/3/start"), Some(Err(405)));
        assert_eq!(routed("POST", "/health"), Some(Err(405)));
        assert_eq!(routed("GET", "/streams/abc"), Some(Err(404)));
        assert_eq!(routed("GET", "/events"), None);
    }

    #[test]
    fn start_body_accepts_rtsp_url_alias() -> Result<()> {
        let body: StartRequest =
            serde_json::from_str(r#"{"rtsp_url":"rtsp://cam/1","location_id":7}"#)?;
        assert_eq!(body.source_url, "rtsp://cam/1");
        assert_eq!(body.location_id, Some(7));
        assert!(body.conf_threshold.is_none());
        Ok(())
    }
}
