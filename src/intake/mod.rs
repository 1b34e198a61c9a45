//! HTTP intake for camera detection posts.
//!
//! Cameras `POST /` an XML document per detection. Every well-formed post is
//! acknowledged with `200` whatever the relay decided; only a buffer failure
//! is surfaced (`500`), so the camera retries exactly the events that were
//! not recorded.

pub mod xml;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::reconcile::Reconciler;
use crate::relay::Relay;

pub use xml::decode_event;

const MAX_HEADER_BYTES: usize = 8192;
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct IntakeConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3065".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug)]
pub struct IntakeHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl IntakeHandle {
    /// Stop accepting connections. Requests already being handled run to completion.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("intake server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct IntakeServer {
    cfg: IntakeConfig,
    relay: Arc<Relay>,
    reconciler: Option<Arc<Reconciler>>,
}

impl IntakeServer {
    pub fn new(cfg: IntakeConfig, relay: Arc<Relay>) -> Self {
        Self {
            cfg,
            relay,
            reconciler: None,
        }
    }

    /// Report the reconciliation state on `/health`.
    pub fn with_reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn spawn(self) -> Result<IntakeHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid intake address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(ConnectionContext {
            relay: self.relay,
            reconciler: self.reconciler,
            max_body_bytes: self.cfg.max_body_bytes,
        });
        let join = std::thread::Builder::new()
            .name("intake-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_accept_loop(listener, ctx, shutdown_thread) {
                    log::error!("intake server stopped: {}", err);
                }
            })?;

        Ok(IntakeHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ConnectionContext {
    relay: Arc<Relay>,
    reconciler: Option<Arc<Reconciler>>,
    max_body_bytes: usize,
}

fn run_accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("intake-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("intake request from {} rejected: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("could not spawn intake handler: {}", err);
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

fn handle_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream, ctx.max_body_bytes) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_response(&mut stream, 413, "text/plain", b"Payload too large")?;
            return Err(anyhow!("request too large"));
        }
        Err(RequestError::Other(err)) => {
            let _ = write_response(&mut stream, 400, "text/plain", b"Bad request");
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/") => handle_detection(&mut stream, ctx, &request.body),
        ("GET", "/health") => handle_health(&mut stream, ctx),
        (_, "/") | (_, "/health") => {
            write_response(&mut stream, 405, "text/plain", b"Method Not Allowed")
        }
        _ => write_response(&mut stream, 404, "text/plain", b"Not Found"),
    }
}

fn handle_detection(stream: &mut TcpStream, ctx: &ConnectionContext, body: &[u8]) -> Result<()> {
    let event = match decode_event(body) {
        Ok(event) => event,
        Err(err) => {
            write_response(stream, 400, "text/plain", b"Malformed detection")?;
            return Err(err.into());
        }
    };

    match ctx.relay.on_event(event) {
        Ok(outcome) => {
            log::debug!("intake outcome: {:?}", outcome);
            write_response(stream, 200, "text/plain", b"Data processed")
        }
        Err(err) => {
            write_response(stream, 500, "text/plain", b"Detection not recorded")?;
            Err(err.into())
        }
    }
}

fn handle_health(stream: &mut TcpStream, ctx: &ConnectionContext) -> Result<()> {
    let counts = match ctx.relay.buffer().counts() {
        Ok(counts) => counts,
        Err(err) => {
            write_response(stream, 500, "application/json", br#"{"status":"buffer_error"}"#)?;
            return Err(err.into());
        }
    };
    let body = serde_json::json!({
        "status": "ok",
        "buffered": counts.total,
        "pending": counts.pending,
        "reconciliation": ctx.reconciler.as_ref().map(|r| r.state()),
    });
    write_response(stream, 200, "application/json", &serde_json::to_vec(&body)?)
}

enum RequestError {
    TooLarge,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for RequestError {
    fn from(err: anyhow::Error) -> Self {
        RequestError::Other(err)
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Other(err.into())
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers").into());
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length {:?}", value))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(RequestError::TooLarge);
    }

    let mut body = data[header_end + 4..].to_vec();
    body.truncate(content_length);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body").into());
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&buf[..take]);
    }

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
