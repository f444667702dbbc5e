//! Request forwarding to a ready tenant gateway
//!
//! Incoming paths look like `/bot/<id>/rest?query`. The gateway sees
//! `/rest?query&token=<GatewayToken>`; a caller-supplied `token` parameter is
//! left untouched.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Query parameter carrying the gateway token
pub const TOKEN_PARAM: &str = "token";

/// Largest upgrade response head accepted from a gateway
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Largest body relayed back from a refused upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Why a request could not be relayed
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The gateway refused or dropped the connection
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The gateway took longer than the request timeout
    #[error("gateway did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The gateway answered with something that is not HTTP
    #[error("invalid response from gateway: {0}")]
    BadResponse(String),
}

impl ForwardError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::Unreachable(_) => ProxyErrorCode::BackendUnreachable,
            ForwardError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            ForwardError::BadResponse(_) => ProxyErrorCode::BadGateway,
        }
    }

    /// Whether the cached readiness of the gateway should be dropped
    pub fn invalidates(&self) -> bool {
        matches!(self, ForwardError::Unreachable(_))
    }

    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let message = match self {
            ForwardError::Unreachable(_) => "Bot gateway is unreachable".to_string(),
            ForwardError::Timeout(after) => {
                format!("Request timed out after {} seconds", after.as_secs())
            }
            ForwardError::BadResponse(_) => "Invalid response from bot gateway".to_string(),
        };
        json_error_response(self.code(), message)
    }
}

/// Path the gateway sees: `/bot/<id>` removed, an empty rest becomes `/`
pub fn strip_tenant_prefix(path: &str, tenant_id: &str) -> String {
    let prefix = format!("/bot/{}", tenant_id);
    match path.strip_prefix(prefix.as_str()) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Whether a raw query string already carries `token`
pub fn has_token_param(query: &str) -> bool {
    query.split('&').any(|pair| {
        let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
        urlencoding::decode(key)
            .map(|k| k == TOKEN_PARAM)
            .unwrap_or(false)
    })
}

/// Query string with the token appended unless the caller set one
pub fn inject_token(query: Option<&str>, token: &str) -> String {
    let param = format!("{}={}", TOKEN_PARAM, urlencoding::encode(token));
    match query {
        None | Some("") => param,
        Some(q) if has_token_param(q) => q.to_string(),
        Some(q) => format!("{}&{}", q, param),
    }
}

/// Path and query to send to the gateway
pub fn rewrite_target(uri: &Uri, tenant_id: &str, token: &str) -> String {
    let path = strip_tenant_prefix(uri.path(), tenant_id);
    let query = inject_token(uri.query(), token);
    format!("{}?{}", path, query)
}

/// Check if a request is a WebSocket (or other protocol) upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Whether the client is a browser navigating to a page
pub fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

/// Set `x-request-id` and the `x-forwarded-*` headers
///
/// Client-supplied forwarding headers are overwritten; this proxy is the
/// first trusted hop.
pub fn apply_forward_headers(headers: &mut HeaderMap, client_addr: SocketAddr, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

impl From<PoolError> for ForwardError {
    fn from(err: PoolError) -> Self {
        if err.is_connect() {
            ForwardError::Unreachable(err.to_string())
        } else {
            ForwardError::BadResponse(err.to_string())
        }
    }
}

/// Relay a plain HTTP request through the pool
pub async fn forward_http(
    pool: &ConnectionPool,
    req: Request<Incoming>,
    addr: SocketAddr,
    target: &str,
    timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
    match tokio::time::timeout(timeout, pool.send_request(req, addr, target)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ForwardError::Timeout(timeout)),
    }
}

/// Build the raw HTTP upgrade request to send to the gateway
fn build_upgrade_request<B>(req: &Request<B>, addr: SocketAddr, target: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), target);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", addr));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read a response head; returns it and any bytes that followed it
async fn read_response_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), ForwardError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ForwardError::Unreachable(format!("failed to read upgrade response: {}", e)))?;
        if n == 0 {
            return Err(ForwardError::Unreachable(
                "gateway closed connection during upgrade".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(ForwardError::BadResponse("upgrade response head too large".to_string()));
        }
    }
}

/// Parse the status line and headers of a raw response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// How the body of a refused upgrade is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
    UntilClose,
}

fn body_framing(status: StatusCode, headers: &[(String, String)]) -> Result<BodyFraming, ForwardError> {
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(BodyFraming::Length(0));
    }
    if header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return Ok(BodyFraming::Chunked);
    }
    match header_value(headers, "content-length") {
        Some(len) => len
            .parse()
            .map(BodyFraming::Length)
            .map_err(|_| ForwardError::BadResponse(format!("invalid content-length: {}", len))),
        None => Ok(BodyFraming::UntilClose),
    }
}

/// Decode a complete chunked body; `None` until the last chunk has arrived
fn decode_chunked(data: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = pos + data[pos..].windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16).ok()?;
        pos = line_end + 2;

        if size == 0 {
            // Trailers end with an empty line
            data[pos..].windows(2).position(|w| w == b"\r\n")?;
            return Some(body);
        }
        if data.len() < pos + size + 2 {
            return None;
        }
        body.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

/// Read the body of a refused upgrade, starting from the bytes already buffered
async fn read_rejection_body(
    stream: &mut TcpStream,
    framing: BodyFraming,
    early: Vec<u8>,
) -> Result<Bytes, ForwardError> {
    let mut buf = early;
    let mut chunk = [0u8; 4096];

    loop {
        match framing {
            BodyFraming::Length(len) if buf.len() >= len => {
                buf.truncate(len);
                return Ok(Bytes::from(buf));
            }
            BodyFraming::Chunked => {
                if let Some(body) = decode_chunked(&buf) {
                    return Ok(Bytes::from(body));
                }
            }
            _ => {}
        }
        if buf.len() > MAX_REJECTION_BODY {
            return Err(ForwardError::BadResponse("upgrade rejection body too large".to_string()));
        }

        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ForwardError::Unreachable(format!("failed to read upgrade rejection: {}", e)))?;
        if n == 0 {
            return match framing {
                BodyFraming::UntilClose => Ok(Bytes::from(buf)),
                _ => Err(ForwardError::BadResponse(
                    "gateway closed connection mid-body".to_string(),
                )),
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(body: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body).map_err(|never| match never {}).boxed()
}

fn build_response(
    status: StatusCode,
    headers: &[(String, String)],
    body: BoxBody<Bytes, hyper::Error>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    for (name, value) in headers {
        // Framing follows the body we hand to hyper
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Relay bytes both ways until either side closes
async fn relay(client: Upgraded, mut backend: TcpStream, early: Vec<u8>, tenant: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(tenant, request_id, error = %e, "Client went away before relay started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                tenant,
                request_id,
                client_to_backend,
                backend_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(tenant, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Outcome of the handshake with the gateway
enum Handshake {
    Switched {
        backend: TcpStream,
        headers: Vec<(String, String)>,
        early: Vec<u8>,
    },
    Refused(Response<BoxBody<Bytes, hyper::Error>>),
}

async fn handshake(raw_request: &[u8], addr: SocketAddr, tenant: &str) -> Result<Handshake, ForwardError> {
    let mut backend = TcpStream::connect(addr).await.map_err(|e| {
        error!(tenant, %addr, error = %e, "Failed to connect to gateway for upgrade");
        ForwardError::Unreachable(e.to_string())
    })?;

    backend.write_all(raw_request).await.map_err(|e| {
        error!(tenant, error = %e, "Failed to send upgrade request to gateway");
        ForwardError::Unreachable(e.to_string())
    })?;

    let (head, early) = read_response_head(&mut backend).await?;

    let (status, headers) = parse_upgrade_response(&head)
        .ok_or_else(|| ForwardError::BadResponse("unparseable upgrade response".to_string()))?;

    if status == StatusCode::SWITCHING_PROTOCOLS {
        return Ok(Handshake::Switched {
            backend,
            headers,
            early,
        });
    }

    warn!(tenant, status = %status, "Gateway rejected upgrade request");
    let framing = body_framing(status, &headers)?;
    let body = read_rejection_body(&mut backend, framing, early).await?;
    Ok(Handshake::Refused(build_response(status, &headers, full_body(body))))
}

/// Relay a WebSocket upgrade to the gateway
///
/// The rewritten, token-carrying target goes into the raw handshake. A 101
/// from the gateway upgrades the client connection; any other answer is
/// passed back to the client with its body. Everything up to the 101 is
/// bounded by `timeout`; the relay that follows is not.
pub async fn forward_upgrade(
    req: Request<Incoming>,
    addr: SocketAddr,
    target: &str,
    tenant: &str,
    request_id: &str,
    timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(tenant, request_id, upgrade_type = %upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, addr, target);

    let outcome = tokio::time::timeout(timeout, handshake(&raw_request, addr, tenant))
        .await
        .map_err(|_| {
            warn!(tenant, request_id, %addr, "Gateway upgrade handshake timed out");
            ForwardError::Timeout(timeout)
        })??;

    let (backend, headers, early) = match outcome {
        Handshake::Switched {
            backend,
            headers,
            early,
        } => (backend, headers, early),
        Handshake::Refused(response) => return Ok(response),
    };

    info!(tenant, request_id, upgrade_type = %upgrade_type, "WebSocket upgrade successful");

    let response = build_response(StatusCode::SWITCHING_PROTOCOLS, &headers, empty_body());

    let tenant = tenant.to_string();
    let request_id = request_id.to_string();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(tenant = %tenant, request_id = %request_id, "Client upgrade complete, starting relay");
                relay(upgraded, backend, early, &tenant, &request_id).await;
            }
            Err(e) => {
                error!(tenant = %tenant, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
