//! Landing redirect and static files (landing page, chat UI)

use crate::registry::Tenant;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Chat UI page the landing route redirects to
pub const CHAT_PAGE: &str = "/chat.html";

/// Where `GET /bot/<id>` sends the browser
pub fn landing_location(tenant: Option<&Tenant>) -> String {
    match tenant {
        Some(tenant) => format!(
            "{}?botId={}&botName={}",
            CHAT_PAGE,
            urlencoding::encode(&tenant.id),
            urlencoding::encode(&tenant.name)
        ),
        None => "/".to_string(),
    }
}

pub fn redirect(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

/// Content type by file extension
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Files served for every GET no other route claims
#[derive(Debug, Clone)]
pub struct StaticAssets {
    root: PathBuf,
}

impl StaticAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path onto the asset directory; `None` if it escapes it
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if relative.is_empty() || request_path.ends_with('/') {
            path.push("index.html");
        }
        Some(path)
    }

    pub async fn serve(&self, request_path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(path) = self.resolve(request_path) else {
            return not_found();
        };

        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let mut response = Response::new(full(contents));
                let headers = response.headers_mut();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Static asset not found");
                not_found()
            }
        }
    }
}

fn full(contents: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(contents.into()).map_err(|never| match never {}).boxed()
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    full(Bytes::new())
}

pub fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full("Not Found"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
