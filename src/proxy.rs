//! The front door: listener, routing and the tenant proxy entry point

use crate::api::BotsApi;
use crate::assets::{self, StaticAssets};
use crate::error::{json_error_response, ProxyErrorCode, StartupError};
use crate::forward::{self, X_REQUEST_ID};
use crate::pool::ConnectionPool;
use crate::registry::{Registry, TenantStatus};
use crate::supervisor::{Fleet, TenantSupervisor};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Seconds a browser is asked to wait while a gateway starts
const RETRY_AFTER_SECS: &str = "5";

/// Split `/bot/<id>[/rest]` into the id and whether nothing follows it
pub fn parse_bot_path(path: &str) -> Option<(&str, bool)> {
    let rest = path.strip_prefix("/bot/")?;
    let (id, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if id.is_empty() {
        return None;
    }
    Some((id, tail.is_empty()))
}

/// Everything a request handler needs
pub struct FrontDoor {
    registry: Registry,
    fleet: Arc<Fleet>,
    api: BotsApi,
    assets: StaticAssets,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

impl FrontDoor {
    pub fn new(
        registry: Registry,
        fleet: Arc<Fleet>,
        pool: Arc<ConnectionPool>,
        assets: StaticAssets,
        request_timeout: Duration,
    ) -> Self {
        Self {
            api: BotsApi::new(registry.clone(), Arc::clone(&fleet)),
            registry,
            fleet,
            assets,
            pool,
            request_timeout,
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        if path == "/health" && method == Method::GET {
            return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
        }

        if BotsApi::handles(&method, &path) {
            return Ok(self.api.handle(req).await);
        }

        if let Some((tenant_id, is_root)) = parse_bot_path(&path) {
            let tenant_id = tenant_id.to_string();
            if is_root && method == Method::GET && !forward::is_upgrade_request(&req) {
                return Ok(self.landing(&tenant_id));
            }
            return Ok(self.proxy_tenant(req, tenant_id, client_addr).await);
        }

        if method == Method::GET {
            return Ok(self.assets.serve(&path).await);
        }

        Ok(assets::not_found())
    }

    /// `GET /bot/<id>`: send the browser to the chat page
    fn landing(&self, tenant_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.registry.get(tenant_id) {
            Ok(tenant) => assets::redirect(&assets::landing_location(tenant.as_ref())),
            Err(e) => {
                error!(tenant = tenant_id, error = %e, "Registry lookup failed");
                json_error_response(ProxyErrorCode::InternalError, "Registry unavailable")
            }
        }
    }

    async fn proxy_tenant(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        tenant_id: String,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.registry.get(&tenant_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(tenant = %tenant_id, "Request for unknown bot");
                return json_error_response(ProxyErrorCode::UnknownTenant, "Bot not found");
            }
            Err(e) => {
                error!(tenant = %tenant_id, error = %e, "Registry lookup failed");
                return json_error_response(ProxyErrorCode::InternalError, "Registry unavailable");
            }
        }

        let supervisor = match self.fleet.get_or_create(&tenant_id) {
            Ok(supervisor) => supervisor,
            Err(e @ StartupError::Removed { .. }) => {
                debug!(tenant = %tenant_id, "Request for deleted bot");
                return e.to_response();
            }
            Err(e) => {
                error!(tenant = %tenant_id, error = %e, "No sandbox for bot");
                return e.to_response();
            }
        };

        forward::apply_forward_headers(req.headers_mut(), client_addr, &request_id);
        let upgrade = forward::is_upgrade_request(&req);

        debug!(
            tenant = %tenant_id,
            method = %req.method(),
            uri = %req.uri(),
            request_id = %request_id,
            upgrade,
            "Incoming bot request"
        );

        let was_ready = supervisor.is_ready();
        if !was_ready && !upgrade && forward::accepts_html(req.headers()) {
            self.start_in_background(Arc::clone(&supervisor));
            return starting_response();
        }

        let process = match supervisor.ensure_ready().await {
            Ok(process) => {
                if !was_ready {
                    record_status(&self.registry, &tenant_id, TenantStatus::Active);
                }
                process
            }
            Err(e @ StartupError::Removed { .. }) => {
                debug!(tenant = %tenant_id, request_id = %request_id, "Bot deleted during startup");
                return e.to_response();
            }
            Err(e) => {
                error!(tenant = %tenant_id, error = %e, request_id = %request_id, "Gateway startup failed");
                record_status(&self.registry, &tenant_id, TenantStatus::Error);
                return e.to_response();
            }
        };

        let target = forward::rewrite_target(req.uri(), &tenant_id, supervisor.token().as_str());

        let result = if upgrade {
            forward::forward_upgrade(
                req,
                process.addr,
                &target,
                &tenant_id,
                &request_id,
                self.request_timeout,
            )
            .await
        } else {
            forward::forward_http(&self.pool, req, process.addr, &target, self.request_timeout).await
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    tenant = %tenant_id,
                    process_id = %process.id,
                    request_id = %request_id,
                    error = %e,
                    "Forwarding to gateway failed"
                );
                if e.invalidates() {
                    supervisor.invalidate(&process.id);
                }
                e.to_response()
            }
        }
    }

    /// Drive startup on a detached task; its outcome only lands in logs and the registry
    fn start_in_background(&self, supervisor: Arc<TenantSupervisor>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let tenant_id = supervisor.tenant_id().to_string();
            match supervisor.ensure_ready().await {
                Ok(process) => {
                    info!(tenant = %tenant_id, process_id = %process.id, "Gateway started in background");
                    record_status(&registry, &tenant_id, TenantStatus::Active);
                }
                Err(StartupError::Removed { .. }) => {
                    debug!(tenant = %tenant_id, "Bot deleted during background startup");
                }
                Err(e) => {
                    error!(
                        tenant = %tenant_id,
                        error = %e,
                        details = %e.details(),
                        "Background gateway startup failed"
                    );
                    record_status(&registry, &tenant_id, TenantStatus::Error);
                }
            }
        });
    }
}

fn record_status(registry: &Registry, tenant_id: &str, status: TenantStatus) {
    if let Err(e) = registry.update_status(tenant_id, status) {
        warn!(tenant = tenant_id, %status, error = %e, "Failed to record bot status");
    }
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Full::new(body.into()).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// 202 for a browser hitting a gateway that is still starting
fn starting_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "status": "starting",
        "message": "The bot is starting up. This page will be ready in a moment.",
    });
    let mut response = json_response(StatusCode::ACCEPTED, body.to_string());
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    response
}

/// The front door HTTP server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    front_door: Arc<FrontDoor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        front_door: Arc<FrontDoor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            front_door,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Front door listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let front_door = Arc::clone(&self.front_door);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, front_door).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    front_door: Arc<FrontDoor>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let front_door = Arc::clone(&front_door);
        async move { front_door.handle_request(req, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
