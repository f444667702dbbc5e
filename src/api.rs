//! Bot management API
//!
//! CRUD over the tenant registry under `/api/bots` (also reachable as
//! `/bots`), plus a read-only view of each bot's gateway supervisor.

use crate::registry::{Registry, Tenant};
use crate::supervisor::{Fleet, SupervisorSnapshot};
use anyhow::Result;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Longest accepted bot name, in characters
pub const MAX_NAME_CHARS: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct CreateBotRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct BotList {
    bots: Vec<Tenant>,
}

#[derive(Debug, Serialize)]
struct BotEnvelope {
    bot: Tenant,
}

#[derive(Debug, Serialize)]
struct GatewayStatus {
    gateway: SupervisorSnapshot,
}

/// Which API resource a path names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotRoute {
    Collection,
    Item(String),
    Gateway(String),
}

impl BotRoute {
    /// Parse `/api/bots[/<id>[/gateway]]` or the same under `/bots`
    pub fn parse(path: &str) -> Option<BotRoute> {
        let rest = path.strip_prefix("/api").unwrap_or(path);
        let rest = rest.strip_prefix("/bots")?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }

        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Some(BotRoute::Collection),
            [id] => Some(BotRoute::Item(id.to_string())),
            [id, "gateway"] => Some(BotRoute::Gateway(id.to_string())),
            _ => None,
        }
    }
}

/// Default display name for a bot created without one
pub fn default_bot_name() -> String {
    format!("Bot {}", chrono::Utc::now().timestamp_millis())
}

/// Trimmed bot name, or an error message for the caller
pub fn normalize_name(name: Option<&str>) -> std::result::Result<String, String> {
    let trimmed = name.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Ok(default_bot_name());
    }
    if trimmed.chars().count() > MAX_NAME_CHARS {
        return Err(format!(
            "Bot name must be {} characters or fewer",
            MAX_NAME_CHARS
        ));
    }
    Ok(trimmed.to_string())
}

/// Bot management handlers
pub struct BotsApi {
    registry: Registry,
    fleet: Arc<Fleet>,
}

impl BotsApi {
    pub fn new(registry: Registry, fleet: Arc<Fleet>) -> Self {
        Self { registry, fleet }
    }

    /// Whether the request belongs to this API
    pub fn handles(method: &Method, path: &str) -> bool {
        if *method == Method::OPTIONS && path.starts_with("/api/") {
            return true;
        }
        path.starts_with("/api/") || BotRoute::parse(path).is_some()
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let body = if method == Method::POST {
            match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return finish(json_error(
                        StatusCode::BAD_REQUEST,
                        format!("Failed to read request body: {}", e),
                    ))
                }
            }
        } else {
            Bytes::new()
        };

        self.route(&method, &path, &body).await
    }

    /// Dispatch an already-read request
    pub async fn route(
        &self,
        method: &Method,
        path: &str,
        body: &[u8],
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        debug!(%method, %path, "API request");

        let response = match self.dispatch(method, path, body).await {
            Ok(response) => response,
            Err(e) => {
                error!(%method, %path, error = %e, "API request failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", e))
            }
        };
        finish(response)
    }

    async fn dispatch(&self, method: &Method, path: &str, body: &[u8]) -> Result<Response<Full<Bytes>>> {
        if *method == Method::OPTIONS {
            return Ok(preflight());
        }

        let Some(route) = BotRoute::parse(path) else {
            return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
        };

        match (method, route) {
            (&Method::GET, BotRoute::Collection) => self.list_bots(),
            (&Method::POST, BotRoute::Collection) => self.create_bot(body),
            (&Method::GET, BotRoute::Item(id)) => self.get_bot(&id),
            (&Method::DELETE, BotRoute::Item(id)) => self.delete_bot(&id).await,
            (&Method::GET, BotRoute::Gateway(id)) => self.gateway_status(&id),
            _ => Ok(json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")),
        }
    }

    fn list_bots(&self) -> Result<Response<Full<Bytes>>> {
        let bots = self.registry.list()?;
        let response = ApiResponse::ok(BotList { bots });
        Ok(json_response(StatusCode::OK, serde_json::to_string(&response)?))
    }

    fn create_bot(&self, body: &[u8]) -> Result<Response<Full<Bytes>>> {
        let request: CreateBotRequest = if body.iter().all(u8::is_ascii_whitespace) {
            CreateBotRequest::default()
        } else {
            match serde_json::from_slice(body) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)));
                }
            }
        };

        let name = match normalize_name(request.name.as_deref()) {
            Ok(name) => name,
            Err(message) => return Ok(json_error(StatusCode::BAD_REQUEST, message)),
        };

        let bot = self.registry.create(&name)?;
        info!(tenant = %bot.id, name = %bot.name, "Created bot");

        let response = ApiResponse::ok(BotEnvelope { bot });
        Ok(json_response(StatusCode::CREATED, serde_json::to_string(&response)?))
    }

    fn get_bot(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        match self.registry.get(id)? {
            Some(bot) => {
                let response = ApiResponse::ok(BotEnvelope { bot });
                Ok(json_response(StatusCode::OK, serde_json::to_string(&response)?))
            }
            None => Ok(json_error(StatusCode::NOT_FOUND, "Bot not found")),
        }
    }

    async fn delete_bot(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        if !self.registry.delete(id)? {
            return Ok(json_error(StatusCode::NOT_FOUND, "Bot not found"));
        }

        info!(tenant = %id, "Deleted bot, stopping its gateway");
        self.fleet.remove(id).await;

        let response: ApiResponse<()> = ApiResponse::ok(());
        Ok(json_response(StatusCode::OK, serde_json::to_string(&response)?))
    }

    fn gateway_status(&self, id: &str) -> Result<Response<Full<Bytes>>> {
        if self.registry.get(id)?.is_none() {
            return Ok(json_error(StatusCode::NOT_FOUND, "Bot not found"));
        }

        let gateway = self
            .fleet
            .get(id)
            .map(|supervisor| supervisor.snapshot())
            .unwrap_or_else(|| SupervisorSnapshot::idle(id));
        let response = ApiResponse::ok(GatewayStatus { gateway });
        Ok(json_response(StatusCode::OK, serde_json::to_string(&response)?))
    }
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let response: ApiResponse<()> = ApiResponse::error(message);
    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"success":false,"error":"internal error"}"#.to_string());
    json_response(status, body)
}

fn preflight() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

fn finish(mut response: Response<Full<Bytes>>) -> Response<BoxBody<Bytes, hyper::Error>> {
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, ProviderCredentials};
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::readiness::HttpProbe;
    use crate::sandbox::LocalSandboxProvider;
    use crate::supervisor::GatewaySettings;
    use std::time::Duration;

    fn api() -> BotsApi {
        let gateway = GatewayConfig {
            base_port: 42000,
            max_sandboxes: 10,
            ..GatewayConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let fleet = Fleet::new(
            Arc::new(LocalSandboxProvider::new(&gateway)),
            Arc::new(HttpProbe::new(pool, "/health", Duration::from_secs(1))),
            GatewaySettings::from_config(&gateway, ProviderCredentials::default()),
        );
        BotsApi::new(Registry::open_in_memory().unwrap(), Arc::new(fleet))
    }

    async fn body_json(response: Response<BoxBody<Bytes, hyper::Error>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_api_response() {
        let response: ApiResponse<String> = ApiResponse::ok("test".to_string());
        assert!(response.success);
        assert_eq!(response.data, Some("test".to_string()));
        assert!(response.error.is_none());

        let error: ApiResponse<String> = ApiResponse::error("failed");
        assert!(!error.success);
        assert!(error.data.is_none());
        assert_eq!(error.error, Some("failed".to_string()));
    }

    #[test]
    fn test_route_parsing() {
        assert_eq!(BotRoute::parse("/api/bots"), Some(BotRoute::Collection));
        assert_eq!(BotRoute::parse("/api/bots/"), Some(BotRoute::Collection));
        assert_eq!(BotRoute::parse("/bots"), Some(BotRoute::Collection));
        assert_eq!(BotRoute::parse("/api/bots/abc"), Some(BotRoute::Item("abc".to_string())));
        assert_eq!(
            BotRoute::parse("/bots/abc/gateway"),
            Some(BotRoute::Gateway("abc".to_string()))
        );
        assert_eq!(BotRoute::parse("/botsx"), None);
        assert_eq!(BotRoute::parse("/api/bots/abc/logs"), None);
        assert_eq!(BotRoute::parse("/bot/abc"), None);
    }

    #[test]
    fn test_handles() {
        assert!(BotsApi::handles(&Method::GET, "/api/bots"));
        assert!(BotsApi::handles(&Method::GET, "/bots/abc"));
        assert!(BotsApi::handles(&Method::OPTIONS, "/api/anything"));
        assert!(!BotsApi::handles(&Method::GET, "/bot/abc"));
        assert!(!BotsApi::handles(&Method::GET, "/index.html"));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name(Some("  Helper  ")).unwrap(), "Helper");
        assert!(normalize_name(None).unwrap().starts_with("Bot "));
        assert!(normalize_name(Some("   ")).unwrap().starts_with("Bot "));
        assert!(normalize_name(Some(&"x".repeat(50))).is_ok());
        assert!(normalize_name(Some(&"x".repeat(51))).is_err());
        // Characters, not bytes
        assert!(normalize_name(Some(&"é".repeat(50))).is_ok());
    }

    #[tokio::test]
    async fn test_create_then_list_and_get() {
        let api = api();

        let response = api.route(&Method::POST, "/api/bots", br#"{"name":" Support "}"#).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        let created = body_json(response).await;
        assert_eq!(created["success"], true);
        assert_eq!(created["data"]["bot"]["name"], "Support");
        assert_eq!(created["data"]["bot"]["status"], "active");
        let id = created["data"]["bot"]["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 12);

        let listed = body_json(api.route(&Method::GET, "/bots", b"").await).await;
        assert_eq!(listed["data"]["bots"][0]["id"], id.as_str());

        let fetched = api.route(&Method::GET, &format!("/api/bots/{}", id), b"").await;
        assert_eq!(fetched.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let api = api();

        let long = format!(r#"{{"name":"{}"}}"#, "n".repeat(51));
        let response = api.route(&Method::POST, "/api/bots", long.as_bytes()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = api.route(&Method::POST, "/api/bots", b"{not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);

        let response = api.route(&Method::POST, "/api/bots", b"").await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert!(body["data"]["bot"]["name"].as_str().unwrap().starts_with("Bot "));
    }

    #[tokio::test]
    async fn test_missing_bot() {
        let api = api();

        let response = api.route(&Method::GET, "/api/bots/nope", b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Bot not found");

        let response = api.route(&Method::DELETE, "/api/bots/nope", b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = api.route(&Method::GET, "/api/bots/nope/gateway", b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_and_gateway_status() {
        let api = api();
        let created = body_json(api.route(&Method::POST, "/api/bots", br#"{"name":"x"}"#).await).await;
        let id = created["data"]["bot"]["id"].as_str().unwrap().to_string();

        let status = body_json(api.route(&Method::GET, &format!("/api/bots/{}/gateway", id), b"").await).await;
        assert_eq!(status["data"]["gateway"]["state"], "unknown");
        assert_eq!(status["data"]["gateway"]["tenant_id"], id.as_str());

        let response = api.route(&Method::DELETE, &format!("/api/bots/{}", id), b"").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = api.route(&Method::GET, &format!("/api/bots/{}", id), b"").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preflight_and_method_not_allowed() {
        let api = api();

        let response = api.route(&Method::OPTIONS, "/api/bots", b"").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().contains_key(ACCESS_CONTROL_ALLOW_METHODS));

        let response = api.route(&Method::PUT, "/api/bots", b"").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
