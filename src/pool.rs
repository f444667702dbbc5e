//! Connection pool for gateway HTTP connections
//!
//! One pooled client carries forwarded tenant traffic, a second one carries
//! readiness probes so probe bursts never evict keep-alive connections used
//! by real requests.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl PoolError {
    /// Whether the gateway could not be reached at all
    ///
    /// Connect failures and socket errors count; a gateway that answered
    /// with something malformed does not.
    pub fn is_connect(&self) -> bool {
        match self {
            PoolError::Client(e) => {
                if e.is_connect() {
                    return true;
                }
                let mut source = std::error::Error::source(e);
                while let Some(err) = source {
                    if err.is::<std::io::Error>() {
                        return true;
                    }
                    source = err.source();
                }
                false
            }
            PoolError::RequestBuild(_) => false,
        }
    }
}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to gateways
    pub forwarded: AtomicU64,
    /// Readiness probes sent
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per gateway
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP clients towards tenant gateways
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes rarely reuse a connection across gateway restarts
        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to a gateway under a rewritten path and query
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        addr: SocketAddr,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://{}{}", addr, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            // The client derives Host from the URI
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_forward();

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` on a gateway and return the status code
    pub async fn probe(&self, addr: SocketAddr, path: &str) -> Result<StatusCode, PoolError> {
        let uri = format!("http://{}{}", addr, path);

        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_probe();

        let response = self.probe_client.request(req).await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.forwarded(), 0);
        assert_eq!(stats.probes(), 0);

        stats.record_forward();
        stats.record_forward();
        stats.record_probe();
        assert_eq!(stats.forwarded(), 2);
        assert_eq!(stats.probes(), 1);
    }

    #[tokio::test]
    async fn test_probe_unreachable_gateway() {
        let pool = ConnectionPool::new(PoolConfig::default());

        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = pool.probe(addr, "/health").await;
        assert!(matches!(result, Err(PoolError::Client(_))));
        assert!(result.unwrap_err().is_connect());
        assert_eq!(pool.stats().probes(), 1);
    }

    #[tokio::test]
    async fn test_malformed_answer_is_not_connect_failure() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n\r\n").await;
            let _ = stream.shutdown().await;
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        let err = pool.probe(addr, "/health").await.unwrap_err();
        assert!(matches!(err, PoolError::Client(_)));
        assert!(!err.is_connect());
        assert!(!PoolError::RequestBuild("bad uri".to_string()).is_connect());
    }
}
