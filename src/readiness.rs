//! Readiness polling for tenant gateways
//!
//! A gateway counts as ready once its health path answers 200, 401 or 403.
//! Auth failures mean the HTTP stack is up and only the probe lacks
//! credentials.

use crate::pool::ConnectionPool;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Whether a health status code means the gateway is serving
pub fn accepts_status(status: u16) -> bool {
    matches!(status, 200 | 401 | 403)
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready(u16),
    NotReady(u16),
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn from_status(status: u16) -> Self {
        if accepts_status(status) {
            ProbeOutcome::Ready(status)
        } else {
            ProbeOutcome::NotReady(status)
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready(_))
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Ready(status) => write!(f, "ready (status {})", status),
            ProbeOutcome::NotReady(status) => write!(f, "status {}", status),
            ProbeOutcome::Unreachable(reason) => write!(f, "unreachable: {}", reason),
        }
    }
}

/// A single readiness check against a gateway address
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> ProbeOutcome;
}

/// HTTP GET against the gateway health path
pub struct HttpProbe {
    pool: Arc<ConnectionPool>,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(pool: Arc<ConnectionPool>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, addr: SocketAddr) -> ProbeOutcome {
        match tokio::time::timeout(self.timeout, self.pool.probe(addr, &self.path)).await {
            Ok(Ok(status)) => ProbeOutcome::from_status(status.as_u16()),
            Ok(Err(e)) => ProbeOutcome::Unreachable(e.to_string()),
            Err(_) => ProbeOutcome::Unreachable(format!(
                "no answer within {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// The gateway never became ready
#[derive(Debug, Clone, thiserror::Error)]
#[error("not ready after {}s (last probe: {last})", .waited.as_secs())]
pub struct WaitTimeout {
    pub waited: Duration,
    pub last: ProbeOutcome,
}

/// Poll `addr` every `interval` until it is ready or `budget` runs out
///
/// Probe failures are never fatal on their own; only the deadline ends the
/// wait.
pub async fn wait_ready(
    probe: &dyn ReadinessProbe,
    addr: SocketAddr,
    budget: Duration,
    interval: Duration,
) -> Result<(), WaitTimeout> {
    let start = Instant::now();
    let deadline = start + budget;
    let mut last: Option<ProbeOutcome> = None;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, probe.probe(addr)).await {
            Ok(outcome) if outcome.is_ready() => {
                debug!(%addr, attempts, elapsed_ms = start.elapsed().as_millis() as u64, "Gateway ready");
                return Ok(());
            }
            Ok(outcome) => {
                trace!(%addr, attempts, outcome = %outcome, "Gateway not ready yet");
                last = Some(outcome);
            }
            Err(_) => {
                if last.is_none() {
                    last = Some(ProbeOutcome::Unreachable(
                        "probe did not finish before the deadline".to_string(),
                    ));
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let last = last.unwrap_or_else(|| ProbeOutcome::Unreachable("never probed".to_string()));
            return Err(WaitTimeout {
                waited: start.elapsed(),
                last,
            });
        }

        tokio::time::sleep(interval.min(remaining)).await;
    }
}
