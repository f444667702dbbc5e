//! Locate an existing gateway process inside a tenant sandbox

use crate::sandbox::{BackendProcess, Sandbox};
use tracing::warn;

/// Whether a command line belongs to a gateway
pub fn matches_signature(command: &str, signatures: &[String]) -> bool {
    signatures
        .iter()
        .any(|sig| !sig.is_empty() && command.contains(sig.as_str()))
}

/// Every live gateway in the sandbox, best candidate first
///
/// The managed process (the one this front door launched) wins; the rest are
/// ordered newest first. A failing list call yields no candidates.
pub async fn candidates(
    sandbox: &dyn Sandbox,
    signatures: &[String],
    managed: Option<&str>,
) -> Vec<BackendProcess> {
    let processes = match sandbox.list_processes().await {
        Ok(processes) => processes,
        Err(e) => {
            warn!(error = %e, "Failed to list sandbox processes");
            return Vec::new();
        }
    };

    let mut found: Vec<BackendProcess> = processes
        .into_iter()
        .filter(|p| p.status.is_live() && matches_signature(&p.command, signatures))
        .collect();

    found.sort_by(|a, b| {
        let a_managed = managed == Some(a.id.as_str());
        let b_managed = managed == Some(b.id.as_str());
        b_managed
            .cmp(&a_managed)
            .then_with(|| b.started_at.cmp(&a.started_at))
    });

    found
}

/// The best gateway candidate, if any
pub async fn find(
    sandbox: &dyn Sandbox,
    signatures: &[String],
    managed: Option<&str>,
) -> Option<BackendProcess> {
    candidates(sandbox, signatures, managed).await.into_iter().next()
}
