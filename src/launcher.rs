//! Gateway launch: environment, token and the start call

use crate::config::ProviderCredentials;
use crate::sandbox::{BackendProcess, LaunchSpec, Sandbox};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

/// Number of tenant id characters carried in a token
const TOKEN_ID_CHARS: usize = 16;

/// Per-tenant attribution token handed to the gateway and appended to
/// forwarded requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayToken(String);

impl GatewayToken {
    pub fn derive(tenant_id: &str, prefix: &str) -> Self {
        let id: String = tenant_id.chars().take(TOKEN_ID_CHARS).collect();
        GatewayToken(format!("{}{}", prefix, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settings the launcher needs from the gateway configuration
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub token_env: String,
}

/// Environment for a gateway: present provider credentials plus the token
pub fn build_env(
    providers: &ProviderCredentials,
    token_env: &str,
    token: &GatewayToken,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = providers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.insert(token_env.to_string(), token.as_str().to_string());
    env
}

/// Start a gateway in the sandbox; hosting errors are returned as-is
pub async fn launch(
    sandbox: &dyn Sandbox,
    command: &LaunchCommand,
    providers: &ProviderCredentials,
    token: &GatewayToken,
) -> anyhow::Result<BackendProcess> {
    let spec = LaunchSpec {
        program: command.program.clone(),
        args: command.args.clone(),
        env: build_env(providers, &command.token_env, token),
    };

    info!(
        command = %spec.command_line(),
        providers = ?providers.names(),
        "Launching gateway"
    );

    sandbox.start_process(&spec).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ProcessLogs, ProcessStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn test_token_derivation() {
        let token = GatewayToken::derive("abcdefghijklmnopqrstuvwxyz", "botgate-");
        assert_eq!(token.as_str(), "botgate-abcdefghijklmnop");

        let short = GatewayToken::derive("abc123", "botgate-");
        assert_eq!(short.as_str(), "botgate-abc123");
        assert_eq!(short.to_string(), "botgate-abc123");
    }

    #[test]
    fn test_token_is_pure() {
        assert_eq!(
            GatewayToken::derive("V1StGXR8_Z5j", "p-"),
            GatewayToken::derive("V1StGXR8_Z5j", "p-")
        );
    }

    #[test]
    fn test_env_omits_absent_credentials() {
        let providers: ProviderCredentials =
            vec![("OPENAI_API_KEY".to_string(), "sk-1".to_string())].into_iter().collect();
        let token = GatewayToken::derive("tenant", "botgate-");

        let env = build_env(&providers, "BOTGATE_GATEWAY_TOKEN", &token);
        assert_eq!(env.len(), 2);
        assert_eq!(env["OPENAI_API_KEY"], "sk-1");
        assert_eq!(env["BOTGATE_GATEWAY_TOKEN"], "botgate-tenant");
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
    }

    struct RecordingSandbox {
        seen: Mutex<Option<LaunchSpec>>,
        fail: bool,
    }

    #[async_trait]
    impl Sandbox for RecordingSandbox {
        async fn list_processes(&self) -> anyhow::Result<Vec<BackendProcess>> {
            Ok(Vec::new())
        }

        async fn start_process(&self, spec: &LaunchSpec) -> anyhow::Result<BackendProcess> {
            *self.seen.lock() = Some(spec.clone());
            if self.fail {
                anyhow::bail!("quota exceeded");
            }
            Ok(BackendProcess {
                id: "42".to_string(),
                command: spec.command_line(),
                status: ProcessStatus::Starting,
                addr: "127.0.0.1:18789".parse().unwrap(),
                started_at: chrono::Utc::now(),
            })
        }

        async fn kill_process(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn process_logs(&self, _id: &str) -> anyhow::Result<ProcessLogs> {
            Ok(ProcessLogs::default())
        }
    }

    fn command() -> LaunchCommand {
        LaunchCommand {
            program: "openclaw".to_string(),
            args: vec!["gateway".to_string()],
            token_env: "BOTGATE_GATEWAY_TOKEN".to_string(),
        }
    }

    #[tokio::test]
    async fn test_launch_passes_command_and_env() {
        let sandbox = RecordingSandbox {
            seen: Mutex::new(None),
            fail: false,
        };
        let token = GatewayToken::derive("tenant1", "botgate-");

        let process = launch(&sandbox, &command(), &ProviderCredentials::default(), &token)
            .await
            .unwrap();
        assert_eq!(process.command, "openclaw gateway");

        let spec = sandbox.seen.lock().clone().unwrap();
        assert_eq!(spec.program, "openclaw");
        assert_eq!(spec.env["BOTGATE_GATEWAY_TOKEN"], "botgate-tenant1");
    }

    #[tokio::test]
    async fn test_launch_surfaces_host_errors() {
        let sandbox = RecordingSandbox {
            seen: Mutex::new(None),
            fail: true,
        };
        let token = GatewayToken::derive("tenant1", "botgate-");

        let err = launch(&sandbox, &command(), &ProviderCredentials::default(), &token)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }
}
