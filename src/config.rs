use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that turns on development mode regardless of the file
pub const DEV_MODE_ENV: &str = "BOTGATE_DEV_MODE";

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Development mode relaxes the launch command checks in [`Config::validate`]
    #[serde(default)]
    pub dev_mode: bool,

    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Tenant registry storage
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Static assets (landing page, chat UI)
    #[serde(default)]
    pub assets: AssetsConfig,

    /// How tenant gateways are launched and checked
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Upstream model-provider credentials handed to every gateway
    #[serde(default)]
    pub providers: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8787)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle connections per gateway (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a gateway response to a forwarded HTTP request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// SQLite database file holding tenant records
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    /// Directory served for every GET that is not an API or bot route
    #[serde(default = "default_assets_dir")]
    pub dir: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            dir: default_assets_dir(),
        }
    }
}

/// Gateway launch and readiness settings
///
/// # Security Warning
///
/// `command` and `args` are executed directly for every tenant. Configuration
/// files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Program that starts a tenant gateway
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Arguments passed to the program
    #[serde(default = "default_gateway_args")]
    pub args: Vec<String>,

    /// Command-line substrings that identify a running gateway (default: the command)
    #[serde(default)]
    pub signatures: Vec<String>,

    /// Environment variable the gateway token is exported under
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Fixed tag the gateway token starts with
    #[serde(default = "default_token_prefix")]
    pub token_prefix: String,

    /// Path probed for readiness
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Timeout of a single readiness probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Budget for a freshly launched gateway to become ready, in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Budget for an already running gateway to answer before it is replaced
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,

    /// First port handed out to tenant sandboxes
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of ports (and so concurrent sandboxes) available
    #[serde(default = "default_max_sandboxes")]
    pub max_sandboxes: u16,

    /// Parent of the per-tenant working directories (optional)
    pub work_root: Option<PathBuf>,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            args: default_gateway_args(),
            signatures: Vec::new(),
            token_env: default_token_env(),
            token_prefix: default_token_prefix(),
            health_path: default_health_path(),
            poll_interval_ms: default_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            stale_grace_secs: default_stale_grace(),
            base_port: default_base_port(),
            max_sandboxes: default_max_sandboxes(),
            work_root: None,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl GatewayConfig {
    /// Signatures used to recognise a gateway process, falling back to the command
    pub fn signatures(&self) -> Vec<String> {
        if self.signatures.is_empty() {
            vec![self.command.clone()]
        } else {
            self.signatures.clone()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Validate the gateway configuration
    pub fn validate(&self, dev_mode: bool) -> Vec<String> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("gateway: 'command' must not be empty".to_string());
        } else if !dev_mode && self.command.contains('/') && !Path::new(&self.command).exists() {
            errors.push(format!(
                "gateway: command '{}' does not exist (set dev_mode to skip this check)",
                self.command
            ));
        }

        if self.base_port == 0 {
            errors.push("gateway: 'base_port' must be greater than 0".to_string());
        }
        if self.max_sandboxes == 0 {
            errors.push("gateway: 'max_sandboxes' must be greater than 0".to_string());
        }
        if u32::from(self.base_port) + u32::from(self.max_sandboxes) > u32::from(u16::MAX) + 1 {
            errors.push(format!(
                "gateway: port range {}+{} exceeds 65535",
                self.base_port, self.max_sandboxes
            ));
        }
        if self.poll_interval_ms == 0 {
            errors.push("gateway: 'poll_interval_ms' must be greater than 0".to_string());
        }
        if !self.health_path.starts_with('/') {
            errors.push(format!(
                "gateway: 'health_path' must start with '/', got '{}'",
                self.health_path
            ));
        }
        if self.token_env.trim().is_empty() {
            errors.push("gateway: 'token_env' must not be empty".to_string());
        }

        errors
    }
}

/// Upstream model-provider credentials
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Variables copied from the front door's own environment when set
    #[serde(default = "default_passthrough")]
    pub passthrough: Vec<String>,

    /// Literal credentials; these win over passthrough values
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            passthrough: default_passthrough(),
            keys: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Resolve credentials against the process environment
    pub fn resolve(&self) -> ProviderCredentials {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve credentials with a custom lookup; empty values are dropped
    pub fn resolve_with<F>(&self, lookup: F) -> ProviderCredentials
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved = BTreeMap::new();

        for name in &self.passthrough {
            if let Some(value) = lookup(name).filter(|v| !v.trim().is_empty()) {
                resolved.insert(name.clone(), value);
            }
        }

        for (name, value) in &self.keys {
            if value.trim().is_empty() {
                resolved.remove(name);
            } else {
                resolved.insert(name.clone(), value.clone());
            }
        }

        ProviderCredentials(resolved)
    }
}

/// Provider credentials that are actually present
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProviderCredentials(BTreeMap<String, String>);

impl ProviderCredentials {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for ProviderCredentials {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Values never reach logs
impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8787
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300 // chat completions can be slow
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("./botgate.db")
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from("./public")
}

fn default_gateway_command() -> String {
    "openclaw".to_string()
}

fn default_gateway_args() -> Vec<String> {
    vec!["gateway".to_string()]
}

fn default_token_env() -> String {
    "BOTGATE_GATEWAY_TOKEN".to_string()
}

fn default_token_prefix() -> String {
    "botgate-".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_startup_timeout() -> u64 {
    180
}

fn default_stale_grace() -> u64 {
    10
}

fn default_base_port() -> u16 {
    18789
}

fn default_max_sandboxes() -> u16 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_passthrough() -> Vec<String> {
    vec!["OPENAI_API_KEY".to_string(), "ANTHROPIC_API_KEY".to_string()]
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(DEV_MODE_ENV) {
            let value = value.trim().to_ascii_lowercase();
            self.dev_mode = matches!(value.as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.gateway.validate(self.dev_mode);

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
dev_mode = true

[server]
port = 9090
bind = "127.0.0.1"
request_timeout_secs = 60

[registry]
path = "/var/lib/botgate/bots.db"

[gateway]
command = "node"
args = ["gateway.js", "--port", "{port}"]
signatures = ["gateway.js"]
startup_timeout_secs = 120
stale_grace_secs = 5
base_port = 20000
max_sandboxes = 50

[providers]
passthrough = ["OPENAI_API_KEY"]

[providers.keys]
ANTHROPIC_API_KEY = "sk-ant"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.registry.path, PathBuf::from("/var/lib/botgate/bots.db"));
        assert_eq!(config.gateway.command, "node");
        assert_eq!(config.gateway.signatures(), vec!["gateway.js"]);
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(120));
        assert_eq!(config.gateway.stale_grace(), Duration::from_secs(5));
        assert_eq!(config.gateway.base_port, 20000);
        assert_eq!(config.providers.keys.get("ANTHROPIC_API_KEY").unwrap(), "sk-ant");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert!(!config.dev_mode);
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.request_timeout_secs, 300);
        assert_eq!(config.gateway.command, "openclaw");
        assert_eq!(config.gateway.args, vec!["gateway"]);
        assert_eq!(config.gateway.health_path, "/health");
        assert_eq!(config.gateway.poll_interval(), Duration::from_millis(2000));
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(180));
        assert_eq!(config.gateway.token_env, "BOTGATE_GATEWAY_TOKEN");
        assert_eq!(config.gateway.token_prefix, "botgate-");
        assert_eq!(config.providers.passthrough, vec!["OPENAI_API_KEY", "ANTHROPIC_API_KEY"]);
    }

    #[test]
    fn test_signatures_default_to_command() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.signatures(), vec!["openclaw"]);
    }

    #[test]
    fn test_provider_resolution_omits_absent_and_empty() {
        let providers = ProviderConfig {
            passthrough: vec![
                "OPENAI_API_KEY".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "MISTRAL_API_KEY".to_string(),
            ],
            keys: BTreeMap::new(),
        };

        let resolved = providers.resolve_with(|name| match name {
            "OPENAI_API_KEY" => Some("sk-live".to_string()),
            "ANTHROPIC_API_KEY" => Some("   ".to_string()),
            _ => None,
        });

        assert_eq!(resolved.names(), vec!["OPENAI_API_KEY"]);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_provider_literal_keys_override_passthrough() {
        let mut keys = BTreeMap::new();
        keys.insert("OPENAI_API_KEY".to_string(), "from-config".to_string());
        keys.insert("EMPTY_KEY".to_string(), String::new());
        let providers = ProviderConfig {
            passthrough: vec!["OPENAI_API_KEY".to_string()],
            keys,
        };

        let resolved = providers.resolve_with(|_| Some("from-env".to_string()));
        let values: Vec<_> = resolved.iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1, "from-config");
    }

    #[test]
    fn test_credentials_debug_hides_values() {
        let creds: ProviderCredentials =
            vec![("OPENAI_API_KEY".to_string(), "sk-secret".to_string())].into_iter().collect();
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("OPENAI_API_KEY"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn test_dev_mode_from_env() {
        let mut config = Config::default();
        config.apply_env(|name| (name == DEV_MODE_ENV).then(|| "true".to_string()));
        assert!(config.dev_mode);

        config.apply_env(|name| (name == DEV_MODE_ENV).then(|| "0".to_string()));
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_validate_collects_errors() {
        let toml = r#"
[server]
port = 0

[gateway]
command = ""
base_port = 0
poll_interval_ms = 0
health_path = "health"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("'command' must not be empty"));
        assert!(err.contains("'base_port' must be greater than 0"));
        assert!(err.contains("'poll_interval_ms' must be greater than 0"));
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("server: 'port' must be greater than 0"));
    }

    #[test]
    fn test_validate_port_range_overflow() {
        let gateway = GatewayConfig {
            base_port: 65000,
            max_sandboxes: 1000,
            ..GatewayConfig::default()
        };
        let errors = gateway.validate(false);
        assert!(errors.iter().any(|e| e.contains("exceeds 65535")));
    }

    #[test]
    fn test_missing_command_path_only_checked_outside_dev_mode() {
        let gateway = GatewayConfig {
            command: "/definitely/not/here/gateway".to_string(),
            ..GatewayConfig::default()
        };
        assert!(gateway.validate(false).iter().any(|e| e.contains("does not exist")));
        assert!(gateway.validate(true).is_empty());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botgate.toml");
        std::fs::write(&path, "[gateway]\npoll_interval_ms = 0\n").unwrap();

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("poll_interval_ms"));
    }
}
