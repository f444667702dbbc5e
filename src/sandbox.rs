//! Hosting layer for tenant gateways
//!
//! A [`Sandbox`] is one tenant's view of the process host: it can list the
//! processes it knows about, start a new one, kill one and hand back captured
//! output. [`SandboxProvider`] maps tenant ids to sandboxes.
//!
//! [`LocalSandboxProvider`] hosts gateways as child processes of the front
//! door. Every tenant sandbox owns one port from a fixed range, exported to
//! the gateway as `PORT`.

use crate::config::GatewayConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Lines of stdout/stderr kept per process
const LOG_TAIL_LINES: usize = 200;

/// Placeholder in launch arguments replaced by the sandbox port
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Lifecycle status reported by the hosting layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Exited,
    Unknown,
}

impl ProcessStatus {
    /// Whether the process may still serve traffic
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

/// A process as seen through the hosting layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendProcess {
    /// Host-assigned process identifier
    pub id: String,
    /// Full command line, used to recognise gateways
    pub command: String,
    pub status: ProcessStatus,
    /// Address the gateway listens on
    pub addr: SocketAddr,
    pub started_at: DateTime<Utc>,
}

/// Captured output of a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

impl ProcessLogs {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// What to run
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    /// Shell-quoted command line
    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)))
    }
}

/// One tenant's slice of the hosting layer
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Every process the host knows about for this tenant, live or not
    async fn list_processes(&self) -> anyhow::Result<Vec<BackendProcess>>;

    /// Start a process; the returned handle is `starting` or `running`
    async fn start_process(&self, spec: &LaunchSpec) -> anyhow::Result<BackendProcess>;

    /// Terminate a process
    async fn kill_process(&self, id: &str) -> anyhow::Result<()>;

    /// Captured stdout/stderr of a process
    async fn process_logs(&self, id: &str) -> anyhow::Result<ProcessLogs>;
}

/// Hands out one sandbox per tenant
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The tenant's sandbox; repeated calls return the same sandbox
    fn sandbox(&self, tenant_id: &str) -> anyhow::Result<Arc<dyn Sandbox>>;

    /// Tear down the tenant's sandbox and everything running in it
    async fn release(&self, tenant_id: &str);
}

/// Bounded tail of a process output stream
#[derive(Default)]
struct LogTail {
    lines: Mutex<VecDeque<String>>,
}

impl LogTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == LOG_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn render(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

struct LocalProcess {
    child: Child,
    command: String,
    started_at: DateTime<Utc>,
    stdout: Arc<LogTail>,
    stderr: Arc<LogTail>,
}

/// Sandbox backed by local child processes
pub struct LocalSandbox {
    tenant_id: String,
    port: u16,
    workdir: Option<PathBuf>,
    grace_period: Duration,
    processes: DashMap<String, Mutex<LocalProcess>>,
}

impl LocalSandbox {
    pub fn new(tenant_id: &str, port: u16, workdir: Option<PathBuf>, grace_period: Duration) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            port,
            workdir,
            grace_period,
            processes: DashMap::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    fn status_of(process: &mut LocalProcess) -> ProcessStatus {
        match process.child.try_wait() {
            Ok(Some(_)) => ProcessStatus::Exited,
            Ok(None) => ProcessStatus::Running,
            Err(_) => ProcessStatus::Unknown,
        }
    }

    /// Forget processes that already exited
    fn prune_exited(&self) {
        self.processes
            .retain(|_, process| Self::status_of(process.get_mut()) != ProcessStatus::Exited);
    }

    /// Kill every process in this sandbox
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.kill_process(&id).await {
                debug!(tenant = %self.tenant_id, id, error = %e, "Process already gone");
            }
        }
    }

    /// Stop a local process: SIGTERM, then SIGKILL once the grace period runs out
    async fn stop_local_process(&self, id: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            info!(tenant = %self.tenant_id, pid, "Sending SIGTERM to gateway");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(tenant = %self.tenant_id, id, ?status, "Gateway process exited");
            }
            Ok(Err(e)) => {
                warn!(tenant = %self.tenant_id, id, error = %e, "Error waiting for gateway to exit");
            }
            Err(_) => {
                warn!(
                    tenant = %self.tenant_id,
                    id,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

fn spawn_log_reader<R>(reader: R, tail: Arc<LogTail>, tenant_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(tenant = %tenant_id, stream, "{}", line);
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(tenant = %tenant_id, stream, error = %e, "Gateway output closed");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn list_processes(&self) -> anyhow::Result<Vec<BackendProcess>> {
        let addr = self.addr();
        let processes = self
            .processes
            .iter()
            .map(|entry| {
                let mut guard = entry.value().lock();
                let status = Self::status_of(&mut guard);
                BackendProcess {
                    id: entry.key().clone(),
                    command: guard.command.clone(),
                    status,
                    addr,
                    started_at: guard.started_at,
                }
            })
            .collect();
        Ok(processes)
    }

    async fn start_process(&self, spec: &LaunchSpec) -> anyhow::Result<BackendProcess> {
        self.prune_exited();

        let port = self.port.to_string();
        let args: Vec<String> = spec
            .args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect();
        let command = LaunchSpec {
            program: spec.program.clone(),
            args: args.clone(),
            env: HashMap::new(),
        }
        .command_line();

        info!(tenant = %self.tenant_id, command = %command, port = self.port, "Starting gateway process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if let Some(ref workdir) = self.workdir {
            tokio::fs::create_dir_all(workdir).await.map_err(|e| {
                anyhow::anyhow!("Cannot create working directory {}: {}", workdir.display(), e)
            })?;
            cmd.current_dir(workdir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", &port);
        cmd.env("BOTGATE_TENANT_ID", &self.tenant_id);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Cannot spawn '{}': {}", spec.program, e))?;
        let id = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let stdout = Arc::new(LogTail::default());
        let stderr = Arc::new(LogTail::default());
        if let Some(out) = child.stdout.take() {
            spawn_log_reader(out, Arc::clone(&stdout), self.tenant_id.clone(), "stdout");
        }
        if let Some(err) = child.stderr.take() {
            spawn_log_reader(err, Arc::clone(&stderr), self.tenant_id.clone(), "stderr");
        }

        let started_at = Utc::now();
        info!(tenant = %self.tenant_id, id = %id, "Gateway process spawned");

        self.processes.insert(
            id.clone(),
            Mutex::new(LocalProcess {
                child,
                command: command.clone(),
                started_at,
                stdout,
                stderr,
            }),
        );

        Ok(BackendProcess {
            id,
            command,
            status: ProcessStatus::Running,
            addr: self.addr(),
            started_at,
        })
    }

    async fn kill_process(&self, id: &str) -> anyhow::Result<()> {
        let Some((_, process)) = self.processes.remove(id) else {
            anyhow::bail!("No process '{}' in sandbox for tenant '{}'", id, self.tenant_id);
        };
        let mut process = process.into_inner();
        self.stop_local_process(id, &mut process.child).await;
        Ok(())
    }

    async fn process_logs(&self, id: &str) -> anyhow::Result<ProcessLogs> {
        let entry = self
            .processes
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("No process '{}' in sandbox for tenant '{}'", id, self.tenant_id))?;
        let guard = entry.value().lock();
        Ok(ProcessLogs {
            stdout: guard.stdout.render(),
            stderr: guard.stderr.render(),
        })
    }
}

/// Hosts every tenant as local child processes on distinct ports
pub struct LocalSandboxProvider {
    base_port: u16,
    capacity: u16,
    work_root: Option<PathBuf>,
    grace_period: Duration,
    sandboxes: DashMap<String, Arc<LocalSandbox>>,
    ports_in_use: Mutex<BTreeSet<u16>>,
}

impl LocalSandboxProvider {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            base_port: config.base_port,
            capacity: config.max_sandboxes,
            work_root: config.work_root.clone(),
            grace_period: config.shutdown_grace_period(),
            sandboxes: DashMap::new(),
            ports_in_use: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate_port(&self) -> Option<u16> {
        let mut in_use = self.ports_in_use.lock();
        let port = (0..self.capacity)
            .filter_map(|offset| self.base_port.checked_add(offset))
            .find(|port| !in_use.contains(port))?;
        in_use.insert(port);
        Some(port)
    }

    /// Number of tenants currently holding a sandbox
    pub fn active(&self) -> usize {
        self.sandboxes.len()
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    fn sandbox(&self, tenant_id: &str) -> anyhow::Result<Arc<dyn Sandbox>> {
        let sandbox = match self.sandboxes.entry(tenant_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let port = self.allocate_port().ok_or_else(|| {
                    anyhow::anyhow!("No free gateway ports ({} sandboxes in use)", self.capacity)
                })?;
                let workdir = self.work_root.as_ref().map(|root| root.join(tenant_id));
                debug!(tenant = tenant_id, port, "Allocated sandbox");
                let sandbox = Arc::new(LocalSandbox::new(tenant_id, port, workdir, self.grace_period));
                entry.insert(Arc::clone(&sandbox));
                sandbox
            }
        };
        let sandbox: Arc<dyn Sandbox> = sandbox;
        Ok(sandbox)
    }

    async fn release(&self, tenant_id: &str) {
        let Some((_, sandbox)) = self.sandboxes.remove(tenant_id) else {
            return;
        };
        sandbox.kill_all().await;
        self.ports_in_use.lock().remove(&sandbox.port());
        debug!(tenant = tenant_id, port = sandbox.port(), "Released sandbox");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base_port: u16, capacity: u16) -> LocalSandboxProvider {
        LocalSandboxProvider::new(&GatewayConfig {
            base_port,
            max_sandboxes: capacity,
            shutdown_grace_period_secs: 1,
            ..GatewayConfig::default()
        })
    }

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_process_status_liveness() {
        assert!(ProcessStatus::Starting.is_live());
        assert!(ProcessStatus::Running.is_live());
        assert!(!ProcessStatus::Exited.is_live());
        assert!(!ProcessStatus::Unknown.is_live());
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let spec = spec("/opt/gateway/start.sh", &["--name", "my bot"]);
        assert_eq!(spec.command_line(), "/opt/gateway/start.sh --name 'my bot'");
    }

    #[test]
    fn test_log_tail_is_bounded() {
        let tail = LogTail::default();
        for i in 0..(LOG_TAIL_LINES + 5) {
            tail.push(format!("line {}", i));
        }
        let rendered = tail.render();
        assert!(!rendered.contains("line 4\n"));
        assert!(rendered.starts_with("line 5"));
        assert!(rendered.ends_with(&format!("line {}", LOG_TAIL_LINES + 4)));
    }

    #[test]
    fn test_provider_allocates_distinct_ports() {
        let provider = provider(41000, 10);
        let a = provider.sandboxes_port("a");
        let b = provider.sandboxes_port("b");
        assert_ne!(a, b);
        assert_eq!(provider.sandboxes_port("a"), a);
        assert_eq!(provider.active(), 2);
    }

    #[test]
    fn test_provider_capacity_exhausted() {
        let provider = provider(41100, 1);
        assert!(provider.sandbox("a").is_ok());
        let err = provider.sandbox("b").err().unwrap();
        assert!(err.to_string().contains("No free gateway ports"));
    }

    #[tokio::test]
    async fn test_release_frees_port() {
        let provider = provider(41200, 1);
        let first = provider.sandboxes_port("a");
        provider.release("a").await;
        assert_eq!(provider.active(), 0);
        assert_eq!(provider.sandboxes_port("b"), first);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_list_and_kill() {
        let sandbox = LocalSandbox::new("t1", 41300, None, Duration::from_secs(1));

        let process = sandbox.start_process(&spec("sleep", &["30"])).await.unwrap();
        assert_eq!(process.status, ProcessStatus::Running);
        assert_eq!(process.command, "sleep 30");
        assert_eq!(process.addr.port(), 41300);

        let listed = sandbox.list_processes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, process.id);
        assert!(listed[0].status.is_live());

        sandbox.kill_process(&process.id).await.unwrap();
        assert!(sandbox.list_processes().await.unwrap().is_empty());
        assert!(sandbox.kill_process(&process.id).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_keeps_logs() {
        let sandbox = LocalSandbox::new("t2", 41301, None, Duration::from_secs(1));
        let process = sandbox
            .start_process(&spec("sh", &["-c", "echo booting; echo boom >&2; exit 3"]))
            .await
            .unwrap();

        let mut exited = false;
        for _ in 0..50 {
            let listed = sandbox.list_processes().await.unwrap();
            if listed[0].status == ProcessStatus::Exited {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited, "process should have exited");

        // Output readers run on their own tasks
        tokio::time::sleep(Duration::from_millis(100)).await;
        let logs = sandbox.process_logs(&process.id).await.unwrap();
        assert_eq!(logs.stdout, "booting");
        assert_eq!(logs.stderr, "boom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_placeholder_and_env() {
        let sandbox = LocalSandbox::new("t3", 41302, None, Duration::from_secs(1));
        let mut launch = spec("sh", &["-c", "echo port={port} env=$PORT tenant=$BOTGATE_TENANT_ID key=$EXTRA"]);
        launch.env.insert("EXTRA".to_string(), "value".to_string());

        let process = sandbox.start_process(&launch).await.unwrap();
        assert!(process.command.contains("port=41302"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let logs = sandbox.process_logs(&process.id).await.unwrap();
        assert_eq!(logs.stdout, "port=41302 env=41302 tenant=t3 key=value");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let sandbox = LocalSandbox::new("t4", 41303, None, Duration::from_secs(1));
        let err = sandbox
            .start_process(&spec("/nonexistent/botgate-gateway", &[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Cannot spawn"));
    }

    impl LocalSandboxProvider {
        fn sandboxes_port(&self, tenant: &str) -> u16 {
            self.sandbox(tenant).unwrap();
            self.sandboxes.get(tenant).unwrap().port()
        }
    }
}
