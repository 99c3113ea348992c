//! Dev-server lifecycle manager.
//!
//! Detects what kind of web project an approved folder holds, spawns the
//! matching dev command in its own process group, and supervises it until
//! the preview stops. A port that is already listening is assumed to be a
//! user-started server and is adopted without spawning. Shutdown goes
//! through SIGTERM on the whole group with a 5 s grace window before
//! SIGKILL; on Windows the group signalling degrades to a direct kill.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lines worth surfacing from a dev server's chatter.
const INTERESTING_OUTPUT: &[&str] = &[
    "ready",
    "started",
    "compiled",
    "error",
    "failed",
    "localhost",
    "local:",
    "listening",
];

#[derive(Debug, Error)]
pub enum DevServerError {
    #[error("no package.json found in {0}")]
    NoPackageJson(PathBuf),
    #[error("invalid package.json: {0}")]
    InvalidPackageJson(#[from] serde_json::Error),
    #[error("node_modules not found - run 'npm install' first")]
    MissingDependencies,
    #[error("unknown project type - no package.json with dev/start script found")]
    UnknownProjectType,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Next,
    Vite,
    Cra,
    Node,
    Unknown,
}

impl ProjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectKind::Next => "nextjs",
            ProjectKind::Vite => "vite",
            ProjectKind::Cra => "cra",
            ProjectKind::Node => "node",
            ProjectKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: HashMap<String, String>,
    #[serde(default)]
    dependencies: HashMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, String>,
}

/// Reads `package.json` and classifies the project by its dependencies.
/// Priority: next, then vite, then react-scripts, then any dev/start script.
pub fn detect_project_kind(folder: &Path) -> Result<ProjectKind, DevServerError> {
    let manifest = folder.join("package.json");
    let data = std::fs::read_to_string(&manifest)
        .map_err(|_| DevServerError::NoPackageJson(folder.to_path_buf()))?;
    let pkg: PackageJson = serde_json::from_str(&data)?;

    let has_dep =
        |name: &str| pkg.dependencies.contains_key(name) || pkg.dev_dependencies.contains_key(name);

    if has_dep("next") {
        return Ok(ProjectKind::Next);
    }
    if has_dep("vite") {
        return Ok(ProjectKind::Vite);
    }
    if has_dep("react-scripts") {
        return Ok(ProjectKind::Cra);
    }
    if pkg.scripts.contains_key("dev") || pkg.scripts.contains_key("start") {
        return Ok(ProjectKind::Node);
    }
    Ok(ProjectKind::Unknown)
}

pub fn detect_package_manager(folder: &Path) -> PackageManager {
    if folder.join("yarn.lock").exists() {
        PackageManager::Yarn
    } else if folder.join("pnpm-lock.yaml").exists() {
        PackageManager::Pnpm
    } else {
        PackageManager::Npm
    }
}

/// The command vector for a project kind. Under npm, script arguments need
/// the `--` separator; yarn and pnpm forward them directly. CRA only honors
/// the PORT environment variable, so its vector carries no port flag.
pub fn dev_command(
    kind: ProjectKind,
    manager: PackageManager,
    port: u16,
) -> Result<(String, Vec<String>), DevServerError> {
    let port = port.to_string();
    let args = match (kind, manager) {
        (ProjectKind::Next, PackageManager::Npm) => vec!["run", "dev", "--", "-p", &port],
        (ProjectKind::Next, _) => vec!["run", "dev", "-p", &port],
        (ProjectKind::Vite, PackageManager::Npm) => vec!["run", "dev", "--", "--port", &port],
        (ProjectKind::Vite, _) => vec!["run", "dev", "--port", &port],
        (ProjectKind::Cra, _) => vec!["run", "start"],
        (ProjectKind::Node, _) => vec!["run", "dev"],
        (ProjectKind::Unknown, _) => return Err(DevServerError::UnknownProjectType),
    };
    Ok((
        manager.program().to_string(),
        args.into_iter().map(String::from).collect(),
    ))
}

pub async fn is_port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Polls loopback every 500 ms until the port answers, the deadline passes,
/// or `cancel` flips.
pub async fn wait_for_port(
    port: u16,
    timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), DevServerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(PORT_PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled").into());
            }
            _ = ticker.tick() => {}
        }
        if is_port_in_use(port).await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timeout waiting for port {port}"),
            )
            .into());
        }
    }
}

pub type StateCallback = Arc<dyn Fn(&str, ServerState, Option<String>) + Send + Sync>;

#[derive(Debug)]
pub struct DevServer {
    pub folder_id: String,
    pub folder_path: PathBuf,
    pub port: u16,
    pub kind: ProjectKind,
    state: std::sync::Mutex<ServerState>,
    last_error: std::sync::Mutex<Option<String>>,
    /// Group leader pid when we spawned the process; None for adopted
    /// servers the user started themselves.
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
}

impl DevServer {
    pub fn state(&self) -> ServerState {
        *self.state.lock().expect("state lock")
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("error lock").clone()
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().expect("state lock") = state;
    }
}

/// Supervises every dev server the daemon has spawned, keyed by folder id.
pub struct Manager {
    servers: Mutex<HashMap<String, Arc<DevServer>>>,
    on_state_change: Mutex<Option<StateCallback>>,
    /// Handed to monitor tasks; weak so a supervisor callback cycle can
    /// never keep the daemon alive.
    weak: std::sync::Weak<Manager>,
}

impl Manager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            servers: Mutex::new(HashMap::new()),
            on_state_change: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub async fn set_state_callback(&self, callback: StateCallback) {
        *self.on_state_change.lock().await = Some(callback);
    }

    /// Starts a dev server for the folder. Reentry-safe: a folder that is
    /// already starting or running hands back the existing server. If the
    /// port is already listening the server is recorded as running without
    /// spawning anything.
    pub async fn start(
        &self,
        folder_id: &str,
        folder_path: &Path,
        port: u16,
    ) -> Result<Arc<DevServer>, DevServerError> {
        {
            let mut servers = self.servers.lock().await;
            if let Some(existing) = servers.get(folder_id) {
                match existing.state() {
                    ServerState::Running | ServerState::Starting => {
                        debug!(event = "devserver_reuse", folder_id = folder_id);
                        return Ok(existing.clone());
                    }
                    _ => {
                        servers.remove(folder_id);
                    }
                }
            }
        }

        if is_port_in_use(port).await {
            info!(event = "devserver_adopted", folder_id = folder_id, port = port);
            let (_, exited) = watch::channel(false);
            let server = Arc::new(DevServer {
                folder_id: folder_id.to_string(),
                folder_path: folder_path.to_path_buf(),
                port,
                kind: ProjectKind::Unknown,
                state: std::sync::Mutex::new(ServerState::Running),
                last_error: std::sync::Mutex::new(None),
                pid: None,
                exited,
            });
            self.servers
                .lock()
                .await
                .insert(folder_id.to_string(), server.clone());
            return Ok(server);
        }

        if !folder_path.join("node_modules").exists() {
            return Err(DevServerError::MissingDependencies);
        }

        let kind = detect_project_kind(folder_path)?;
        if kind == ProjectKind::Unknown {
            return Err(DevServerError::UnknownProjectType);
        }
        let manager = detect_package_manager(folder_path);
        let (program, args) = dev_command(kind, manager, port)?;

        info!(
            event = "devserver_start",
            folder_id = folder_id,
            kind = kind.as_str(),
            command = %format!("{program} {}", args.join(" "))
        );

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(folder_path)
            .env("CI", "true")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null());
        if kind == ProjectKind::Cra {
            command.env("PORT", port.to_string());
        }
        // Descendants (bundler workers and friends) get signalled together.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();

        let (exit_tx, exit_rx) = watch::channel(false);
        let server = Arc::new(DevServer {
            folder_id: folder_id.to_string(),
            folder_path: folder_path.to_path_buf(),
            port,
            kind,
            state: std::sync::Mutex::new(ServerState::Starting),
            last_error: std::sync::Mutex::new(None),
            pid,
            exited: exit_rx,
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, "dev"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, "dev!"));
        }

        self.servers
            .lock()
            .await
            .insert(folder_id.to_string(), server.clone());

        let manager_ref = self.weak.clone();
        let monitored = server.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let was_running = monitored.state() == ServerState::Running;
            let (state, error) = match status {
                Ok(status) if status.success() => (ServerState::Stopped, None),
                Ok(status) => (ServerState::Failed, Some(format!("exit status {status}"))),
                Err(err) => (ServerState::Failed, Some(err.to_string())),
            };
            monitored.set_state(state);
            *monitored.last_error.lock().expect("error lock") = error.clone();
            let _ = exit_tx.send(true);

            if let Some(error) = &error {
                warn!(event = "devserver_exit", folder_id = %monitored.folder_id, error = %error);
            } else {
                info!(event = "devserver_exit", folder_id = %monitored.folder_id);
            }

            // Weak reference: the supervisor must not keep the router alive
            // through a callback cycle, and a dead manager means shutdown.
            if let Some(manager) = manager_ref.upgrade() {
                manager.servers.lock().await.remove(&monitored.folder_id);
                if was_running {
                    let callback = manager.on_state_change.lock().await.clone();
                    if let Some(callback) = callback {
                        callback(&monitored.folder_id, state, error);
                    }
                }
            }
        });

        Ok(server)
    }

    /// Marks a starting server as running once its port probes ready.
    pub async fn mark_running(&self, folder_id: &str) {
        let servers = self.servers.lock().await;
        if let Some(server) = servers.get(folder_id) {
            let mut state = server.state.lock().expect("state lock");
            if *state == ServerState::Starting {
                *state = ServerState::Running;
            }
        }
    }

    pub async fn state(&self, folder_id: &str) -> Option<(ServerState, Option<String>)> {
        let servers = self.servers.lock().await;
        servers
            .get(folder_id)
            .map(|s| (s.state(), s.last_error()))
    }

    pub async fn is_running(&self, folder_id: &str) -> bool {
        matches!(
            self.state(folder_id).await,
            Some((ServerState::Running, _))
        )
    }

    /// Terminates the process group: SIGTERM, 5 s grace, then SIGKILL.
    pub async fn stop(&self, folder_id: &str) {
        let server = {
            let servers = self.servers.lock().await;
            servers.get(folder_id).cloned()
        };
        let Some(server) = server else { return };

        {
            let mut state = server.state.lock().expect("state lock");
            if matches!(*state, ServerState::Stopping | ServerState::Stopped) {
                return;
            }
            *state = ServerState::Stopping;
        }

        info!(event = "devserver_stop", folder_id = folder_id);

        if let Some(pid) = server.pid {
            signal_group(pid, false);
            let mut exited = server.exited.clone();
            let graceful = tokio::time::timeout(STOP_GRACE, async {
                while !*exited.borrow() {
                    if exited.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if graceful.is_err() {
                warn!(event = "devserver_kill", folder_id = folder_id);
                signal_group(pid, true);
            }
        }

        self.servers.lock().await.remove(folder_id);
    }

    pub async fn stop_all(&self) {
        let folder_ids: Vec<String> = {
            let servers = self.servers.lock().await;
            servers.keys().cloned().collect()
        };
        futures_util::future::join_all(folder_ids.iter().map(|id| self.stop(id))).await;
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, force: bool) {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // The child is its own group leader, so -pid addresses the whole group.
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc != 0 {
        // Group may be gone already; fall back to the process itself.
        unsafe { libc::kill(pid as i32, signal) };
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _force: bool) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output();
}

/// Surfaces only the lines a human debugging a preview would care about.
async fn pump_output(reader: impl tokio::io::AsyncRead + Unpin, tag: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_lowercase();
        if INTERESTING_OUTPUT.iter().any(|needle| lower.contains(needle)) {
            info!(target: "devserver", "[{tag}] {trimmed}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_package_json(dir: &TempDir, contents: &str) {
        std::fs::write(dir.path().join("package.json"), contents).expect("write package.json");
    }

    #[test]
    fn detects_next_before_vite_before_cra() {
        let dir = TempDir::new().expect("temp dir");
        write_package_json(
            &dir,
            r#"{"dependencies": {"next": "14.0.0", "vite": "5.0.0", "react-scripts": "5.0.1"}}"#,
        );
        assert_eq!(detect_project_kind(dir.path()).expect("detect"), ProjectKind::Next);

        write_package_json(
            &dir,
            r#"{"devDependencies": {"vite": "5.0.0"}, "dependencies": {"react-scripts": "5.0.1"}}"#,
        );
        assert_eq!(detect_project_kind(dir.path()).expect("detect"), ProjectKind::Vite);

        write_package_json(&dir, r#"{"dependencies": {"react-scripts": "5.0.1"}}"#);
        assert_eq!(detect_project_kind(dir.path()).expect("detect"), ProjectKind::Cra);
    }

    #[test]
    fn falls_back_to_scripts_then_unknown() {
        let dir = TempDir::new().expect("temp dir");
        write_package_json(&dir, r#"{"scripts": {"dev": "node server.js"}}"#);
        assert_eq!(detect_project_kind(dir.path()).expect("detect"), ProjectKind::Node);

        write_package_json(&dir, r#"{"scripts": {"build": "tsc"}}"#);
        assert_eq!(detect_project_kind(dir.path()).expect("detect"), ProjectKind::Unknown);
    }

    #[test]
    fn missing_package_json_is_an_error() {
        let dir = TempDir::new().expect("temp dir");
        assert!(matches!(
            detect_project_kind(dir.path()),
            Err(DevServerError::NoPackageJson(_))
        ));
    }

    #[test]
    fn package_manager_detected_from_lockfiles() {
        let dir = TempDir::new().expect("temp dir");
        assert_eq!(detect_package_manager(dir.path()), PackageManager::Npm);

        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").expect("write");
        assert_eq!(detect_package_manager(dir.path()), PackageManager::Pnpm);

        // yarn.lock wins over pnpm-lock.yaml.
        std::fs::write(dir.path().join("yarn.lock"), "").expect("write");
        assert_eq!(detect_package_manager(dir.path()), PackageManager::Yarn);
    }

    #[test]
    fn npm_gets_double_dash_separator_and_cra_gets_none() {
        let (prog, args) =
            dev_command(ProjectKind::Vite, PackageManager::Npm, 3000).expect("command");
        assert_eq!(prog, "npm");
        assert_eq!(args, vec!["run", "dev", "--", "--port", "3000"]);

        let (prog, args) =
            dev_command(ProjectKind::Next, PackageManager::Yarn, 4000).expect("command");
        assert_eq!(prog, "yarn");
        assert_eq!(args, vec!["run", "dev", "-p", "4000"]);

        let (_, args) = dev_command(ProjectKind::Cra, PackageManager::Npm, 5000).expect("command");
        assert_eq!(args, vec!["run", "start"], "cra takes its port from the environment");

        assert!(dev_command(ProjectKind::Unknown, PackageManager::Npm, 3000).is_err());
    }

    #[tokio::test]
    async fn adopts_already_listening_port_without_spawning() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let dir = TempDir::new().expect("temp dir");
        let manager = Manager::new();
        let server = manager
            .start("folder-1", dir.path(), port)
            .await
            .expect("adopt");
        assert_eq!(server.state(), ServerState::Running);
        assert!(manager.is_running("folder-1").await);

        // Reentry is a no-op handing back the same server.
        let again = manager.start("folder-1", dir.path(), port).await.expect("reenter");
        assert_eq!(again.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn missing_node_modules_blocks_spawn() {
        let dir = TempDir::new().expect("temp dir");
        write_package_json(&dir, r#"{"dependencies": {"vite": "5.0.0"}}"#);

        let manager = Manager::new();
        let err = manager
            .start("folder-2", dir.path(), 1) // port 1 is never listening
            .await
            .expect_err("must fail");
        assert!(matches!(err, DevServerError::MissingDependencies));
    }

    #[tokio::test]
    async fn wait_for_port_times_out_and_cancels() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let err = wait_for_port(1, Duration::from_millis(1200), cancel_rx)
            .await
            .expect_err("timeout");
        assert!(err.to_string().contains("timeout waiting for port"));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let waiter = tokio::spawn(wait_for_port(1, Duration::from_secs(30), cancel_rx));
        cancel_tx.send(true).expect("cancel");
        let err = waiter.await.expect("join").expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
    }
}
