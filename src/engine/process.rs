//! Child-process tunnel engine
//!
//! Runs an OpenVPN-compatible binary per session:
//!
//! ```text
//! <binary> --config <runtime_dir>/session_<uuid>.ovpn
//!          [--auth-user-pass <runtime_dir>/auth_<uuid>.txt]
//!          <extra_args...>
//! ```
//!
//! Config and credential files are created with mode 0600 and removed when
//! the process exits. Stage names are derived from the process output:
//!
//! | Output | Stage |
//! |--------|-------|
//! | process spawned | `connecting` |
//! | `Initialization Sequence Completed` | `connected` |
//! | `RECONNECTING` / `Restart pause` | `connecting` |
//! | `SIGTERM` / `process exiting` | `disconnecting` |
//! | process exit | `disconnected` |
//!
//! The monitor task owns the child. `stop` asks it to send SIGTERM and it
//! escalates to SIGKILL if the process has not exited within the grace
//! period; a process that already exited is never signalled. Per-app bypass lists are not supported and
//! are ignored with a warning.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{EngineEventSink, TunnelEngine};
use crate::config::EngineConfig;
use crate::session::{Session, Stage};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Map one line of engine output to a stage, if it marks a transition
pub fn classify_output(line: &str) -> Option<Stage> {
    if line.contains("Initialization Sequence Completed") {
        Some(Stage::Connected)
    } else if line.contains("RECONNECTING") || line.contains("Restart pause") {
        Some(Stage::Connecting)
    } else if line.contains("SIGTERM") || line.contains("process exiting") {
        Some(Stage::Disconnecting)
    } else {
        None
    }
}

struct RunningTunnel {
    stop: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    sink: Mutex<Option<EngineEventSink>>,
    status: Mutex<Stage>,
    /// Cleared once the child has been reaped
    pid: Mutex<Option<u32>>,
}

impl Shared {
    fn report(&self, stage: Stage) {
        *self.status.lock() = stage;
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.stage_changed(stage.as_str());
        }
    }
}

/// Tunnel engine running one OpenVPN child process per session
pub struct ProcessEngine {
    binary: PathBuf,
    extra_args: Vec<String>,
    runtime_dir: PathBuf,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<RunningTunnel>>,
}

impl ProcessEngine {
    /// Engine from the `[engine]` config section
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            extra_args: config.extra_args.clone(),
            runtime_dir: config
                .runtime_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("lamco-vpn-session")),
            shared: Arc::new(Shared::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Directory holding per-session files
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Pid of the live engine process
    pub fn pid(&self) -> Option<u32> {
        *self.shared.pid.lock()
    }

    async fn write_private(&self, prefix: &str, ext: &str, content: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.runtime_dir)
            .await
            .context(format!("Failed to create runtime dir: {:?}", self.runtime_dir))?;

        let path = self
            .runtime_dir
            .join(format!("{}_{}.{}", prefix, uuid::Uuid::new_v4(), ext));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&path)
            .await
            .context(format!("Failed to create {:?}", path))?;
        file.write_all(content.as_bytes())
            .await
            .context(format!("Failed to write {:?}", path))?;
        file.flush().await?;

        Ok(path)
    }

    /// Engine arguments for the given session files
    pub fn build_args(&self, config_path: &Path, auth_path: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            config_path.to_string_lossy().into_owned(),
        ];
        if let Some(auth) = auth_path {
            args.push("--auth-user-pass".to_string());
            args.push(auth.to_string_lossy().into_owned());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    async fn terminate(tunnel: RunningTunnel) {
        let RunningTunnel { stop, monitor } = tunnel;

        if monitor.is_finished() {
            debug!("Engine process already exited");
        } else if stop.send(()).is_err() {
            debug!("Engine monitor gone before stop request");
        }

        if let Err(e) = monitor.await {
            debug!("Engine monitor ended abnormally: {}", e);
        }
    }
}

/// SIGTERM, then SIGKILL after the grace period
async fn shutdown_child(child: &mut Child) -> std::io::Result<ExitStatus> {
    // id() is None once the child was reaped, so a reused pid is never hit
    if let Some(pid) = child.id() {
        send_signal(pid, nix::sys::signal::Signal::SIGTERM);
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Engine did not exit within {:?}, killing", STOP_GRACE);
            child.kill().await?;
            child.wait().await
        }
    }
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), signal) {
        debug!("Failed to send {:?} to engine pid {}: {}", signal, pid, e);
    }
}

async fn log_output<R: AsyncRead + Unpin>(reader: R, shared: Option<Arc<Shared>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "lamco_vpn_session::engine::output", "{}", line);
        if let Some(shared) = &shared {
            if let Some(stage) = classify_output(&line) {
                shared.report(stage);
            }
        }
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    fn attach(&self, sink: EngineEventSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    async fn start(&self, session: &Session) -> Result<()> {
        let mut running = self.running.lock().await;

        if let Some(previous) = running.take() {
            info!("Stopping previous engine process before restart");
            Self::terminate(previous).await;
        }

        if !session.bypass_list.is_empty() {
            warn!(
                "Per-app bypass is not supported by the process engine, ignoring {} entries",
                session.bypass_list.len()
            );
        }

        let config_path = self
            .write_private("session", "ovpn", &session.config)
            .await?;

        let auth_path = if session.credentials.is_empty() {
            None
        } else {
            let auth = Zeroizing::new(format!(
                "{}\n{}\n",
                session.credentials.username,
                session.credentials.password.as_str()
            ));
            Some(self.write_private("auth", "txt", &auth).await?)
        };

        let args = self.build_args(&config_path, auth_path.as_deref());
        debug!("Spawning {:?} {:?}", self.binary, args);

        let mut child = match Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                remove_files(&config_path, auth_path.as_deref()).await;
                return Err(e).context(format!("Failed to spawn engine {:?}", self.binary));
            }
        };

        let pid = child.id();
        info!("Engine started for '{}' (pid {:?})", session.display_name, pid);
        *self.shared.pid.lock() = pid;
        self.shared.report(Stage::Connecting);

        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(log_output(out, Some(Arc::clone(&self.shared))))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(log_output(err, None))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (stop_tx, stop_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);

        let monitor = tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => status,
                _ = stop_rx => shutdown_child(&mut child).await,
            };
            *shared.pid.lock() = None;

            match exit {
                Ok(status) => info!("Engine exited: {}", status),
                Err(e) => warn!("Failed to reap engine process: {}", e),
            }

            for reader in readers {
                if let Err(e) = reader.await {
                    debug!("Engine output reader ended abnormally: {}", e);
                }
            }

            remove_files(&config_path, auth_path.as_deref()).await;
            shared.report(Stage::Disconnected);
        });

        *running = Some(RunningTunnel {
            stop: stop_tx,
            monitor,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(tunnel) = self.running.lock().await.take() else {
            debug!("Stop requested with no engine process running");
            return Ok(());
        };

        info!("Stopping engine process");
        Self::terminate(tunnel).await;
        Ok(())
    }

    fn current_status(&self) -> String {
        self.shared.status.lock().as_str().to_string()
    }
}

async fn remove_files(config_path: &Path, auth_path: Option<&Path>) {
    for path in std::iter::once(config_path).chain(auth_path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!("Could not remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConnectRequest, Credentials};
    use tempfile::TempDir;

    fn engine(dir: &TempDir, binary: &str) -> ProcessEngine {
        ProcessEngine::new(&EngineConfig {
            binary: PathBuf::from(binary),
            extra_args: vec!["--verb".into(), "3".into()],
            runtime_dir: Some(dir.path().to_path_buf()),
        })
    }

    fn session() -> Session {
        Session::from_request(ConnectRequest {
            config: Some("client\nremote vpn.example.com 1194\n".into()),
            credentials: Credentials::new("alice", "hunter2"),
            name: "Test".into(),
            ..Default::default()
        })
        .unwrap()
        .0
    }

    #[test]
    fn test_classify_output() {
        assert_eq!(
            classify_output("2024-01-01 Initialization Sequence Completed"),
            Some(Stage::Connected)
        );
        assert_eq!(
            classify_output("[server] Inactivity timeout (--ping-restart), restarting; RECONNECTING"),
            Some(Stage::Connecting)
        );
        assert_eq!(
            classify_output("SIGTERM[hard,] received, process exiting"),
            Some(Stage::Disconnecting)
        );
        assert_eq!(classify_output("TUN/TAP device tun0 opened"), None);
    }

    #[test]
    fn test_build_args() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "openvpn");
        let args = engine.build_args(Path::new("/r/s.ovpn"), Some(Path::new("/r/a.txt")));
        assert_eq!(
            args,
            vec!["--config", "/r/s.ovpn", "--auth-user-pass", "/r/a.txt", "--verb", "3"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "openvpn");
        let path = engine.write_private("auth", "txt", "alice\nhunter2\n").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "/nonexistent/openvpn-binary");

        let result = engine.start(&session()).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(engine.current_status(), "idle");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_after_exit_does_not_signal() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "true");

        engine.start(&session()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.current_status() != "disconnected" {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Reaped: nothing left that a signal could reach
        assert_eq!(engine.pid(), None);
        assert!(engine.stop().await.is_ok());
        assert_eq!(engine.current_status(), "disconnected");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_process_is_ok() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "openvpn");
        assert!(engine.stop().await.is_ok());
    }
}
