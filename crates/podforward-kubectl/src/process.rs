//! kubectl child process management

use crate::output::{is_forwarding_line, parse_forwarding_line};
use crate::KubectlConfig;
use async_trait::async_trait;
use podforward_session::{
    EstablishedTunnel, LiveTunnel, LocalEndpoint, TunnelError, TunnelPrimitive, TunnelRequest,
};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;
/// How long to wait for stderr to close after the process exited
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

enum Readiness {
    Ready(Option<LocalEndpoint>),
    Exited(ExitStatus),
}

/// Opens tunnels by running `kubectl port-forward`
#[derive(Debug, Clone, Default)]
pub struct KubectlTunnel {
    config: KubectlConfig,
}

impl KubectlTunnel {
    pub fn new(config: KubectlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KubectlConfig {
        &self.config
    }

    /// Run `kubectl version --client` and return its output
    pub async fn client_version(&self) -> Result<String, TunnelError> {
        let output = Command::new(&self.config.program)
            .args(self.config.version_args())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&self.config.program, e))?;

        if !output.status.success() {
            return Err(TunnelError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl TunnelPrimitive for KubectlTunnel {
    async fn establish(
        &self,
        request: &TunnelRequest,
        timeout: Duration,
    ) -> Result<EstablishedTunnel, TunnelError> {
        let args = self.config.port_forward_args(request);
        let target = request.target.to_string();
        debug!(program = %self.config.program, args = ?args, "Spawning kubectl port-forward");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.config.program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::Io("kubectl stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TunnelError::Io("kubectl stderr was not captured".to_string()))?;
        let stderr = StderrTail::spawn(stderr, target.clone());
        let mut lines = BufReader::new(stdout).lines();

        let readiness =
            tokio::time::timeout(timeout, wait_until_ready(&mut child, &mut lines)).await;

        match readiness {
            Ok(Ok(Readiness::Ready(endpoint))) => {
                let endpoint = endpoint.unwrap_or_else(|| {
                    LocalEndpoint::new(request.bind_address.clone(), request.local_port)
                });
                info!(forward = %target, endpoint = %endpoint, pid = ?child.id(), "kubectl port-forward ready");
                drain_stdout(lines, target.clone());
                Ok(EstablishedTunnel {
                    endpoint,
                    handle: Box::new(KubectlHandle::new(child, target, self.config.stop_grace)),
                })
            }
            Ok(Ok(Readiness::Exited(status))) => {
                let stderr = stderr.collect().await;
                warn!(forward = %target, status = %status, stderr = %stderr, "kubectl port-forward exited before it was ready");
                Err(TunnelError::Exited {
                    status: status.to_string(),
                    stderr,
                })
            }
            Ok(Err(e)) => {
                kill_quietly(&mut child, &target).await;
                Err(e.into())
            }
            Err(_) => {
                warn!(forward = %target, timeout_ms = timeout.as_millis() as u64, "kubectl port-forward not ready in time");
                kill_quietly(&mut child, &target).await;
                Err(TunnelError::Timeout(timeout))
            }
        }
    }
}

/// Read stdout until kubectl reports the listener, or the process exits
async fn wait_until_ready(
    child: &mut Child,
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> std::io::Result<Readiness> {
    while let Some(line) = lines.next_line().await? {
        if is_forwarding_line(&line) {
            return Ok(Readiness::Ready(parse_forwarding_line(&line)));
        }
        debug!(line = %line, "kubectl output");
    }
    Ok(Readiness::Exited(child.wait().await?))
}

fn drain_stdout(mut lines: Lines<BufReader<ChildStdout>>, target: String) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(forward = %target, line = %line, "kubectl output");
        }
    });
}

async fn kill_quietly(child: &mut Child, target: &str) {
    if let Err(e) = child.kill().await {
        warn!(forward = %target, error = %e, "Failed to kill kubectl");
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> TunnelError {
    TunnelError::Spawn(format!(
        "failed to run '{}' (is kubectl installed and in PATH?): {}",
        program, e
    ))
}

/// Logs stderr and keeps its last lines for error reports
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: JoinHandle<()>,
}

impl StderrTail {
    fn spawn(stderr: ChildStderr, target: String) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = lines.clone();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                warn!(forward = %target, line = %line, "kubectl stderr");
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
        Self { lines, task }
    }

    /// Wait for stderr to close, then return what it printed
    async fn collect(self) -> String {
        let _ = tokio::time::timeout(STDERR_FLUSH_TIMEOUT, self.task).await;
        let tail = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let text = tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if text.trim().is_empty() {
            "no output on stderr".to_string()
        } else {
            text
        }
    }
}

/// A running `kubectl port-forward` process
#[derive(Debug)]
pub struct KubectlHandle {
    child: Child,
    pid: Option<u32>,
    target: String,
    stop_grace: Duration,
}

impl KubectlHandle {
    fn new(child: Child, target: String, stop_grace: Duration) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            target,
            stop_grace,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask kubectl to exit; `false` if no signal could be sent
    #[cfg(unix)]
    fn send_sigterm(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        // The child has not been reaped yet, so the pid is still ours
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                forward = %self.target,
                pid,
                error = %std::io::Error::last_os_error(),
                "Failed to send SIGTERM to kubectl"
            );
            return false;
        }
        true
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) -> bool {
        false
    }

    /// SIGTERM, then wait up to the stop grace for the child to exit
    async fn stop_gracefully(&mut self) -> bool {
        if !self.send_sigterm() {
            return false;
        }
        match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(forward = %self.target, pid = ?self.pid, status = %status, "kubectl port-forward stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(forward = %self.target, pid = ?self.pid, error = %e, "Failed to wait for kubectl");
                false
            }
            Err(_) => {
                warn!(
                    forward = %self.target,
                    pid = ?self.pid,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "kubectl ignored SIGTERM, killing it"
                );
                false
            }
        }
    }
}

#[async_trait]
impl LiveTunnel for KubectlHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> Result<(), TunnelError> {
        if !self.is_alive() {
            debug!(forward = %self.target, pid = ?self.pid, "kubectl already exited");
            return Ok(());
        }

        if self.stop_gracefully().await {
            return Ok(());
        }

        // kill() also waits for the child, so no zombie is left behind
        if let Err(e) = self.child.kill().await {
            if self.is_alive() {
                return Err(TunnelError::Terminate(format!(
                    "failed to kill kubectl (pid {:?}): {}",
                    self.pid, e
                )));
            }
        }
        debug!(forward = %self.target, pid = ?self.pid, "kubectl port-forward killed");
        Ok(())
    }
}
