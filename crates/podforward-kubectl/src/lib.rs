//! `kubectl port-forward` as a tunnel primitive
//!
//! Each tunnel is one `kubectl port-forward` child process. The tunnel is
//! considered up once kubectl reports `Forwarding from ...` on stdout. When
//! the session releases it the child gets SIGTERM and, if it is still
//! running after the stop grace, SIGKILL. Dropping a handle kills the child.

mod output;
mod process;

pub use output::{is_forwarding_line, parse_forwarding_line};
pub use process::{KubectlHandle, KubectlTunnel};

use std::time::Duration;

/// How long kubectl gets to exit after SIGTERM before it is killed
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How to invoke kubectl
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubectlConfig {
    /// Executable to run
    pub program: String,
    /// Arguments placed before the kubectl subcommand
    pub global_args: Vec<String>,
    /// `--context` to use, if not the current one
    pub context: Option<String>,
    /// `--kubeconfig` to use, if not the default
    pub kubeconfig: Option<String>,
    /// Wait between SIGTERM and SIGKILL when a tunnel is released
    pub stop_grace: Duration,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            program: "kubectl".to_string(),
            global_args: Vec::new(),
            context: None,
            kubeconfig: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

impl KubectlConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<String>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Arguments for `kubectl port-forward` to one pod port
    pub fn port_forward_args(&self, request: &podforward_session::TunnelRequest) -> Vec<String> {
        let target = &request.target;
        let mut args = self.leading_args();
        args.extend([
            "port-forward".to_string(),
            format!("pod/{}", target.pod),
            format!("{}:{}", request.local_port, target.remote_port),
            "-n".to_string(),
            target.namespace.clone(),
            "--address".to_string(),
            request.bind_address.clone(),
        ]);
        args
    }

    /// Arguments for `kubectl version --client`
    pub fn version_args(&self) -> Vec<String> {
        let mut args = self.leading_args();
        args.extend(["version".to_string(), "--client".to_string()]);
        args
    }

    fn leading_args(&self) -> Vec<String> {
        let mut args = self.global_args.clone();
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.clone());
        }
        args
    }
}
