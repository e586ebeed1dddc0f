use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

/// The supervised upstream child. Stdio is shared with the parent so the
/// assembly logs as one process; signals are relayed by pid so callers can
/// signal while `run` holds the child handle.
pub struct UpstreamProcess {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    pid: AtomicI32,
    started_tx: watch::Sender<bool>,
    started_rx: watch::Receiver<bool>,
}

impl UpstreamProcess {
    pub fn new(command: &str, args: &[String], env: Vec<(String, String)>) -> Self {
        let (started_tx, started_rx) = watch::channel(false);
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            env,
            pid: AtomicI32::new(0),
            started_tx,
            started_rx,
        }
    }

    /// Resolves to `true` once the child has a pid.
    pub fn started(&self) -> watch::Receiver<bool> {
        self.started_rx.clone()
    }

    /// Launches the child and blocks until it exits. The returned code is
    /// the child's own exit code, or `128 + signal` when a signal killed it.
    /// A child that cannot be launched at all surfaces as an error.
    pub async fn run(&self) -> Result<i32> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to launch upstream command '{}'", self.command))?;

        if let Some(pid) = child.id() {
            self.pid.store(pid as i32, Ordering::SeqCst);
            let _ = self.started_tx.send(true);
            debug!(pid, command = %self.command, "upstream process started");
        }

        let status = child
            .wait()
            .await
            .context("failed waiting for upstream process")?;

        let code = match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        };
        info!(code, "upstream process exited");
        Ok(code)
    }

    /// Relays a signal to the child. A child that already exited counts as
    /// success; the exit is reported through `run` regardless.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            bail!("upstream process has not started");
        }
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err).context("failed to signal upstream process"),
        }
    }
}
