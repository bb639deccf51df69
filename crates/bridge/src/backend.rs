//! Backend process supervision
//!
//! Optionally spawns the backend executable the bridge talks to, so a
//! desktop build can ship both halves and bring the daemon up on demand.
//! Output is drained into the log; the channel layer notices an exit on
//! the next connection attempt.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::error::Error;

/// A spawned backend child process
pub struct BackendProcess {
    child: Child,
}

impl BackendProcess {
    /// Spawn the configured backend executable.
    ///
    /// Must run inside a tokio runtime, which also drains the child's
    /// stdout and stderr into debug logs.
    pub fn spawn(config: &BackendConfig) -> Result<Self, Error> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &config.workdir {
            command.current_dir(workdir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Backend(format!("cannot spawn {}: {}", config.command.display(), e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output("stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output("stderr", stderr));
        }

        info!(
            pid = child.id(),
            command = %config.command.display(),
            "Backend process launched"
        );
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the child has not yet exited
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the child and reap it
    pub async fn stop(&mut self) {
        info!("Stopping backend process");
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

async fn forward_output<R>(stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, "{}", line);
    }
}
