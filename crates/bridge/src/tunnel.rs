//! Mesh tunnel process management
//!
//! Runs the userspace mesh daemon that carries traffic when the transport
//! is switched away from direct mode. The daemon gets the opened tun
//! device as an inherited file descriptor and is considered established
//! once the virtual interface reports link-up in sysfs.

use std::io;
use std::os::unix::io::AsRawFd;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::config::TunnelConfig;
use crate::error::Error;

extern "C" {
    fn fcntl(fd: i32, cmd: i32, arg: i32) -> i32;
}

const F_GETFD: i32 = 1;
const F_SETFD: i32 = 2;
const FD_CLOEXEC: i32 = 1;

/// Owns the mesh daemon child process
pub struct TunnelRuntime {
    config: TunnelConfig,
    child: Mutex<Option<Child>>,
}

impl TunnelRuntime {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    /// Launch the daemon and wait for the interface to come up.
    ///
    /// A no-op when the daemon is already running. On any failure the
    /// half-started child is reaped before returning.
    pub async fn start(&self) -> Result<(), Error> {
        let mut slot = self.child.lock().await;

        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
            *slot = None;
        }

        let tun = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.tun_device)
            .map_err(|e| {
                Error::TransportSwitch(format!(
                    "cannot open {}: {}",
                    self.config.tun_device.display(),
                    e
                ))
            })?;
        let tun_fd = tun.as_raw_fd();

        let mut command = Command::new(&self.config.binary);
        command
            .arg("-tunfd")
            .arg(tun_fd.to_string())
            .arg("-socks")
            .arg(self.config.proxy_port.to_string())
            .arg("-subnet")
            .arg(&self.config.subnet)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // The descriptor must survive exec so the daemon can drive the
        // device; std opens everything with CLOEXEC set.
        unsafe {
            command.pre_exec(move || {
                let flags = fcntl(tun_fd, F_GETFD, 0);
                if flags < 0 {
                    return Err(io::Error::last_os_error());
                }
                if fcntl(tun_fd, F_SETFD, flags & !FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            Error::TransportSwitch(format!(
                "cannot spawn {}: {}",
                self.config.binary.display(),
                e
            ))
        })?;
        drop(tun);

        info!(
            binary = %self.config.binary.display(),
            interface = %self.config.interface,
            "Tunnel daemon launched"
        );

        match self.wait_established(&mut child).await {
            Ok(()) => {
                *slot = Some(child);
                Ok(())
            }
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
        }
    }

    async fn wait_established(&self, child: &mut Child) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.establish_timeout();
        let state_path = format!("/sys/class/net/{}/operstate", self.config.interface);

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::TransportSwitch(format!(
                    "tunnel daemon exited during startup ({status})"
                )));
            }

            // Tun interfaces report "unknown" rather than "up" once live
            if let Ok(state) = tokio::fs::read_to_string(&state_path).await {
                if state.trim() != "down" {
                    info!(interface = %self.config.interface, "Tunnel interface is up");
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::TransportSwitch(format!(
                    "interface {} did not come up within {}ms",
                    self.config.interface, self.config.establish_timeout_ms
                )));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Kill the daemon if it is running
    pub async fn stop(&self) {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            info!("Stopping tunnel daemon");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}
