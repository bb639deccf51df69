//! Test harness: a scriptable stand-in for the backend daemon

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{BridgeEvent, ConnectionState};
use crate::config::{BridgeConfig, TunnelConfig};

/// How the fake backend answers `send` commands
#[derive(Debug, Clone, Copy)]
pub(crate) enum AckMode {
    Success,
    Failure,
    Silent,
}

enum SessionOp {
    SendRaw(String),
    Close,
}

/// Fake backend daemon.
///
/// Greets every connection with the `connected` handshake, acks `send`
/// commands per the configured mode, and hands every parsed command to
/// the test for assertions.
pub(crate) struct FakeBackend {
    accepted: Arc<AtomicUsize>,
    commands: mpsc::UnboundedReceiver<Value>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<SessionOp>>>>,
    accept_task: JoinHandle<()>,
}

impl FakeBackend {
    pub(crate) fn spawn(socket: &Path, ack: AckMode) -> Self {
        let listener = UnixListener::bind(socket).unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (command_tx, commands) = mpsc::unbounded_channel();
        let current: Arc<Mutex<Option<mpsc::UnboundedSender<SessionOp>>>> =
            Arc::new(Mutex::new(None));

        let task_accepted = accepted.clone();
        let task_current = current.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(_) => return,
                };
                task_accepted.fetch_add(1, Ordering::SeqCst);
                let (op_tx, op_rx) = mpsc::unbounded_channel();
                *task_current.lock().unwrap() = Some(op_tx);
                tokio::spawn(run_session(stream, ack, command_tx.clone(), op_rx));
            }
        });

        Self {
            accepted,
            commands,
            current,
            accept_task,
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next command any session parsed, in arrival order
    pub(crate) async fn next_command(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("fake backend stopped")
    }

    /// Write a raw line on the most recent session
    pub(crate) fn push_raw(&self, line: &str) {
        let current = self.current.lock().unwrap();
        current
            .as_ref()
            .expect("no session yet")
            .send(SessionOp::SendRaw(line.to_string()))
            .expect("session gone");
    }

    /// Drop the most recent session, as a crashing backend would
    pub(crate) fn close_current(&self) {
        let current = self.current.lock().unwrap();
        if let Some(session) = current.as_ref() {
            let _ = session.send(SessionOp::Close);
        }
    }

    pub(crate) fn stop(&self) {
        self.accept_task.abort();
    }
}

async fn run_session(
    stream: UnixStream,
    ack: AckMode,
    commands: mpsc::UnboundedSender<Value>,
    mut ops: mpsc::UnboundedReceiver<SessionOp>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let greeting = b"{\"type\":\"connected\"}\n";
    if write_half.write_all(greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => return,
                };
                let value: Value =
                    serde_json::from_str(&line).expect("client sent invalid JSON");
                let ack_record = match (value.get("cmd").and_then(Value::as_str), ack) {
                    (Some("send"), AckMode::Success) => Some(json!({
                        "type": "delivered",
                        "messageId": value["id"],
                        "success": true,
                    })),
                    (Some("send"), AckMode::Failure) => Some(json!({
                        "type": "delivered",
                        "messageId": value["id"],
                        "success": false,
                        "reason": "peer unreachable",
                    })),
                    _ => None,
                };
                let _ = commands.send(value);
                if let Some(record) = ack_record {
                    let mut frame = record.to_string();
                    frame.push('\n');
                    if write_half.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            op = ops.recv() => {
                match op {
                    Some(SessionOp::SendRaw(line)) => {
                        let mut frame = line;
                        frame.push('\n');
                        if write_half.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Some(SessionOp::Close) | None => return,
                }
            }
        }
    }
}

/// Config tuned for fast tests
pub(crate) fn test_config(socket: &Path) -> BridgeConfig {
    BridgeConfig {
        socket_path: socket.to_path_buf(),
        reconnect_delay_ms: 100,
        delivery_deadline_ms: 500,
        ..BridgeConfig::default()
    }
}

/// Receive the next event, failing the test on a 2s stall
pub(crate) async fn recv_event(events: &mut mpsc::Receiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip ahead to the next status change
pub(crate) async fn next_status(events: &mut mpsc::Receiver<BridgeEvent>) -> ConnectionState {
    loop {
        if let BridgeEvent::StatusChanged(state) = recv_event(events).await {
            return state;
        }
    }
}

/// Fake mesh daemon: logs its argv to `log`, then idles like the real one
pub(crate) fn fake_tunnel(dir: &Path) -> (TunnelConfig, PathBuf) {
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("tunnel.log");
    let script = dir.join("fake-tunnel.sh");
    let mut file = std::fs::File::create(&script).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "echo launched \"$@\" >> {}", log.display()).unwrap();
    writeln!(file, "exec sleep 30").unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    let device = dir.join("tun-node");
    std::fs::write(&device, b"").unwrap();

    let config = TunnelConfig {
        binary: script,
        tun_device: device,
        // Loopback is always up, so establishment succeeds immediately
        interface: "lo".to_string(),
        establish_timeout_ms: 2000,
        poll_interval_ms: 50,
        ..TunnelConfig::default()
    };
    (config, log)
}
