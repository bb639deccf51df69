//! Channel machinery
//!
//! Owns the Unix socket lifecycle: connect, the newline-framed read loop,
//! write-side framing, disconnect handling and the single reconnect timer.
//! Everything here is a free function over the shared [`BridgeCore`] so
//! background tasks and the public handle drive the same state.
//!
//! Lifecycle rules: state changes and the channel generation live under
//! one lock, at most one reconnect timer exists at a time, and every task
//! tied to a torn-down channel goes quiet via its generation stamp.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use culvert_proto::{Command, Event, TransportMode};

use crate::backend::BackendProcess;
use crate::bridge::{BridgeCore, BridgeEvent, ChannelWriter, ConnectionState};
use crate::delivery::DeliveryStatus;
use crate::error::{Error, Result};

/// Connect to the backend and wire up the channel.
///
/// A no-op when a channel is already up or being opened. On failure the
/// state falls back to Disconnected and a retry is scheduled; the error is
/// still returned so direct callers can report it.
pub(crate) async fn open_channel(core: &Arc<BridgeCore>) -> Result<()> {
    if core.closed.load(Ordering::SeqCst) {
        return Err(Error::Shutdown);
    }

    let (transport, opened_generation) = {
        let mut link = core.link.lock().unwrap();
        if link.connection != ConnectionState::Disconnected {
            return Ok(());
        }
        link.connection = ConnectionState::Connecting;
        (link.transport, link.generation)
    };
    notify_status(core, ConnectionState::Connecting).await;

    ensure_backend(core).await;

    if transport == TransportMode::Mesh {
        if let Err(e) = core.tunnel.start().await {
            fail_connect_attempt(core, opened_generation, e.to_string()).await;
            return Err(e);
        }
    }

    let stream = match UnixStream::connect(&core.config.socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                socket = %core.config.socket_path.display(),
                error = %e,
                "Backend connection failed"
            );
            fail_connect_attempt(core, opened_generation, format!("Cannot reach backend: {e}"))
                .await;
            return Err(Error::Channel(e));
        }
    };
    info!(socket = %core.config.socket_path.display(), "Channel open");

    let (read_half, write_half) = stream.into_split();

    let generation = {
        let mut link = core.link.lock().unwrap();
        if link.generation != opened_generation {
            // A teardown raced this attempt; whoever tore the channel
            // down owns the state now, and the fresh stream is dropped
            return Ok(());
        }
        link.generation += 1;
        link.generation
    };
    *core.writer.lock().await = Some(ChannelWriter {
        generation,
        stream: write_half,
    });

    let task = tokio::spawn(listen_task(core.clone(), read_half, generation));
    if let Some(old) = core.listener.lock().unwrap().replace(task) {
        old.abort();
    }

    // Replay the stored join so a reconnect lands back in the room
    let replay = {
        let link = core.link.lock().unwrap();
        link.join.as_ref().map(|params| Command::Join {
            room: params.room.clone(),
            pre_key_bundle: params.pre_key_bundle.clone(),
            transport: link.transport,
        })
    };
    if let Some(command) = replay {
        write_command(core, &command).await?;
    }

    Ok(())
}

/// Failed before the stream came up: report, fall back, schedule a retry.
///
/// An attempt overtaken by a teardown leaves the state alone; the teardown
/// owns it now.
async fn fail_connect_attempt(core: &Arc<BridgeCore>, opened_generation: u64, reason: String) {
    {
        let mut link = core.link.lock().unwrap();
        if link.generation != opened_generation {
            debug!(reason, "Dropping a connect failure from a stale attempt");
            return;
        }
        link.connection = ConnectionState::Disconnected;
    }
    let _ = core.events.send(BridgeEvent::BackendError(reason)).await;
    notify_status(core, ConnectionState::Disconnected).await;
    schedule_reconnect(core);
}

/// Arm the reconnect timer, replacing any timer already armed.
///
/// When it fires, the attempt only proceeds if the channel is still down;
/// a connection established in the meantime makes it a no-op.
pub(crate) fn schedule_reconnect(core: &Arc<BridgeCore>) {
    if core.closed.load(Ordering::SeqCst) {
        return;
    }
    let delay = core.config.reconnect_delay();

    let task_core = core.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if task_core.closed.load(Ordering::SeqCst) {
            return;
        }
        let due =
            task_core.link.lock().unwrap().connection == ConnectionState::Disconnected;
        if due {
            if let Err(e) = open_channel(&task_core).await {
                debug!(error = %e, "Scheduled reconnect failed");
            }
        }
    });

    if let Some(old) = core.reconnect.lock().unwrap().replace(task) {
        old.abort();
    }
    info!(delay_ms = core.config.reconnect_delay_ms, "Reconnect scheduled");
}

pub(crate) fn cancel_reconnect(core: &BridgeCore) {
    if let Some(timer) = core.reconnect.lock().unwrap().take() {
        timer.abort();
    }
}

/// Drop the channel deliberately: no retry is scheduled here.
///
/// The generation bump comes first so an in-flight disconnect handler for
/// the old channel sees itself stale.
pub(crate) async fn teardown_channel(core: &BridgeCore) {
    let changed = {
        let mut link = core.link.lock().unwrap();
        link.generation += 1;
        let was = link.connection;
        link.connection = ConnectionState::Disconnected;
        was != ConnectionState::Disconnected
    };

    if let Some(listener) = core.listener.lock().unwrap().take() {
        listener.abort();
    }
    *core.writer.lock().await = None;

    if changed {
        notify_status(core, ConnectionState::Disconnected).await;
    }
}

/// React to a lost channel noticed by a task from `generation`.
///
/// Stale generations and channels already marked down are ignored, so
/// concurrent read and write failures collapse into one disconnect.
async fn handle_disconnect(core: &Arc<BridgeCore>, generation: u64, reason: &str) {
    {
        let mut link = core.link.lock().unwrap();
        if link.generation != generation {
            debug!(reason, "Ignoring disconnect from a stale channel");
            return;
        }
        if link.connection == ConnectionState::Disconnected {
            return;
        }
        link.connection = ConnectionState::Disconnected;
        link.generation += 1;
    }
    warn!(reason, "Channel lost");

    *core.writer.lock().await = None;
    core.message_limiter.prune_idle();
    core.file_limiter.prune_idle();

    let mut message = format!("Connection lost: {reason}");
    {
        let mut backend = core.backend.lock().await;
        if let Some(process) = backend.as_mut() {
            if !process.is_running() {
                message = format!("Backend process exited ({reason})");
                // Cleared so the next attempt respawns it
                *backend = None;
            }
        }
    }

    let _ = core.events.send(BridgeEvent::BackendError(message)).await;
    notify_status(core, ConnectionState::Disconnected).await;

    if !core.closed.load(Ordering::SeqCst) {
        schedule_reconnect(core);
    }
}

/// Largest inbound record the read loop will buffer
const MAX_RECORD_BYTES: usize = 1024 * 1024;

enum InboundRecord {
    Line(String),
    Oversized,
    Eof,
}

/// Read one newline-delimited record, holding at most [`MAX_RECORD_BYTES`].
///
/// An oversized record is consumed through its delimiter and flagged, so
/// the reader stays aligned on record boundaries without ever buffering
/// the whole line.
async fn read_record<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<InboundRecord>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(MAX_RECORD_BYTES as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(InboundRecord::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(InboundRecord::Line(String::from_utf8_lossy(buf).into_owned()));
    }
    if buf.len() <= MAX_RECORD_BYTES {
        // Final record before EOF, the delimiter never arrived
        return Ok(InboundRecord::Line(String::from_utf8_lossy(buf).into_owned()));
    }

    loop {
        buf.clear();
        let n = (&mut *reader)
            .take(MAX_RECORD_BYTES as u64)
            .read_until(b'\n', buf)
            .await?;
        if n == 0 {
            return Ok(InboundRecord::Eof);
        }
        if buf.last() == Some(&b'\n') {
            return Ok(InboundRecord::Oversized);
        }
    }
}

/// Read loop over the newline-framed channel
async fn listen_task(core: Arc<BridgeCore>, read_half: OwnedReadHalf, generation: u64) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        match read_record(&mut reader, &mut buf).await {
            Ok(InboundRecord::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if core.link.lock().unwrap().generation != generation {
                    return;
                }
                dispatch_line(&core, &line, generation).await;
            }
            Ok(InboundRecord::Oversized) => {
                if core.link.lock().unwrap().generation != generation {
                    return;
                }
                warn!(max_bytes = MAX_RECORD_BYTES, "Dropping oversized record");
                let _ = core
                    .events
                    .send(BridgeEvent::BackendError(
                        "Failed to process record: record too large".to_string(),
                    ))
                    .await;
            }
            Ok(InboundRecord::Eof) => {
                handle_disconnect(&core, generation, "backend closed the channel").await;
                return;
            }
            Err(e) => {
                handle_disconnect(&core, generation, &format!("read failed: {e}")).await;
                return;
            }
        }
    }
}

/// Decode one inbound line and route it.
///
/// A malformed line is reported upward and dropped; it never takes the
/// read loop down.
async fn dispatch_line(core: &Arc<BridgeCore>, line: &str, generation: u64) {
    let event = match Event::from_line(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Dropping malformed record");
            let _ = core
                .events
                .send(BridgeEvent::BackendError(format!(
                    "Failed to process record: {e}"
                )))
                .await;
            return;
        }
    };

    match event {
        Event::Connected => {
            let flipped = {
                let mut link = core.link.lock().unwrap();
                if link.generation == generation
                    && link.connection != ConnectionState::Connected
                {
                    link.connection = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            };
            if flipped {
                info!("Backend handshake complete");
                notify_status(core, ConnectionState::Connected).await;
            }
        }
        Event::Message { data } => {
            let _ = core.events.send(BridgeEvent::MessageReceived(data)).await;
        }
        Event::Delivered {
            message_id,
            success,
            reason,
        } => {
            let status = if success {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Failed(
                    reason.unwrap_or_else(|| "delivery failed".to_string()),
                )
            };
            core.tracker.resolve(message_id, status);
        }
        Event::Error { error } => {
            warn!(error = %error, "Backend reported an error");
            let _ = core.events.send(BridgeEvent::BackendError(error)).await;
        }
        Event::Unrecognized(value) => {
            debug!("Forwarding unrecognized record");
            let _ = core.events.send(BridgeEvent::MessageReceived(value)).await;
        }
    }
}

/// Frame and write one command.
///
/// All writers funnel through the single writer lock, so concurrent sends
/// never interleave bytes. A failed write tears the channel down before
/// returning the error.
pub(crate) async fn write_command(core: &Arc<BridgeCore>, command: &Command) -> Result<()> {
    let line = command.to_line()?;

    let mut writer = core.writer.lock().await;
    let channel = match writer.as_mut() {
        Some(channel) => channel,
        None => return Err(Error::NotConnected),
    };
    let generation = channel.generation;

    let result = async {
        channel.stream.write_all(line.as_bytes()).await?;
        channel.stream.write_all(b"\n").await?;
        channel.stream.flush().await
    }
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            *writer = None;
            drop(writer);
            handle_disconnect(core, generation, &format!("write failed: {e}")).await;
            Err(Error::Channel(e))
        }
    }
}

/// Spawn the configured backend when it is not already running
async fn ensure_backend(core: &Arc<BridgeCore>) {
    let config = match core.config.backend.as_ref() {
        Some(config) => config,
        None => return,
    };

    // Checked under the lock shutdown reaps through, so a racing
    // shutdown either sees this spawn or prevents it
    let mut backend = core.backend.lock().await;
    if core.closed.load(Ordering::SeqCst) {
        return;
    }
    if backend.as_mut().map_or(false, BackendProcess::is_running) {
        return;
    }

    match BackendProcess::spawn(config) {
        Ok(process) => *backend = Some(process),
        Err(e) => {
            warn!(error = %e, "Backend spawn failed");
            let _ = core.events.send(BridgeEvent::BackendError(e.to_string())).await;
        }
    }
}

async fn notify_status(core: &BridgeCore, state: ConnectionState) {
    debug!(state = %state, "Connection state changed");
    let _ = core.events.send(BridgeEvent::StatusChanged(state)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use crate::bridge::Bridge;
    use crate::config::BridgeConfig;
    use crate::harness::{self, AckMode, FakeBackend};

    #[tokio::test]
    async fn test_rescheduling_keeps_a_single_timer() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let server = tokio::spawn(async move {
            let mut sessions = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                // Hold the stream open so the client stays in Connecting
                sessions.push(stream);
            }
        });

        let config = BridgeConfig {
            socket_path: socket,
            reconnect_delay_ms: 150,
            ..BridgeConfig::default()
        };
        let (bridge, _events) = Bridge::new(config);

        // Five schedules must collapse into one armed timer
        for _ in 0..5 {
            schedule_reconnect(&bridge.core);
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        bridge.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_write_without_channel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            socket_path: dir.path().join("backend.sock"),
            ..BridgeConfig::default()
        };
        let (bridge, _events) = Bridge::new(config);

        let command = Command::SetTransport {
            transport: TransportMode::Direct,
        };
        match write_command(&bridge.core, &command).await {
            Err(Error::NotConnected) => {}
            other => panic!("wrong outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_and_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let backend = FakeBackend::spawn(&socket, AckMode::Success);

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        bridge.connect().await.unwrap();

        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);
        assert_eq!(backend.connection_count(), 1);

        bridge.shutdown().await;
        backend.stop();
    }

    #[tokio::test]
    async fn test_failed_connect_reports_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        // Nothing is listening yet
        match bridge.connect().await {
            Err(Error::Channel(_)) => {}
            other => panic!("wrong outcome: {other:?}"),
        }

        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        match harness::recv_event(&mut events).await {
            BridgeEvent::BackendError(message) => {
                assert!(message.contains("Cannot reach backend"), "got: {message}")
            }
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Disconnected
        );

        // Once the backend appears, the armed retry finds it
        let backend = FakeBackend::spawn(&socket, AckMode::Success);
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        bridge.shutdown().await;
        backend.stop();
    }

    #[tokio::test]
    async fn test_lost_channel_reconnects_and_replays_join() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let mut backend = FakeBackend::spawn(&socket, AckMode::Success);

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        bridge
            .join("alpha", json!({"identityKey": "pk-alpha"}))
            .await
            .unwrap();

        let first = backend.next_command().await;
        assert_eq!(first["cmd"], "join");
        assert_eq!(first["room"], "alpha");
        assert_eq!(first["preKeyBundle"]["identityKey"], "pk-alpha");
        assert_eq!(first["transport"], "direct");

        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        // Backend crash: the channel drops without warning
        backend.close_current();
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Disconnected
        );

        // The retry reconnects and the stored join is replayed
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        let replayed = backend.next_command().await;
        assert_eq!(replayed["cmd"], "join");
        assert_eq!(replayed["room"], "alpha");
        assert_eq!(backend.connection_count(), 2);

        bridge.shutdown().await;
        backend.stop();
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_stop_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let backend = FakeBackend::spawn(&socket, AckMode::Success);

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        bridge.connect().await.unwrap();
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        backend.push_raw("{this is not json");
        match harness::recv_event(&mut events).await {
            BridgeEvent::BackendError(message) => {
                assert!(message.contains("Failed to process record"), "got: {message}")
            }
            other => panic!("wrong event: {other:?}"),
        }

        // The listener is still alive and delivers the next record
        backend.push_raw(r#"{"type":"message","data":{"body":"still here"}}"#);
        match harness::recv_event(&mut events).await {
            BridgeEvent::MessageReceived(envelope) => {
                assert_eq!(envelope["body"], "still here")
            }
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);

        bridge.shutdown().await;
        backend.stop();
    }

    #[tokio::test]
    async fn test_oversized_record_does_not_stop_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let backend = FakeBackend::spawn(&socket, AckMode::Success);

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        bridge.connect().await.unwrap();
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        // Spans several read chunks, never gets buffered whole
        let flood = "x".repeat(MAX_RECORD_BYTES + 4096);
        backend.push_raw(&flood);
        match harness::recv_event(&mut events).await {
            BridgeEvent::BackendError(message) => {
                assert!(message.contains("record too large"), "got: {message}")
            }
            other => panic!("wrong event: {other:?}"),
        }

        // The listener is still aligned on record boundaries
        backend.push_raw(r#"{"type":"message","data":{"body":"fits"}}"#);
        match harness::recv_event(&mut events).await {
            BridgeEvent::MessageReceived(envelope) => assert_eq!(envelope["body"], "fits"),
            other => panic!("wrong event: {other:?}"),
        }
        assert_eq!(bridge.connection_state(), ConnectionState::Connected);

        bridge.shutdown().await;
        backend.stop();
    }

    #[tokio::test]
    async fn test_unknown_record_is_forwarded_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let backend = FakeBackend::spawn(&socket, AckMode::Success);

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        bridge.connect().await.unwrap();
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        backend.push_raw(r#"{"type":"presence","user":"zoe","online":true}"#);
        match harness::recv_event(&mut events).await {
            BridgeEvent::MessageReceived(record) => {
                assert_eq!(record["type"], "presence");
                assert_eq!(record["user"], "zoe");
                assert_eq!(record["online"], true);
            }
            other => panic!("wrong event: {other:?}"),
        }

        bridge.shutdown().await;
        backend.stop();
    }

    #[tokio::test]
    async fn test_backend_error_record_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("backend.sock");
        let backend = FakeBackend::spawn(&socket, AckMode::Success);

        let (bridge, mut events) = Bridge::new(harness::test_config(&socket));
        bridge.connect().await.unwrap();
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connecting
        );
        assert_eq!(
            harness::next_status(&mut events).await,
            ConnectionState::Connected
        );

        backend.push_raw(r#"{"type":"error","error":"room full"}"#);
        match harness::recv_event(&mut events).await {
            BridgeEvent::BackendError(message) => assert_eq!(message, "room full"),
            other => panic!("wrong event: {other:?}"),
        }

        bridge.shutdown().await;
        backend.stop();
    }
}
