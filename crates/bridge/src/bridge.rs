//! Bridge handle and shared state
//!
//! [`Bridge`] is the public face of the crate: a cheap-to-clone handle the
//! embedding layer drives, with events flowing back over the channel
//! returned by [`Bridge::new`]. All cross-task state lives in
//! [`BridgeCore`] behind the handle's `Arc`; the connection machinery in
//! [`crate::connection`] operates on the same core from background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use culvert_proto::{Command, TransportMode};

use crate::backend::BackendProcess;
use crate::config::BridgeConfig;
use crate::connection;
use crate::delivery::{DeliveryReceipt, DeliveryStatus, DeliveryTracker};
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::tunnel::TunnelRuntime;

/// Lifecycle of the backend channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events pushed up to the embedding layer
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The channel changed lifecycle state
    StatusChanged(ConnectionState),
    /// An inbound envelope; the payload stays sealed
    MessageReceived(Value),
    /// A backend-side failure worth surfacing
    BackendError(String),
}

/// Join parameters, kept for replay after a reconnect
#[derive(Debug, Clone)]
pub(crate) struct JoinParams {
    pub(crate) room: String,
    pub(crate) pre_key_bundle: Value,
}

/// Write half of the channel, stamped with the generation it was opened
/// under so a failed write is attributed to the right channel
pub(crate) struct ChannelWriter {
    pub(crate) generation: u64,
    pub(crate) stream: OwnedWriteHalf,
}

/// Channel lifecycle state guarded by a single lock.
///
/// `generation` increments whenever the channel is torn down or replaced.
/// Background tasks carry the generation they were started under and go
/// quiet once it no longer matches, so a stale listener can never clobber
/// the state of its successor.
pub(crate) struct LinkState {
    pub(crate) connection: ConnectionState,
    pub(crate) transport: TransportMode,
    pub(crate) generation: u64,
    pub(crate) join: Option<JoinParams>,
}

/// Shared state behind the [`Bridge`] handle
pub(crate) struct BridgeCore {
    pub(crate) link: Mutex<LinkState>,
    pub(crate) writer: AsyncMutex<Option<ChannelWriter>>,
    pub(crate) listener: Mutex<Option<JoinHandle<()>>>,
    pub(crate) reconnect: Mutex<Option<JoinHandle<()>>>,
    pub(crate) events: mpsc::Sender<BridgeEvent>,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) message_limiter: RateLimiter,
    pub(crate) file_limiter: RateLimiter,
    pub(crate) tunnel: TunnelRuntime,
    pub(crate) backend: AsyncMutex<Option<BackendProcess>>,
    pub(crate) closed: AtomicBool,
    pub(crate) config: BridgeConfig,
}

/// Handle to the backend bridge
#[derive(Clone)]
pub struct Bridge {
    pub(crate) core: Arc<BridgeCore>,
}

impl Bridge {
    /// Create a bridge and the receiver its events arrive on.
    ///
    /// Nothing touches the network until [`connect`](Self::connect) or
    /// [`join`](Self::join) is called.
    pub fn new(config: BridgeConfig) -> (Self, mpsc::Receiver<BridgeEvent>) {
        let (events, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let core = Arc::new(BridgeCore {
            link: Mutex::new(LinkState {
                connection: ConnectionState::Disconnected,
                transport: TransportMode::Direct,
                generation: 0,
                join: None,
            }),
            writer: AsyncMutex::new(None),
            listener: Mutex::new(None),
            reconnect: Mutex::new(None),
            events,
            tracker: DeliveryTracker::new(),
            message_limiter: RateLimiter::new("Message", config.message_limit),
            file_limiter: RateLimiter::new("File transfer", config.file_limit),
            tunnel: TunnelRuntime::new(config.tunnel.clone()),
            backend: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });
        (Self { core }, event_rx)
    }

    /// Open the channel to the backend
    pub async fn connect(&self) -> Result<()> {
        connection::open_channel(&self.core).await
    }

    /// Join a room, connecting first when the channel is down.
    ///
    /// The parameters are kept and replayed automatically after any
    /// reconnection.
    pub async fn join(&self, room: impl Into<String>, pre_key_bundle: Value) -> Result<()> {
        let params = JoinParams {
            room: room.into(),
            pre_key_bundle,
        };

        let (state, transport) = {
            let mut link = self.core.link.lock().unwrap();
            link.join = Some(params.clone());
            (link.connection, link.transport)
        };

        // Windows keyed by rooms left behind are dead weight once expired
        self.core.message_limiter.prune_idle();
        self.core.file_limiter.prune_idle();

        let command = Command::Join {
            room: params.room,
            pre_key_bundle: params.pre_key_bundle,
            transport,
        };

        match state {
            ConnectionState::Disconnected => connection::open_channel(&self.core).await,
            // Mid-handshake the write can land before the greeting; if the
            // writer is not up yet, the stored join is replayed on connect
            ConnectionState::Connecting | ConnectionState::Connected => {
                match connection::write_command(&self.core, &command).await {
                    Err(Error::NotConnected) => Ok(()),
                    other => other,
                }
            }
        }
    }

    /// Send a sealed payload to the joined room.
    ///
    /// Returns a receipt that resolves when the backend acknowledges
    /// delivery, reports a failure, or the deadline passes. The send
    /// itself fails fast when the channel is down or the rate limiter
    /// rejects it. Payloads whose `type` field is `"file"` are admitted
    /// against the file window, everything else against the message
    /// window.
    pub async fn send_message(&self, payload: Value) -> Result<DeliveryReceipt> {
        let key = {
            let link = self.core.link.lock().unwrap();
            if link.connection != ConnectionState::Connected {
                return Err(Error::NotConnected);
            }
            link.join
                .as_ref()
                .map_or_else(|| "unjoined".to_string(), |j| j.room.clone())
        };

        let limiter = if payload.get("type").and_then(Value::as_str) == Some("file") {
            &self.core.file_limiter
        } else {
            &self.core.message_limiter
        };
        if !limiter.is_allowed(&key) {
            return Err(Error::RateLimited(limiter.name()));
        }

        let id = Uuid::new_v4();
        // Track before writing so a fast ack always finds its entry
        let receipt = self
            .core
            .tracker
            .track(id, self.core.config.delivery_deadline());

        let command = Command::Send { id, data: payload };
        if let Err(e) = connection::write_command(&self.core, &command).await {
            self.core
                .tracker
                .resolve(id, DeliveryStatus::Failed("channel write failed".to_string()));
            return Err(e);
        }
        debug!(message_id = %id, "Message dispatched");
        Ok(receipt)
    }

    /// Switch between the direct path and the overlay mesh.
    ///
    /// A no-op when the requested mode is already active. Otherwise the
    /// channel is torn down and re-established from scratch: the backend
    /// drops per-connection state on a transport change, and a fresh
    /// connect with the stored join replayed is the one reliable way back
    /// to a consistent session.
    pub async fn set_transport(&self, overlay: bool) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let target = if overlay {
            TransportMode::Mesh
        } else {
            TransportMode::Direct
        };

        let (current, was_connected) = {
            let link = self.core.link.lock().unwrap();
            (link.transport, link.connection == ConnectionState::Connected)
        };
        if current == target {
            debug!(transport = %target, "Transport already active");
            return Ok(());
        }
        info!(from = %current, to = %target, "Switching transport");

        // Best effort: let the backend wind down its side first
        if was_connected {
            let command = Command::SetTransport { transport: target };
            let _ = connection::write_command(&self.core, &command).await;
        }

        // Cancel first: a timer firing behind the teardown would have its
        // attempt aborted half-open, stranding the state at Connecting
        connection::cancel_reconnect(&self.core);
        // Flip before the teardown so an attempt racing the switch reads
        // the new mode
        self.core.link.lock().unwrap().transport = target;
        connection::teardown_channel(&self.core).await;

        match target {
            TransportMode::Mesh => {
                if let Err(e) = self.core.tunnel.start().await {
                    warn!(error = %e, "Tunnel failed to start");
                    let _ = self
                        .core
                        .events
                        .send(BridgeEvent::BackendError(e.to_string()))
                        .await;
                    // The mode sticks; the retry path keeps trying mesh
                    connection::schedule_reconnect(&self.core);
                    return Err(e);
                }
            }
            TransportMode::Direct => self.core.tunnel.stop().await,
        }

        connection::open_channel(&self.core).await
    }

    /// Tear everything down: channel, timers, tunnel, owned backend.
    ///
    /// Idempotent. Afterwards connect paths return [`Error::Shutdown`].
    pub async fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Bridge shutting down");

        connection::cancel_reconnect(&self.core);
        connection::teardown_channel(&self.core).await;
        self.core.tunnel.stop().await;

        let backend = self.core.backend.lock().await.take();
        if let Some(mut backend) = backend {
            backend.stop().await;
        }
    }

    /// Current channel lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        self.core.link.lock().unwrap().connection
    }

    /// Currently selected transport
    pub fn transport_mode(&self) -> TransportMode {
        self.core.link.lock().unwrap().transport
    }

    /// Sends still awaiting their delivery ack
    pub fn pending_deliveries(&self) -> usize {
        self.core.tracker.pending_count()
    }
}
