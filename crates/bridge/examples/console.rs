//! Interactive console against a running backend daemon.
//!
//! Joins a room and bridges stdin lines into `send`, printing every event:
//!
//! ```text
//! cargo run --example console -- /run/user/1000/culvert/backend.sock lobby
//! ```

use std::path::PathBuf;

use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use culvert_bridge::{Bridge, BridgeConfig, BridgeEvent};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let socket = args.next().map(PathBuf::from);
    let room = args.next().unwrap_or_else(|| "lobby".to_string());

    let mut config = BridgeConfig::default();
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    tracing::info!(socket = %config.socket_path.display(), room = %room, "Starting console");

    let (bridge, mut events) = Bridge::new(config);
    if let Err(e) = bridge.join(room, json!({"identityKey": "console"})).await {
        eprintln!("initial connect failed ({e}); retrying in the background");
    }

    let sender = bridge.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match sender.send_message(json!({"type": "text", "body": line})).await {
                Ok(receipt) => {
                    if let Err(e) = receipt.wait().await {
                        eprintln!("delivery failed: {e}");
                    }
                }
                Err(e) => eprintln!("send rejected: {e}"),
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::StatusChanged(state) => println!("<< status: {state}"),
            BridgeEvent::MessageReceived(envelope) => println!("<< message: {envelope}"),
            BridgeEvent::BackendError(error) => println!("<< error: {error}"),
        }
    }
}
