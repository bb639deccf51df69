//! Culvert wire protocol
//!
//! Line-oriented JSON envelopes exchanged with the local backend process.
//! This crate is pure: it defines the envelope shapes and the line codec,
//! and never touches the channel itself.
//!
//! # Wire format
//!
//! One record per line, UTF-8 JSON. Outbound records are tagged by `cmd`,
//! inbound records by `type`. Message payloads pass through opaquely: the
//! codec reads the envelope, never the sealed content.
//!
//! # Usage
//!
//! ```ignore
//! // Outbound
//! let line = Command::Send { id, data }.to_line()?;
//!
//! // Inbound
//! match Event::from_line(&line)? {
//!     Event::Message { data } => { /* hand to the UI layer */ }
//!     Event::Unrecognized(raw) => { /* forward untouched */ }
//!     _ => {}
//! }
//! ```

pub mod envelope;
pub mod error;

pub use envelope::{Command, Event, TransportMode};
pub use error::DecodeError;
