//! Core of the SFU: room and track registries, peer sessions and the
//! signaling coordinator that keeps every peer's SDP aligned with the
//! current set of room tracks.
//!
//! Transport is abstracted behind the [`peer::SignalStream`] and
//! [`peer::SignalWriter`] traits; the HTTP/WebSocket layer lives in the
//! `sfu-api` crate and the process bootstrap in the `sfu` binary.

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod models;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod system;
pub mod track;

pub use config::Config;
pub use error::{Error, Result};
pub use system::System;

#[cfg(test)]
pub(crate) mod test_helpers;
