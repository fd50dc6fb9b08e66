//! umr-remoted: remote control for MPRIS media players over HTTP/WebSocket.
//!
//! - `bus` talks to players on the session bus (zbus 3.x).
//! - `selector` decides which player a request means and remembers the last one.
//! - `cache` turns local `file://` artwork into content-addressed copies.
//! - `hub` coalesces change signals and pushes snapshots to live clients.
//! - `listener` subscribes to bus signals and feeds the hub.
//!
//! No unsafe. Locks are never held across awaits except the per-client sink lock and
//! the bus connection slot while reconnecting.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::must_use_candidate,
    clippy::option_if_let_else,
    clippy::significant_drop_tightening
)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod listener;
pub mod model;
pub mod remote;
pub mod selector;
pub mod server;
pub mod volume;

pub use error::{RemoteError, Result};
