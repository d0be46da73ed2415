//! KSI Daemon - Unix-socket transport and service assembly.
//!
//! [`KsiDaemon::start`] wires the whole system together: the event
//! router, the plugin registry with every built-in service plugin, the
//! persistent state store, and the line-delimited JSON transport on a
//! Unix socket. The `ksid` binary is a thin clap wrapper around it.
//!
//! # Wire protocol
//!
//! One JSON object per line in each direction. Requests carry
//! `{event, data, correlation_id?}`; every request gets exactly one
//! response — the handler's object augmented with the correlation id, or
//! an `{error: {code, message}}` envelope. Parse errors never close the
//! connection.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod core_plugin;
mod daemon;
mod error;
mod message;
mod monitor;
mod transport;

pub use core_plugin::CorePlugin;
pub use daemon::KsiDaemon;
pub use error::{DaemonError, DaemonResult};
pub use message::MessagePlugin;
pub use monitor::MonitorPlugin;
pub use transport::{UnixSocketPlugin, UnixSocketTransport};
