//! Upstream MCP servers running as child processes.
//!
//! Each upstream is launched from a configured command and spoken to with
//! line-delimited JSON-RPC over its stdin/stdout. On start the proxy runs
//! the `initialize` + `tools/list` handshake and records the tool catalog;
//! the [`UpstreamManager`] merges every catalog into one routing table and
//! forwards `tools/call` requests to the owning upstream.
//!
//! # Layers
//!
//! - [`ProcessChannel`]: one child process, one request in flight
//! - [`UpstreamServer`]: handshake, tool catalog, tool invocation
//! - [`UpstreamManager`]: all servers plus the tool → server routing table
//!
//! # Collisions
//!
//! When two upstreams advertise the same tool name the first one to
//! register keeps it; the collision is reported through [`Diagnostics`].

pub mod channel;
pub mod diagnostics;
pub mod error;
pub mod manager;
pub mod server;
pub mod types;

pub use channel::ProcessChannel;
pub use diagnostics::{Diagnostics, RecordingDiagnostics, TracingDiagnostics};
pub use error::{Result, UpstreamError};
pub use manager::{RoutingTable, UpstreamManager};
pub use server::UpstreamServer;
pub use types::{Liveness, PROTOCOL_VERSION, ServerState, ServerStatus, ToolDescriptor};
