//! Upstream Proxy
//!
//! An MCP proxy that launches a set of upstream tool servers as child
//! processes, aggregates the tools they expose and routes each tool call to
//! the upstream that owns it.
//!
//! # Modules
//!
//! - [`config`]: CLI flags and the YAML upstream list
//! - [`upstream`]: process channels, handshake, routing table
//! - [`frontend`]: JSON-RPC front end over the proxy's own stdio
//! - [`telemetry`]: `tracing` subscriber setup

#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::map_err_ignore)]

pub mod config;
pub mod frontend;
pub mod telemetry;
pub mod upstream;
