//! Error types for upstream process management and routing.

use thiserror::Error;

/// Errors raised by upstream channels, servers and the manager.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The configured command could not be spawned.
    #[error("failed to launch upstream '{server}': {reason}")]
    Launch {
        /// Server id.
        server: String,
        /// Why the spawn failed.
        reason: String,
    },

    /// A request was attempted before the process was started.
    #[error("upstream '{server}' is not started")]
    NotStarted {
        /// Server id.
        server: String,
    },

    /// The child closed its output; the channel is permanently unusable.
    #[error("upstream '{server}' closed stdout")]
    Closed {
        /// Server id.
        server: String,
    },

    /// The child answered with an explicit JSON-RPC error object.
    #[error("upstream error from '{server}': {error}")]
    Protocol {
        /// Server id.
        server: String,
        /// The `error` payload, passed through unmodified.
        error: serde_json::Value,
    },

    /// No response line arrived within the configured timeout.
    #[error("upstream '{server}' did not answer '{method}' within {timeout_ms}ms")]
    Timeout {
        /// Server id.
        server: String,
        /// JSON-RPC method of the request that timed out.
        method: String,
        /// The timeout that expired.
        timeout_ms: u64,
    },

    /// The response `id` does not match the request that was sent.
    #[error("upstream '{server}' answered request {expected} with id {received}")]
    ResponseMismatch {
        /// Server id.
        server: String,
        /// Id of the request in flight.
        expected: u64,
        /// Id found in the response (`null` when absent).
        received: serde_json::Value,
    },

    /// The response line was not valid JSON.
    #[error("malformed response from upstream '{server}': {source}")]
    MalformedResponse {
        /// Server id.
        server: String,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// Framing or reading the exchange failed.
    #[error("I/O error talking to upstream '{server}': {source}")]
    Io {
        /// Server id.
        server: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No upstream owns the requested tool.
    #[error("no upstream server registered for tool '{name}'")]
    UnknownTool {
        /// Requested tool name.
        name: String,
    },

    /// No upstream is registered under this id.
    #[error("unknown upstream server id '{id}'")]
    UnknownServer {
        /// Requested server id.
        id: String,
    },

    /// Two configuration entries share one id.
    #[error("duplicate upstream server id '{id}'")]
    DuplicateServer {
        /// The repeated id.
        id: String,
    },
}

impl UpstreamError {
    /// `true` for routing misses, which are caller errors rather than
    /// upstream faults.
    pub fn is_routing_miss(&self) -> bool {
        matches!(self, Self::UnknownTool { .. } | Self::UnknownServer { .. })
    }

    /// `true` when the failing channel can never serve another request.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. }
                | Self::Timeout { .. }
                | Self::Io { .. }
                | Self::ResponseMismatch { .. }
        )
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;
