use serde::{Deserialize, Serialize};

/// Protocol version sent in every `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One tool advertised by an upstream.
///
/// Only `name` is interpreted; everything else (description, input schema,
/// annotations, ...) is carried through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Outgoing JSON-RPC request line. Field order matches the wire format.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Point-in-time liveness of an upstream process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Connected,
    Down,
}

/// Startup state of an upstream server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Unstarted,
    Starting,
    Ready,
    Failed,
}

/// Status row reported by [`UpstreamManager::get_servers_status`].
///
/// [`UpstreamManager::get_servers_status`]: super::manager::UpstreamManager::get_servers_status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub description: String,
    pub tools_count: usize,
    pub status: Liveness,
    pub state: ServerState,
}
