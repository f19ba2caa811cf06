//! Line-delimited JSON-RPC front end over the proxy's own stdio.
//!
//! Clients see one MCP server: `tools/list` returns the union of every
//! upstream catalog plus the `proxy.*` introspection tools, and `tools/call`
//! is routed through [`UpstreamManager::route_tool_call`].
//!
//! Requests are handled concurrently; responses go through a single writer
//! task so lines never interleave.

use crate::upstream::{PROTOCOL_VERSION, ToolDescriptor, UpstreamError, UpstreamManager};
use futures::StreamExt;
use serde_json::{Value, json};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Longest accepted request line.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub const LIST_SERVERS_TOOL: &str = "proxy.list_servers";
pub const SERVER_TOOLS_TOOL: &str = "proxy.server_tools";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Serve requests from `reader` until it reaches end-of-stream.
///
/// Returns once every in-flight request has been answered and flushed.
pub async fn serve<R, W>(manager: Arc<UpstreamManager>, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let diagnostics = Arc::clone(manager.diagnostics());
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer_task = tokio::spawn(async move {
        let mut w = writer;
        while let Some(msg) = rx.recv().await {
            let mut line = serde_json::to_string(&msg)?;
            line.push('\n');
            w.write_all(line.as_bytes()).await?;
            w.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut inflight = JoinSet::new();

    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                diagnostics.error("Dropped oversized request line");
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                diagnostics.error(&format!("Ignoring malformed request line: {e}"));
                continue;
            }
        };

        let manager = Arc::clone(&manager);
        let tx = tx.clone();
        inflight.spawn(async move {
            if let Some(resp) = handle_message(&manager, msg).await {
                let _ = tx.send(resp);
            }
        });
    }

    while inflight.join_next().await.is_some() {}
    drop(tx);
    writer_task.await.map_err(io::Error::other)?
}

/// Answer one incoming message. Notifications and stray responses yield
/// `None`.
pub async fn handle_message(manager: &UpstreamManager, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(Value::as_str)?;
    let id = msg.get("id").filter(|id| !id.is_null())?.clone();
    let params = msg.get("params").cloned().unwrap_or(Value::Null);

    let resp = match method {
        "initialize" => ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "ping" => ok(id, json!({})),
        "tools/list" => {
            let mut tools = manager.get_all_tools();
            tools.extend(builtin_tools());
            ok(id, json!({ "tools": tools }))
        }
        "tools/call" => call_tool(manager, id, &params).await,
        other => error(id, METHOD_NOT_FOUND, &format!("Method not found: {other}")),
    };
    Some(resp)
}

async fn call_tool(manager: &UpstreamManager, id: Value, params: &Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return error(id, INVALID_PARAMS, "tools/call requires a string 'name'");
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        LIST_SERVERS_TOOL => ok(id, text_result(&json!(manager.get_servers_status()))),
        SERVER_TOOLS_TOOL => {
            let server_id = arguments
                .get("server_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match manager.get_server_tools(server_id) {
                Ok(tools) => ok(id, text_result(&json!(tools))),
                Err(e) => ok(id, failed_result(&e)),
            }
        }
        _ => match manager.route_tool_call(name, arguments).await {
            Ok(result) => ok(id, result),
            Err(e) if e.is_routing_miss() => error(id, INVALID_PARAMS, &format!("Unknown tool: {name}")),
            Err(e) => ok(id, failed_result(&e)),
        },
    }
}

fn builtin_tools() -> Vec<ToolDescriptor> {
    let describe = |name: &str, description: &str, schema: Value| {
        let mut tool = ToolDescriptor::new(name);
        tool.metadata
            .insert("description".to_string(), Value::from(description));
        tool.metadata.insert("inputSchema".to_string(), schema);
        tool
    };

    vec![
        describe(
            LIST_SERVERS_TOOL,
            "List upstream servers with their tool counts and liveness",
            json!({ "type": "object", "properties": {} }),
        ),
        describe(
            SERVER_TOOLS_TOOL,
            "List the tools advertised by one upstream server",
            json!({
                "type": "object",
                "properties": { "server_id": { "type": "string" } },
                "required": ["server_id"]
            }),
        ),
    ]
}

fn text_result(payload: &Value) -> Value {
    let text = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    json!({ "content": [{ "type": "text", "text": text }] })
}

fn failed_result(err: &UpstreamError) -> Value {
    json!({
        "content": [{ "type": "text", "text": err.to_string() }],
        "isError": true
    })
}

fn ok(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::diagnostics::RecordingDiagnostics;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn empty_manager() -> Arc<UpstreamManager> {
        Arc::new(UpstreamManager::new(RecordingDiagnostics::new()))
    }

    #[tokio::test]
    async fn test_initialize_advertises_tools() {
        let resp = handle_message(
            &empty_manager(),
            json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}),
        )
        .await
        .unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let reply = handle_message(
            &empty_manager(),
            json!({"jsonrpc":"2.0","method":"notifications/initialized"}),
        )
        .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_a_jsonrpc_error() {
        let resp = handle_message(
            &empty_manager(),
            json!({"jsonrpc":"2.0","id":"a","method":"tools/call","params":{"name":"nonexistent","arguments":{}}}),
        )
        .await
        .unwrap();
        assert_eq!(resp["id"], "a");
        assert_eq!(resp["error"]["code"], INVALID_PARAMS);
        assert!(resp.get("result").is_none());
    }

    #[tokio::test]
    async fn test_builtin_tools_are_listed_and_callable() {
        let manager = empty_manager();
        let resp = handle_message(&manager, json!({"id":2,"method":"tools/list"}))
            .await
            .unwrap();
        let names: Vec<&str> = resp["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names, vec![LIST_SERVERS_TOOL, SERVER_TOOLS_TOOL]);

        let resp = handle_message(
            &manager,
            json!({"id":3,"method":"tools/call","params":{"name":SERVER_TOOLS_TOOL,"arguments":{"server_id":"ghost"}}}),
        )
        .await
        .unwrap();
        assert_eq!(resp["result"]["isError"], true);
        assert!(
            resp["result"]["content"][0]["text"]
                .as_str()
                .unwrap()
                .contains("ghost")
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let resp = handle_message(&empty_manager(), json!({"id":9,"method":"resources/list"}))
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_skips_garbage_and_answers_in_lines() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let serving = tokio::spawn(serve(empty_manager(), server_read, server_write));

        client_write
            .write_all(b"not json\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let resp: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"], json!({}));

        serving.await.unwrap().unwrap();
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
