#![cfg(unix)]

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use upstream_proxy::config::{CommandSpec, UpstreamServerConfig};
use upstream_proxy::frontend::{self, LIST_SERVERS_TOOL};
use upstream_proxy::upstream::{RecordingDiagnostics, UpstreamManager};

const CALC_UPSTREAM: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/^{"jsonrpc":"2.0","id":\([0-9]*\).*/\1/')
  case "$line" in
    *'"method":"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
    *'"method":"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"add"},{"name":"divide"}]}}\n' "$id" ;;
    *'"name":"add"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"3"}]}}\n' "$id" ;;
    *) printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"division by zero"}}\n' "$id" ;;
  esac
done"#;

async fn started_manager() -> Arc<UpstreamManager> {
    let mut manager =
        UpstreamManager::new(RecordingDiagnostics::new()).with_request_timeout(Duration::from_secs(5));
    let cfg = UpstreamServerConfig::new(
        "calc",
        CommandSpec::Argv(vec!["sh".into(), "-c".into(), CALC_UPSTREAM.into()]),
    )
    .with_description("Calculator");
    manager.load_and_start(&[cfg]).await.unwrap();
    Arc::new(manager)
}

#[tokio::test]
async fn test_proxy_session_over_stdio() {
    let manager = started_manager().await;
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, mut client_write) = tokio::io::split(client);
    let serving = tokio::spawn(frontend::serve(Arc::clone(&manager), server_read, server_write));

    let requests = [
        json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{}}}),
        json!({"jsonrpc":"2.0","method":"notifications/initialized"}),
        json!({"jsonrpc":"2.0","id":2,"method":"tools/list","params":{"cursor":null}}),
        json!({"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"add","arguments":{"a":1,"b":2}}}),
        json!({"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"divide","arguments":{"a":1,"b":0}}}),
        json!({"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"nonexistent","arguments":{}}}),
        json!({"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":LIST_SERVERS_TOOL}}),
    ];
    for req in &requests {
        let mut line = req.to_string();
        line.push('\n');
        client_write.write_all(line.as_bytes()).await.unwrap();
    }
    client_write.shutdown().await.unwrap();
    serving.await.unwrap().unwrap();

    let mut responses = Vec::new();
    let mut lines = BufReader::new(client_read).lines();
    while let Some(line) = lines.next_line().await.unwrap() {
        responses.push(serde_json::from_str::<Value>(&line).unwrap());
    }
    // Requests run concurrently; match answers up by id.
    responses.sort_by_key(|r| r["id"].as_u64());
    assert_eq!(responses.len(), 6, "the notification gets no reply");

    assert_eq!(responses[0]["result"]["serverInfo"]["name"], "upstream-proxy");

    let names: Vec<&str> = responses[1]["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.starts_with(&["add", "divide"]));
    assert!(names.contains(&LIST_SERVERS_TOOL));

    assert_eq!(responses[2]["result"]["content"][0]["text"], "3");

    assert_eq!(responses[3]["result"]["isError"], true);
    assert!(
        responses[3]["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("division by zero")
    );

    assert_eq!(responses[4]["error"]["code"], -32602);

    let listing = responses[5]["result"]["content"][0]["text"].as_str().unwrap();
    let servers: Value = serde_json::from_str(listing).unwrap();
    assert_eq!(servers[0]["id"], "calc");
    assert_eq!(servers[0]["tools_count"], 2);
    assert_eq!(servers[0]["status"], "connected");

    manager.shutdown().await;
}
