use crate::config::UpstreamServerConfig;
use crate::upstream::{
    channel::ProcessChannel,
    diagnostics::Diagnostics,
    error::Result,
    types::{Liveness, PROTOCOL_VERSION, ServerState, ServerStatus, ToolDescriptor},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

/// One configured upstream: its process channel plus the tool catalog
/// fetched during the handshake.
#[derive(Debug)]
pub struct UpstreamServer {
    config: UpstreamServerConfig,
    channel: ProcessChannel,
    tools: Vec<ToolDescriptor>,
    state: ServerState,
    diagnostics: Arc<dyn Diagnostics>,
}

impl UpstreamServer {
    pub fn new(
        config: UpstreamServerConfig,
        request_timeout: Duration,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let channel = ProcessChannel::new(&config.id, request_timeout, Arc::clone(&diagnostics));
        Self {
            config,
            channel,
            tools: Vec::new(),
            state: ServerState::Unstarted,
            diagnostics,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn description(&self) -> &str {
        &self.config.description
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Tool catalog from `tools/list`; empty until `start` succeeds.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Launch the process, then run `initialize` followed by `tools/list`.
    pub async fn start(&mut self) -> Result<()> {
        self.state = ServerState::Starting;
        self.diagnostics.info(&format!(
            "Starting upstream server '{}' with: {}",
            self.config.id, self.config.command
        ));

        match self.handshake().await {
            Ok(()) => {
                self.state = ServerState::Ready;
                self.diagnostics.info(&format!(
                    "Upstream '{}' has {} tools",
                    self.config.id,
                    self.tools.len()
                ));
                Ok(())
            }
            Err(err) => {
                self.state = ServerState::Failed;
                self.diagnostics.error(&format!(
                    "Upstream '{}' failed to start: {err}",
                    self.config.id
                ));
                self.channel.shutdown().await;
                Err(err)
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        self.channel
            .start(&self.config.command, &self.config.env)
            .await?;

        self.channel
            .send_request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {}
                })),
            )
            .await?;

        let resp = self
            .channel
            .send_request("tools/list", Some(json!({ "cursor": null })))
            .await?;
        self.tools = self.extract_tools(&resp);
        Ok(())
    }

    /// Pull the catalog out of a `tools/list` response.
    ///
    /// `result.tools` wins over a top-level `tools`. A response with neither
    /// yields an empty catalog; entries without a string `name` are dropped.
    fn extract_tools(&self, resp: &serde_json::Value) -> Vec<ToolDescriptor> {
        let listed = resp
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(serde_json::Value::as_array)
            .or_else(|| resp.get("tools").and_then(serde_json::Value::as_array));

        let Some(listed) = listed else {
            self.diagnostics.error(&format!(
                "Upstream '{}' did not return tools in tools/list",
                self.config.id
            ));
            return Vec::new();
        };

        listed
            .iter()
            .filter_map(|raw| match serde_json::from_value(raw.clone()) {
                Ok(tool) => Some(tool),
                Err(e) => {
                    self.diagnostics.error(&format!(
                        "Upstream '{}' listed an unusable tool {raw}: {e}",
                        self.config.id
                    ));
                    None
                }
            })
            .collect()
    }

    /// Invoke `name` on this upstream; yields `result`, or the whole
    /// response when it has none.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut resp = self
            .channel
            .send_request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;

        if let Some(result) = resp.get_mut("result") {
            return Ok(result.take());
        }
        Ok(resp)
    }

    pub fn liveness(&self) -> Liveness {
        if self.channel.is_alive() {
            Liveness::Connected
        } else {
            Liveness::Down
        }
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.config.id.clone(),
            description: self.config.description.clone(),
            tools_count: self.tools.len(),
            status: self.liveness(),
            state: self.state,
        }
    }

    pub async fn shutdown(&self) {
        self.channel.shutdown().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CommandSpec;
    use crate::upstream::{diagnostics::RecordingDiagnostics, error::UpstreamError};

    fn server(script: &str) -> (UpstreamServer, Arc<RecordingDiagnostics>) {
        let diag = RecordingDiagnostics::new();
        let cfg = UpstreamServerConfig::new(
            "unit",
            CommandSpec::Argv(vec!["sh".into(), "-c".into(), script.into()]),
        )
        .with_description("unit test upstream");
        let srv = UpstreamServer::new(
            cfg,
            Duration::from_secs(5),
            Arc::clone(&diag) as Arc<dyn Diagnostics>,
        );
        (srv, diag)
    }

    #[tokio::test]
    async fn test_handshake_reads_nested_tools() {
        let (mut srv, _) = server(
            r#"read -r line
echo '{"id":1,"result":{}}'
read -r line
echo '{"id":2,"result":{"tools":[{"name":"echo","description":"Echo input"}]}}'
read -r line
echo '{"id":3,"result":{"content":[{"type":"text","text":"hi"}]}}'
sleep 5"#,
        );
        assert_eq!(srv.state(), ServerState::Unstarted);
        assert_eq!(srv.liveness(), Liveness::Down);

        srv.start().await.unwrap();
        assert_eq!(srv.state(), ServerState::Ready);
        assert_eq!(srv.tools().len(), 1);
        assert_eq!(srv.tools()[0].name, "echo");
        assert_eq!(srv.tools()[0].metadata["description"], "Echo input");

        let status = srv.status();
        assert_eq!(status.id, "unit");
        assert_eq!(status.description, "unit test upstream");
        assert_eq!(status.tools_count, 1);
        assert_eq!(status.status, Liveness::Connected);

        let result = srv.call_tool("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "hi");

        srv.shutdown().await;
        assert_eq!(srv.liveness(), Liveness::Down);
    }

    #[tokio::test]
    async fn test_handshake_accepts_top_level_tools() {
        let (mut srv, _) = server(
            r#"read -r line
echo '{"id":1,"result":{}}'
read -r line
echo '{"id":2,"tools":[{"name":"a"},{"name":"b"}]}'
read -r line
echo '{"id":3,"content":"raw"}'"#,
        );
        srv.start().await.unwrap();
        let names: Vec<&str> = srv.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        // No `result` field: the raw response comes back.
        let raw = srv.call_tool("a", json!({})).await.unwrap();
        assert_eq!(raw["content"], "raw");
        assert_eq!(raw["id"], 3);
    }

    #[tokio::test]
    async fn test_missing_tools_degrades_to_empty_catalog() {
        let (mut srv, diag) = server(
            r#"read -r line
echo '{"id":1,"result":{}}'
read -r line
echo '{"id":2,"result":{}}'
sleep 5"#,
        );
        srv.start().await.unwrap();
        assert_eq!(srv.state(), ServerState::Ready);
        assert!(srv.tools().is_empty());
        assert!(
            diag.errors()
                .iter()
                .any(|m| m.contains("did not return tools"))
        );
        srv.shutdown().await;
    }

    #[tokio::test]
    async fn test_nameless_tools_are_dropped() {
        let (mut srv, diag) = server(
            r#"read -r line
echo '{"id":1,"result":{}}'
read -r line
echo '{"id":2,"result":{"tools":[{"description":"anonymous"},{"name":"kept"}]}}'
sleep 5"#,
        );
        srv.start().await.unwrap();
        assert_eq!(srv.tools(), &[ToolDescriptor::new("kept")]);
        assert!(diag.errors().iter().any(|m| m.contains("unusable tool")));
        srv.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_error_aborts_start() {
        let (mut srv, diag) = server(
            r#"read -r line
echo '{"id":1,"error":{"code":-32600,"message":"unsupported protocol"}}'
sleep 5"#,
        );
        let err = srv.start().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Protocol { .. }));
        assert_eq!(srv.state(), ServerState::Failed);
        assert_eq!(srv.liveness(), Liveness::Down);
        assert!(diag.errors().iter().any(|m| m.contains("failed to start")));
    }

    #[tokio::test]
    async fn test_call_before_start_is_not_started() {
        let (srv, _) = server("sleep 5");
        let err = srv.call_tool("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotStarted { .. }));
    }
}
