use crate::config::{DEFAULT_REQUEST_TIMEOUT_SECS, ProxyConfig, UpstreamServerConfig};
use crate::upstream::{
    diagnostics::Diagnostics,
    error::{Result, UpstreamError},
    server::UpstreamServer,
    types::{ServerStatus, ToolDescriptor},
};
use futures::{StreamExt, future::join_all, stream::FuturesUnordered};
use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

/// Tool name → id of the upstream that owns it.
///
/// The first registration of a name wins; later ones are refused and
/// reported back to the caller with the existing owner.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    owners: HashMap<String, String>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `tool` for `server`. On collision the table is left unchanged
    /// and the current owner is returned.
    pub fn register(&mut self, tool: &str, server: &str) -> std::result::Result<(), &str> {
        match self.owners.entry(tool.to_string()) {
            Entry::Occupied(existing) => Err(existing.into_mut().as_str()),
            Entry::Vacant(slot) => {
                slot.insert(server.to_string());
                Ok(())
            }
        }
    }

    pub fn owner(&self, tool: &str) -> Option<&str> {
        self.owners.get(tool).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Owns every upstream server and the routing table built from their
/// catalogs. It is the only writer of that table.
pub struct UpstreamManager {
    // Registration order; also the iteration order of every listing.
    servers: Vec<Arc<UpstreamServer>>,
    index: HashMap<String, usize>,
    routes: RoutingTable,
    request_timeout: Duration,
    diagnostics: Arc<dyn Diagnostics>,
}

impl std::fmt::Debug for UpstreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamManager")
            .field("server_count", &self.servers.len())
            .field("route_count", &self.routes.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl UpstreamManager {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            servers: Vec::new(),
            index: HashMap::new(),
            routes: RoutingTable::new(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            diagnostics,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build a manager from a loaded config and start every upstream in it.
    pub async fn start_from_config(
        cfg: &ProxyConfig,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Result<Self> {
        let mut manager = Self::new(diagnostics).with_request_timeout(cfg.request_timeout());
        manager.load_and_start(&cfg.upstream_servers).await?;
        Ok(manager)
    }

    /// Start every entry and merge each catalog into the routing table.
    ///
    /// Handshakes run concurrently; catalogs are merged in the order the
    /// servers finish starting. The load is all-or-nothing: if any entry
    /// fails, every server started by this call is shut down, the manager is
    /// left as it was, and the first failure is returned.
    pub async fn load_and_start(&mut self, entries: &[UpstreamServerConfig]) -> Result<()> {
        let mut ids: HashSet<&str> = self.index.keys().map(String::as_str).collect();
        for entry in entries {
            if !ids.insert(entry.id.as_str()) {
                self.diagnostics
                    .error(&format!("Duplicate upstream server id '{}'", entry.id));
                return Err(UpstreamError::DuplicateServer {
                    id: entry.id.clone(),
                });
            }
        }

        let timeout = self.request_timeout;
        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .cloned()
            .map(|cfg| {
                let mut server = UpstreamServer::new(cfg, timeout, Arc::clone(&self.diagnostics));
                async move {
                    let outcome = server.start().await;
                    (server, outcome)
                }
            })
            .collect();

        let mut routes = self.routes.clone();
        let mut started: Vec<Arc<UpstreamServer>> = Vec::with_capacity(entries.len());

        while let Some((server, outcome)) = pending.next().await {
            if let Err(err) = outcome {
                // Unfinished handshakes are dropped; their children die with them.
                drop(pending);
                join_all(started.iter().map(|s| s.shutdown())).await;
                return Err(err);
            }
            self.merge_catalog(&mut routes, &server);
            started.push(Arc::new(server));
        }

        for server in started {
            self.index
                .insert(server.id().to_string(), self.servers.len());
            self.servers.push(server);
        }
        self.routes = routes;
        Ok(())
    }

    fn merge_catalog(&self, routes: &mut RoutingTable, server: &UpstreamServer) {
        for tool in server.tools() {
            if let Err(owner) = routes.register(&tool.name, server.id()) {
                self.diagnostics.error(&format!(
                    "Tool name collision: '{}' provided by both {} and {}",
                    tool.name,
                    owner,
                    server.id()
                ));
            }
        }
    }

    /// Every server's catalog, concatenated in registration order.
    pub fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        self.servers
            .iter()
            .flat_map(|s| s.tools().iter().cloned())
            .collect()
    }

    /// Forward a call to the upstream owning `name`.
    ///
    /// An unrouted name fails with [`UpstreamError::UnknownTool`] before any
    /// child process is touched.
    pub async fn route_tool_call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let Some(server) = self.owning_server(name) else {
            self.diagnostics
                .error(&format!("No upstream server registered for tool '{name}'"));
            return Err(UpstreamError::UnknownTool {
                name: name.to_string(),
            });
        };

        self.diagnostics
            .debug(&format!("Routing tool '{name}' to upstream '{}'", server.id()));
        server.call_tool(name, arguments).await
    }

    pub fn get_servers_status(&self) -> Vec<ServerStatus> {
        self.servers.iter().map(|s| s.status()).collect()
    }

    pub fn get_server_tools(&self, id: &str) -> Result<&[ToolDescriptor]> {
        match self.server(id) {
            Some(server) => Ok(server.tools()),
            None => {
                self.diagnostics
                    .error(&format!("Unknown upstream server id '{id}'"));
                Err(UpstreamError::UnknownServer { id: id.to_string() })
            }
        }
    }

    /// Id of the upstream that owns `tool`, if any.
    pub fn owner_of(&self, tool: &str) -> Option<&str> {
        self.routes.owner(tool)
    }

    pub fn server(&self, id: &str) -> Option<&Arc<UpstreamServer>> {
        self.index.get(id).map(|&i| &self.servers[i])
    }

    pub fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.diagnostics
    }

    fn owning_server(&self, tool: &str) -> Option<&Arc<UpstreamServer>> {
        self.routes.owner(tool).and_then(|id| self.server(id))
    }

    /// Stop every upstream process.
    pub async fn shutdown(&self) {
        join_all(self.servers.iter().map(|s| s.shutdown())).await;
        self.diagnostics
            .info(&format!("Stopped {} upstream servers", self.servers.len()));
    }
}
