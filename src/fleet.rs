//! Engine facade.
//!
//! # Mutation Flow
//! ```text
//! caller
//!     → registry (client id must exist)
//!     → FleetIndex::scan (every other client's document, unlocked)
//!     → ConfigStore::update (lock target → load → validate → mutate → save → unlock)
//!     → caller may hot-reload the running process
//! ```
//!
//! Sibling documents are indexed before the target lock is taken, so a
//! mutation never holds two document locks at once. A sibling edited in the
//! window between scan and save can still collide; the next mutation that
//! touches either record will report it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use toml::Table;

use crate::config::schema::FleetConfig;
use crate::document::{ClientDocument, ConnectionSettings, ListenerRecord, TunnelRecord, TunnelType};
use crate::error::{FleetError, FleetResult};
use crate::observability::metrics;
use crate::registry::{ClientRegistry, DirectoryRegistry};
use crate::store::ConfigStore;
use crate::supervisor::{ProcessStatus, StopOutcome, Supervisor, TunnelRunState};
use crate::validator::{self, FleetIndex};

/// A record tagged with the client that owns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Owned<T> {
    pub client_id: String,
    pub record: T,
}

/// One row of the fleet-wide tunnel view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelOverview {
    pub client_id: String,
    pub name: String,
    pub kind: TunnelType,
    /// `local -> remote` description of where traffic flows.
    pub route: String,
    /// `None` when the client is not running or its admin endpoint did not
    /// answer.
    pub run_state: Option<TunnelRunState>,
}

pub struct Fleet {
    store: ConfigStore,
    registry: Arc<dyn ClientRegistry>,
    supervisor: Supervisor,
}

impl Fleet {
    pub fn new(config: &FleetConfig, registry: Arc<dyn ClientRegistry>) -> Self {
        let store = ConfigStore::new(&config.paths, &config.store);
        let supervisor = Supervisor::new(store.clone(), config.supervisor.clone(), &config.admin);
        Self {
            store,
            registry,
            supervisor,
        }
    }

    /// A fleet whose clients are the sub-directories of `paths.data_dir`.
    pub fn from_config(config: &FleetConfig) -> Self {
        let registry = Arc::new(DirectoryRegistry::new(config.paths.data_dir.clone()));
        Self::new(config, registry)
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn client_ids(&self) -> FleetResult<Vec<String>> {
        Ok(self.registry.list_ids()?.into_iter().collect())
    }

    // ---- reads -------------------------------------------------------

    pub fn document(&self, client_id: &str) -> FleetResult<ClientDocument> {
        self.ensure_client(client_id)?;
        self.store.load(client_id)
    }

    pub fn connection(&self, client_id: &str) -> FleetResult<ConnectionSettings> {
        Ok(self.document(client_id)?.connection)
    }

    pub fn list_tunnels(&self, client_id: &str) -> FleetResult<Vec<TunnelRecord>> {
        Ok(self.document(client_id)?.tunnels)
    }

    pub fn get_tunnel(&self, client_id: &str, name: &str) -> FleetResult<TunnelRecord> {
        self.document(client_id)?
            .tunnels
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| missing_record("tunnel", client_id, name))
    }

    pub fn list_listeners(&self, client_id: &str) -> FleetResult<Vec<ListenerRecord>> {
        Ok(self.document(client_id)?.listeners)
    }

    pub fn get_listener(&self, client_id: &str, name: &str) -> FleetResult<ListenerRecord> {
        self.document(client_id)?
            .listeners
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| missing_record("listener", client_id, name))
    }

    /// Every tunnel in the fleet. Unreadable documents are skipped.
    pub fn all_tunnels(&self) -> FleetResult<Vec<Owned<TunnelRecord>>> {
        Ok(self
            .readable_documents()?
            .into_iter()
            .flat_map(|(client_id, doc)| {
                doc.tunnels.into_iter().map(move |record| Owned {
                    client_id: client_id.clone(),
                    record,
                })
            })
            .collect())
    }

    /// Every listener in the fleet. Unreadable documents are skipped.
    pub fn all_listeners(&self) -> FleetResult<Vec<Owned<ListenerRecord>>> {
        Ok(self
            .readable_documents()?
            .into_iter()
            .flat_map(|(client_id, doc)| {
                doc.listeners.into_iter().map(move |record| Owned {
                    client_id: client_id.clone(),
                    record,
                })
            })
            .collect())
    }

    /// Every tunnel with its route and, where the client's admin endpoint
    /// answers, its live state. Works from any instance, not only the one
    /// that started the processes.
    pub async fn tunnel_overview(&self) -> FleetResult<Vec<TunnelOverview>> {
        let mut rows = Vec::new();
        for client_id in self.registry.list_ids()? {
            if !self.store.exists(&client_id) {
                continue;
            }
            let doc = match self.store.load_async(&client_id).await {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "skipping unreadable document");
                    continue;
                }
            };
            let states = match self.supervisor.run_states(&client_id).await {
                Ok(states) => states,
                Err(e) => {
                    tracing::debug!(client_id = %client_id, error = %e, "no run state for client");
                    HashMap::new()
                }
            };
            let user = doc.connection.user.as_deref();
            for tunnel in &doc.tunnels {
                rows.push(TunnelOverview {
                    client_id: client_id.clone(),
                    name: tunnel.name.clone(),
                    kind: tunnel.tunnel_type(),
                    route: route(&doc.connection, tunnel),
                    run_state: find_run_state(&states, user, &tunnel.name),
                });
            }
        }
        Ok(rows)
    }

    // ---- tunnel mutations ---------------------------------------------

    /// Validate a new tunnel against the fleet and append it.
    pub fn create_tunnel(&self, client_id: &str, fields: Table) -> FleetResult<TunnelRecord> {
        observe("create_tunnel", client_id, self.create_tunnel_inner(client_id, fields))
    }

    fn create_tunnel_inner(&self, client_id: &str, fields: Table) -> FleetResult<TunnelRecord> {
        self.ensure_client(client_id)?;
        let tunnel = TunnelRecord::from_table(fields)?;
        let mut index = self.index_excluding(client_id)?;
        self.store.update(client_id, |doc| {
            index.insert_tunnels_except(client_id, doc, None);
            validator::check_tunnel(&index, client_id, doc, &tunnel, None)?;
            doc.tunnels.push(tunnel.clone());
            Ok(tunnel)
        })
    }

    /// Merge `patch` onto the stored tunnel `name` and re-validate.
    pub fn update_tunnel(&self, client_id: &str, name: &str, patch: Table) -> FleetResult<TunnelRecord> {
        observe("update_tunnel", client_id, self.update_tunnel_inner(client_id, name, patch))
    }

    fn update_tunnel_inner(&self, client_id: &str, name: &str, patch: Table) -> FleetResult<TunnelRecord> {
        self.ensure_client(client_id)?;
        let mut index = self.index_excluding(client_id)?;
        self.store.update(client_id, |doc| {
            let position = doc
                .tunnels
                .iter()
                .position(|t| t.name == name)
                .ok_or_else(|| missing_record("tunnel", client_id, name))?;
            let stored = &doc.tunnels[position];
            validator::check_kind_unchanged(name, stored.tunnel_type().as_str(), &patch)?;
            let merged = stored.patched(patch)?;

            index.insert_tunnels_except(client_id, doc, Some(name));
            validator::check_tunnel(&index, client_id, doc, &merged, Some(name))?;
            doc.tunnels[position] = merged.clone();
            Ok(merged)
        })
    }

    pub fn delete_tunnel(&self, client_id: &str, name: &str) -> FleetResult<TunnelRecord> {
        let result = self.ensure_client(client_id).and_then(|()| {
            self.store.update(client_id, |doc| {
                let position = doc
                    .tunnels
                    .iter()
                    .position(|t| t.name == name)
                    .ok_or_else(|| missing_record("tunnel", client_id, name))?;
                Ok(doc.tunnels.remove(position))
            })
        });
        observe("delete_tunnel", client_id, result)
    }

    // ---- listener mutations -------------------------------------------

    pub fn create_listener(&self, client_id: &str, fields: Table) -> FleetResult<ListenerRecord> {
        let result = self.ensure_client(client_id).and_then(|()| {
            let listener = ListenerRecord::from_table(fields)?;
            self.store.update(client_id, |doc| {
                validator::check_listener(client_id, doc, &listener, None)?;
                doc.listeners.push(listener.clone());
                Ok(listener)
            })
        });
        observe("create_listener", client_id, result)
    }

    pub fn update_listener(&self, client_id: &str, name: &str, patch: Table) -> FleetResult<ListenerRecord> {
        let result = self.ensure_client(client_id).and_then(|()| {
            self.store.update(client_id, |doc| {
                let position = doc
                    .listeners
                    .iter()
                    .position(|l| l.name == name)
                    .ok_or_else(|| missing_record("listener", client_id, name))?;
                let stored = &doc.listeners[position];
                validator::check_kind_unchanged(name, stored.listener_type().as_str(), &patch)?;
                let merged = stored.patched(patch)?;

                validator::check_listener(client_id, doc, &merged, Some(name))?;
                doc.listeners[position] = merged.clone();
                Ok(merged)
            })
        });
        observe("update_listener", client_id, result)
    }

    pub fn delete_listener(&self, client_id: &str, name: &str) -> FleetResult<ListenerRecord> {
        let result = self.ensure_client(client_id).and_then(|()| {
            self.store.update(client_id, |doc| {
                let position = doc
                    .listeners
                    .iter()
                    .position(|l| l.name == name)
                    .ok_or_else(|| missing_record("listener", client_id, name))?;
                Ok(doc.listeners.remove(position))
            })
        });
        observe("delete_listener", client_id, result)
    }

    // ---- document lifecycle -------------------------------------------

    /// Write the first document of a registered client.
    pub fn create_document(&self, client_id: &str, connection: ConnectionSettings) -> FleetResult<ClientDocument> {
        let result = self.ensure_client(client_id).and_then(|()| {
            if self.store.exists(client_id) {
                return Err(FleetError::AlreadyExists(format!(
                    "client {client_id} already has a document"
                )));
            }
            connection.validate()?;
            let index = self.index_excluding(client_id)?;
            validator::check_admin_port(&index, &connection)?;

            let document = ClientDocument::new(connection);
            self.store.create(client_id, &document)?;
            Ok(document)
        });
        observe("create_document", client_id, result)
    }

    /// Merge `patch` into the connection settings; records are untouched.
    pub fn update_connection(&self, client_id: &str, patch: Table) -> FleetResult<ConnectionSettings> {
        let result = self.ensure_client(client_id).and_then(|()| {
            let index = self.index_excluding(client_id)?;
            self.store.update(client_id, |doc| {
                let merged = doc.connection.patched(patch)?;
                validator::check_admin_port(&index, &merged)?;
                doc.connection = merged.clone();
                Ok(merged)
            })
        });
        observe("update_connection", client_id, result)
    }

    /// Stop the client's process, then remove its document and lock file.
    pub async fn delete_document(&self, client_id: &str) -> FleetResult<()> {
        let result = self.delete_document_inner(client_id).await;
        observe("delete_document", client_id, result)
    }

    async fn delete_document_inner(&self, client_id: &str) -> FleetResult<()> {
        if !self.store.exists(client_id) {
            return Err(FleetError::NotFound(format!("client {client_id} has no document")));
        }
        self.supervisor.stop(client_id).await?;
        self.store.remove(client_id)?;
        self.supervisor.forget(client_id);
        Ok(())
    }

    // ---- processes ----------------------------------------------------

    pub async fn start(&self, client_id: &str) -> FleetResult<ProcessStatus> {
        self.ensure_client(client_id)?;
        self.supervisor.start(client_id).await
    }

    pub async fn stop(&self, client_id: &str) -> FleetResult<StopOutcome> {
        self.supervisor.stop(client_id).await
    }

    pub async fn restart(&self, client_id: &str) -> FleetResult<ProcessStatus> {
        self.ensure_client(client_id)?;
        self.supervisor.restart(client_id).await
    }

    pub async fn reload(&self, client_id: &str) -> FleetResult<()> {
        self.supervisor.reload(client_id).await
    }

    /// Push a saved document to the client's process if it is running.
    /// Returns whether a reload was sent.
    pub async fn reload_if_running(&self, client_id: &str) -> FleetResult<bool> {
        if self.supervisor.running_ids().iter().any(|id| id == client_id) {
            self.supervisor.reload(client_id).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Start every registered client that has an executable and a document.
    /// Returns the number of processes started.
    pub async fn start_all(&self) -> FleetResult<usize> {
        let mut started = 0;
        for client_id in self.registry.list_ids()? {
            let layout = self.store.layout();
            if !layout.executable_path(&client_id).is_file() || !self.store.exists(&client_id) {
                tracing::debug!(client_id = %client_id, "not startable, skipping");
                continue;
            }
            match self.supervisor.start(&client_id).await {
                Ok(_) => started += 1,
                Err(e) => tracing::error!(client_id = %client_id, error = %e, "autostart failed"),
            }
        }
        Ok(started)
    }

    pub async fn stop_all(&self) -> FleetResult<()> {
        self.supervisor.stop_all().await
    }

    pub fn status(&self) -> Vec<ProcessStatus> {
        self.supervisor.status()
    }

    // ---- helpers ------------------------------------------------------

    fn ensure_client(&self, client_id: &str) -> FleetResult<()> {
        if self.registry.contains(client_id)? {
            Ok(())
        } else {
            Err(FleetError::NotFound(format!("unknown client {client_id}")))
        }
    }

    fn index_excluding(&self, client_id: &str) -> FleetResult<FleetIndex> {
        let ids = self.registry.list_ids()?;
        Ok(FleetIndex::scan(&self.store, ids, client_id))
    }

    fn readable_documents(&self) -> FleetResult<Vec<(String, ClientDocument)>> {
        let mut documents = Vec::new();
        for client_id in self.registry.list_ids()? {
            if !self.store.exists(&client_id) {
                continue;
            }
            match self.store.load(&client_id) {
                Ok(doc) => documents.push((client_id, doc)),
                Err(e) => tracing::warn!(client_id = %client_id, error = %e, "skipping unreadable document"),
            }
        }
        Ok(documents)
    }
}

fn observe<T>(op: &'static str, client_id: &str, result: FleetResult<T>) -> FleetResult<T> {
    metrics::record_mutation(op, result.is_ok());
    match &result {
        Ok(_) => tracing::info!(client_id, op, "document updated"),
        Err(e) => tracing::info!(client_id, op, error = %e, kind = ?e.kind(), "mutation rejected"),
    }
    result
}

fn missing_record(entity: &str, client_id: &str, name: &str) -> FleetError {
    FleetError::NotFound(format!("{entity} `{name}` not found in client {client_id}"))
}

/// Default relay address of the supervised executable.
const DEFAULT_SERVER_ADDR: &str = "0.0.0.0";

fn route(connection: &ConnectionSettings, tunnel: &TunnelRecord) -> String {
    let local = match tunnel.local_port {
        Some(port) => format!("{}:{}", tunnel.effective_local_ip(), port),
        None => format!("{}:-", tunnel.effective_local_ip()),
    };
    match tunnel.tunnel_type() {
        TunnelType::Tcp | TunnelType::Udp => {
            let server = connection.server_addr.as_deref().unwrap_or(DEFAULT_SERVER_ADDR);
            let port = tunnel
                .remote_port()
                .map_or_else(|| "-".to_string(), |p| p.to_string());
            format!("{local} -> {server}:{port}")
        }
        kind @ (TunnelType::Http | TunnelType::Https) => {
            let scheme = kind.as_str();
            let host = tunnel
                .custom_domains()
                .first()
                .map(String::as_str)
                .or_else(|| tunnel.sub_domain())
                .unwrap_or("-");
            format!("{scheme}://{local} -> {scheme}://{host}")
        }
        TunnelType::Tcpmux | TunnelType::Stcp | TunnelType::Sudp | TunnelType::Xtcp => {
            format!("{local} -> {}", tunnel.name)
        }
    }
}

/// The process may report names prefixed with the connection user.
fn find_run_state(
    states: &HashMap<String, Vec<TunnelRunState>>,
    user: Option<&str>,
    name: &str,
) -> Option<TunnelRunState> {
    let prefixed = user.map(|u| format!("{u}.{name}"));
    states
        .values()
        .flatten()
        .find(|s| s.name == name || Some(&s.name) == prefixed.as_ref())
        .cloned()
}
