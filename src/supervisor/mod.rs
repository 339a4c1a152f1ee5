//! Supervision of one external process per client.
//!
//! # States
//! ```text
//! Absent ──start──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                      │                              │
//!                      └──(process exits on its own)──┘
//! Stopped ──start──▶ Running
//! ```
//!
//! # Design Decisions
//! - One `Supervisor` per running system, shared by reference
//! - The registry map is behind a short-lived `std::sync::Mutex`; each entry
//!   carries its own async mutex so operations on one id are serialized
//!   while different ids proceed independently
//! - `stop` takes the child out of its entry before terminating it and a
//!   drop guard marks the entry stopped, so no handle survives a failed or
//!   cancelled stop

pub mod admin;
pub mod process;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::process::Child;

use crate::config::schema::{AdminEndpointConfig, SupervisorConfig};
use crate::error::{FleetError, FleetResult};
use crate::observability::metrics;
use crate::store::ConfigStore;

pub use admin::{AdminClient, AdminError, AdminTarget, RunStates, TunnelRunState};
pub use process::Termination;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Never started by this supervisor.
    Absent,
    Running,
    Stopping,
    /// Exited or killed.
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Absent => "absent",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub client_id: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// Exit code of the last run, when it has ended.
    pub exit_code: Option<i32>,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NothingToStop,
    Stopped(Termination),
}

#[derive(Debug)]
struct Handle {
    state: ProcessState,
    child: Option<Child>,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

impl Handle {
    /// Fold an exit the child made on its own into the state.
    fn refresh(&mut self, client_id: &str) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(client_id, pid = ?self.pid, code = ?status.code(), "process exited");
                self.child = None;
                self.pid = None;
                self.exit_code = status.code();
                self.state = ProcessState::Stopped;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(client_id, error = %e, "liveness check failed"),
        }
    }

    fn status(&self, client_id: &str) -> ProcessStatus {
        ProcessStatus {
            client_id: client_id.to_string(),
            state: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
        }
    }
}

#[derive(Debug)]
struct Entry {
    /// Serializes start/stop/reload for this id.
    op: tokio::sync::Mutex<()>,
    handle: Mutex<Handle>,
}

impl Entry {
    fn new() -> Self {
        Self {
            op: tokio::sync::Mutex::new(()),
            handle: Mutex::new(Handle {
                state: ProcessState::Absent,
                child: None,
                pid: None,
                exit_code: None,
            }),
        }
    }

    fn handle(&self) -> MutexGuard<'_, Handle> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks an entry stopped when dropped, whatever happened in between.
struct StopGuard<'a> {
    entry: &'a Entry,
    exit_code: Option<i32>,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        let mut handle = self.entry.handle();
        handle.child = None;
        handle.pid = None;
        handle.exit_code = self.exit_code;
        handle.state = ProcessState::Stopped;
    }
}

/// Registry of supervised client processes.
#[derive(Debug)]
pub struct Supervisor {
    store: ConfigStore,
    settings: SupervisorConfig,
    admin: AdminClient,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl Supervisor {
    pub fn new(store: ConfigStore, settings: SupervisorConfig, admin: &AdminEndpointConfig) -> Self {
        Self {
            store,
            settings,
            admin: AdminClient::new(admin),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start the client's executable unless it is already running.
    pub async fn start(&self, client_id: &str) -> FleetResult<ProcessStatus> {
        let entry = self.entry_or_insert(client_id);
        let _op = entry.op.lock().await;

        {
            let mut handle = entry.handle();
            handle.refresh(client_id);
            if handle.state == ProcessState::Running {
                tracing::debug!(client_id, pid = ?handle.pid, "already running");
                return Ok(handle.status(client_id));
            }
        }

        let layout = self.store.layout();
        let executable = layout.executable_path(client_id);
        if !executable.is_file() {
            return Err(FleetError::NotFound(format!(
                "client {client_id} has no executable at {}",
                executable.display()
            )));
        }
        let document = layout.document_path(client_id);
        if !document.is_file() {
            return Err(FleetError::NotFound(format!("client {client_id} has no document")));
        }

        let child = process::spawn(client_id, &executable, &document, &self.settings.config_flag)?;
        let pid = child.id();
        let status = {
            let mut handle = entry.handle();
            handle.child = Some(child);
            handle.pid = pid;
            handle.exit_code = None;
            handle.state = ProcessState::Running;
            handle.status(client_id)
        };

        tracing::info!(client_id, pid = ?pid, executable = %executable.display(), "process started");
        metrics::record_process_start();
        self.publish_running();
        Ok(status)
    }

    /// Terminate the client's process: SIGTERM, wait, then SIGKILL.
    ///
    /// Returns [`StopOutcome::NothingToStop`] when nothing is running.
    pub async fn stop(&self, client_id: &str) -> FleetResult<StopOutcome> {
        let Some(entry) = self.entry(client_id) else {
            return Ok(StopOutcome::NothingToStop);
        };
        let _op = entry.op.lock().await;

        let child = {
            let mut handle = entry.handle();
            handle.refresh(client_id);
            match handle.child.take() {
                Some(child) => {
                    handle.state = ProcessState::Stopping;
                    child
                }
                None => return Ok(StopOutcome::NothingToStop),
            }
        };

        let mut guard = StopGuard {
            entry: &entry,
            exit_code: None,
        };
        let mut child = child;
        let result = process::terminate(
            client_id,
            &mut child,
            self.settings.stop_timeout(),
            self.settings.stop_poll_interval(),
        )
        .await;
        if let Ok(termination) = &result {
            guard.exit_code = termination.exit_code;
        }
        drop(guard);
        self.publish_running();

        match result {
            Ok(termination) => {
                tracing::info!(client_id, code = ?termination.exit_code, forced = termination.forced, "process stopped");
                metrics::record_process_stop(termination.forced);
                Ok(StopOutcome::Stopped(termination))
            }
            Err(e) => {
                tracing::error!(client_id, error = %e, "process stop failed; handle released");
                Err(e)
            }
        }
    }

    pub async fn restart(&self, client_id: &str) -> FleetResult<ProcessStatus> {
        self.stop(client_id).await?;
        self.start(client_id).await
    }

    /// Stop every running entry. Failures are logged; the first is returned
    /// after all entries have been attempted.
    pub async fn stop_all(&self) -> FleetResult<()> {
        let mut first_error = None;
        for client_id in self.running_ids() {
            if let Err(e) = self.stop(&client_id).await {
                tracing::error!(client_id = %client_id, error = %e, "stop failed during stop_all");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hot-reload the client's document through its admin endpoint.
    pub async fn reload(&self, client_id: &str) -> FleetResult<()> {
        let entry = self.entry(client_id).ok_or_else(|| not_running(client_id))?;
        let _op = entry.op.lock().await;
        {
            let mut handle = entry.handle();
            handle.refresh(client_id);
            if handle.state != ProcessState::Running {
                return Err(not_running(client_id));
            }
        }

        let target = self.admin_target(client_id).await?;
        let result = self.admin.reload(&target).await;
        metrics::record_reload(result.is_ok());
        match result {
            Ok(()) => {
                tracing::info!(client_id, "configuration reloaded");
                Ok(())
            }
            Err(e) => Err(FleetError::PreconditionFailed(format!(
                "reload of client {client_id} failed: {e}"
            ))),
        }
    }

    /// Per-tunnel run state straight from the client's admin endpoint.
    ///
    /// The endpoint is asked even when this supervisor did not start the
    /// process, so another instance (the CLI next to a daemon) sees it too.
    /// Fails without network I/O when the document has no usable
    /// `webServer` section.
    pub async fn run_states(&self, client_id: &str) -> FleetResult<RunStates> {
        let target = self.admin_target(client_id).await?;
        self.admin
            .status(&target)
            .await
            .map_err(|e| FleetError::PreconditionFailed(format!("status of client {client_id} failed: {e}")))
    }

    /// Snapshot of every entry this supervisor knows, sorted by id.
    pub fn status(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|(client_id, entry)| {
                let mut handle = entry.handle();
                handle.refresh(&client_id);
                handle.status(&client_id)
            })
            .collect();
        statuses.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        statuses
    }

    pub fn process_status(&self, client_id: &str) -> ProcessStatus {
        match self.entry(client_id) {
            Some(entry) => {
                let mut handle = entry.handle();
                handle.refresh(client_id);
                handle.status(client_id)
            }
            None => ProcessStatus {
                client_id: client_id.to_string(),
                state: ProcessState::Absent,
                pid: None,
                exit_code: None,
            },
        }
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.status()
            .into_iter()
            .filter(|s| s.state == ProcessState::Running)
            .map(|s| s.client_id)
            .collect()
    }

    /// Drop the entry of a client that no longer exists.
    pub(crate) fn forget(&self, client_id: &str) {
        self.entries().remove(client_id);
    }

    async fn admin_target(&self, client_id: &str) -> FleetResult<AdminTarget> {
        let document = self.store.load_async(client_id).await?;
        let settings = document.connection.admin.as_ref().ok_or_else(|| {
            FleetError::PreconditionFailed(format!("client {client_id} has no webServer section"))
        })?;
        AdminTarget::from_settings(settings).ok_or_else(|| {
            FleetError::PreconditionFailed(format!(
                "client {client_id} lacks webServer port or credentials"
            ))
        })
    }

    fn publish_running(&self) {
        metrics::set_running_processes(self.running_ids().len());
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, client_id: &str) -> Option<Arc<Entry>> {
        self.entries().get(client_id).cloned()
    }

    fn entry_or_insert(&self, client_id: &str) -> Arc<Entry> {
        self.entries()
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, Arc<Entry>)> {
        self.entries()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }
}

fn not_running(client_id: &str) -> FleetError {
    FleetError::PreconditionFailed(format!("client {client_id} is not running"))
}
