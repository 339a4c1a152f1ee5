//! Client document watcher for hot reload.

use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::store::FleetLayout;

/// Watches the data directory and reports which client's document changed.
pub struct DocumentWatcher {
    layout: FleetLayout,
    changed_tx: mpsc::UnboundedSender<String>,
}

impl DocumentWatcher {
    /// Create a new DocumentWatcher.
    ///
    /// Returns the watcher and a receiver of changed client ids.
    pub fn new(layout: FleetLayout) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();

        (Self { layout, changed_tx }, changed_rx)
    }

    /// Start watching in a background thread. Dropping the returned watcher
    /// stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.changed_tx.clone();
        let layout = self.layout.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    for path in &event.paths {
                        if let Some(client_id) = layout.client_of_document(path) {
                            tracing::debug!(client_id = %client_id, "document change detected");
                            let _ = tx.send(client_id);
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(self.layout.data_dir(), RecursiveMode::Recursive)?;

        tracing::info!(path = ?self.layout.data_dir(), "Document watcher started");
        Ok(watcher)
    }
}
