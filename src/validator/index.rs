//! Fleet-wide index of taken relay ports, domains and admin ports.

use std::collections::HashMap;

use crate::document::{ClientDocument, TunnelRecord};
use crate::error::Owner;
use crate::store::ConfigStore;

/// Owners of every contested value seen while scanning the fleet.
///
/// Rebuilt from disk on each mutation; fleets are small and mutations are
/// operator-driven.
#[derive(Debug, Default, Clone)]
pub struct FleetIndex {
    remote_ports: HashMap<u16, Owner>,
    domains: HashMap<String, Owner>,
    admin_ports: HashMap<u16, Owner>,
    scanned: usize,
    skipped: usize,
}

impl FleetIndex {
    /// Index every document in `client_ids` except `exclude`.
    ///
    /// Documents that are missing or fail to load are skipped with a warning;
    /// a broken sibling never blocks a mutation elsewhere.
    pub fn scan<I>(store: &ConfigStore, client_ids: I, exclude: &str) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut index = Self::default();
        for client_id in client_ids {
            if client_id == exclude || !store.exists(&client_id) {
                continue;
            }
            match store.load(&client_id) {
                Ok(document) => {
                    index.insert_document(&client_id, &document);
                    index.scanned += 1;
                }
                Err(e) => {
                    index.skipped += 1;
                    tracing::warn!(client_id = %client_id, error = %e, "skipping unreadable document while indexing fleet");
                }
            }
        }
        tracing::debug!(scanned = index.scanned, skipped = index.skipped, "fleet index built");
        index
    }

    pub fn insert_document(&mut self, client_id: &str, document: &ClientDocument) {
        for tunnel in &document.tunnels {
            self.insert_tunnel(client_id, tunnel);
        }
        if let Some(port) = document.connection.admin_port() {
            self.admin_ports.entry(port).or_insert_with(|| Owner {
                client_id: client_id.to_string(),
                record: None,
            });
        }
    }

    /// Index the target document's own tunnels, leaving out the one being
    /// replaced.
    pub fn insert_tunnels_except(&mut self, client_id: &str, document: &ClientDocument, skip: Option<&str>) {
        for tunnel in &document.tunnels {
            if Some(tunnel.name.as_str()) != skip {
                self.insert_tunnel(client_id, tunnel);
            }
        }
    }

    fn insert_tunnel(&mut self, client_id: &str, tunnel: &TunnelRecord) {
        let owner = || Owner {
            client_id: client_id.to_string(),
            record: Some(tunnel.name.clone()),
        };
        if let Some(port) = tunnel.remote_port() {
            self.remote_ports.entry(port).or_insert_with(owner);
        }
        if tunnel.tunnel_type().uses_unique_domains() {
            for domain in tunnel.custom_domains() {
                self.domains.entry(normalize_domain(domain)).or_insert_with(owner);
            }
        }
    }

    pub fn remote_port_owner(&self, port: u16) -> Option<&Owner> {
        self.remote_ports.get(&port)
    }

    pub fn domain_owner(&self, domain: &str) -> Option<&Owner> {
        self.domains.get(&normalize_domain(domain))
    }

    pub fn admin_port_owner(&self, port: u16) -> Option<&Owner> {
        self.admin_ports.get(&port)
    }

    /// Documents that could not be loaded during the scan.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

pub(crate) fn normalize_domain(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexes_ports_domains_and_admin() {
        let document = ClientDocument::parse(
            r#"
[webServer]
port = 8080

[[proxies]]
name = "ssh"
type = "tcp"
remotePort = 2222

[[proxies]]
name = "web"
type = "https"
customDomains = ["Example.COM"]

[[proxies]]
name = "mux"
type = "tcpmux"
customDomains = ["mux.example.com"]
"#,
        )
        .unwrap();

        let mut index = FleetIndex::default();
        index.insert_document("7", &document);

        let owner = index.remote_port_owner(2222).unwrap();
        assert_eq!(owner.client_id, "7");
        assert_eq!(owner.record.as_deref(), Some("ssh"));
        assert_eq!(index.domain_owner("example.com").unwrap().record.as_deref(), Some("web"));
        assert!(index.domain_owner("mux.example.com").is_none());
        assert_eq!(index.admin_port_owner(8080).unwrap().record, None);
    }

    #[test]
    fn test_skip_leaves_out_replaced_tunnel() {
        let document = ClientDocument::parse(
            "[[proxies]]\nname = 'ssh'\ntype = 'tcp'\nremotePort = 2222\n",
        )
        .unwrap();
        let mut index = FleetIndex::default();
        index.insert_tunnels_except("7", &document, Some("ssh"));
        assert!(index.remote_port_owner(2222).is_none());
    }
}
