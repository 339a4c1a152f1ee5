//! Cross-record and cross-document uniqueness rules.
//!
//! # Rules
//! ```text
//! per document:  tunnel names, listener names, listener (bindAddr, bindPort)
//! fleet-wide:    tcp/udp remotePort, http/https customDomains, webServer.port
//! per record:    `type` never changes once stored
//! on creation:   tcp/udp tunnels must carry remotePort
//! ```
//!
//! The checks here are pure. Building the [`FleetIndex`] from disk and
//! holding the document lock around check + save is the caller's job.

pub mod index;

use toml::{Table, Value};

use crate::document::{ClientDocument, ConnectionSettings, ListenerRecord, SchemaError, TunnelRecord};
use crate::error::{Conflict, FleetError, FleetResult, Owner};

pub use index::FleetIndex;

/// Check a tunnel about to be stored in `document`.
///
/// `replacing` names the stored record this one supersedes on update; it is
/// left out of every comparison. `index` must hold the rest of the fleet plus
/// the target document's other tunnels.
pub fn check_tunnel(
    index: &FleetIndex,
    client_id: &str,
    document: &ClientDocument,
    tunnel: &TunnelRecord,
    replacing: Option<&str>,
) -> FleetResult<()> {
    if let Some(existing) = document
        .tunnels
        .iter()
        .find(|t| t.name == tunnel.name && Some(t.name.as_str()) != replacing)
    {
        return Err(conflict("name", &tunnel.name, client_id, &existing.name));
    }

    let kind = tunnel.tunnel_type();
    if kind.uses_remote_port() {
        match tunnel.remote_port() {
            Some(port) => {
                if let Some(owner) = index.remote_port_owner(port) {
                    return Err(FleetError::Conflict(Conflict {
                        field: "remotePort",
                        value: port.to_string(),
                        owner: owner.clone(),
                    }));
                }
            }
            // Legacy records stored without a port stay editable.
            None if replacing.is_some() => {}
            None => {
                return Err(SchemaError::MissingField {
                    entity: "tunnel",
                    field: "remotePort",
                }
                .into())
            }
        }
    }

    if kind.uses_unique_domains() {
        let mut seen = std::collections::HashSet::new();
        for domain in tunnel.custom_domains() {
            let normalized = index::normalize_domain(domain);
            if let Some(owner) = index.domain_owner(domain) {
                return Err(FleetError::Conflict(Conflict {
                    field: "customDomains",
                    value: domain.clone(),
                    owner: owner.clone(),
                }));
            }
            if !seen.insert(normalized) {
                return Err(conflict("customDomains", domain, client_id, &tunnel.name));
            }
        }
    }

    Ok(())
}

/// Check a listener about to be stored in `document`.
///
/// Listeners only compete with listeners of the same document: their
/// sockets are local to the supervised process.
pub fn check_listener(
    client_id: &str,
    document: &ClientDocument,
    listener: &ListenerRecord,
    replacing: Option<&str>,
) -> FleetResult<()> {
    let others = document
        .listeners
        .iter()
        .filter(|l| Some(l.name.as_str()) != replacing);

    for other in others {
        if other.name == listener.name {
            return Err(conflict("name", &listener.name, client_id, &other.name));
        }
        if let (Some(mine), Some(theirs)) = (listener.local_socket(), other.local_socket()) {
            if mine == theirs {
                let value = format!("{}:{}", mine.0, mine.1);
                return Err(conflict("bindPort", &value, client_id, &other.name));
            }
        }
    }
    Ok(())
}

/// Check that a client's admin UI port is free across the fleet.
pub fn check_admin_port(index: &FleetIndex, connection: &ConnectionSettings) -> FleetResult<()> {
    match connection.admin_port().and_then(|port| index.admin_port_owner(port).map(|o| (port, o))) {
        Some((port, owner)) => Err(FleetError::Conflict(Conflict {
            field: "webServer.port",
            value: port.to_string(),
            owner: owner.clone(),
        })),
        None => Ok(()),
    }
}

/// Reject a patch whose `type` differs from the stored record's.
pub fn check_kind_unchanged(record: &str, stored: &str, patch: &Table) -> FleetResult<()> {
    let requested = match patch.get("type") {
        None => return Ok(()),
        Some(Value::String(kind)) if kind == stored => return Ok(()),
        Some(Value::String(kind)) => kind.clone(),
        Some(other) => other.to_string(),
    };
    Err(FleetError::KindChange {
        record: record.to_string(),
        stored: stored.to_string(),
        requested,
    })
}

fn conflict(field: &'static str, value: &str, client_id: &str, record: &str) -> FleetError {
    FleetError::Conflict(Conflict {
        field,
        value: value.to_string(),
        owner: Owner {
            client_id: client_id.to_string(),
            record: Some(record.to_string()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_table;
    use crate::error::ErrorKind;

    fn tunnel(text: &str) -> TunnelRecord {
        TunnelRecord::from_table(parse_table(text).unwrap()).unwrap()
    }

    fn listener(text: &str) -> ListenerRecord {
        ListenerRecord::from_table(parse_table(text).unwrap()).unwrap()
    }

    fn fleet_with_ssh() -> FleetIndex {
        let sibling = ClientDocument::parse(
            "[[proxies]]\nname = 'ssh'\ntype = 'tcp'\nlocalPort = 22\nremotePort = 2222\n\
             [[proxies]]\nname = 'site'\ntype = 'http'\ncustomDomains = ['a.example.com']\n",
        )
        .unwrap();
        let mut index = FleetIndex::default();
        index.insert_document("7", &sibling);
        index
    }

    #[test]
    fn test_remote_port_taken_by_other_client() {
        let index = fleet_with_ssh();
        let doc = ClientDocument::default();
        let err = check_tunnel(
            &index,
            "8",
            &doc,
            &tunnel("name = 'mc'\ntype = 'tcp'\nlocalPort = 25565\nremotePort = 2222"),
            None,
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        let message = err.to_string();
        assert!(message.contains("2222"), "{message}");
        assert!(message.contains("ssh"), "{message}");
    }

    #[test]
    fn test_udp_shares_port_space_with_tcp() {
        let index = fleet_with_ssh();
        let err = check_tunnel(
            &index,
            "8",
            &ClientDocument::default(),
            &tunnel("name = 'dns'\ntype = 'udp'\nremotePort = 2222"),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_domain_collision_ignores_case() {
        let index = fleet_with_ssh();
        let err = check_tunnel(
            &index,
            "8",
            &ClientDocument::default(),
            &tunnel("name = 'web'\ntype = 'https'\ncustomDomains = ['b.example.com', 'A.Example.com']"),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("site"));
    }

    #[test]
    fn test_tcpmux_domains_are_not_fleet_unique() {
        let index = fleet_with_ssh();
        check_tunnel(
            &index,
            "8",
            &ClientDocument::default(),
            &tunnel("name = 'mux'\ntype = 'tcpmux'\ncustomDomains = ['a.example.com']"),
            None,
        )
        .unwrap();
    }

    #[test]
    fn test_duplicate_name_in_same_document() {
        let doc = ClientDocument::parse("[[proxies]]\nname = 'ssh'\ntype = 'stcp'\n").unwrap();
        let err = check_tunnel(
            &FleetIndex::default(),
            "1",
            &doc,
            &tunnel("name = 'ssh'\ntype = 'xtcp'"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FleetError::Conflict(Conflict { field: "name", .. })));

        // Same name is fine when it is the record being replaced.
        check_tunnel(&FleetIndex::default(), "1", &doc, &tunnel("name = 'ssh'\ntype = 'stcp'"), Some("ssh")).unwrap();
    }

    #[test]
    fn test_remote_port_required_only_on_creation() {
        let index = FleetIndex::default();
        let doc = ClientDocument::default();
        let legacy = tunnel("name = 'old'\ntype = 'tcp'\nlocalPort = 22");

        let err = check_tunnel(&index, "1", &doc, &legacy, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        check_tunnel(&index, "1", &doc, &legacy, Some("old")).unwrap();
    }

    #[test]
    fn test_listener_socket_collision() {
        let doc = ClientDocument::parse(
            "[[visitors]]\nname = 'a'\ntype = 'stcp'\nbindPort = 9000\n\
             [[visitors]]\nname = 'b'\ntype = 'xtcp'\nbindPort = -1\n",
        )
        .unwrap();

        let same_socket = listener("name = 'c'\ntype = 'sudp'\nbindAddr = '127.0.0.1'\nbindPort = 9000");
        let err = check_listener("1", &doc, &same_socket, None).unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:9000"));

        let other_addr = listener("name = 'c'\ntype = 'sudp'\nbindAddr = '0.0.0.0'\nbindPort = 9000");
        check_listener("1", &doc, &other_addr, None).unwrap();

        let no_socket = listener("name = 'd'\ntype = 'xtcp'\nbindPort = -1");
        check_listener("1", &doc, &no_socket, None).unwrap();
    }

    #[test]
    fn test_duplicate_listener_name_in_same_document() {
        let doc = ClientDocument::parse("[[visitors]]\nname = 'db'\ntype = 'stcp'\nbindPort = 9000\n").unwrap();
        let err = check_listener("1", &doc, &listener("name = 'db'\ntype = 'xtcp'\nbindPort = 9001"), None).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(Conflict { field: "name", .. })));

        check_listener("1", &doc, &listener("name = 'db'\ntype = 'stcp'\nbindPort = 9000"), Some("db")).unwrap();
    }

    #[test]
    fn test_admin_port_collision() {
        let sibling = ClientDocument::parse("[webServer]\nport = 8080\n").unwrap();
        let mut index = FleetIndex::default();
        index.insert_document("3", &sibling);

        let mine = ConnectionSettings::from_table(parse_table("[webServer]\nport = 8080").unwrap()).unwrap();
        let err = check_admin_port(&index, &mine).unwrap_err();
        assert!(err.to_string().contains("client 3"));

        let free = ConnectionSettings::from_table(parse_table("[webServer]\nport = 8081").unwrap()).unwrap();
        check_admin_port(&index, &free).unwrap();
    }

    #[test]
    fn test_kind_change_rejected() {
        let patch = parse_table("type = 'udp'").unwrap();
        let err = check_kind_unchanged("ssh", "tcp", &patch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        check_kind_unchanged("ssh", "tcp", &parse_table("type = 'tcp'").unwrap()).unwrap();
        check_kind_unchanged("ssh", "tcp", &parse_table("localPort = 23").unwrap()).unwrap();
    }
}
