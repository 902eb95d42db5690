//! Aurora cluster support.
//!
//! An Aurora cluster endpoint looks like
//! `<cluster>.cluster-<id>.<region>.rds.amazonaws.com`; every instance lives
//! at `<instance>.<id>.<region>.rds.amazonaws.com`. The writer is the row of
//! `information_schema.replica_host_status` whose `SESSION_ID` is
//! `MASTER_SESSION_ID`.

use std::sync::OnceLock;

use marlin_core::{Endpoint, Result, Role};
use marlin_mariadb::Session;
use regex::{Captures, Regex};
use tracing::{debug, warn};

/// Instances that reported within the last few minutes, freshest first.
pub const TOPOLOGY_QUERY: &str = "SELECT SERVER_ID, SESSION_ID FROM information_schema.replica_host_status \
     WHERE LAST_UPDATE_TIMESTAMP > DATE_SUB(NOW(), INTERVAL 3 MINUTE) \
     ORDER BY LAST_UPDATE_TIMESTAMP DESC";

/// `SESSION_ID` of the writer instance.
pub const WRITER_SESSION_ID: &str = "MASTER_SESSION_ID";

const CLUSTER_HOST_PATTERN: &str =
    r"^(.+)\.(cluster-|cluster-ro-)?([a-z0-9]+\.[a-z0-9\-]+\.rds\.amazonaws\.com)$";

fn cluster_host(host: &str) -> Option<Captures<'_>> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(CLUSTER_HOST_PATTERN) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(error = %e, "invalid cluster host pattern, Aurora host detection disabled");
                None
            }
        })
        .as_ref()
        .and_then(|regex| regex.captures(host))
}

/// The instance DNS suffix of an Aurora host name, e.g.
/// `abc123.us-east-1.rds.amazonaws.com`.
pub fn cluster_suffix(host: &str) -> Option<String> {
    let host = host.to_ascii_lowercase();
    cluster_host(&host)
        .and_then(|c| c.get(3))
        .map(|m| m.as_str().to_string())
}

/// Whether `host` is a cluster (not instance) endpoint.
pub fn is_cluster_endpoint(host: &str) -> bool {
    cluster_host(&host.to_ascii_lowercase()).is_some_and(|c| c.get(2).is_some())
}

/// One row of the replica status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub server_id: String,
    pub is_writer: bool,
}

/// Query the cluster topology through an open session.
pub fn fetch_topology(session: &mut Session) -> Result<Vec<Instance>> {
    let result = session.query_buffered(TOPOLOGY_QUERY)?;
    let mut instances: Vec<Instance> = Vec::with_capacity(result.len());
    for row in &result.rows {
        let Some(server_id) = row.get(0).and_then(|v| v.as_str()) else {
            continue;
        };
        // Rows are freshest first; keep the first report of each instance.
        if instances.iter().any(|i| i.server_id == server_id) {
            continue;
        }
        let is_writer = row
            .get(1)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == WRITER_SESSION_ID);
        instances.push(Instance {
            server_id: server_id.to_string(),
            is_writer,
        });
    }
    debug!(instances = instances.len(), "fetched cluster topology");
    Ok(instances)
}

/// Does a configured endpoint stand for this instance?
fn matches_instance(endpoint: &Endpoint, server_id: &str) -> bool {
    endpoint.host.eq_ignore_ascii_case(server_id)
        || endpoint.address() == server_id
        || endpoint
            .host
            .to_ascii_lowercase()
            .strip_prefix(&server_id.to_ascii_lowercase())
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Turn a topology into an endpoint list: the writer first, readers after.
///
/// Instances are matched against `configured` endpoints first; unmatched
/// instances get a host name built from the cluster suffix of any configured
/// endpoint. Instances that can be placed neither way are dropped. Returns
/// `None` when the topology has no writer or nothing could be placed.
pub fn resolve_endpoints(configured: &[Endpoint], topology: &[Instance]) -> Option<Vec<Endpoint>> {
    if !topology.iter().any(|i| i.is_writer) {
        return None;
    }
    let suffix = configured.iter().find_map(|e| cluster_suffix(&e.host));
    let port = configured.first().map(|e| e.port)?;

    let mut ordered: Vec<&Instance> = topology.iter().collect();
    ordered.sort_by_key(|i| !i.is_writer);

    let mut endpoints: Vec<Endpoint> = Vec::with_capacity(ordered.len());
    for instance in ordered {
        let role = if instance.is_writer {
            Role::Writer
        } else {
            Role::Reader
        };
        let placed = configured
            .iter()
            .find(|e| matches_instance(e, &instance.server_id))
            .map(|e| Endpoint {
                role,
                ..e.clone()
            })
            .or_else(|| {
                suffix.as_ref().map(|suffix| {
                    Endpoint::new(format!("{}.{}", instance.server_id, suffix), port).role(role)
                })
            });
        match placed {
            Some(endpoint) if !endpoints.contains(&endpoint) => endpoints.push(endpoint),
            Some(_) => {}
            None => debug!(server_id = %instance.server_id, "cannot place instance"),
        }
    }
    endpoints
        .first()
        .is_some_and(Endpoint::is_writer)
        .then_some(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: &str = "orders.cluster-c8x9y7.eu-west-1.rds.amazonaws.com";

    fn instance(id: &str, writer: bool) -> Instance {
        Instance {
            server_id: id.to_string(),
            is_writer: writer,
        }
    }

    #[test]
    fn detects_cluster_suffix() {
        assert_eq!(
            cluster_suffix(CLUSTER).as_deref(),
            Some("c8x9y7.eu-west-1.rds.amazonaws.com")
        );
        assert_eq!(
            cluster_suffix("orders.cluster-ro-c8x9y7.eu-west-1.rds.amazonaws.com").as_deref(),
            Some("c8x9y7.eu-west-1.rds.amazonaws.com")
        );
        assert!(is_cluster_endpoint(CLUSTER));
        assert!(!is_cluster_endpoint("orders-1.c8x9y7.eu-west-1.rds.amazonaws.com"));
        assert_eq!(cluster_suffix("db.internal"), None);
    }

    #[test]
    fn builds_instance_hosts_from_suffix() {
        let configured = vec![Endpoint::new(CLUSTER, 3306)];
        let topology = vec![instance("orders-2", false), instance("orders-1", true)];
        let endpoints = resolve_endpoints(&configured, &topology).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].host, "orders-1.c8x9y7.eu-west-1.rds.amazonaws.com");
        assert!(endpoints[0].is_writer());
        assert_eq!(endpoints[1].host, "orders-2.c8x9y7.eu-west-1.rds.amazonaws.com");
        assert_eq!(endpoints[1].role, Role::Reader);
    }

    #[test]
    fn matches_configured_endpoints() {
        let configured = vec![
            Endpoint::new("10.0.0.1", 3306),
            Endpoint::new("10.0.0.2", 3307),
            Endpoint::new("node-c.internal", 3306),
        ];
        let topology = vec![
            instance("10.0.0.1:3306", false),
            instance("10.0.0.2:3307", true),
            instance("node-c", false),
            instance("unknown", false),
        ];
        let endpoints = resolve_endpoints(&configured, &topology).unwrap();
        let hosts: Vec<&str> = endpoints.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.1", "node-c.internal"]);
        assert!(endpoints[0].is_writer());
        assert!(!endpoints[1].is_writer());
    }

    #[test]
    fn no_writer_means_no_topology() {
        let configured = vec![Endpoint::new(CLUSTER, 3306)];
        assert_eq!(resolve_endpoints(&configured, &[instance("orders-2", false)]), None);
        assert_eq!(resolve_endpoints(&configured, &[]), None);
    }
}
