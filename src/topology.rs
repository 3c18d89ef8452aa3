//! Joins a service with its endpoints into concrete per-port backends.

use log::debug;

use crate::keys::ObjectKey;
use crate::resources::{EndpointsRecord, Protocol, ServicePort, ServiceRecord, TargetPort};

/// One fully resolved backend for one service port.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Target {
    pub service_port: i32,
    pub port_name: String,
    pub node_name: String,
    pub node_port: Option<i32>,
    pub pod_ip: String,
    pub pod_port: i32,
    pub protocol: Protocol,
}

/// A service port with the targets currently backing it.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PortTopology {
    /// The service port's name, empty for a single unnamed port.
    pub port_name: String,
    pub service_port: i32,
    pub protocol: Protocol,
    pub node_port: Option<i32>,
    pub targets: Vec<Target>,
}

impl PortTopology {
    pub fn is_udp(&self) -> bool {
        self.protocol.is_udp()
    }
}

/// Resolves a service against its endpoints. Inadmissible services (which
/// includes headless ones) and services without endpoints resolve to
/// nothing.
pub fn resolve(
    key: &ObjectKey,
    service: &ServiceRecord,
    endpoints: Option<&EndpointsRecord>,
) -> Vec<PortTopology> {
    if !service.is_admissible() {
        return Vec::new();
    }
    let Some(endpoints) = endpoints else {
        debug!("{key}: no endpoints record");
        return Vec::new();
    };

    service
        .ports
        .iter()
        .map(|port| PortTopology {
            port_name: port.name.clone(),
            service_port: port.port,
            protocol: port.protocol,
            node_port: port.node_port,
            targets: resolve_port(key, port, endpoints),
        })
        .collect()
}

/// The backend port as a number: either declared numerically on the
/// service port, or looked up by name in the endpoints subsets.
fn canonical_target_port(port: &ServicePort, endpoints: &EndpointsRecord) -> Option<i32> {
    match &port.target_port {
        TargetPort::Int(n) => Some(*n),
        TargetPort::Name(name) => endpoints
            .subsets
            .iter()
            .flat_map(|subset| subset.ports.iter())
            .find(|p| &p.name == name)
            .map(|p| p.port),
    }
}

fn resolve_port(key: &ObjectKey, port: &ServicePort, endpoints: &EndpointsRecord) -> Vec<Target> {
    let Some(backend_port) = canonical_target_port(port, endpoints) else {
        debug!(
            "{key}: port {}: no endpoint port matches target {:?}",
            port.port, port.target_port
        );
        return Vec::new();
    };

    let mut targets = Vec::new();
    for subset in &endpoints.subsets {
        if !subset.ports.iter().any(|p| p.port == backend_port) {
            continue;
        }
        for addr in &subset.addresses {
            targets.push(Target {
                service_port: port.port,
                port_name: port.name.clone(),
                node_name: addr.node_name.clone(),
                node_port: port.node_port,
                pod_ip: addr.ip.clone(),
                pod_port: backend_port,
                protocol: port.protocol,
            });
        }
    }

    if targets.is_empty() {
        debug!("{key}: port {}: no targets", port.port);
    }

    // deterministic rendering downstream
    targets.sort_by(|a, b| {
        (a.service_port, &a.node_name, &a.pod_ip, a.pod_port)
            .cmp(&(b.service_port, &b.node_name, &b.pod_ip, b.pod_port))
    });
    targets
}
