use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use log::debug;
use std::collections::BTreeMap as Map;

use crate::annotations::Annotations;
use crate::keys::ObjectKey;

/// A kube object that could not be reduced to its canonical record.
#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("{kind} record without metadata.{field}")]
    MissingMetadata {
        kind: &'static str,
        field: &'static str,
    },
}

/// Conversion from the API shape to the canonical record, applied once at
/// the watch boundary. Everything past the informers sees only canonical
/// records.
pub trait FromKube<K>: Sized {
    fn key_of(obj: &K) -> Result<ObjectKey, ResourceError>;
    fn from_kube(obj: &K) -> Result<Self, ResourceError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum Protocol {
    TCP,
    UDP,
}

impl Protocol {
    fn from_kube(protocol: Option<&str>) -> Option<Self> {
        match protocol {
            None | Some("TCP") => Some(Protocol::TCP),
            Some("UDP") => Some(Protocol::UDP),
            Some(other) => {
                debug!("dropping port with unsupported protocol {other}");
                None
            }
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::UDP)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
    Other,
}

impl ServiceType {
    fn from_kube(type_: Option<&str>) -> Self {
        match type_ {
            None | Some("ClusterIP") => ServiceType::ClusterIP,
            Some("NodePort") => ServiceType::NodePort,
            Some("LoadBalancer") => ServiceType::LoadBalancer,
            Some("ExternalName") => ServiceType::ExternalName,
            Some(_) => ServiceType::Other,
        }
    }
}

/// A service port's backend port: either a number or the name of a port in
/// the endpoints subsets.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum TargetPort {
    Int(i32),
    Name(String),
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ServicePort {
    /// Empty iff the service has a single, unnamed port.
    pub name: String,
    pub protocol: Protocol,
    pub port: i32,
    pub target_port: TargetPort,
    pub node_port: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ServiceRecord {
    pub service_type: ServiceType,
    pub cluster_ip: String,
    pub ports: Vec<ServicePort>,
    pub annotations: Map<String, String>,
}

impl ServiceRecord {
    pub fn annotations(&self) -> Annotations<'_> {
        Annotations::new(&self.annotations)
    }

    fn is_headless(&self) -> bool {
        self.cluster_ip.eq_ignore_ascii_case("none")
    }

    /// The admission gate: only services carrying the lbex class annotation,
    /// of a routable type, with a real cluster IP are rendered.
    pub fn is_admissible(&self) -> bool {
        self.annotations().is_lbex_class()
            && matches!(
                self.service_type,
                ServiceType::ClusterIP | ServiceType::NodePort | ServiceType::LoadBalancer
            )
            && !self.is_headless()
    }
}

impl FromKube<core::Service> for ServiceRecord {
    fn key_of(svc: &core::Service) -> Result<ObjectKey, ResourceError> {
        ObjectKey::try_from(&svc.metadata).map_err(|field| ResourceError::MissingMetadata {
            kind: "Service",
            field: if field == "no name" { "name" } else { "namespace" },
        })
    }

    fn from_kube(svc: &core::Service) -> Result<Self, ResourceError> {
        let spec = svc.spec.as_ref();

        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|p| {
                let protocol = Protocol::from_kube(p.protocol.as_deref())?;
                let target_port = match &p.target_port {
                    // an absent targetPort defaults to the service port
                    None => TargetPort::Int(p.port),
                    Some(IntOrString::Int(n)) => TargetPort::Int(*n),
                    Some(IntOrString::String(name)) => TargetPort::Name(name.clone()),
                };
                Some(ServicePort {
                    name: p.name.clone().unwrap_or_default(),
                    protocol,
                    port: p.port,
                    target_port,
                    node_port: p.node_port,
                })
            })
            .collect();

        Ok(Self {
            service_type: ServiceType::from_kube(spec.and_then(|s| s.type_.as_deref())),
            cluster_ip: spec
                .and_then(|s| s.cluster_ip.clone())
                .unwrap_or_default(),
            ports,
            annotations: svc.metadata.annotations.clone().unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct EndpointAddress {
    pub ip: String,
    /// Empty when the API did not report a hosting node.
    pub node_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct EndpointPort {
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct EndpointsRecord {
    pub subsets: Vec<EndpointSubset>,
}

impl FromKube<core::Endpoints> for EndpointsRecord {
    fn key_of(eps: &core::Endpoints) -> Result<ObjectKey, ResourceError> {
        ObjectKey::try_from(&eps.metadata).map_err(|field| ResourceError::MissingMetadata {
            kind: "Endpoints",
            field: if field == "no name" { "name" } else { "namespace" },
        })
    }

    fn from_kube(eps: &core::Endpoints) -> Result<Self, ResourceError> {
        let subsets = eps
            .subsets
            .iter()
            .flatten()
            .map(|subset| EndpointSubset {
                addresses: subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|addr| EndpointAddress {
                        ip: addr.ip.clone(),
                        node_name: addr.node_name.clone().unwrap_or_default(),
                    })
                    .collect(),
                ports: subset
                    .ports
                    .iter()
                    .flatten()
                    .filter_map(|p| {
                        Some(EndpointPort {
                            name: p.name.clone().unwrap_or_default(),
                            port: p.port,
                            protocol: Protocol::from_kube(p.protocol.as_deref())?,
                        })
                    })
                    .collect(),
            })
            .collect();

        Ok(Self { subsets })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct NodeRecord {
    pub name: String,
    pub hostname: String,
    pub internal_ip: String,
    pub external_ip: String,
    pub schedulable: bool,
    pub labels: Map<String, String>,
    pub annotations: Map<String, String>,
}

impl NodeRecord {
    /// The address members point at, by annotation-selected type.
    pub fn address(&self, external: bool) -> &str {
        if external {
            &self.external_ip
        } else {
            &self.internal_ip
        }
    }
}

impl FromKube<core::Node> for NodeRecord {
    fn key_of(node: &core::Node) -> Result<ObjectKey, ResourceError> {
        let name = node
            .metadata
            .name
            .clone()
            .ok_or(ResourceError::MissingMetadata {
                kind: "Node",
                field: "name",
            })?;
        Ok(ObjectKey::cluster(name))
    }

    fn from_kube(node: &core::Node) -> Result<Self, ResourceError> {
        let key = Self::key_of(node)?;

        let mut hostname = String::new();
        let mut internal_ip = String::new();
        let mut external_ip = String::new();
        for addr in (node.status.iter()).flat_map(|s| s.addresses.iter().flatten()) {
            match addr.type_.as_str() {
                "Hostname" => hostname = addr.address.clone(),
                "InternalIP" => internal_ip = addr.address.clone(),
                "ExternalIP" => external_ip = addr.address.clone(),
                _ => {}
            }
        }

        Ok(Self {
            name: key.name,
            hostname,
            internal_ip,
            external_ip,
            schedulable: !(node.spec.as_ref())
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            annotations: node.metadata.annotations.clone().unwrap_or_default(),
        })
    }
}
