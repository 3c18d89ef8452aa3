//! Sole owner of the proxy configuration directory and the cross-index
//! between nodes and the services whose upstreams they populate.
//!
//! All mutation happens under one lock, held for the duration of a single
//! reconcile: index update, file write, reload request. Reads of the
//! informer caches never take this lock.

use log::{debug, warn};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use tokio::sync::Mutex;

use crate::annotations::{Algorithm, NodeSet, UpstreamType, UNNAMED_PORT};
use crate::keys::ObjectKey;
use crate::nginx::stream::{
    LoadBalance, StreamConfig, StreamListen, StreamServer, StreamUpstream, StreamUpstreamServer,
};
use crate::nginx::{NginxDriver, NginxError};
use crate::resources::{NodeRecord, ServiceRecord};
use crate::topology::{PortTopology, Target};

/// Everything a service reconcile hands over: the service's identity, its
/// canonical record, and the resolved topology. Never retained across
/// reconciles.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub key: ObjectKey,
    pub record: ServiceRecord,
    pub topology: Vec<PortTopology>,
}

/// The nodes a service's upstream was last rendered from.
struct UpstreamNodes {
    set: NodeSet,
    nodes: Vec<NodeRecord>,
}

#[derive(Default)]
struct Index {
    nodes: Map<String, NodeRecord>,
    service_nodes: Map<ObjectKey, UpstreamNodes>,
    service_targets: Map<ObjectKey, Vec<Target>>,
}

impl Index {
    fn services_by_address(&self, address: &str) -> Vec<ObjectKey> {
        if address.is_empty() {
            return Vec::new();
        }
        (self.service_nodes.iter())
            .filter(|(_, up)| {
                up.nodes
                    .iter()
                    .any(|n| n.internal_ip == address || n.external_ip == address)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn services_by_node_name(&self, name: &str) -> Vec<ObjectKey> {
        (self.service_nodes.iter())
            .filter(|(_, up)| up.nodes.iter().any(|n| n.name == name))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Services spanning the whole inventory react to every node
    /// arrival, not just to changes of nodes they already reference.
    fn services_with_all_nodes(&self) -> Vec<ObjectKey> {
        (self.service_nodes.iter())
            .filter(|(_, up)| up.set == NodeSet::All)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

pub struct Configurator {
    driver: NginxDriver,
    index: Mutex<Index>,
    require_port: bool,
}

impl Configurator {
    pub fn new(driver: NginxDriver, require_port: bool) -> Self {
        Self {
            driver,
            index: Mutex::new(Index::default()),
            require_port,
        }
    }

    pub fn driver(&self) -> &NginxDriver {
        &self.driver
    }

    /// Upserts a node, returning the keys of services that must be
    /// re-reconciled. An unschedulable node is removed from the inventory.
    pub async fn add_or_update_node(&self, node: NodeRecord) -> Vec<ObjectKey> {
        let mut index = self.index.lock().await;

        if !node.schedulable {
            debug!("node {}: unschedulable, removing from inventory", node.name);
            return Self::delete_node_locked(&mut index, &node.name);
        }

        match index.nodes.get(&node.name) {
            None => {
                debug!("node {}: added to inventory", node.name);
                let affected = index.services_with_all_nodes();
                index.nodes.insert(node.name.clone(), node);
                affected
            }
            Some(prev) => {
                let mut affected = Vec::new();
                if prev.internal_ip != node.internal_ip {
                    affected.extend(index.services_by_address(&prev.internal_ip));
                }
                if prev.external_ip != node.external_ip {
                    affected.extend(index.services_by_address(&prev.external_ip));
                }
                affected.sort();
                affected.dedup();
                index.nodes.insert(node.name.clone(), node);
                affected
            }
        }
    }

    pub async fn delete_node(&self, name: &str) -> Vec<ObjectKey> {
        let mut index = self.index.lock().await;
        Self::delete_node_locked(&mut index, name)
    }

    fn delete_node_locked(index: &mut Index, name: &str) -> Vec<ObjectKey> {
        if index.nodes.remove(name).is_none() {
            return Vec::new();
        }
        index.services_by_node_name(name)
    }

    /// Renders and installs the configuration for one service, updating
    /// the cross-index and requesting a reload when the on-disk state
    /// changed. A service resolving to nothing has its configuration
    /// removed instead.
    pub async fn add_or_update_service(&self, spec: &ServiceSpec) -> Result<(), NginxError> {
        let mut index = self.index.lock().await;

        let total_targets: usize = spec.topology.iter().map(|p| p.targets.len()).sum();
        if total_targets == 0 {
            debug!("{}: no targets, removing configuration", spec.key);
            return self.delete_locked(&mut index, &spec.key).await;
        }

        let ann = spec.record.annotations();
        let pass_through = match ann.ip_passthrough() {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: {e}, not updating", spec.key);
                return Ok(());
            }
        };
        let upstream_type = ann.upstream_type();
        let node_set = ann.node_set();
        let external = ann.node_address_type().is_external();
        let load_balance = match ann.algorithm() {
            // round-robin is the proxy default and must not be emitted
            Algorithm::RoundRobin => None,
            Algorithm::LeastConn => Some(LoadBalance::LeastConn),
            Algorithm::LeastTime => Some(LoadBalance::LeastTime(ann.method())),
        };

        let mut config = StreamConfig {
            resolver: ann.resolver().map(Into::into),
            ..StreamConfig::default()
        };
        let mut used_nodes: Map<String, NodeRecord> = Map::new();
        let mut targets = Vec::new();

        for port in &spec.topology {
            if port.targets.is_empty() {
                continue;
            }

            let port_name = if port.port_name.is_empty() {
                UNNAMED_PORT
            } else {
                &port.port_name
            };

            let listen_port = match ann.listen_port(port_name) {
                Ok(Some(p)) => p,
                Ok(None) if self.require_port => {
                    warn!(
                        "{}: no listener port annotation for port {port_name}, skipping",
                        spec.key
                    );
                    continue;
                }
                Ok(None) => port.service_port,
                Err(e) => {
                    warn!("{}: {e}, not updating", spec.key);
                    return Ok(());
                }
            };

            let members = match upstream_type {
                UpstreamType::ClusterIP => {
                    Self::cluster_ip_members(&spec.record.cluster_ip, port)
                }
                UpstreamType::Pod => Self::pod_members(port),
                UpstreamType::Node => {
                    Self::node_members(&index, &spec.key, port, node_set, external, &mut used_nodes)
                }
            };
            if members.is_empty() {
                debug!("{}: port {port_name}: no upstream members", spec.key);
                continue;
            }

            let upstream_name = format!("{}-{port_name}", spec.key.config_name());
            config.upstreams.push(StreamUpstream {
                name: upstream_name.clone(),
                load_balance: load_balance.clone(),
                servers: members,
            });
            config.servers.push(StreamServer {
                listen: StreamListen {
                    address: None,
                    port: listen_port,
                    udp: port.is_udp(),
                },
                proxy_protocol: false,
                pass_through,
                upstream: upstream_name,
            });
            targets.extend(port.targets.iter().cloned());
        }

        if config.servers.is_empty() {
            debug!("{}: nothing to render, removing configuration", spec.key);
            return self.delete_locked(&mut index, &spec.key).await;
        }

        let changed = self
            .driver
            .write_stream(&spec.key.config_name(), &config)
            .await?;

        index.service_targets.insert(spec.key.clone(), targets);
        if upstream_type == UpstreamType::Node {
            index.service_nodes.insert(
                spec.key.clone(),
                UpstreamNodes {
                    set: node_set,
                    nodes: used_nodes.into_values().collect(),
                },
            );
        } else {
            index.service_nodes.remove(&spec.key);
        }

        if changed {
            self.driver.reload().await?;
        }
        Ok(())
    }

    /// Removes a service's configuration file and cross-index entries.
    /// Missing files are not an error; a reload is only requested when a
    /// file was actually removed.
    pub async fn delete_configuration(&self, key: &ObjectKey) -> Result<(), NginxError> {
        let mut index = self.index.lock().await;
        self.delete_locked(&mut index, key).await
    }

    async fn delete_locked(&self, index: &mut Index, key: &ObjectKey) -> Result<(), NginxError> {
        index.service_nodes.remove(key);
        index.service_targets.remove(key);

        if self.driver.delete_stream(&key.config_name()).await? {
            self.driver.reload().await?;
        }
        Ok(())
    }

    fn cluster_ip_members(cluster_ip: &str, port: &PortTopology) -> Vec<StreamUpstreamServer> {
        let addresses: Set<String> = (port.targets.iter())
            .map(|_| format!("{cluster_ip}:{}", port.service_port))
            .collect();
        addresses.into_iter().map(StreamUpstreamServer::new).collect()
    }

    fn pod_members(port: &PortTopology) -> Vec<StreamUpstreamServer> {
        let addresses: Set<String> = (port.targets.iter())
            .map(|t| format!("{}:{}", t.pod_ip, t.pod_port))
            .collect();
        addresses.into_iter().map(StreamUpstreamServer::new).collect()
    }

    fn node_members(
        index: &Index,
        key: &ObjectKey,
        port: &PortTopology,
        node_set: NodeSet,
        external: bool,
        used_nodes: &mut Map<String, NodeRecord>,
    ) -> Vec<StreamUpstreamServer> {
        let Some(node_port) = port.node_port else {
            debug!("{key}: port {} has no node port", port.service_port);
            return Vec::new();
        };

        let mut addresses = Set::new();
        match node_set {
            NodeSet::Host => {
                for target in &port.targets {
                    let Some(node) = index.nodes.get(&target.node_name) else {
                        debug!("{key}: no inventory entry for node {:?}", target.node_name);
                        continue;
                    };
                    addresses.insert(format!("{}:{node_port}", node.address(external)));
                    used_nodes.insert(node.name.clone(), node.clone());
                }
            }
            NodeSet::All => {
                for node in index.nodes.values() {
                    addresses.insert(format!("{}:{node_port}", node.address(external)));
                    used_nodes.insert(node.name.clone(), node.clone());
                }
            }
        }
        addresses.into_iter().map(StreamUpstreamServer::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nginx::config::MainConfig;
    use crate::nginx::Mode;
    use crate::resources::{EndpointsRecord, FromKube};
    use crate::topology;
    use k8s_openapi::api::core::v1 as core;
    use serde_json::json;
    use std::sync::Arc;

    fn configurator(dir: &std::path::Path) -> Arc<Configurator> {
        let driver = NginxDriver::new(dir.to_path_buf(), Mode::DryRun, MainConfig::default());
        Arc::new(Configurator::new(driver, true))
    }

    fn node(name: &str, internal: &str) -> NodeRecord {
        NodeRecord {
            name: name.into(),
            hostname: name.into(),
            internal_ip: internal.into(),
            external_ip: String::new(),
            schedulable: true,
            labels: Map::new(),
            annotations: Map::new(),
        }
    }

    fn service_record(value: serde_json::Value) -> ServiceRecord {
        let svc: core::Service = serde_json::from_value(value).unwrap();
        ServiceRecord::from_kube(&svc).unwrap()
    }

    fn endpoints_record(value: serde_json::Value) -> EndpointsRecord {
        let eps: core::Endpoints = serde_json::from_value(value).unwrap();
        EndpointsRecord::from_kube(&eps).unwrap()
    }

    fn spec(key: ObjectKey, record: ServiceRecord, endpoints: &EndpointsRecord) -> ServiceSpec {
        let topology = topology::resolve(&key, &record, Some(endpoints));
        ServiceSpec {
            key,
            record,
            topology,
        }
    }

    fn ntp_service() -> ServiceRecord {
        service_record(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "svc1",
                "namespace": "ns1",
                "annotations": {
                    "kubernetes.io/loadbalancer-class": "loadbalancer-lbex",
                    "loadbalancer.lbex/port.ntp": "123"
                }
            },
            "spec": {
                "type": "NodePort",
                "clusterIP": "10.96.0.17",
                "ports": [{"name": "ntp", "protocol": "UDP", "port": 123,
                           "targetPort": 30123, "nodePort": 30123}]
            }
        }))
    }

    fn ntp_endpoints() -> EndpointsRecord {
        endpoints_record(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"name": "svc1", "namespace": "ns1"},
            "subsets": [{
                "addresses": [{"ip": "10.1.1.5", "nodeName": "n1"}],
                "ports": [{"name": "ntp", "port": 30123, "protocol": "UDP"}]
            }]
        }))
    }

    #[tokio::test]
    async fn test_nodeport_admission() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();

        assert!(cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await.is_empty());

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key.clone(), ntp_service(), &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();

        let written =
            std::fs::read_to_string(dir.path().join("conf.d/ns1-svc1.stream.conf")).unwrap();
        assert_eq!(
            written,
            "upstream ns1-svc1-ntp {
    server 10.0.0.11:30123;
}

server {
    listen 123 udp;
    proxy_pass ns1-svc1-ntp;
}
"
        );
        assert_eq!(cfgtor.driver().reloads(), 1);

        let index = cfgtor.index.lock().await;
        assert_eq!(index.service_nodes[&key].nodes.len(), 1);
        assert_eq!(index.service_targets[&key].len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key, ntp_service(), &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();
        let first = std::fs::read(dir.path().join("conf.d/ns1-svc1.stream.conf")).unwrap();

        // same inputs: byte-identical file, no extra reload
        cfgtor.add_or_update_service(&svc).await.unwrap();
        let second = std::fs::read(dir.path().join("conf.d/ns1-svc1.stream.conf")).unwrap();
        assert_eq!(first, second);
        assert_eq!(cfgtor.driver().reloads(), 1);
    }

    #[tokio::test]
    async fn test_node_address_change_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key.clone(), ntp_service(), &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();

        let affected = cfgtor.add_or_update_node(node("n1", "10.0.0.12")).await;
        assert_eq!(affected, vec![key]);

        // the re-enqueued service re-renders against the new inventory
        cfgtor.add_or_update_service(&svc).await.unwrap();
        let written =
            std::fs::read_to_string(dir.path().join("conf.d/ns1-svc1.stream.conf")).unwrap();
        assert!(written.contains("server 10.0.0.12:30123;"));
        assert_eq!(cfgtor.driver().reloads(), 2);
    }

    #[tokio::test]
    async fn test_service_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key.clone(), ntp_service(), &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();

        cfgtor.delete_configuration(&key).await.unwrap();
        assert!(!dir.path().join("conf.d/ns1-svc1.stream.conf").exists());
        assert_eq!(cfgtor.driver().reloads(), 2);

        let index = cfgtor.index.lock().await;
        assert!(!index.service_nodes.contains_key(&key));
        assert!(!index.service_targets.contains_key(&key));
    }

    #[tokio::test]
    async fn test_headless_service_renders_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();

        let record = service_record(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svcH", "namespace": "ns2",
                         "annotations": {"kubernetes.io/loadbalancer-class": "loadbalancer-lbex"}},
            "spec": {"type": "ClusterIP", "clusterIP": "None",
                     "ports": [{"port": 80, "protocol": "TCP"}]}
        }));
        let key = ObjectKey::new("ns2", "svcH");
        let svc = spec(key, record, &ntp_endpoints());

        cfgtor.add_or_update_service(&svc).await.unwrap();
        assert!(!dir.path().join("conf.d/ns2-svcH.stream.conf").exists());
        assert_eq!(cfgtor.driver().reloads(), 0);
    }

    #[tokio::test]
    async fn test_cluster_ip_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;

        let record = service_record(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "svcC",
                "namespace": "ns3",
                "annotations": {
                    "kubernetes.io/loadbalancer-class": "loadbalancer-lbex",
                    "loadbalancer.lbex/upstream-type": "cluster-ip",
                    "loadbalancer.lbex/port.http": "8080"
                }
            },
            "spec": {
                "type": "ClusterIP",
                "clusterIP": "10.96.0.42",
                "ports": [{"name": "http", "protocol": "TCP", "port": 80, "targetPort": 8080}]
            }
        }));
        let eps = endpoints_record(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"name": "svcC", "namespace": "ns3"},
            "subsets": [{
                "addresses": [{"ip": "10.1.1.9", "nodeName": "n1"}],
                "ports": [{"name": "http", "port": 8080, "protocol": "TCP"}]
            }]
        }));

        let key = ObjectKey::new("ns3", "svcC");
        let svc = spec(key.clone(), record, &eps);
        cfgtor.add_or_update_service(&svc).await.unwrap();

        let written =
            std::fs::read_to_string(dir.path().join("conf.d/ns3-svcC.stream.conf")).unwrap();
        assert_eq!(
            written,
            "upstream ns3-svcC-http {
    server 10.96.0.42:80;
}

server {
    listen 8080;
    proxy_pass ns3-svcC-http;
}
"
        );

        // cluster-ip upstreams do not depend on any node
        let index = cfgtor.index.lock().await;
        assert!(!index.service_nodes.contains_key(&key));
    }

    #[tokio::test]
    async fn test_least_time_pod_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();

        let record = service_record(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "svcT",
                "namespace": "ns4",
                "annotations": {
                    "kubernetes.io/loadbalancer-class": "loadbalancer-lbex",
                    "loadbalancer.lbex/algorithm": "least-time",
                    "loadbalancer.lbex/method": "first_byte",
                    "loadbalancer.lbex/upstream-type": "pod",
                    "loadbalancer.lbex/port.unnamed": "9000"
                }
            },
            "spec": {
                "type": "ClusterIP",
                "clusterIP": "10.96.0.50",
                "ports": [{"protocol": "TCP", "port": 9000, "targetPort": 9000}]
            }
        }));
        let eps = endpoints_record(json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"name": "svcT", "namespace": "ns4"},
            "subsets": [{
                "addresses": [{"ip": "10.1.1.7", "nodeName": "n1"}],
                "ports": [{"port": 9000, "protocol": "TCP"}]
            }]
        }));

        let key = ObjectKey::new("ns4", "svcT");
        cfgtor
            .add_or_update_service(&spec(key, record, &eps))
            .await
            .unwrap();

        let written =
            std::fs::read_to_string(dir.path().join("conf.d/ns4-svcT.stream.conf")).unwrap();
        assert_eq!(
            written,
            "upstream ns4-svcT-unnamed {
    least_time first_byte;
    server 10.1.1.7:9000;
}

server {
    listen 9000;
    proxy_pass ns4-svcT-unnamed;
}
"
        );
    }

    #[tokio::test]
    async fn test_missing_port_annotation_skips_port() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;

        let mut record = ntp_service();
        record
            .annotations
            .remove("loadbalancer.lbex/port.ntp")
            .unwrap();

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key, record, &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();

        // require-port is on: the only port is skipped, nothing written
        assert!(!dir.path().join("conf.d/ns1-svc1.stream.conf").exists());
        assert_eq!(cfgtor.driver().reloads(), 0);
    }

    #[tokio::test]
    async fn test_node_set_all_covers_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;
        cfgtor.add_or_update_node(node("n2", "10.0.0.12")).await;

        let mut record = ntp_service();
        record.annotations.insert(
            "loadbalancer.lbex/node-set".into(),
            "all".into(),
        );

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key.clone(), record, &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();

        let written =
            std::fs::read_to_string(dir.path().join("conf.d/ns1-svc1.stream.conf")).unwrap();
        assert!(written.contains("server 10.0.0.11:30123;"));
        assert!(written.contains("server 10.0.0.12:30123;"));

        // a node arriving later must re-reconcile this service
        let affected = cfgtor.add_or_update_node(node("n3", "10.0.0.13")).await;
        assert_eq!(affected, vec![key]);
    }

    #[tokio::test]
    async fn test_unschedulable_node_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cfgtor = configurator(dir.path());
        cfgtor.driver().ensure_dirs().await.unwrap();
        cfgtor.add_or_update_node(node("n1", "10.0.0.11")).await;

        let key = ObjectKey::new("ns1", "svc1");
        let svc = spec(key.clone(), ntp_service(), &ntp_endpoints());
        cfgtor.add_or_update_service(&svc).await.unwrap();

        let mut cordoned = node("n1", "10.0.0.11");
        cordoned.schedulable = false;
        let affected = cfgtor.add_or_update_node(cordoned).await;
        assert_eq!(affected, vec![key]);

        assert!(cfgtor.index.lock().await.nodes.is_empty());
    }
}
