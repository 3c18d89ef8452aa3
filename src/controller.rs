//! The external load-balancer controller: three informer/queue pipelines
//! and the reconcile functions tying them to the configurator.

use eyre::format_err;
use k8s_openapi::api::core::v1 as core;
use kube::api::Api;
use kube::Client;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::configurator::{Configurator, ServiceSpec};
use crate::informer::{self, drop_none, drop_system_namespaces, Informer};
use crate::keys::ObjectKey;
use crate::nginx::NginxError;
use crate::queue::{self, SyncError, SyncResult, WorkQueue};
use crate::resources::{EndpointsRecord, FromKube, NodeRecord, ServiceRecord};
use crate::store::Store;
use crate::topology;

/// Services reconciled before the node and endpoints caches are seeded
/// render incomplete upstreams and cause a spurious delete+add cycle, so
/// the services pipeline starts after this delay.
const WARM_UP: std::time::Duration = std::time::Duration::from_secs(5);

/// Consecutive configuration write failures tolerated before giving up:
/// past this, the on-disk state can no longer be trusted to follow the
/// cluster.
const MAX_IO_FAILURES: u32 = 8;

/// Instance-level service selection.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    /// Reconcile only the service with this name.
    pub service_name: Option<String>,
    pub service_pool: Option<String>,
    /// Only services whose pool annotation matches `service_pool`.
    pub strict_affinity: bool,
    /// Only services whose pool annotation does not match `service_pool`.
    pub anti_affinity: bool,
}

impl Settings {
    fn selects(&self, key: &ObjectKey, record: &ServiceRecord) -> bool {
        if let Some(only) = &self.service_name {
            if &key.name != only {
                return false;
            }
        }

        let pool = record.annotations().service_pool();
        let matches_pool = pool.is_some() && pool == self.service_pool.as_deref();
        if self.strict_affinity && !matches_pool {
            return false;
        }
        if self.anti_affinity && matches_pool {
            return false;
        }
        true
    }
}

pub struct Controller {
    services: Store<ServiceRecord>,
    endpoints: Store<EndpointsRecord>,
    nodes: Store<NodeRecord>,

    services_queue: Arc<WorkQueue>,
    endpoints_queue: Arc<WorkQueue>,
    nodes_queue: Arc<WorkQueue>,

    cfgtor: Arc<Configurator>,
    settings: Settings,
    io_failures: AtomicU32,
}

impl Controller {
    pub fn new(cfgtor: Arc<Configurator>, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            services: Store::new(),
            endpoints: Store::new(),
            nodes: Store::new(),
            services_queue: Arc::new(WorkQueue::new()),
            endpoints_queue: Arc::new(WorkQueue::new()),
            nodes_queue: Arc::new(WorkQueue::new()),
            cfgtor,
            settings,
            io_failures: AtomicU32::new(0),
        })
    }

    async fn sync_services(&self, key: ObjectKey) -> SyncResult {
        if self.services_queue.is_shutting_down() {
            return Ok(());
        }

        let Some(record) = self.services.get(&key) else {
            debug!("{key}: service gone, deleting configuration");
            return self.configure(&key, None).await;
        };

        if !record.is_admissible() || !self.settings.selects(&key, &record) {
            // also covers a service leaving our management
            return self.configure(&key, None).await;
        }

        let endpoints = self.endpoints.get(&key);
        let spec = ServiceSpec {
            key: key.clone(),
            topology: topology::resolve(&key, &record, endpoints.as_ref()),
            record,
        };
        self.configure(&key, Some(spec)).await
    }

    async fn configure(&self, key: &ObjectKey, spec: Option<ServiceSpec>) -> SyncResult {
        let result = match &spec {
            Some(spec) => self.cfgtor.add_or_update_service(spec).await,
            None => self.cfgtor.delete_configuration(key).await,
        };
        match result {
            Ok(()) => {
                self.io_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    /// Validation and reload failures leave the previous configuration
    /// active and are retried; configuration writes that keep failing end
    /// the controller.
    fn classify(&self, err: NginxError) -> SyncError {
        match &err {
            NginxError::Io(_) => {
                let failures = self.io_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= MAX_IO_FAILURES {
                    return SyncError::Fatal(
                        eyre::Report::new(err).wrap_err("repeated configuration write failures"),
                    );
                }
                SyncError::Retry(err.into())
            }
            _ => SyncError::Retry(err.into()),
        }
    }

    async fn sync_endpoints(&self, key: ObjectKey) -> SyncResult {
        if self.endpoints_queue.is_shutting_down() {
            return Ok(());
        }

        // endpoints are never rendered directly: an endpoints object and
        // its service share their key, so hand the work to the services
        // queue
        if let Some(service) = self.services.get(&key) {
            if service.is_admissible() {
                self.services_queue.add(key);
            }
        }
        Ok(())
    }

    async fn sync_nodes(&self, key: ObjectKey) -> SyncResult {
        if self.nodes_queue.is_shutting_down() {
            return Ok(());
        }

        let affected = match self.nodes.get(&key) {
            Some(node) => self.cfgtor.add_or_update_node(node).await,
            None => self.cfgtor.delete_node(&key.name).await,
        };
        for service_key in affected {
            debug!("node {key}: re-enqueuing {service_key}");
            self.services_queue.add(service_key);
        }
        Ok(())
    }

    /// Runs the pipelines until shutdown. Nodes and endpoints come up
    /// first and get a warm-up interval to seed their caches before the
    /// services pipeline starts.
    pub async fn run(
        self: Arc<Self>,
        client: Client,
        mut shutdown: watch::Receiver<bool>,
    ) -> eyre::Result<()> {
        let mut informers = Tasks::new();
        let mut workers = Tasks::new();

        spawn_informer(
            &mut informers,
            "nodes",
            Api::<core::Node>::all(client.clone()),
            Informer::new(self.nodes.clone(), self.nodes_queue.clone(), drop_none),
        );
        {
            let this = self.clone();
            let queue = self.nodes_queue.clone();
            workers.spawn(async move {
                let result = queue::run_worker(queue, "nodes", move |key| {
                    let this = this.clone();
                    async move { this.sync_nodes(key).await }
                })
                .await;
                ("nodes worker", result)
            });
        }

        spawn_informer(
            &mut informers,
            "endpoints",
            Api::<core::Endpoints>::all(client.clone()),
            Informer::new(
                self.endpoints.clone(),
                self.endpoints_queue.clone(),
                drop_system_namespaces,
            ),
        );
        {
            let this = self.clone();
            let queue = self.endpoints_queue.clone();
            workers.spawn(async move {
                let result = queue::run_worker(queue, "endpoints", move |key| {
                    let this = this.clone();
                    async move { this.sync_endpoints(key).await }
                })
                .await;
                ("endpoints worker", result)
            });
        }

        info!("waiting {WARM_UP:?} for node and endpoints caches to seed");
        tokio::time::sleep(WARM_UP).await;

        spawn_informer(
            &mut informers,
            "services",
            Api::<core::Service>::all(client),
            Informer::new(
                self.services.clone(),
                self.services_queue.clone(),
                drop_system_namespaces,
            ),
        );
        {
            let this = self.clone();
            let queue = self.services_queue.clone();
            workers.spawn(async move {
                let result = queue::run_worker(queue, "services", move |key| {
                    let this = this.clone();
                    async move { this.sync_services(key).await }
                })
                .await;
                ("services worker", result)
            });
        }

        info!("controller started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(res) = workers.join_next() => match res {
                    Ok((name, Ok(()))) => return Err(format_err!("{name} stopped unexpectedly")),
                    Ok((name, Err(e))) => return Err(e.wrap_err(format!("{name} failed"))),
                    Err(e) => return Err(format_err!("worker task join failed: {e}")),
                },
                Some(res) = informers.join_next() => match res {
                    Ok((name, Ok(()))) => return Err(format_err!("{name} informer stopped unexpectedly")),
                    Ok((name, Err(e))) => return Err(e.wrap_err(format!("{name} informer failed"))),
                    Err(e) => return Err(format_err!("informer task join failed: {e}")),
                },
            }
        }

        // cascade: queues stop accepting and drain, workers exit, then the
        // informers are stopped; the proxy process is left running
        info!("shutting down");
        self.nodes_queue.shut_down();
        self.endpoints_queue.shut_down();
        self.services_queue.shut_down();

        while let Some(res) = workers.join_next().await {
            if let Ok((name, Err(e))) = res {
                warn!("{name} failed during drain: {e:#}");
            }
        }
        informers.abort_all();
        while informers.join_next().await.is_some() {}

        info!("shutdown complete");
        Ok(())
    }
}

type Tasks = JoinSet<(&'static str, eyre::Result<()>)>;

fn spawn_informer<K, R>(tasks: &mut Tasks, name: &'static str, api: Api<K>, informer: Informer<K, R>)
where
    K: kube::api::Resource
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
    R: FromKube<K> + Clone + PartialEq + Send + Sync + 'static,
{
    tasks.spawn(async move { (name, informer::run(informer, api).await) });
}
