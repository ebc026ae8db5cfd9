//! Kubernetes controller.
//!
//! This controller watches the operator's CRDs across the cluster and routes their events into
//! the subsystems which act on them: BrokerCluster events go to per-cluster workers owning the
//! cluster state machines, BrokerDrain events go to the drain coordinator registry. A
//! scheduled resync tick re-drives convergence for every live cluster so failed or timed-out
//! passes are always retried.

pub(crate) mod channel;
mod compare;
mod drain;
mod fsm;
mod reconciler;
mod recovery;
mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use maplit::btreemap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::config::Config;
use crate::k8s::drain::DrainRegistry;
use crate::k8s::registry::{ClusterEvent, ClusterRegistry};
use rivermq_core::crd::{BrokerCluster, BrokerDrain, RequiredMetadata};

/// The app name used by the operator.
pub const APP_NAME: &str = "rivermq-operator";
/// The timeout used for individual K8s API calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The label carrying the owning cluster's name on every managed object.
pub const LABEL_RIVERMQ_CLUSTER: &str = "rivermq.io/cluster";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// The identity of a declared cluster: its namespace paired with its name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// The key of the given declared object.
    pub fn of(obj: &impl RequiredMetadata) -> Self {
        Self::new(obj.namespace(), obj.name())
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The canonical labels carried by every object this operator manages.
pub fn canonical_labels() -> BTreeMap<String, String> {
    btreemap! {
        "app".to_string() => "rivermq".to_string(),
        "rivermq.io/controlled-by".to_string() => APP_NAME.to_string(),
    }
}

/// The labels for objects managed on behalf of a specific cluster.
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = canonical_labels();
    labels.insert(LABEL_RIVERMQ_CLUSTER.into(), cluster.into());
    labels
}

/// The central K8s controller of the operator.
pub struct Controller {
    /// The K8s client in use.
    client: Client,
    /// The application's runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The registry of per-cluster workers.
    registry: Arc<ClusterRegistry>,
    /// The registry of drain coordinators.
    drains: Arc<DrainRegistry>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Self {
        let registry = ClusterRegistry::new(client.clone());
        let drains = Arc::new(DrainRegistry::new(client.clone(), config.clone()));
        Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            registry,
            drains,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let clusters: Api<BrokerCluster> = Api::all(self.client.clone());
        let mut clusters_watcher = watcher(clusters, ListParams::default()).boxed();
        let drains: Api<BrokerDrain> = Api::all(self.client.clone());
        let mut drains_watcher = watcher(drains, ListParams::default()).boxed();
        let period = Duration::from_secs(self.config.reconcile_resync_seconds);
        let mut resync = IntervalStream::new(tokio::time::interval(period));

        tracing::info!("k8s controller started");
        loop {
            tokio::select! {
                Some(res) = clusters_watcher.next() => self.handle_cluster_event(res),
                Some(res) = drains_watcher.next() => self.handle_drain_event(res),
                Some(_) = resync.next() => self.registry.resync(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        self.drains.shutdown();
        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Route a BrokerCluster watcher event to the owning worker.
    fn handle_cluster_event(&mut self, res: EventResult<BrokerCluster>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from BrokerCluster watcher");
                return;
            }
        };
        match event {
            Event::Applied(cluster) => {
                self.registry.dispatch(ClusterKey::of(&cluster), ClusterEvent::Applied(Box::new(cluster)));
            }
            Event::Deleted(cluster) => {
                self.registry.dispatch(ClusterKey::of(&cluster), ClusterEvent::Deleted);
            }
            Event::Restarted(clusters) => {
                for cluster in clusters {
                    self.registry.dispatch(ClusterKey::of(&cluster), ClusterEvent::Applied(Box::new(cluster)));
                }
            }
        }
    }

    /// Route a BrokerDrain watcher event to the drain coordinator registry.
    fn handle_drain_event(&mut self, res: EventResult<BrokerDrain>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from BrokerDrain watcher");
                return;
            }
        };
        match event {
            Event::Applied(drain) => self.drains.ensure(&drain),
            Event::Deleted(drain) => self.drains.remove(&drain),
            Event::Restarted(drains) => {
                for drain in drains {
                    self.drains.ensure(&drain);
                }
            }
        }
    }
}
