//! The drain coordinator.
//!
//! When a persistent cluster scales down, the departing members' journal volumes still hold
//! messages. A drain coordinator watches operator-managed StatefulSets on an observation tick,
//! detects journal claims whose ordinal is at or above the declared replica count, and walks
//! each one through a small session state machine: wait for the member's pod to go quiescent,
//! migrate its messages onto a surviving member, then mark the session complete. The
//! coordinator never deletes anything; completion only gates signaling.
//!
//! Coordinators are declared via BrokerDrain objects and coalesced per scope: one global
//! coordinator, or one per namespace for `localOnly` drains.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt;
use tokio::time::timeout;

use crate::config::Config;
use crate::k8s::reconciler::JOURNAL_VOLUME;
use crate::k8s::API_TIMEOUT;
use rivermq_core::crd::{BrokerDrain, RequiredMetadata};

/// The registry scope key for a coordinator watching all namespaces.
pub const SCOPE_ALL: &str = "*";

/// The phases of one drain session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainPhase {
    /// The departing member's pod has not yet gone quiescent.
    WaitingForQuiescence,
    /// Messages are being migrated onto a surviving member.
    Migrating,
    /// Migration finished; the session is done.
    Complete,
}

/// One departing member being drained.
#[derive(Clone, Debug)]
pub struct DrainSession {
    /// The owning cluster's name.
    pub cluster: String,
    /// The owning cluster's namespace.
    pub namespace: String,
    /// The departing member's pod name.
    pub pod: String,
    /// The departing member's ordinal.
    pub ordinal: i32,
    /// The broker image used for the migration.
    pub image: String,
    /// The session's current phase.
    pub phase: DrainPhase,
}

/// Advance a session phase given what this tick observed.
///
/// Sessions only move forward; a pod re-appearing mid-migration does not rewind the session.
pub fn advance(phase: DrainPhase, quiescent: bool, migrated: bool) -> DrainPhase {
    match phase {
        DrainPhase::WaitingForQuiescence if quiescent => DrainPhase::Migrating,
        DrainPhase::Migrating if migrated => DrainPhase::Complete,
        other => other,
    }
}

/// Whether a pod phase counts as quiescent for drain purposes.
pub fn pod_quiescent(phase: Option<&str>) -> bool {
    match phase {
        None => true,
        Some("Succeeded") | Some("Failed") => true,
        Some(_) => false,
    }
}

/// Parse a departing member's ordinal out of its journal claim name.
pub(crate) fn ordinal_from_claim(claim: &str, cluster: &str) -> Option<i32> {
    claim.strip_prefix(&format!("{}-{}-", JOURNAL_VOLUME, cluster))?.parse().ok()
}

/// The session map key for a departing member.
///
/// Pod names repeat across namespaces under the all-namespaces scope, so the namespace is
/// part of the key.
fn session_key(namespace: &str, pod: &str) -> String {
    format!("{}/{}", namespace, pod)
}

/// The message migration seam.
///
/// Production uses a drainer pod; tests substitute a stub so session progression can be
/// exercised without a platform.
pub trait MessageMigrator: Send + Sync + 'static {
    /// Drive one bounded migration attempt for the session, targeting the given member pod.
    ///
    /// Returns true once migration has fully completed; false means still in progress and the
    /// next tick should call again.
    fn migrate<'a>(&'a self, session: &'a DrainSession, target_pod: &'a str) -> BoxFuture<'a, Result<bool>>;
}

/// Migrates messages by running a drainer pod against the departing member's journal claim.
pub struct DrainPodMigrator {
    client: Client,
}

impl DrainPodMigrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn drainer_pod(session: &DrainSession, target_pod: &str) -> Pod {
        let claim = format!("{}-{}", JOURNAL_VOLUME, session.pod);
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-drainer", session.pod)),
                namespace: Some(session.namespace.clone()),
                labels: Some(crate::k8s::canonical_labels()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".into()),
                containers: vec![Container {
                    name: "drainer".into(),
                    image: Some(session.image.clone()),
                    env: Some(vec![
                        EnvVar { name: "RIVERMQ_DRAINER".into(), value: Some("true".into()), value_from: None },
                        EnvVar {
                            name: "RIVERMQ_DRAIN_TARGET".into(),
                            value: Some(format!("{}.{}-hs.{}.svc", target_pod, session.cluster, session.namespace)),
                            value_from: None,
                        },
                    ]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: JOURNAL_VOLUME.into(),
                        mount_path: "/var/lib/rivermq/data".into(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: JOURNAL_VOLUME.into(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim,
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl MessageMigrator for DrainPodMigrator {
    fn migrate<'a>(&'a self, session: &'a DrainSession, target_pod: &'a str) -> BoxFuture<'a, Result<bool>> {
        async move {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &session.namespace);
            let name = format!("{}-drainer", session.pod);
            let live = match timeout(API_TIMEOUT, api.get(&name))
                .await
                .context("timeout while fetching drainer pod")?
            {
                Ok(pod) => pod,
                Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => {
                    let pod = Self::drainer_pod(session, target_pod);
                    timeout(API_TIMEOUT, api.create(&PostParams::default(), &pod))
                        .await
                        .context("timeout while creating drainer pod")?
                        .context("error creating drainer pod")?;
                    tracing::info!(pod = %name, "created drainer pod");
                    return Ok(false);
                }
                Err(err) => return Err(err).context("error fetching drainer pod"),
            };
            match live.status.as_ref().and_then(|status| status.phase.as_deref()) {
                Some("Succeeded") => {
                    timeout(API_TIMEOUT, api.delete(&name, &DeleteParams::default()))
                        .await
                        .context("timeout while deleting drainer pod")?
                        .map(|_| ())
                        .context("error deleting drainer pod")?;
                    Ok(true)
                }
                Some("Failed") => {
                    // Delete so the next tick starts a fresh attempt.
                    timeout(API_TIMEOUT, api.delete(&name, &DeleteParams::default()))
                        .await
                        .context("timeout while deleting failed drainer pod")?
                        .map(|_| ())
                        .context("error deleting failed drainer pod")?;
                    anyhow::bail!("drainer pod failed, will retry")
                }
                _ => Ok(false),
            }
        }
        .boxed()
    }
}

/// A coordinator instance for one scope.
pub struct DrainController {
    scope: String,
    client: Client,
    config: Arc<Config>,
    migrator: Arc<dyn MessageMigrator>,
    sessions: HashMap<String, DrainSession>,
    shutdown: BroadcastStream<()>,
}

impl DrainController {
    pub fn new(
        scope: String, client: Client, config: Arc<Config>, migrator: Arc<dyn MessageMigrator>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { scope, client, config, migrator, sessions: HashMap::new(), shutdown: BroadcastStream::new(shutdown) }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(scope = %self.scope, "drain coordinator started");
        let period = std::time::Duration::from_secs(self.config.drain_check_seconds);
        let mut ticks = IntervalStream::new(tokio::time::interval(period));
        loop {
            tokio::select! {
                Some(_) = ticks.next() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = ?err, scope = %self.scope, "error during drain observation tick");
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }
        tracing::info!(scope = %self.scope, "drain coordinator stopped");
        Ok(())
    }

    /// One observation tick over every managed StatefulSet in scope.
    #[tracing::instrument(level = "debug", skip(self), fields(scope = %self.scope))]
    async fn tick(&mut self) -> Result<()> {
        let api: Api<StatefulSet> = if self.scope == SCOPE_ALL {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.scope)
        };
        let params = ListParams {
            label_selector: Some(rivermq_core::RIVERMQ_OPERATOR_LABEL_SELECTORS.into()),
            ..Default::default()
        };
        let stss = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing managed statefulsets")?
            .context("error listing managed statefulsets")?;
        for sts in stss.items {
            if let Err(err) = self.observe_cluster(&sts).await {
                let name = sts.metadata.name.as_deref().unwrap_or("<unknown>");
                tracing::error!(error = ?err, cluster = name, "error observing cluster for drain");
            }
        }
        Ok(())
    }

    /// Observe one cluster: discover departing members and advance their sessions.
    async fn observe_cluster(&mut self, sts: &StatefulSet) -> Result<()> {
        let name = sts.metadata.name.clone().context("statefulset has no name")?;
        let namespace = sts.metadata.namespace.clone().context("statefulset has no namespace")?;
        let desired = sts.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0);
        let image = sts
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .and_then(|container| container.image.clone())
            .unwrap_or_default();

        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let selector = format!(
            "{},{}={}",
            rivermq_core::RIVERMQ_OPERATOR_LABEL_SELECTORS,
            crate::k8s::LABEL_RIVERMQ_CLUSTER,
            name
        );
        let params = ListParams { label_selector: Some(selector), ..Default::default() };
        let claims = timeout(API_TIMEOUT, api.list(&params))
            .await
            .context("timeout while listing journal claims")?
            .context("error listing journal claims")?;

        for claim in claims.items {
            let claim_name = claim.metadata.name.clone().unwrap_or_default();
            let ordinal = match ordinal_from_claim(&claim_name, &name) {
                Some(ordinal) => ordinal,
                None => continue,
            };
            let pod_name = format!("{}-{}", name, ordinal);
            if ordinal < desired {
                // The member is back in the declared set; any session for it is superseded.
                if self.sessions.remove(&session_key(&namespace, &pod_name)).is_some() {
                    tracing::info!(pod = %pod_name, "drain session superseded by scale up");
                }
                continue;
            }
            self.advance_session(&name, &namespace, &pod_name, ordinal, &image, desired).await;
        }
        Ok(())
    }

    async fn advance_session(
        &mut self, cluster: &str, namespace: &str, pod_name: &str, ordinal: i32, image: &str, desired: i32,
    ) {
        let session = self.sessions.entry(session_key(namespace, pod_name)).or_insert_with(|| {
            tracing::info!(pod = %pod_name, cluster = %cluster, "departing member detected, drain session opened");
            DrainSession {
                cluster: cluster.to_string(),
                namespace: namespace.to_string(),
                pod: pod_name.to_string(),
                ordinal,
                image: image.to_string(),
                phase: DrainPhase::WaitingForQuiescence,
            }
        });
        match session.phase {
            DrainPhase::WaitingForQuiescence => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let phase = match timeout(API_TIMEOUT, api.get(pod_name)).await {
                    Ok(Ok(pod)) => pod.status.as_ref().and_then(|status| status.phase.clone()),
                    Ok(Err(kube::Error::Api(err))) if err.code == http::StatusCode::NOT_FOUND => None,
                    Ok(Err(err)) => {
                        tracing::error!(error = ?err, pod = %pod_name, "error checking member pod for quiescence");
                        return;
                    }
                    Err(_) => {
                        tracing::error!(pod = %pod_name, "timeout checking member pod for quiescence");
                        return;
                    }
                };
                let next = advance(session.phase, pod_quiescent(phase.as_deref()), false);
                if next != session.phase {
                    tracing::info!(pod = %pod_name, "departing member quiescent, beginning migration");
                    session.phase = next;
                }
            }
            DrainPhase::Migrating => {
                if desired == 0 {
                    tracing::warn!(pod = %pod_name, "no surviving members to migrate onto, holding session");
                    return;
                }
                let target = format!("{}-0", cluster);
                match self.migrator.migrate(session, &target).await {
                    Ok(true) => {
                        session.phase = advance(session.phase, true, true);
                        tracing::info!(pod = %pod_name, target = %target, "message migration complete");
                    }
                    Ok(false) => tracing::debug!(pod = %pod_name, "message migration in progress"),
                    Err(err) => {
                        tracing::warn!(error = ?err, pod = %pod_name, "message migration attempt failed, will retry");
                    }
                }
            }
            DrainPhase::Complete => (),
        }
    }
}

/// Handle to a running coordinator, tracking every declaration resolving to its scope.
struct CoordinatorHandle {
    stop: broadcast::Sender<()>,
    declarations: BTreeSet<String>,
}

impl CoordinatorHandle {
    /// Record a declaration as resolving to this coordinator's scope.
    fn declare(&mut self, id: String) -> bool {
        self.declarations.insert(id)
    }

    /// Retire a declaration; returns true once no declaration resolves to the scope anymore.
    fn retire(&mut self, id: &str) -> bool {
        self.declarations.remove(id);
        self.declarations.is_empty()
    }
}

/// The identity of a drain declaration.
fn drain_id(drain: &BrokerDrain) -> String {
    format!("{}/{}", drain.namespace(), drain.name())
}

/// The registry of drain coordinators, keyed by scope.
pub struct DrainRegistry {
    client: Client,
    config: Arc<Config>,
    coordinators: DashMap<String, CoordinatorHandle>,
}

impl DrainRegistry {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config, coordinators: DashMap::new() }
    }

    /// The scope a drain declaration resolves to.
    pub fn scope_of(drain: &BrokerDrain) -> String {
        if drain.spec.local_only {
            drain.namespace().to_string()
        } else {
            SCOPE_ALL.into()
        }
    }

    /// Ensure a coordinator is running for the drain's scope, coalescing duplicates.
    pub fn ensure(&self, drain: &BrokerDrain) {
        let scope = Self::scope_of(drain);
        let id = drain_id(drain);
        if let Some(mut handle) = self.coordinators.get_mut(&scope) {
            handle.declare(id);
            tracing::debug!(scope = %scope, drain = %drain.name(), "drain declaration coalesced onto running coordinator");
            return;
        }
        let (stop, stop_rx) = broadcast::channel(1);
        let migrator = Arc::new(DrainPodMigrator::new(self.client.clone()));
        DrainController::new(scope.clone(), self.client.clone(), self.config.clone(), migrator, stop_rx).spawn();
        let mut handle = CoordinatorHandle { stop, declarations: BTreeSet::new() };
        handle.declare(id);
        self.coordinators.insert(scope, handle);
    }

    /// Retire a removed drain declaration.
    ///
    /// The scope's coordinator keeps running until no declaration resolves to the scope
    /// anymore; only the last retirement fires the stop signal.
    pub fn remove(&self, drain: &BrokerDrain) {
        let scope = Self::scope_of(drain);
        let id = drain_id(drain);
        let scope_empty = match self.coordinators.get_mut(&scope) {
            Some(mut handle) => handle.retire(&id),
            None => return,
        };
        if !scope_empty {
            tracing::debug!(scope = %scope, drain = %drain.name(), "scope still declared elsewhere, coordinator kept");
            return;
        }
        if let Some((_, handle)) = self.coordinators.remove_if(&scope, |_, handle| handle.declarations.is_empty()) {
            let _ = handle.stop.send(());
            tracing::info!(scope = %scope, "drain coordinator stopping");
        }
    }

    /// Stop all coordinators.
    pub fn shutdown(&self) {
        for entry in self.coordinators.iter() {
            let _ = entry.value().stop.send(());
        }
        self.coordinators.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_only_moves_forward() {
        assert_eq!(advance(DrainPhase::WaitingForQuiescence, false, false), DrainPhase::WaitingForQuiescence);
        assert_eq!(advance(DrainPhase::WaitingForQuiescence, true, false), DrainPhase::Migrating);
        assert_eq!(advance(DrainPhase::Migrating, false, false), DrainPhase::Migrating);
        assert_eq!(advance(DrainPhase::Migrating, true, true), DrainPhase::Complete);
        // A returning pod does not rewind an in-flight migration.
        assert_eq!(advance(DrainPhase::Migrating, false, true), DrainPhase::Complete);
        assert_eq!(advance(DrainPhase::Complete, false, false), DrainPhase::Complete);
    }

    #[test]
    fn quiescence_from_pod_phase() {
        assert!(pod_quiescent(None));
        assert!(pod_quiescent(Some("Succeeded")));
        assert!(pod_quiescent(Some("Failed")));
        assert!(!pod_quiescent(Some("Running")));
        assert!(!pod_quiescent(Some("Pending")));
    }

    #[test]
    fn claim_ordinal_parsing() {
        assert_eq!(ordinal_from_claim("journal-mq-3", "mq"), Some(3));
        assert_eq!(ordinal_from_claim("journal-mq-0", "mq"), Some(0));
        assert_eq!(ordinal_from_claim("journal-other-3", "mq"), None);
        assert_eq!(ordinal_from_claim("cache-mq-3", "mq"), None);
        assert_eq!(ordinal_from_claim("journal-mq-x", "mq"), None);
    }

    #[test]
    fn session_keys_separate_namespaces() {
        assert_ne!(session_key("team-a", "mq-2"), session_key("team-b", "mq-2"));
        assert_eq!(session_key("team-a", "mq-2"), session_key("team-a", "mq-2"));
    }

    #[test]
    fn coordinator_stops_only_after_last_declaration_retires() {
        let (stop, _stop_rx) = broadcast::channel(1);
        let mut handle = CoordinatorHandle { stop, declarations: BTreeSet::new() };
        assert!(handle.declare("team-a/mq-drain".into()));
        assert!(handle.declare("team-b/other-drain".into()));
        // Re-declaring coalesces.
        assert!(!handle.declare("team-a/mq-drain".into()));

        assert!(!handle.retire("team-a/mq-drain"));
        assert!(handle.retire("team-b/other-drain"));
    }

    #[test]
    fn drain_scope_resolution() {
        let mut drain = BrokerDrain::new("mq-drain", rivermq_core::crd::BrokerDrainSpec { local_only: false });
        drain.metadata.namespace = Some("team-a".into());
        assert_eq!(DrainRegistry::scope_of(&drain), SCOPE_ALL);
        drain.spec.local_only = true;
        assert_eq!(DrainRegistry::scope_of(&drain), "team-a");
    }
}
