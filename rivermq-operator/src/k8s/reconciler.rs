//! The convergence pass.
//!
//! One pass derives the full desired managed object set from a cluster's declaration, syncs
//! the config channels, diffs desired against deployed, applies the delta, and reports what it
//! observed so the state machine can move. Passes are idempotent: with no declaration change
//! and a converged platform, a pass performs zero writes.

use std::collections::BTreeMap;

use anyhow::Context;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, Pod, PodSpec, PodTemplateSpec, ResourceRequirements, Secret, Service, ServicePort,
    ServiceSpec, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::timeout;

use crate::k8s::channel;
use crate::k8s::compare::{self, ManagedObject};
use crate::k8s::fsm::{ClusterFsm, Observation};
use crate::k8s::{cluster_labels, ClusterKey, API_TIMEOUT};
use rivermq_core::crd::{
    BrokerCluster, BrokerClusterStatus, BrokerDrain, BrokerDrainSpec, PodStatusSummary, StatusCondition,
};
use rivermq_core::ReconcileError;

/// The management console port opened on every member.
pub const CONSOLE_PORT: i32 = 8161;
/// The cluster discovery port opened on every member.
pub const PING_PORT: i32 = 8888;
/// The broker container name within member pods.
const CONTAINER_NAME: &str = "broker";
/// The journal volume claim name for persistent members.
pub(crate) const JOURNAL_VOLUME: &str = "journal";

/// Shared handles a convergence pass needs.
pub struct ReconcileContext {
    /// The K8s API client.
    pub client: Client,
}

/// What a finished pass reports back to the state machine.
pub(crate) struct PassReport {
    pub observation: Observation,
}

/// Run one convergence pass for the given cluster record.
///
/// Individual object write failures are tolerated and reflected in the observation; the pass
/// itself only fails when it cannot even assemble its inputs.
pub(crate) async fn run_pass(fsm: &mut ClusterFsm, ctx: &ReconcileContext) -> Result<PassReport, ReconcileError> {
    let key = fsm.key.clone();
    let owner = owner_reference(&fsm.current)?;
    let deployed = compare::fetch_deployed(&ctx.client, &key.namespace, &key.name)
        .await
        .map_err(ReconcileError::Transient)?;
    let deployed_sts = deployed.iter().find_map(|obj| match obj {
        ManagedObject::StatefulSet(sts) if obj.name() == key.name => Some(sts.as_ref().clone()),
        _ => None,
    });
    let deployed_secret = |name: &str| {
        deployed.iter().find_map(|obj| match obj {
            ManagedObject::Secret(secret) if obj.name() == name => Some(secret.as_ref().clone()),
            _ => None,
        })
    };

    // Re-derive the workload template when the cache is cold or the declaration moved.
    let changes = fsm.process_semantic_changes();
    let mut template = match fsm.template.take() {
        Some(template) if !changes.declaration_changed => template,
        _ => build_statefulset(&key, &fsm.current),
    };
    if let Some(spec) = template.spec.as_mut() {
        spec.replicas = Some(fsm.current.spec.deployment_plan.replicas);
    }
    // Seed the roll count from the deployed workload so rehydrated templates don't roll pods.
    seed_roll_count(&mut template, deployed_sts.as_ref());

    let mut desired: Vec<ManagedObject> = Vec::new();
    let mut config_changed = changes.config_changed;

    // Credentials channel.
    let name = credentials_secret_name(&key.name);
    let existing = deployed_secret(&name);
    let entries = credential_entries(&fsm.current, existing.as_ref());
    config_changed |= sync_channel(&key, &name, existing.as_ref(), entries, &mut template, &mut desired);

    // Endpoints channel.
    let name = endpoints_secret_name(&key.name);
    let existing = deployed_secret(&name);
    let entries = endpoint_entries(&fsm.current);
    config_changed |= sync_channel(&key, &name, existing.as_ref(), entries, &mut template, &mut desired);

    // Console channel, only present when the console needs args at all.
    if let Some(entries) = console_entries(&fsm.current) {
        let name = console_secret_name(&key.name);
        let existing = deployed_secret(&name);
        config_changed |= sync_channel(&key, &name, existing.as_ref(), entries, &mut template, &mut desired);
    }

    // Broker properties channel, rendered from the merged declaration view.
    let name = properties_secret_name(&key.name);
    let existing = deployed_secret(&name);
    let entries = property_entries(&fsm.previous, &fsm.current).map_err(ReconcileError::Transient)?;
    config_changed |= sync_channel(&key, &name, existing.as_ref(), entries, &mut template, &mut desired);

    // Any channel change rolls the cluster's pods, exactly once per pass.
    if config_changed {
        let count = channel::increment_roll_count(&mut template);
        tracing::info!(cluster = %key, roll_count = count, "config change detected, rolling cluster pods");
    }

    desired.push(ManagedObject::StatefulSet(Box::new(template.clone())));
    fsm.template = Some(template);

    desired.push(ManagedObject::Service(Box::new(build_headless_service(&key, &fsm.current))));
    desired.push(ManagedObject::Service(Box::new(build_ping_service(&key))));
    desired.extend(build_ingresses(&key, &fsm.current).into_iter().map(|obj| ManagedObject::Ingress(Box::new(obj))));

    let delta = compare::compare(desired, deployed);
    let report = compare::apply(&ctx.client, &key.namespace, &owner, delta).await;

    // The drain declaration lives outside the diffed object set.
    if let Err(err) = sync_drain_declaration(ctx, &key, &fsm.current, &owner).await {
        tracing::error!(error = ?err, cluster = %key, "error syncing drain declaration");
    }

    let observation = Observation {
        all_objects_present: report.failed == 0,
        desired_replicas: fsm.current.spec.deployment_plan.replicas,
        observed_replicas: deployed_sts
            .as_ref()
            .and_then(|sts| sts.status.as_ref())
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0),
    };

    if let Err(err) = update_status(fsm, ctx, &observation).await {
        tracing::error!(error = ?err, cluster = %key, "error updating cluster status");
    }

    Ok(PassReport { observation })
}

/// Plan and record one config channel sync, wiring its keys into the workload template.
///
/// The desired Secret always joins the managed object set so the diff engine performs the
/// actual create or rewrite. Returns whether the channel's content changed.
fn sync_channel(
    key: &ClusterKey, name: &str, existing: Option<&Secret>, entries: BTreeMap<String, String>,
    template: &mut StatefulSet, desired: &mut Vec<ManagedObject>,
) -> bool {
    let plan = channel::plan_sync(name, &key.namespace, cluster_labels(&key.name), existing, &entries);
    let changed = plan.is_config_change();
    if changed {
        tracing::debug!(cluster = %key, channel = name, "config channel content changed");
    }
    channel::source_env_from_secret(template, name, entries.keys());
    desired.push(ManagedObject::Secret(Box::new(plan.into_secret())));
    changed
}

//////////////////////////////////////////////////////////////////////////////
// Object Naming /////////////////////////////////////////////////////////////

pub fn credentials_secret_name(cluster: &str) -> String {
    format!("{}-credentials", cluster)
}

pub fn endpoints_secret_name(cluster: &str) -> String {
    format!("{}-endpoints", cluster)
}

pub fn console_secret_name(cluster: &str) -> String {
    format!("{}-console", cluster)
}

pub fn properties_secret_name(cluster: &str) -> String {
    format!("{}-props", cluster)
}

pub fn headless_service_name(cluster: &str) -> String {
    format!("{}-hs", cluster)
}

pub fn ping_service_name(cluster: &str) -> String {
    format!("{}-ping", cluster)
}

pub fn drain_name(cluster: &str) -> String {
    format!("{}-drain", cluster)
}

//////////////////////////////////////////////////////////////////////////////
// Object Builders ///////////////////////////////////////////////////////////

/// Build the workload StatefulSet for a declared cluster.
///
/// Deterministic: the same declaration always yields the same template.
pub(crate) fn build_statefulset(key: &ClusterKey, cluster: &BrokerCluster) -> StatefulSet {
    let plan = &cluster.spec.deployment_plan;
    let labels = cluster_labels(&key.name);

    let mut ports: Vec<ContainerPort> = cluster
        .spec
        .acceptors
        .iter()
        .map(|acceptor| ContainerPort {
            name: Some(acceptor.name.clone()),
            container_port: acceptor.port,
            ..Default::default()
        })
        .collect();
    ports.push(ContainerPort { name: Some("console".into()), container_port: CONSOLE_PORT, ..Default::default() });
    ports.push(ContainerPort { name: Some("ping".into()), container_port: PING_PORT, ..Default::default() });

    let env = vec![
        EnvVar { name: "RIVERMQ_CLUSTERED".into(), value: Some("true".into()), value_from: None },
        EnvVar { name: "RIVERMQ_PING_SVC_NAME".into(), value: Some(ping_service_name(&key.name)), value_from: None },
        EnvVar {
            name: "POD_NAMESPACE".into(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        },
    ];

    let mut container = Container {
        name: CONTAINER_NAME.into(),
        image: Some(plan.image.clone()),
        ports: Some(ports),
        env: Some(env),
        ..Default::default()
    };

    let mut volume_claim_templates = None;
    if plan.persistence_enabled {
        container.volume_mounts = Some(vec![VolumeMount {
            name: JOURNAL_VOLUME.into(),
            mount_path: "/var/lib/rivermq/data".into(),
            ..Default::default()
        }]);
        let storage = plan.storage.clone().unwrap_or_default();
        let size = if storage.size.is_empty() { "2Gi".to_string() } else { storage.size };
        volume_claim_templates = Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta { name: Some(JOURNAL_VOLUME.into()), labels: Some(labels.clone()), ..Default::default() },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(storage.access_modes.unwrap_or_else(|| vec!["ReadWriteOnce".into()])),
                storage_class_name: storage.storage_class,
                resources: Some(ResourceRequirements {
                    requests: Some(maplit::btreemap! {"storage".to_string() => Quantity(size)}),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(plan.replicas),
            service_name: headless_service_name(&key.name),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container], ..Default::default() }),
            },
            volume_claim_templates,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the headless service backing member DNS and client endpoints.
pub(crate) fn build_headless_service(key: &ClusterKey, cluster: &BrokerCluster) -> Service {
    let labels = cluster_labels(&key.name);
    let mut ports: Vec<ServicePort> = cluster
        .spec
        .acceptors
        .iter()
        .map(|acceptor| ServicePort { name: Some(acceptor.name.clone()), port: acceptor.port, ..Default::default() })
        .collect();
    ports.push(ServicePort { name: Some("console".into()), port: CONSOLE_PORT, ..Default::default() });
    Service {
        metadata: ObjectMeta {
            name: Some(headless_service_name(&key.name)),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            selector: Some(labels),
            ports: Some(ports),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the discovery service members use to find each other.
pub(crate) fn build_ping_service(key: &ClusterKey) -> Service {
    let labels = cluster_labels(&key.name);
    Service {
        metadata: ObjectMeta {
            name: Some(ping_service_name(&key.name)),
            namespace: Some(key.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            selector: Some(labels),
            ports: Some(vec![ServicePort { name: Some("ping".into()), port: PING_PORT, ..Default::default() }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build ingresses for every exposed acceptor, connector and the console.
pub(crate) fn build_ingresses(key: &ClusterKey, cluster: &BrokerCluster) -> Vec<Ingress> {
    let mut out = Vec::new();
    for acceptor in cluster.spec.acceptors.iter().filter(|acceptor| acceptor.expose) {
        out.push(build_ingress(key, &acceptor.name, acceptor.port));
    }
    for connector in cluster.spec.connectors.iter().filter(|connector| connector.expose) {
        out.push(build_ingress(key, &connector.name, connector.port));
    }
    if cluster.spec.console.expose {
        out.push(build_ingress(key, "console", CONSOLE_PORT));
    }
    out
}

fn build_ingress(key: &ClusterKey, endpoint: &str, port: i32) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}-ing", key.name, endpoint)),
            namespace: Some(key.namespace.clone()),
            labels: Some(cluster_labels(&key.name)),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(format!("{}-{}.{}.svc", key.name, endpoint, key.namespace)),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".into()),
                        path_type: "Prefix".into(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: headless_service_name(&key.name),
                                port: Some(ServiceBackendPort { number: Some(port), ..Default::default() }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

//////////////////////////////////////////////////////////////////////////////
// Channel Content ///////////////////////////////////////////////////////////

/// Compute the credentials channel entries.
///
/// Explicit declaration values win; otherwise any previously generated value in the deployed
/// channel is preserved; otherwise a fresh random value is generated. This keeps credentials
/// stable across passes while still honoring rotation via the declaration.
pub(crate) fn credential_entries(cluster: &BrokerCluster, existing: Option<&Secret>) -> BTreeMap<String, String> {
    let value = |declared: Option<&String>, key: &str| {
        declared
            .cloned()
            .or_else(|| existing.and_then(|secret| channel::secret_value(secret, key)))
            .unwrap_or_else(generated_credential)
    };
    maplit::btreemap! {
        channel::KEY_USER.to_string() => value(cluster.spec.admin_user.as_ref(), channel::KEY_USER),
        channel::KEY_PASSWORD.to_string() => value(cluster.spec.admin_password.as_ref(), channel::KEY_PASSWORD),
        channel::KEY_CLUSTER_USER.to_string() => value(None, channel::KEY_CLUSTER_USER),
        channel::KEY_CLUSTER_PASSWORD.to_string() => value(None, channel::KEY_CLUSTER_PASSWORD),
        channel::KEY_REQUIRE_LOGIN.to_string() => cluster.spec.deployment_plan.require_login.to_string(),
    }
}

fn generated_credential() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(16).map(char::from).collect()
}

/// Compute the endpoints channel entries: the rendered acceptor and connector strings.
pub(crate) fn endpoint_entries(cluster: &BrokerCluster) -> BTreeMap<String, String> {
    maplit::btreemap! {
        channel::KEY_ACCEPTORS.to_string() => generate_acceptors_string(cluster),
        channel::KEY_CONNECTORS.to_string() => generate_connectors_string(cluster),
    }
}

/// Render the acceptors config string, one entry per declared acceptor, declaration order.
pub(crate) fn generate_acceptors_string(cluster: &BrokerCluster) -> String {
    let mut entries = Vec::with_capacity(cluster.spec.acceptors.len());
    for acceptor in &cluster.spec.acceptors {
        let mut params = Vec::new();
        if let Some(protocols) = acceptor.protocols.as_ref() {
            params.push(format!("protocols={}", protocols));
        }
        if acceptor.ssl_enabled {
            params.push("sslEnabled=true".into());
            if let Some(secret) = acceptor.ssl_secret.as_ref() {
                params.push(format!("sslSecret={}", secret));
            }
            if acceptor.needs_client_auth {
                params.push("needClientAuth=true".into());
            }
            if acceptor.verify_host {
                params.push("verifyHost=true".into());
            }
        }
        if let Some(prefix) = acceptor.anycast_prefix.as_ref() {
            params.push(format!("anycastPrefix={}", prefix));
        }
        if let Some(prefix) = acceptor.multicast_prefix.as_ref() {
            params.push(format!("multicastPrefix={}", prefix));
        }
        let mut entry = format!("{}:tcp://$(POD_IP):{}", acceptor.name, acceptor.port);
        if !params.is_empty() {
            entry.push('?');
            entry.push_str(&params.join(";"));
        }
        entries.push(entry);
    }
    entries.join(",")
}

/// Render the connectors config string, declaration order.
pub(crate) fn generate_connectors_string(cluster: &BrokerCluster) -> String {
    let mut entries = Vec::with_capacity(cluster.spec.connectors.len());
    for connector in &cluster.spec.connectors {
        let mut entry = format!("{}:tcp://{}:{}", connector.name, connector.host, connector.port);
        if connector.ssl_enabled {
            entry.push_str("?sslEnabled=true");
            if let Some(secret) = connector.ssl_secret.as_ref() {
                entry.push_str(&format!(";sslSecret={}", secret));
            }
        }
        entries.push(entry);
    }
    entries.join(",")
}

/// Compute the console channel entries, or None when the console needs no args.
pub(crate) fn console_entries(cluster: &BrokerCluster) -> Option<BTreeMap<String, String>> {
    let console = &cluster.spec.console;
    if !console.ssl_enabled {
        return None;
    }
    let mut args = vec!["--ssl-enabled".to_string()];
    if let Some(secret) = console.ssl_secret.as_ref() {
        args.push(format!("--ssl-secret={}", secret));
    }
    if console.use_client_auth {
        args.push("--use-client-auth".into());
    }
    Some(maplit::btreemap! {channel::KEY_CONSOLE_ARGS.to_string() => args.join(" ")})
}

/// Compute the broker properties channel entries.
///
/// Logging and address settings come from the merged declaration view so that incremental
/// logger updates accumulate rather than reset.
pub(crate) fn property_entries(
    merged: &BrokerCluster, current: &BrokerCluster,
) -> anyhow::Result<BTreeMap<String, String>> {
    let logging = merged
        .spec
        .logging
        .loggers
        .iter()
        .map(|logger| format!("{}={}", logger.name, logger.level.as_deref().unwrap_or("INFO")))
        .collect::<Vec<_>>()
        .join("\n");
    let address_settings =
        serde_json::to_string(&merged.spec.address_settings).context("error serializing address settings")?;
    Ok(maplit::btreemap! {
        channel::KEY_LOGGING.to_string() => logging,
        channel::KEY_ADDRESS_SETTINGS.to_string() => address_settings,
        channel::KEY_BROKER_PROPERTIES.to_string() => current.spec.broker_properties.join("\n"),
    })
}

//////////////////////////////////////////////////////////////////////////////
// Platform Interaction //////////////////////////////////////////////////////

/// Build the owner reference stamped onto every managed object.
pub(crate) fn owner_reference(cluster: &BrokerCluster) -> Result<OwnerReference, ReconcileError> {
    let meta = cluster.meta();
    let uid = meta
        .uid
        .clone()
        .ok_or_else(|| ReconcileError::Transient(anyhow::anyhow!("declaration has no uid assigned yet")))?;
    Ok(OwnerReference {
        api_version: "rivermq.io/v1beta1".into(),
        kind: "BrokerCluster".into(),
        name: meta.name.clone().unwrap_or_default(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Carry the deployed workload's roll count over onto a freshly derived template.
fn seed_roll_count(template: &mut StatefulSet, deployed: Option<&StatefulSet>) {
    let count = deployed
        .and_then(|sts| sts.spec.as_ref())
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.as_ref())
        .and_then(|annotations| annotations.get(channel::ROLL_COUNT_ANNOTATION))
        .cloned();
    if let (Some(count), Some(spec)) = (count, template.spec.as_mut()) {
        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        meta.annotations
            .get_or_insert_with(Default::default)
            .insert(channel::ROLL_COUNT_ANNOTATION.into(), count);
    }
}

/// Keep the cluster's drain declaration in step with its `messageMigration` flag.
///
/// Unset is treated as enabled. The drain object is operator-owned, so deleting the cluster
/// garbage-collects it via the owner reference.
async fn sync_drain_declaration(
    ctx: &ReconcileContext, key: &ClusterKey, cluster: &BrokerCluster, owner: &OwnerReference,
) -> anyhow::Result<()> {
    let api: Api<BrokerDrain> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let name = drain_name(&key.name);
    let enabled = cluster.spec.deployment_plan.message_migration.unwrap_or(true);
    let live = match timeout(API_TIMEOUT, api.get(&name)).await.context("timeout while fetching drain declaration")? {
        Ok(drain) => Some(drain),
        Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => None,
        Err(err) => return Err(err).context("error fetching drain declaration"),
    };
    match (enabled, live) {
        (true, None) => {
            let mut drain = BrokerDrain::new(&name, BrokerDrainSpec { local_only: true });
            drain.metadata.namespace = Some(key.namespace.clone());
            drain.metadata.labels = Some(cluster_labels(&key.name));
            drain.metadata.owner_references = Some(vec![owner.clone()]);
            timeout(API_TIMEOUT, api.create(&Default::default(), &drain))
                .await
                .context("timeout while creating drain declaration")?
                .context("error creating drain declaration")?;
            tracing::info!(cluster = %key, "created drain declaration");
        }
        (false, Some(_)) => {
            match timeout(API_TIMEOUT, api.delete(&name, &Default::default()))
                .await
                .context("timeout while deleting drain declaration")?
            {
                Ok(_) => tracing::info!(cluster = %key, "deleted drain declaration"),
                Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => (),
                Err(err) => return Err(err).context("error deleting drain declaration"),
            }
        }
        _ => (),
    }
    Ok(())
}

/// The status block reporting a declaration the operator refuses to converge.
pub(crate) fn invalid_declaration_status(message: &str) -> BrokerClusterStatus {
    BrokerClusterStatus {
        pods: PodStatusSummary::default(),
        conditions: vec![StatusCondition {
            type_: "Valid".into(),
            status: "False".into(),
            reason: Some("DeclarationInvalid".into()),
            message: Some(message.to_string()),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        }],
    }
}

/// Patch an invalid-declaration condition onto the cluster's status.
pub(crate) async fn post_invalid_condition(
    ctx: &ReconcileContext, key: &ClusterKey, message: &str,
) -> anyhow::Result<()> {
    let api: Api<BrokerCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = serde_json::json!({ "status": invalid_declaration_status(message) });
    timeout(API_TIMEOUT, api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)))
        .await
        .context("timeout while patching cluster status")?
        .context("error patching cluster status")?;
    Ok(())
}

/// Refresh the declaration's status block from observed pod state.
///
/// The patch is skipped outright when nothing changed, keeping converged passes write-free.
async fn update_status(fsm: &mut ClusterFsm, ctx: &ReconcileContext, obs: &Observation) -> anyhow::Result<()> {
    let key = &fsm.key;
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let selector = format!(
        "{},{}={}",
        rivermq_core::RIVERMQ_OPERATOR_LABEL_SELECTORS,
        crate::k8s::LABEL_RIVERMQ_CLUSTER,
        key.name
    );
    let params = ListParams { label_selector: Some(selector), ..Default::default() };
    let pods = timeout(API_TIMEOUT, api.list(&params))
        .await
        .context("timeout while listing cluster pods")?
        .context("error listing cluster pods")?;

    let mut summary = PodStatusSummary::default();
    for pod in pods.items {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref()).unwrap_or("Unknown");
        let ready = pod
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .map(|conditions| conditions.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
            .unwrap_or(false);
        match (phase, ready) {
            ("Running", true) => summary.ready.push(name),
            ("Running", false) | ("Pending", _) => summary.starting.push(name),
            _ => summary.stopped.push(name),
        }
    }
    summary.ready.sort();
    summary.starting.sort();
    summary.stopped.sort();

    let deployed_status = if obs.all_objects_present { "True" } else { "False" };
    let mut status = BrokerClusterStatus {
        pods: summary,
        conditions: vec![StatusCondition {
            type_: "Deployed".into(),
            status: deployed_status.into(),
            reason: None,
            message: Some(format!(
                "{}/{} replicas ready",
                obs.observed_replicas, obs.desired_replicas
            )),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        }],
    };
    // Preserve transition timestamps for conditions which did not actually transition.
    if let Some(old) = fsm.current.status.as_ref() {
        for cond in status.conditions.iter_mut() {
            if let Some(prev) = old.conditions.iter().find(|prev| prev.type_ == cond.type_ && prev.status == cond.status)
            {
                cond.last_transition_time = prev.last_transition_time.clone();
            }
        }
        if *old == status {
            return Ok(());
        }
    }

    let api: Api<BrokerCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = serde_json::json!({ "status": status });
    let params = PatchParams::default();
    timeout(API_TIMEOUT, api.patch_status(&key.name, &params, &Patch::Merge(&patch)))
        .await
        .context("timeout while patching cluster status")?
        .context("error patching cluster status")?;
    fsm.current.status = Some(status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivermq_core::crd::{AcceptorSpec, BrokerClusterSpec, ConnectorSpec, ConsoleSpec, DeploymentPlan, StorageSpec};

    fn key() -> ClusterKey {
        ClusterKey::new("default", "mq")
    }

    fn cluster() -> BrokerCluster {
        let spec = BrokerClusterSpec {
            deployment_plan: DeploymentPlan {
                replicas: 2,
                image: "rivermq/broker:2.1".into(),
                persistence_enabled: true,
                storage: Some(StorageSpec { size: "4Gi".into(), ..Default::default() }),
                ..Default::default()
            },
            acceptors: vec![
                AcceptorSpec {
                    name: "amqp".into(),
                    port: 5672,
                    protocols: Some("AMQP".into()),
                    expose: true,
                    ..Default::default()
                },
                AcceptorSpec {
                    name: "core-tls".into(),
                    port: 61617,
                    ssl_enabled: true,
                    ssl_secret: Some("mq-tls".into()),
                    needs_client_auth: true,
                    ..Default::default()
                },
            ],
            connectors: vec![ConnectorSpec { name: "dr".into(), host: "dr.example.com".into(), port: 61616, ..Default::default() }],
            ..Default::default()
        };
        BrokerCluster::new("mq", spec)
    }

    #[test]
    fn statefulset_build_is_deterministic() {
        let a = build_statefulset(&key(), &cluster());
        let b = build_statefulset(&key(), &cluster());
        assert_eq!(a, b);

        let spec = a.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.service_name, "mq-hs");
        assert_eq!(spec.volume_claim_templates.as_ref().unwrap().len(), 1);
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("rivermq/broker:2.1"));
        // Acceptor ports plus console and ping.
        assert_eq!(container.ports.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn desired_objects_self_compare_to_empty_delta() {
        let key = key();
        let cluster = cluster();
        let build = || {
            let mut objects = vec![
                ManagedObject::StatefulSet(Box::new(build_statefulset(&key, &cluster))),
                ManagedObject::Service(Box::new(build_headless_service(&key, &cluster))),
                ManagedObject::Service(Box::new(build_ping_service(&key))),
            ];
            objects.extend(build_ingresses(&key, &cluster).into_iter().map(|obj| ManagedObject::Ingress(Box::new(obj))));
            objects
        };
        assert!(compare::compare(build(), build()).is_empty());
    }

    #[test]
    fn acceptors_string_renders_declaration_order() {
        let rendered = generate_acceptors_string(&cluster());
        let expected = concat!(
            "amqp:tcp://$(POD_IP):5672?protocols=AMQP,",
            "core-tls:tcp://$(POD_IP):61617?sslEnabled=true;sslSecret=mq-tls;needClientAuth=true",
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn connectors_string_includes_tls_params() {
        let mut cluster = cluster();
        cluster.spec.connectors[0].ssl_enabled = true;
        cluster.spec.connectors[0].ssl_secret = Some("dr-tls".into());
        assert_eq!(
            generate_connectors_string(&cluster),
            "dr:tcp://dr.example.com:61616?sslEnabled=true;sslSecret=dr-tls"
        );
    }

    #[test]
    fn console_entries_absent_without_ssl() {
        assert!(console_entries(&cluster()).is_none());
        let mut with_ssl = cluster();
        with_ssl.spec.console = ConsoleSpec {
            ssl_enabled: true,
            ssl_secret: Some("console-tls".into()),
            use_client_auth: true,
            ..Default::default()
        };
        let entries = console_entries(&with_ssl).unwrap();
        assert_eq!(
            entries.get(channel::KEY_CONSOLE_ARGS).unwrap(),
            "--ssl-enabled --ssl-secret=console-tls --use-client-auth"
        );
    }

    #[test]
    fn credentials_prefer_declared_then_deployed_then_generated() {
        let mut cluster = cluster();
        cluster.spec.admin_user = Some("admin".into());
        let deployed = Secret {
            string_data: Some(maplit::btreemap! {
                channel::KEY_USER.to_string() => "old-admin".to_string(),
                channel::KEY_PASSWORD.to_string() => "kept-password".to_string(),
            }),
            ..Default::default()
        };
        let entries = credential_entries(&cluster, Some(&deployed));
        assert_eq!(entries.get(channel::KEY_USER).unwrap(), "admin");
        assert_eq!(entries.get(channel::KEY_PASSWORD).unwrap(), "kept-password");
        // No declared or deployed value: generated, non-empty.
        assert!(!entries.get(channel::KEY_CLUSTER_PASSWORD).unwrap().is_empty());
    }

    #[test]
    fn ingresses_cover_exposed_endpoints_only() {
        let mut cluster = cluster();
        cluster.spec.console.expose = true;
        let ingresses = build_ingresses(&key(), &cluster);
        let names: Vec<_> = ingresses.iter().filter_map(|ing| ing.metadata.name.clone()).collect();
        assert_eq!(names, vec!["mq-amqp-ing", "mq-console-ing"]);
    }

    #[test]
    fn invalid_declaration_surfaces_readable_condition() {
        let status = invalid_declaration_status("duplicate acceptor name: amqp");
        assert_eq!(status.conditions.len(), 1);
        let cond = &status.conditions[0];
        assert_eq!(cond.type_, "Valid");
        assert_eq!(cond.status, "False");
        assert_eq!(cond.reason.as_deref(), Some("DeclarationInvalid"));
        assert_eq!(cond.message.as_deref(), Some("duplicate acceptor name: amqp"));
    }

    #[test]
    fn property_entries_render_merged_logging() {
        let mut merged = cluster();
        merged.spec.logging.loggers = vec![
            rivermq_core::crd::LoggerSpec { name: "audit".into(), level: Some("DEBUG".into()) },
            rivermq_core::crd::LoggerSpec { name: "org.rivermq".into(), level: None },
        ];
        let entries = property_entries(&merged, &cluster()).unwrap();
        assert_eq!(entries.get(channel::KEY_LOGGING).unwrap(), "audit=DEBUG\norg.rivermq=INFO");
    }
}
