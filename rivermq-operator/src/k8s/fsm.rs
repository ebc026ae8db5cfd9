//! The per-cluster state machine driving convergence.
//!
//! Each declared BrokerCluster is owned by exactly one `ClusterFsm`, which carries the
//! reconciliation record for that cluster: the current and previously processed declarations,
//! the active state, and the cached workload template. The machine is a closed sum over three
//! states with the transition table centralized in [`transition`], so the table can be audited
//! and tested in isolation.
//!
//! All platform writes happen inside [`ClusterFsm::update`]; declaration swaps are pure data
//! movement.

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::k8s::reconciler::{self, ReconcileContext};
use crate::k8s::recovery::SnapshotRecord;
use crate::k8s::ClusterKey;
use k8s_openapi::api::apps::v1::StatefulSet;
use rivermq_core::crd::{AddressSettingsSpec, BrokerCluster, LoggerSpec, LoggingSpec};
use rivermq_core::ReconcileError;

/// The states a declared cluster moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum FsmState {
    /// Required platform objects are being created.
    #[display(fmt = "provisioning")]
    Provisioning,
    /// All required objects exist and observed replicas match the declaration.
    #[display(fmt = "running")]
    Running,
    /// Declared and observed replica counts differ; the workload is converging.
    #[display(fmt = "scaling")]
    Scaling,
}

/// What a convergence pass observed about the platform's actual state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    /// Every object in the managed set exists (nothing left to create, no failed writes).
    pub all_objects_present: bool,
    /// The replica count the declaration asks for.
    pub desired_replicas: i32,
    /// The ready replica count reported by the workload controller.
    pub observed_replicas: i32,
}

/// The outcome of one convergence pass, reported to the owning worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassSummary {
    /// The state the machine moved to.
    pub state: FsmState,
    /// Every object write in the pass landed, so the pass fully covers its revision.
    ///
    /// A pass which left objects unapplied must not be recorded as covering its revision;
    /// a restart would otherwise skip the retry entirely.
    pub fully_applied: bool,
}

impl PassSummary {
    pub(crate) fn of(obs: &Observation) -> Self {
        Self { state: transition(obs), fully_applied: obs.all_objects_present }
    }
}

/// What processing a new declaration for semantic changes concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SemanticChanges {
    /// The declaration moved to an unprocessed generation; derived objects are stale.
    pub declaration_changed: bool,
    /// The logging or address-settings configuration changed and must roll out to pods.
    pub config_changed: bool,
}

/// Compute the next state from a pass observation.
///
/// A missing required object always forces Provisioning, regardless of the current state;
/// this is what makes the machine self-healing when an object is deleted out from under it.
pub fn transition(obs: &Observation) -> FsmState {
    if !obs.all_objects_present {
        return FsmState::Provisioning;
    }
    if obs.observed_replicas != obs.desired_replicas {
        return FsmState::Scaling;
    }
    FsmState::Running
}

/// The reconciliation record and state machine for one declared cluster.
pub struct ClusterFsm {
    /// The identity of the declared cluster.
    pub(crate) key: ClusterKey,
    /// The declaration currently being converged.
    pub(crate) current: BrokerCluster,
    /// The previously processed declaration, used for incremental merge semantics.
    pub(crate) previous: BrokerCluster,
    /// The active state.
    pub(crate) state: FsmState,
    /// The generation of the last declaration processed for semantic changes.
    pub(crate) last_generation: i64,
    /// Cache of the derived workload template, rebuilt when the declaration demands it.
    pub(crate) template: Option<StatefulSet>,
}

impl ClusterFsm {
    /// Create a new machine for a first-sighted declared cluster.
    pub fn new(key: ClusterKey, cluster: BrokerCluster) -> Result<Self, ReconcileError> {
        validate(&cluster)?;
        Ok(Self {
            key,
            previous: cluster.clone(),
            current: cluster,
            state: FsmState::Provisioning,
            last_generation: -1,
            template: None,
        })
    }

    /// Rehydrate a machine from a crash-recovery snapshot.
    ///
    /// The cached workload template is not part of the snapshot; it is re-derived
    /// deterministically on the next pass.
    pub fn from_snapshot(key: ClusterKey, record: SnapshotRecord) -> Self {
        Self {
            key,
            current: record.declaration,
            previous: record.previous,
            state: record.state,
            last_generation: record.last_generation,
            template: None,
        }
    }

    /// Produce a crash-recovery snapshot of this machine's record.
    pub fn snapshot(&self) -> SnapshotRecord {
        SnapshotRecord {
            state: self.state,
            last_generation: self.last_generation,
            previous: self.previous.clone(),
            declaration: self.current.clone(),
        }
    }

    /// The platform-supplied revision token of the current declaration.
    pub fn revision_token(&self) -> String {
        self.current.meta().resource_version.clone().unwrap_or_default()
    }

    /// The active state of this machine.
    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Swap the current declaration into previous and establish the new one as current.
    ///
    /// Pure data movement; no I/O happens here.
    pub fn update_declaration(&mut self, new: BrokerCluster) {
        self.previous = std::mem::replace(&mut self.current, new);
    }

    /// Enter the machine: establish the record and run one convergence pass.
    ///
    /// Idempotent. Transient platform errors are swallowed and surface only as "not yet
    /// converged" to be retried on the next scheduled pass; only an unrecoverable setup
    /// failure (a malformed declaration) is returned as an error. Returns whether the first
    /// pass fully applied.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(cluster = %self.key))]
    pub async fn enter(&mut self, ctx: &ReconcileContext) -> Result<bool, ReconcileError> {
        match self.update(ctx).await {
            Ok(summary) => Ok(summary.fully_applied),
            Err(err) if err.is_fatal_to_pass() => Err(err),
            Err(err) => {
                tracing::debug!(error = %err, "initial convergence pass incomplete, will retry");
                Ok(false)
            }
        }
    }

    /// Run one convergence pass and move to the next state.
    ///
    /// This is the unit of idempotent, retryable work: with no declaration change, a second
    /// call produces zero platform mutations.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(cluster = %self.key, state = %self.state))]
    pub async fn update(&mut self, ctx: &ReconcileContext) -> Result<PassSummary, ReconcileError> {
        validate(&self.current)?;
        let report = reconciler::run_pass(self, ctx).await?;
        let summary = PassSummary::of(&report.observation);
        if summary.state != self.state {
            tracing::info!(cluster = %self.key, from = %self.state, to = %summary.state, "cluster state transition");
        }
        self.state = summary.state;
        Ok(summary)
    }

    /// Release held resources.
    ///
    /// Platform objects are not deleted here; that is the platform's own garbage collection
    /// via owner references.
    pub fn exit(self) {
        tracing::debug!(cluster = %self.key, "cluster state machine retired");
    }

    /// Process the current declaration for semantic changes against the previous one.
    ///
    /// Any unprocessed generation invalidates derived objects, so the workload template is
    /// re-derived whatever the change was (image, plan, acceptors). Logging or address-settings
    /// changes additionally update the previous declaration with the merged view and must roll
    /// out to pods. Re-invocations for an already-processed generation report no change.
    pub(crate) fn process_semantic_changes(&mut self) -> SemanticChanges {
        let generation = self.current.meta().generation.unwrap_or_default();
        if generation == self.last_generation {
            return SemanticChanges { declaration_changed: false, config_changed: false };
        }
        let config_changed = logging_changed(&self.previous.spec.logging, &self.current.spec.logging)
            || address_settings_changed(&self.previous.spec.address_settings, &self.current.spec.address_settings);
        if config_changed {
            self.previous.spec.logging = merge_logging(&self.previous.spec.logging, &self.current.spec.logging);
            // Address settings are replaced wholesale rather than merged.
            self.previous.spec.address_settings = self.current.spec.address_settings.clone();
        }
        self.last_generation = generation;
        SemanticChanges { declaration_changed: true, config_changed }
    }
}

/// Validate that a declaration can produce a minimally valid reconciliation record.
fn validate(cluster: &BrokerCluster) -> Result<(), ReconcileError> {
    let plan = &cluster.spec.deployment_plan;
    if plan.replicas < 0 {
        return Err(ReconcileError::InvalidDeclaration(format!("replicas must be non-negative, got {}", plan.replicas)));
    }
    if plan.image.is_empty() {
        return Err(ReconcileError::InvalidDeclaration("deployment plan image must not be empty".into()));
    }
    let mut seen = std::collections::BTreeSet::new();
    for acceptor in &cluster.spec.acceptors {
        if !seen.insert(acceptor.name.as_str()) {
            return Err(ReconcileError::InvalidDeclaration(format!("duplicate acceptor name: {}", acceptor.name)));
        }
    }
    let mut seen = std::collections::BTreeSet::new();
    for connector in &cluster.spec.connectors {
        if !seen.insert(connector.name.as_str()) {
            return Err(ReconcileError::InvalidDeclaration(format!("duplicate connector name: {}", connector.name)));
        }
    }
    Ok(())
}

/// Whether the logging configuration differs between two declarations.
fn logging_changed(previous: &LoggingSpec, current: &LoggingSpec) -> bool {
    if current.loggers.is_empty() {
        return false;
    }
    if previous.loggers.len() != current.loggers.len() {
        return true;
    }
    let by_name: std::collections::BTreeMap<&str, &LoggerSpec> = previous.loggers.iter().map(|l| (l.name.as_str(), l)).collect();
    current.loggers.iter().any(|logger| match by_name.get(logger.name.as_str()) {
        Some(old) => logger.level.is_some() && logger.level != old.level,
        None => true,
    })
}

/// Merge new loggers into the previous set, by name and field-wise.
///
/// Loggers only present in the previous view are retained; loggers only present in the new
/// view are appended; overlapping loggers take the new level when one is set.
fn merge_logging(previous: &LoggingSpec, current: &LoggingSpec) -> LoggingSpec {
    let mut merged: std::collections::BTreeMap<String, LoggerSpec> =
        previous.loggers.iter().map(|l| (l.name.clone(), l.clone())).collect();
    for logger in &current.loggers {
        let entry = merged.entry(logger.name.clone()).or_insert_with(|| logger.clone());
        if logger.level.is_some() {
            entry.level = logger.level.clone();
        }
    }
    LoggingSpec { loggers: merged.into_iter().map(|(_, l)| l).collect() }
}

/// Whether the address-settings configuration differs between two declarations.
fn address_settings_changed(previous: &AddressSettingsSpec, current: &AddressSettingsSpec) -> bool {
    if current.setting.is_empty() && current.apply_rule.is_none() {
        return false;
    }
    previous != current
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivermq_core::crd::{AddressSetting, BrokerClusterSpec, DeploymentPlan};

    fn obs(present: bool, desired: i32, observed: i32) -> Observation {
        Observation { all_objects_present: present, desired_replicas: desired, observed_replicas: observed }
    }

    fn cluster(replicas: i32) -> BrokerCluster {
        let spec = BrokerClusterSpec {
            deployment_plan: DeploymentPlan { replicas, image: "rivermq/broker:2.1".into(), ..Default::default() },
            ..Default::default()
        };
        BrokerCluster::new("mq", spec)
    }

    #[test]
    fn transition_missing_object_forces_provisioning() {
        assert_eq!(transition(&obs(false, 3, 3)), FsmState::Provisioning);
        assert_eq!(transition(&obs(false, 3, 0)), FsmState::Provisioning);
    }

    #[test]
    fn transition_replica_mismatch_is_scaling() {
        assert_eq!(transition(&obs(true, 3, 1)), FsmState::Scaling);
        assert_eq!(transition(&obs(true, 1, 3)), FsmState::Scaling);
    }

    #[test]
    fn transition_converged_is_running() {
        assert_eq!(transition(&obs(true, 3, 3)), FsmState::Running);
    }

    #[test]
    fn validate_rejects_bad_declarations() {
        let key = ClusterKey::new("default", "mq");
        assert!(ClusterFsm::new(key.clone(), cluster(-1)).is_err());

        let mut no_image = cluster(1);
        no_image.spec.deployment_plan.image.clear();
        assert!(ClusterFsm::new(key.clone(), no_image).is_err());

        let mut dup = cluster(1);
        dup.spec.acceptors = vec![
            rivermq_core::crd::AcceptorSpec { name: "amqp".into(), port: 5672, ..Default::default() },
            rivermq_core::crd::AcceptorSpec { name: "amqp".into(), port: 5673, ..Default::default() },
        ];
        assert!(ClusterFsm::new(key, dup).is_err());
    }

    #[test]
    fn update_declaration_swaps_current_into_previous() {
        let mut fsm = ClusterFsm::new(ClusterKey::new("default", "mq"), cluster(1)).unwrap();
        let next = cluster(3);
        fsm.update_declaration(next);
        assert_eq!(fsm.previous.spec.deployment_plan.replicas, 1);
        assert_eq!(fsm.current.spec.deployment_plan.replicas, 3);
    }

    #[test]
    fn semantic_changes_gated_by_generation() {
        let mut fsm = ClusterFsm::new(ClusterKey::new("default", "mq"), cluster(1)).unwrap();
        let mut next = cluster(1);
        next.metadata.generation = Some(2);
        next.spec.logging.loggers = vec![LoggerSpec { name: "org.rivermq".into(), level: Some("DEBUG".into()) }];
        fsm.update_declaration(next);

        assert!(fsm.process_semantic_changes().config_changed);
        // Same generation is not processed twice.
        assert!(!fsm.process_semantic_changes().declaration_changed);
        // The merged view is retained on the previous declaration.
        assert_eq!(fsm.previous.spec.logging.loggers.len(), 1);
        assert_eq!(fsm.previous.spec.logging.loggers[0].level.as_deref(), Some("DEBUG"));
    }

    #[test]
    fn address_settings_replaced_wholesale() {
        let mut fsm = ClusterFsm::new(ClusterKey::new("default", "mq"), cluster(1)).unwrap();
        let mut next = cluster(1);
        next.metadata.generation = Some(2);
        next.spec.address_settings = AddressSettingsSpec {
            apply_rule: Some("merge_all".into()),
            setting: vec![AddressSetting { match_: "orders.#".into(), max_delivery_attempts: Some(5), ..Default::default() }],
        };
        fsm.update_declaration(next.clone());

        assert!(fsm.process_semantic_changes().config_changed);
        assert_eq!(fsm.previous.spec.address_settings, next.spec.address_settings);
    }

    #[test]
    fn image_change_invalidates_derived_objects_without_config_roll() {
        let mut fsm = ClusterFsm::new(ClusterKey::new("default", "mq"), cluster(1)).unwrap();
        fsm.last_generation = 1;
        let mut next = cluster(1);
        next.metadata.generation = Some(2);
        next.spec.deployment_plan.image = "rivermq/broker:2.2".into();
        fsm.update_declaration(next);

        let changes = fsm.process_semantic_changes();
        assert!(changes.declaration_changed);
        assert!(!changes.config_changed);
    }

    #[test]
    fn replica_change_invalidates_derived_objects() {
        let mut fsm = ClusterFsm::new(ClusterKey::new("default", "mq"), cluster(1)).unwrap();
        fsm.last_generation = 1;
        let mut next = cluster(3);
        next.metadata.generation = Some(2);
        fsm.update_declaration(next);

        assert!(fsm.process_semantic_changes().declaration_changed);
    }

    #[test]
    fn failed_object_writes_leave_pass_not_fully_applied() {
        let summary = PassSummary::of(&obs(false, 3, 3));
        assert_eq!(summary.state, FsmState::Provisioning);
        assert!(!summary.fully_applied);
        assert!(PassSummary::of(&obs(true, 3, 3)).fully_applied);
    }

    #[test]
    fn merge_logging_keeps_disjoint_loggers() {
        let previous = LoggingSpec {
            loggers: vec![
                LoggerSpec { name: "audit".into(), level: Some("INFO".into()) },
                LoggerSpec { name: "io.netty".into(), level: Some("WARN".into()) },
            ],
        };
        let current = LoggingSpec {
            loggers: vec![
                LoggerSpec { name: "audit".into(), level: Some("DEBUG".into()) },
                LoggerSpec { name: "org.rivermq".into(), level: None },
            ],
        };
        let merged = merge_logging(&previous, &current);
        assert_eq!(merged.loggers.len(), 3);
        let audit = merged.loggers.iter().find(|l| l.name == "audit").unwrap();
        assert_eq!(audit.level.as_deref(), Some("DEBUG"));
        let netty = merged.loggers.iter().find(|l| l.name == "io.netty").unwrap();
        assert_eq!(netty.level.as_deref(), Some("WARN"));
    }
}
