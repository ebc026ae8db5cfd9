//! BrokerCluster CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type BrokerCluster = BrokerClusterCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the BrokerCluster resource.
///
/// A BrokerCluster declares the desired shape of one clustered broker deployment: how many
/// members, which image, which network endpoints to open, and how the console is exposed.
/// The operator owns everything derived from this document; users own the document itself.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "BrokerClusterCRD",
    status = "BrokerClusterStatus",
    group = "rivermq.io",
    version = "v1beta1",
    kind = "BrokerCluster",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "bkc",
    printcolumn = r#"{"name":"Replicas","type":"number","jsonPath":".spec.deploymentPlan.replicas"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.deploymentPlan.image"}"#,
    printcolumn = r#"{"name":"Persistence","type":"boolean","jsonPath":".spec.deploymentPlan.persistenceEnabled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerClusterSpec {
    /// The deployment plan for the cluster's backing StatefulSet.
    pub deployment_plan: DeploymentPlan,

    /// The admin username for the broker.
    ///
    /// When unset, the operator preserves any previously generated value, falling back to a
    /// random default. Changing this value rotates the credentials channel and triggers a
    /// rolling restart of the cluster.
    #[serde(default)]
    pub admin_user: Option<String>,
    /// The admin password for the broker. Same defaulting and rotation semantics as `admin_user`.
    #[serde(default)]
    pub admin_password: Option<String>,

    /// Network acceptors to open on each cluster member.
    #[serde(default)]
    pub acceptors: Vec<AcceptorSpec>,
    /// Network connectors used to reach other members or external brokers.
    #[serde(default)]
    pub connectors: Vec<ConnectorSpec>,
    /// Management console exposure configuration.
    #[serde(default)]
    pub console: ConsoleSpec,

    /// Address settings applied to the broker's addresses.
    #[serde(default)]
    pub address_settings: AddressSettingsSpec,
    /// Broker logging configuration.
    #[serde(default)]
    pub logging: LoggingSpec,

    /// Free-form broker property overrides, passed through to the broker verbatim.
    #[serde(default)]
    pub broker_properties: Vec<String>,

    /// Force an exact broker version. Informational only; the image field controls deployment.
    #[serde(default)]
    pub version: Option<String>,
}

/// The deployment plan of a BrokerCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPlan {
    /// The number of cluster members to deploy.
    ///
    /// Scaling down with `message_migration` enabled will drain the departing members'
    /// messages onto the survivors before their pods are retired.
    pub replicas: i32,
    /// The container image to deploy for each member.
    pub image: String,
    /// Whether journal data is persisted to a volume claim.
    #[serde(default)]
    pub persistence_enabled: bool,
    /// Whether anonymous access to the broker is disabled.
    #[serde(default)]
    pub require_login: bool,
    /// Whether messages are migrated off of members removed during a scale down.
    ///
    /// Unset is treated as enabled.
    #[serde(default)]
    pub message_migration: Option<bool>,
    /// Storage configuration for the member volume claims, used when persistence is enabled.
    #[serde(default)]
    pub storage: Option<StorageSpec>,
}

/// Volume claim configuration for persistent members.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// The volume size to request, e.g. `2Gi`.
    pub size: String,
    /// The access modes to use for the claims.
    #[serde(default)]
    pub access_modes: Option<Vec<String>>,
    /// The storage class to use for the claims.
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// A network acceptor opened on every cluster member.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceptorSpec {
    /// The acceptor name. Must be unique within the cluster.
    pub name: String,
    /// The port the acceptor listens on.
    pub port: i32,
    /// Comma-separated protocols to enable, e.g. `AMQP,CORE`. Unset enables all.
    #[serde(default)]
    pub protocols: Option<String>,
    /// Whether TLS is enabled on this acceptor.
    #[serde(default)]
    pub ssl_enabled: bool,
    /// The secret holding the TLS keystore material for this acceptor.
    #[serde(default)]
    pub ssl_secret: Option<String>,
    /// Whether clients must present a certificate.
    #[serde(default)]
    pub needs_client_auth: bool,
    /// Whether the acceptor should verify the client hostname.
    #[serde(default)]
    pub verify_host: bool,
    /// Whether an ingress is created to expose this acceptor outside the cluster.
    #[serde(default)]
    pub expose: bool,
    /// Prefix applied to anycast destination names on this acceptor.
    #[serde(default)]
    pub anycast_prefix: Option<String>,
    /// Prefix applied to multicast destination names on this acceptor.
    #[serde(default)]
    pub multicast_prefix: Option<String>,
}

/// A connector describing how to reach a broker endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorSpec {
    /// The connector name. Must be unique within the cluster.
    pub name: String,
    /// The host the connector targets.
    pub host: String,
    /// The port the connector targets.
    pub port: i32,
    /// Whether TLS is enabled on this connector.
    #[serde(default)]
    pub ssl_enabled: bool,
    /// The secret holding the TLS truststore material for this connector.
    #[serde(default)]
    pub ssl_secret: Option<String>,
    /// Whether an ingress is created to expose this connector outside the cluster.
    #[serde(default)]
    pub expose: bool,
}

/// Management console exposure configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleSpec {
    /// Whether an ingress is created for the console.
    #[serde(default)]
    pub expose: bool,
    /// Whether TLS is enabled on the console.
    #[serde(default)]
    pub ssl_enabled: bool,
    /// The secret holding the console TLS material.
    #[serde(default)]
    pub ssl_secret: Option<String>,
    /// Whether console clients must present a certificate.
    #[serde(default)]
    pub use_client_auth: bool,
}

/// Address settings for the broker, applied per matching address.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressSettingsSpec {
    /// How the broker merges these settings with its defaults, e.g. `merge_all`.
    #[serde(default)]
    pub apply_rule: Option<String>,
    /// The per-address settings entries.
    #[serde(default)]
    pub setting: Vec<AddressSetting>,
}

/// A single address-settings entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressSetting {
    /// The address match pattern this entry applies to.
    #[serde(rename = "match")]
    pub match_: String,
    /// The address messages are routed to when they are dead-lettered.
    #[serde(default)]
    pub dead_letter_address: Option<String>,
    /// The address messages are routed to when they expire.
    #[serde(default)]
    pub expiry_address: Option<String>,
    /// Maximum number of delivery attempts before dead-lettering.
    #[serde(default)]
    pub max_delivery_attempts: Option<i32>,
    /// Maximum memory for the matching addresses, in bytes.
    #[serde(default)]
    pub max_size_bytes: Option<String>,
    /// What happens when `max_size_bytes` is reached, e.g. `PAGE` or `BLOCK`.
    #[serde(default)]
    pub address_full_policy: Option<String>,
}

/// Broker logging configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSpec {
    /// Named loggers and their levels.
    #[serde(default)]
    pub loggers: Vec<LoggerSpec>,
}

/// A single named logger.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggerSpec {
    /// The logger name.
    pub name: String,
    /// The log level for this logger. Unset inherits from the parent logger.
    #[serde(default)]
    pub level: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BrokerClusterStatus {
    /// Summary of member pod readiness.
    #[serde(default)]
    pub pods: PodStatusSummary,
    /// Human-readable conditions describing convergence progress.
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

/// Names of member pods partitioned by observed readiness.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusSummary {
    /// Pods which are running and passing readiness checks.
    #[serde(default)]
    pub ready: Vec<String>,
    /// Pods which are scheduled but not yet ready.
    #[serde(default)]
    pub starting: Vec<String>,
    /// Pods which are not running.
    #[serde(default)]
    pub stopped: Vec<String>,
}

/// A single status condition on the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// The condition type, e.g. `Deployed` or `Valid`.
    #[serde(rename = "type")]
    pub type_: String,
    /// The condition status: `True`, `False` or `Unknown`.
    pub status: String,
    /// A machine-readable reason for the condition's last transition.
    #[serde(default)]
    pub reason: Option<String>,
    /// A human-readable message describing the condition.
    #[serde(default)]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the condition's last transition.
    #[serde(default)]
    pub last_transition_time: Option<String>,
}
