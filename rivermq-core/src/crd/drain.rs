//! BrokerDrain CRD.
//!
//! A BrokerDrain declares that scale downs of a cluster's StatefulSet must drain the departing
//! members' messages before their pods are retired. The cluster controller creates and deletes
//! these objects itself as the `messageMigration` flag of a BrokerCluster changes; users rarely
//! author them directly.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type BrokerDrain = BrokerDrainCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the BrokerDrain resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "BrokerDrainCRD",
    status = "BrokerDrainStatus",
    group = "rivermq.io",
    version = "v1beta1",
    kind = "BrokerDrain",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "bkd",
    printcolumn = r#"{"name":"LocalOnly","type":"boolean","jsonPath":".spec.localOnly"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerDrainSpec {
    /// Restrict the drain coordinator to the drain object's own namespace.
    ///
    /// When false, a single coordinator instance watches StatefulSets across all namespaces.
    #[serde(default)]
    pub local_only: bool,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct BrokerDrainStatus {}
