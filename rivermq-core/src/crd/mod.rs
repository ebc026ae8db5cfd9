//! RiverMQ CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod broker_cluster;
mod drain;

use kube::Resource;

pub use broker_cluster::{
    AcceptorSpec, AddressSetting, AddressSettingsSpec, BrokerCluster, BrokerClusterSpec, BrokerClusterStatus, ConnectorSpec, ConsoleSpec,
    DeploymentPlan, LoggerSpec, LoggingSpec, PodStatusSummary, StatusCondition, StorageSpec,
};
pub use drain::{BrokerDrain, BrokerDrainSpec, BrokerDrainStatus};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for BrokerCluster {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for BrokerDrain {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
