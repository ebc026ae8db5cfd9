//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use rivermq_core::crd::{BrokerCluster, BrokerDrain};

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("helm").join("crds");

    let cluster = BrokerCluster::crd();
    let cluster_yaml = serde_yaml::to_string(&cluster).context("error serializing BrokerCluster CRD to yaml")?;
    std::fs::write(crds_path.join("brokercluster.yaml"), &cluster_yaml).with_context(|| format!("error writing BrokerCluster CRD to {:?}", &crds_path))?;
    println!("BrokerCluster CRD written to {:?}", &crds_path);

    let drain = BrokerDrain::crd();
    let drain_yaml = serde_yaml::to_string(&drain).context("error serializing BrokerDrain CRD to yaml")?;
    std::fs::write(crds_path.join("brokerdrain.yaml"), &drain_yaml).with_context(|| format!("error writing BrokerDrain CRD to {:?}", &crds_path))?;
    println!("BrokerDrain CRD written to {:?}", &crds_path);

    Ok(())
}
