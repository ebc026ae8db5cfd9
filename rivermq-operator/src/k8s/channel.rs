//! Secret-indirected config channels.
//!
//! Broker configuration never lands in pod templates as literal values. Each category of
//! config (credentials, endpoint strings, console args) gets its own Secret, and pod templates
//! reference the keys of that Secret via env-var indirection. Changing the config rewrites the
//! channel object and bumps a roll-count annotation on the pod template, which is what makes
//! the workload controller roll the pods.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, Secret, SecretKeySelector};
use kube::api::ObjectMeta;

/// Pod-template annotation counting config-driven restarts.
pub const ROLL_COUNT_ANNOTATION: &str = "rivermq.io/roll-count";

/// Channel key for the admin username.
pub const KEY_USER: &str = "RIVERMQ_USER";
/// Channel key for the admin password.
pub const KEY_PASSWORD: &str = "RIVERMQ_PASSWORD";
/// Channel key for the internal cluster username.
pub const KEY_CLUSTER_USER: &str = "RIVERMQ_CLUSTER_USER";
/// Channel key for the internal cluster password.
pub const KEY_CLUSTER_PASSWORD: &str = "RIVERMQ_CLUSTER_PASSWORD";
/// Channel key for the generated acceptors config string.
pub const KEY_ACCEPTORS: &str = "RIVERMQ_ACCEPTORS";
/// Channel key for the generated connectors config string.
pub const KEY_CONNECTORS: &str = "RIVERMQ_CONNECTORS";
/// Channel key for the generated console args string.
pub const KEY_CONSOLE_ARGS: &str = "RIVERMQ_CONSOLE_ARGS";
/// Channel key for whether anonymous broker access is disabled.
pub const KEY_REQUIRE_LOGIN: &str = "RIVERMQ_REQUIRE_LOGIN";
/// Channel key for the rendered logger configuration.
pub const KEY_LOGGING: &str = "RIVERMQ_LOGGING";
/// Channel key for the rendered address-settings configuration.
pub const KEY_ADDRESS_SETTINGS: &str = "RIVERMQ_ADDRESS_SETTINGS";
/// Channel key for free-form broker property overrides.
pub const KEY_BROKER_PROPERTIES: &str = "RIVERMQ_BROKER_PROPERTIES";

/// The outcome of planning a channel sync.
pub enum ChannelPlan {
    /// No channel object exists yet; the carried Secret must be created.
    Create(Secret),
    /// The channel exists but at least one key differs; the carried Secret is the new content.
    Rewrite(Secret),
    /// Every key already matches; the carried Secret mirrors the deployed content.
    Unchanged(Secret),
}

impl ChannelPlan {
    /// Whether this plan represents a config change which must roll the cluster's pods.
    ///
    /// First creation is initial provisioning, not a change.
    pub fn is_config_change(&self) -> bool {
        matches!(self, ChannelPlan::Rewrite(_))
    }

    /// Consume the plan, returning the desired Secret regardless of variant.
    pub fn into_secret(self) -> Secret {
        match self {
            ChannelPlan::Create(secret) | ChannelPlan::Rewrite(secret) | ChannelPlan::Unchanged(secret) => secret,
        }
    }
}

/// Plan the sync of one config channel against its deployed object.
///
/// Comparison is per-key string equality over the desired keys. Any differing or missing key
/// causes a full rewrite of the channel object.
pub fn plan_sync(
    name: &str, namespace: &str, labels: BTreeMap<String, String>, deployed: Option<&Secret>,
    desired: &BTreeMap<String, String>,
) -> ChannelPlan {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels),
            ..Default::default()
        },
        string_data: Some(desired.clone()),
        ..Default::default()
    };
    let deployed = match deployed {
        Some(deployed) => deployed,
        None => return ChannelPlan::Create(secret),
    };
    let matches = desired
        .iter()
        .all(|(key, val)| secret_value(deployed, key).as_deref() == Some(val.as_str()));
    if matches {
        ChannelPlan::Unchanged(secret)
    } else {
        ChannelPlan::Rewrite(secret)
    }
}

/// Extract a channel value from a deployed Secret, checking both value representations.
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(val) = secret.string_data.as_ref().and_then(|data| data.get(key)) {
        return Some(val.clone());
    }
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}

/// Wire the given channel keys into every container of the pod template as env vars sourced
/// from the channel Secret.
///
/// Idempotent: an already-wired key is overwritten in place, never duplicated.
pub fn source_env_from_secret<'a>(sts: &mut StatefulSet, secret_name: &str, keys: impl Iterator<Item = &'a String>) {
    let spec = match sts.spec.as_mut().and_then(|spec| spec.template.spec.as_mut()) {
        Some(spec) => spec,
        None => return,
    };
    for key in keys {
        for container in spec.containers.iter_mut() {
            let var = EnvVar {
                name: key.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret_name.into()),
                        key: key.clone(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            };
            let env = container.env.get_or_insert_with(Vec::new);
            match env.iter_mut().find(|have| have.name == var.name) {
                Some(have) => *have = var,
                None => env.push(var),
            }
        }
    }
}

/// Increment the roll-count annotation on the workload's pod template, returning the new count.
///
/// An unparsable or absent annotation counts as zero.
pub fn increment_roll_count(sts: &mut StatefulSet) -> u64 {
    let spec = match sts.spec.as_mut() {
        Some(spec) => spec,
        None => return 0,
    };
    let meta = spec.template.metadata.get_or_insert_with(Default::default);
    let annotations = meta.annotations.get_or_insert_with(Default::default);
    let count = annotations
        .get(ROLL_COUNT_ANNOTATION)
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    annotations.insert(ROLL_COUNT_ANNOTATION.into(), count.to_string());
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::ByteString;
    use maplit::btreemap;

    fn sts_with_container() -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container { name: "broker".into(), ..Default::default() }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn plan_sync_creates_when_absent() {
        let desired = btreemap! {KEY_USER.to_string() => "admin".to_string()};
        let plan = plan_sync("mq-credentials", "default", Default::default(), None, &desired);
        assert!(matches!(plan, ChannelPlan::Create(_)));
        assert!(!plan.is_config_change());
    }

    #[test]
    fn plan_sync_unchanged_when_all_keys_match() {
        let desired = btreemap! {KEY_USER.to_string() => "admin".to_string()};
        let deployed = Secret {
            data: Some(btreemap! {KEY_USER.to_string() => ByteString(b"admin".to_vec())}),
            ..Default::default()
        };
        let plan = plan_sync("mq-credentials", "default", Default::default(), Some(&deployed), &desired);
        assert!(matches!(plan, ChannelPlan::Unchanged(_)));
    }

    #[test]
    fn plan_sync_rewrites_on_any_key_difference() {
        let desired = btreemap! {
            KEY_USER.to_string() => "admin".to_string(),
            KEY_PASSWORD.to_string() => "s3cret".to_string(),
        };
        let deployed = Secret {
            data: Some(btreemap! {KEY_USER.to_string() => ByteString(b"admin".to_vec())}),
            ..Default::default()
        };
        let plan = plan_sync("mq-credentials", "default", Default::default(), Some(&deployed), &desired);
        assert!(plan.is_config_change());
        let secret = plan.into_secret();
        assert_eq!(secret.string_data.unwrap().len(), 2);
    }

    #[test]
    fn env_indirection_is_idempotent() {
        let mut sts = sts_with_container();
        let keys = vec![KEY_USER.to_string(), KEY_PASSWORD.to_string()];
        source_env_from_secret(&mut sts, "mq-credentials", keys.iter());
        source_env_from_secret(&mut sts, "mq-credentials", keys.iter());

        let env = sts.spec.unwrap().template.spec.unwrap().containers[0].env.clone().unwrap();
        assert_eq!(env.len(), 2);
        let user = env.iter().find(|var| var.name == KEY_USER).unwrap();
        let source = user.value_from.clone().unwrap().secret_key_ref.unwrap();
        assert_eq!(source.name.as_deref(), Some("mq-credentials"));
        assert_eq!(source.key, KEY_USER);
    }

    #[test]
    fn roll_count_increments_from_any_starting_point() {
        let mut sts = sts_with_container();
        assert_eq!(increment_roll_count(&mut sts), 1);
        assert_eq!(increment_roll_count(&mut sts), 2);

        // Garbage values are treated as zero.
        sts.spec
            .as_mut()
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations
            .as_mut()
            .unwrap()
            .insert(ROLL_COUNT_ANNOTATION.into(), "bogus".into());
        assert_eq!(increment_roll_count(&mut sts), 1);
    }
}
