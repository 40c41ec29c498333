// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use crate::types::{DENY_ALL_QUOTA_NAME, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use k8s_openapi::api::core::v1::{ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

const BLOCKED_RESOURCES: [&str; 9] = [
    "pods",
    "services",
    "persistentvolumeclaims",
    "services.loadbalancers",
    "services.nodeports",
    "requests.cpu",
    "requests.memory",
    "limits.cpu",
    "limits.memory",
];

const CONFIG_OBJECTS: [&str; 2] = ["secrets", "configmaps"];

/// Builds the quota that pins every hard limit of a locked namespace to zero.
pub fn make_deny_all_quota(namespace: &str, allow_config_objects: bool) -> ResourceQuota {
    let mut hard = BTreeMap::new();
    for resource in BLOCKED_RESOURCES {
        hard.insert(resource.to_string(), Quantity("0".to_string()));
    }
    if !allow_config_objects {
        for resource in CONFIG_OBJECTS {
            hard.insert(resource.to_string(), Quantity("0".to_string()));
        }
    }
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(DENY_ALL_QUOTA_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..ResourceQuotaSpec::default()
        }),
        ..ResourceQuota::default()
    }
}
