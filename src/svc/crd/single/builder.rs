//! # Builder module
//!
//! This module provide the pure functions deriving the dependent resources of
//! a [`Single`] from its specification.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            Affinity, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
            PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, ResourceRequirements,
            Service, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::LabelSelector,
        util::intstr::IntOrString,
    },
};
use kube::{api::ObjectMeta, ResourceExt};

use crate::svc::{
    crd::single::{Single, UpdateStrategy},
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Constants

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const COMPONENT: &str = "database";
pub const MANAGER: &str = "greatsql-operator";

pub const CONFIG_KEY: &str = "my.cnf";
pub const CONFIG_PATH: &str = "/etc/my.cnf";
pub const DATA_PATH: &str = "/data";
pub const DEFAULT_STORAGE: &str = "5Gi";

const CONFIG_MODE: i32 = 0o664;

const DEFAULT_CONFIG: &str = r#"[client]
socket = /data/mysql.sock

[mysqld]
user = mysql
port = 3306
server_id = 3306
datadir = /data
socket = /data/mysql.sock
pid-file = /data/mysql.pid
log-error = /data/error.log
character-set-server = utf8mb4
skip_name_resolve = 1
default-time-zone = "+8:00"
lower_case_table_names = 1
max_connections = 1024
innodb_buffer_pool_size = 1G
innodb_flush_log_at_trx_commit = 1
sync_binlog = 1
log-bin = /data/binlog
binlog_format = ROW
gtid_mode = ON
enforce_gtid_consistency = ON
"#;

// -----------------------------------------------------------------------------
// Helper functions

/// returns the labels carried by every dependent of the instance, also used as
/// selector
pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
    ])
}

fn metadata(single: &Single, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: single.namespace(),
        labels: Some(labels(&single.name_any())),
        owner_references: resource::owner_reference(single).map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn non_empty_map(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

// -----------------------------------------------------------------------------
// Deployment

/// returns the desired deployment of the instance, mounting the given config
/// map as server configuration
pub fn deployment(single: &Single, config_name: &str) -> Deployment {
    let name = single.name_any();
    let selector = labels(&name);

    let mut template_labels = selector.to_owned();
    template_labels.extend(single.spec.pod_spec.labels.to_owned());

    let pod_spec = &single.spec.pod_spec;

    Deployment {
        metadata: metadata(single, name.to_owned()),
        spec: Some(DeploymentSpec {
            replicas: Some(single.spec.size()),
            selector: LabelSelector {
                match_labels: Some(selector.to_owned()),
                ..Default::default()
            },
            strategy: Some(strategy(single.spec.update_strategy())),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    annotations: non_empty_map(pod_spec.annotations.to_owned()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container(single)],
                    affinity: affinity(single, &selector),
                    dns_policy: single.spec.dns_policy.to_owned(),
                    image_pull_secrets: non_empty(pod_spec.container.image_pull_secrets.to_owned()),
                    node_selector: non_empty_map(pod_spec.node_selector.to_owned()),
                    scheduler_name: pod_spec.scheduler_name.to_owned(),
                    security_context: pod_spec.pod_security_context.to_owned(),
                    service_account_name: pod_spec.service_account_name.to_owned(),
                    termination_grace_period_seconds: pod_spec.termination_grace_period_seconds,
                    tolerations: non_empty(pod_spec.tolerations.to_owned()),
                    volumes: Some(vec![config_volume(single, config_name), data_volume(single)]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn container(single: &Single) -> Container {
    let spec = &single.spec.pod_spec.container;

    let ports = single
        .spec
        .ports
        .iter()
        .map(|port| ContainerPort {
            name: port.name.to_owned(),
            container_port: match &port.target_port {
                Some(IntOrString::Int(target)) => *target,
                _ => port.port,
            },
            protocol: port.protocol.to_owned(),
            ..Default::default()
        })
        .collect();

    Container {
        name: single.name_any(),
        image: Some(spec.image.to_owned()),
        image_pull_policy: spec.image_pull_policy.to_owned(),
        env: non_empty(spec.envs.to_owned()),
        ports: non_empty(ports),
        resources: spec.resources.to_owned(),
        startup_probe: spec.startup_probe.to_owned(),
        readiness_probe: spec.readiness_probe.to_owned(),
        liveness_probe: spec.liveness_probe.to_owned(),
        security_context: spec.security_context.to_owned(),
        volume_mounts: Some(vec![
            VolumeMount {
                name: single.config_name(),
                mount_path: CONFIG_PATH.to_string(),
                sub_path: Some(CONFIG_KEY.to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: single.claim_name(),
                mount_path: DATA_PATH.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn config_volume(single: &Single, config_name: &str) -> Volume {
    Volume {
        name: single.config_name(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_name.to_string()),
            default_mode: Some(CONFIG_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// the volume spec override wins over the volume claim when it names a source
fn data_volume(single: &Single) -> Volume {
    let name = single.claim_name();

    if let Some(volume) = &single.spec.pod_spec.volume_spec {
        if volume.empty_dir.is_some()
            || volume.host_path.is_some()
            || volume.persistent_volume_claim.is_some()
        {
            return Volume {
                name,
                empty_dir: volume.empty_dir.to_owned(),
                host_path: volume.host_path.to_owned(),
                persistent_volume_claim: volume.persistent_volume_claim.to_owned(),
                ..Default::default()
            };
        }
    }

    Volume {
        name: name.to_owned(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: name,
            read_only: None,
        }),
        ..Default::default()
    }
}

fn affinity(single: &Single, selector: &BTreeMap<String, String>) -> Option<Affinity> {
    let affinity = single.spec.pod_spec.affinity.as_ref()?;

    if let Some(advanced) = &affinity.advanced {
        return Some(advanced.to_owned());
    }

    let topology_key = affinity.topology_key.to_owned()?;

    Some(Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(selector.to_owned()),
                    ..Default::default()
                }),
                topology_key,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn strategy(strategy: UpdateStrategy) -> DeploymentStrategy {
    match strategy {
        UpdateStrategy::RollingUpdate => DeploymentStrategy {
            type_: Some(strategy.to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::Int(1)),
                max_unavailable: Some(IntOrString::Int(1)),
            }),
        },
        UpdateStrategy::Recreate => DeploymentStrategy {
            type_: Some(strategy.to_string()),
            rolling_update: None,
        },
    }
}

// -----------------------------------------------------------------------------
// Service

/// returns the desired service exposing the instance
pub fn service(single: &Single) -> Service {
    let name = single.name_any();

    Service {
        metadata: metadata(single, name.to_owned()),
        spec: Some(ServiceSpec {
            type_: Some(single.spec.exposure().to_string()),
            ports: non_empty(single.spec.ports.to_owned()),
            selector: Some(labels(&name)),
            ..Default::default()
        }),
        status: None,
    }
}

// -----------------------------------------------------------------------------
// ConfigMap

/// returns the config map holding the default server configuration
pub fn config_map(name: &str, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            DEFAULT_CONFIG.to_string(),
        )])),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// PersistentVolumeClaim

/// returns the volume claim holding the data directory
pub fn volume_claim(single: &Single) -> PersistentVolumeClaim {
    let template = single
        .spec
        .pod_spec
        .storage
        .as_ref()
        .and_then(|storage| storage.claim_template.to_owned())
        .unwrap_or_default();

    let requests = template
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.to_owned())
        .filter(|requests| requests.contains_key("storage"))
        .unwrap_or_else(|| {
            BTreeMap::from([("storage".to_string(), Quantity(DEFAULT_STORAGE.to_string()))])
        });

    let access_modes = template
        .access_modes
        .to_owned()
        .filter(|modes| !modes.is_empty())
        .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]);

    PersistentVolumeClaim {
        metadata: metadata(single, single.claim_name()),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: template.resources.and_then(|resources| resources.limits),
            }),
            storage_class_name: template.storage_class_name,
            volume_mode: Some(template.volume_mode.unwrap_or_else(|| "Filesystem".to_string())),
            selector: template.selector,
            volume_name: template.volume_name,
            ..Default::default()
        }),
        status: None,
    }
}
