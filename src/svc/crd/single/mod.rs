//! # Single instance
//!
//! This module provide the single instance greatsql custom resource, its
//! definition, the builders of its dependent resources and its reconciliation
//! loop.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use k8s_openapi::api::core::v1::{
    Affinity, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, LocalObjectReference,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext, Probe,
    ResourceRequirements, SecurityContext, ServicePort, Toleration,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod builder;
pub mod drift;
pub mod finalizer;
pub mod reconciler;
pub mod status;
pub mod validate;

pub use reconciler::{Reconciler, ReconcilerError};

// -----------------------------------------------------------------------------
// Constants

pub const FINALIZER: &str = "finalizer.greatsql.cn";
pub const DEFAULT_SIZE: i32 = 1;

// -----------------------------------------------------------------------------
// Kind enumeration

/// topology of the greatsql deployment, only [`Kind::Single`] is managed
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Kind {
    #[default]
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "replicaofCluster")]
    ReplicaofCluster,
    #[serde(rename = "singlePrimaryGroupCluster")]
    SinglePrimaryGroupCluster,
    #[serde(rename = "multiPrimaryGroupCluster")]
    MultiPrimaryGroupCluster,
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::ReplicaofCluster => write!(f, "replicaofCluster"),
            Self::SinglePrimaryGroupCluster => write!(f, "singlePrimaryGroupCluster"),
            Self::MultiPrimaryGroupCluster => write!(f, "multiPrimaryGroupCluster"),
        }
    }
}

// -----------------------------------------------------------------------------
// Role enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Role {
    #[default]
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "primary")]
    Primary,
    #[serde(rename = "secondary", alias = "sencondary")]
    Secondary,
    #[serde(rename = "replicaof")]
    Replicaof,
}

// -----------------------------------------------------------------------------
// Exposure enumeration

/// type of the service exposing the instance
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Exposure {
    #[default]
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    #[serde(rename = "NodePort")]
    NodePort,
    #[serde(rename = "LoadBalancer")]
    LoadBalancer,
}

impl Display for Exposure {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ClusterIp => write!(f, "ClusterIP"),
            Self::NodePort => write!(f, "NodePort"),
            Self::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

// -----------------------------------------------------------------------------
// UpdateStrategy enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum UpdateStrategy {
    #[default]
    #[serde(rename = "RollingUpdate")]
    RollingUpdate,
    #[serde(rename = "Recreate")]
    Recreate,
}

impl Display for UpdateStrategy {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::RollingUpdate => write!(f, "RollingUpdate"),
            Self::Recreate => write!(f, "Recreate"),
        }
    }
}

// -----------------------------------------------------------------------------
// PodAffinity structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PodAffinity {
    #[serde(rename = "antiAffinityTopologyKey", default, skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,
    #[serde(rename = "advanced", default, skip_serializing_if = "Option::is_none")]
    pub advanced: Option<Affinity>,
}

// -----------------------------------------------------------------------------
// VolumeSpec structure

/// overrides the volume holding the data directory
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct VolumeSpec {
    #[serde(rename = "emptyDir", default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(rename = "hostPath", default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    #[serde(rename = "persistentVolumeClaim", default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
}

// -----------------------------------------------------------------------------
// Storage structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Storage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(rename = "persistentVolumeClaimTemplate", default, skip_serializing_if = "Option::is_none")]
    pub claim_template: Option<PersistentVolumeClaimSpec>,
}

// -----------------------------------------------------------------------------
// ContainerSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ContainerSpec {
    #[serde(rename = "image")]
    pub image: String,
    #[serde(rename = "imagePullPolicy", default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(rename = "imagePullSecrets", default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    #[serde(rename = "resources", default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "startupProbe", default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
    #[serde(rename = "readinessProbe", default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    #[serde(rename = "livenessProbe", default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(rename = "securityContext", default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    #[serde(rename = "envs", default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvVar>,
}

// -----------------------------------------------------------------------------
// PodSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PodSpec {
    #[serde(rename = "affinity", default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<PodAffinity>,
    #[serde(rename = "annotation", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "nodeSelector", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(rename = "volumeSpec", default, skip_serializing_if = "Option::is_none")]
    pub volume_spec: Option<VolumeSpec>,
    #[serde(rename = "tolerations", default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(rename = "terminationGracePeriodSeconds", default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    #[serde(rename = "schedulerName", default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    #[serde(rename = "podSecurityContext", default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,
    #[serde(rename = "serviceAccountName", default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(rename = "version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub container: ContainerSpec,
    #[serde(rename = "storage", default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
}

// -----------------------------------------------------------------------------
// UpgradeOptions structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct UpgradeOptions {
    #[serde(rename = "versionServiceEndpoint", default, skip_serializing_if = "Option::is_none")]
    pub version_service_endpoint: Option<String>,
    #[serde(rename = "apply", default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<String>,
}

// -----------------------------------------------------------------------------
// SingleSpec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[kube(group = "greatsql.greatsql.cn")]
#[kube(version = "v1")]
#[kube(kind = "Single")]
#[kube(singular = "single")]
#[kube(plural = "singles")]
#[kube(shortname = "gs")]
#[kube(status = "SingleStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"access point", "type":"string", "description":"Address to reach the instance", "jsonPath":".status.accessPoint"}"#
)]
#[kube(
    printcolumn = r#"{"name":"size", "type":"integer", "description":"Desired replicas", "jsonPath":".status.size"}"#
)]
#[kube(
    printcolumn = r#"{"name":"ready", "type":"integer", "description":"Ready replicas", "jsonPath":".status.ready"}"#
)]
#[kube(
    printcolumn = r#"{"name":"age", "type":"date", "description":"Age", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct SingleSpec {
    #[serde(rename = "greatSqlType", default)]
    pub kind: Kind,
    #[serde(rename = "role", default)]
    pub role: Role,
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    #[serde(rename = "podSpec", default)]
    pub pod_spec: PodSpec,
    #[serde(rename = "ports", default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<Exposure>,
    #[serde(rename = "dnsPolicy", default, skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,
    #[serde(rename = "upgradeOptions", default, skip_serializing_if = "Option::is_none")]
    pub upgrade_options: Option<UpgradeOptions>,
    #[serde(rename = "updateStrategy", default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

impl SingleSpec {
    /// returns the desired number of replicas
    pub fn size(&self) -> i32 {
        self.size.unwrap_or(DEFAULT_SIZE)
    }

    pub fn exposure(&self) -> Exposure {
        self.exposure.unwrap_or_default()
    }

    pub fn update_strategy(&self) -> UpdateStrategy {
        self.update_strategy.unwrap_or_default()
    }
}

// -----------------------------------------------------------------------------
// SingleStatus structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct SingleStatus {
    #[serde(rename = "accessPoint", default, skip_serializing_if = "Option::is_none")]
    pub access_point: Option<String>,
    #[serde(rename = "size", default)]
    pub size: i32,
    #[serde(rename = "ready", default)]
    pub ready: i32,
    #[serde(rename = "age", default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(rename = "observedGeneration", default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// specification pushed to the dependent resources by the last cycle
    #[serde(rename = "lastApplied", default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<SingleSpec>,
}

// -----------------------------------------------------------------------------
// Single implementation

impl Single {
    /// returns the name of the config map holding the server configuration
    pub fn config_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    /// returns the name of the persistent volume claim holding the data
    pub fn claim_name(&self) -> String {
        format!("{}-db", self.name_any())
    }

    /// returns the stored status, or the default one if none was written yet
    pub fn current_status(&self) -> SingleStatus {
        self.status.to_owned().unwrap_or_default()
    }
}

// -----------------------------------------------------------------------------
// Action enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    UpsertFinalizer,
    RejectSpec,
    CreateDependents,
    UpdateDependents,
    DeleteDependents,
    DeleteFinalizer,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::UpsertFinalizer => write!(f, "UpsertFinalizer"),
            Self::RejectSpec => write!(f, "RejectSpec"),
            Self::CreateDependents => write!(f, "CreateDependents"),
            Self::UpdateDependents => write!(f, "UpdateDependents"),
            Self::DeleteDependents => write!(f, "DeleteDependents"),
            Self::DeleteFinalizer => write!(f, "DeleteFinalizer"),
        }
    }
}
