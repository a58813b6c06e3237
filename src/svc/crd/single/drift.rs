//! # Drift module
//!
//! This module detect drift between the specification of a [`Single`] and the
//! one pushed to its dependents by the last cycle, and converge the
//! dependents toward the current specification.

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, Service},
};
use kube::{Resource, ResourceExt};
use tracing::{debug, trace};

use crate::svc::{
    crd::single::{builder, ReconcilerError, Single, SingleSpec},
    k8s::{
        resource,
        store::{Object, Store},
    },
};

// -----------------------------------------------------------------------------
// Constants

/// annotation holding the last applied specification of records written
/// before it moved to the status
pub const LEGACY_ANNOTATION: &str = "spec";

// -----------------------------------------------------------------------------
// Drift enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Drift {
    /// nothing was applied yet
    Initial,
    Unchanged,
    Changed,
}

// -----------------------------------------------------------------------------
// Helper functions

/// returns the last applied specification, from the status or from the
/// legacy annotation
pub fn last_applied(single: &Single) -> Result<Option<SingleSpec>, ReconcilerError> {
    if let Some(spec) = single
        .status
        .as_ref()
        .and_then(|status| status.last_applied.to_owned())
    {
        return Ok(Some(spec));
    }

    match single.annotations().get(LEGACY_ANNOTATION) {
        Some(snapshot) => serde_json::from_str(snapshot)
            .map(Some)
            .map_err(ReconcilerError::Snapshot),
        None => Ok(None),
    }
}

pub fn detect(single: &Single) -> Result<Drift, ReconcilerError> {
    Ok(match last_applied(single)? {
        None => Drift::Initial,
        Some(spec) if spec == single.spec => Drift::Unchanged,
        Some(_) => Drift::Changed,
    })
}

async fn fetch<S, K>(store: &S, namespace: &str, name: &str) -> Result<K, ReconcilerError>
where
    S: Store,
    K: Object,
{
    store.get::<K>(namespace, name).await?.ok_or_else(|| {
        ReconcilerError::MissingDependent(
            K::kind(&()).to_string(),
            namespace.to_string(),
            name.to_string(),
        )
    })
}

/// replace the stored object with the desired one, if the two differ. Unless
/// the specification changed, only the fields declared by the desired object
/// are compared.
async fn converge<S, K>(store: &S, drift: Drift, stored: K, desired: K) -> Result<K, ReconcilerError>
where
    S: Store,
    K: Object,
{
    let patch = match drift {
        Drift::Changed => resource::diff(&stored, &desired),
        Drift::Initial | Drift::Unchanged => resource::declared_diff(&stored, &desired),
    }
    .map_err(ReconcilerError::Diff)?;
    if patch.0.is_empty() {
        trace!(
            kind = &*K::kind(&()),
            name = stored.name_any(),
            "Dependent resource is up to date"
        );
        return Ok(stored);
    }

    debug!(
        kind = &*K::kind(&()),
        name = desired.name_any(),
        operations = patch.0.len(),
        "Update dependent resource"
    );

    Ok(store.update(&desired).await?)
}

/// push the desired deployment, service and config map over the stored ones,
/// returns the observed deployment and service
pub async fn apply<S>(
    store: &S,
    single: &Single,
    drift: Drift,
) -> Result<(Deployment, Service), ReconcilerError>
where
    S: Store,
{
    let (namespace, name) = resource::namespaced_name(single);
    let config_name = single.config_name();

    let deployment: Deployment = fetch(store, &namespace, &name).await?;
    let service: Service = fetch(store, &namespace, &name).await?;
    let config_map: ConfigMap = fetch(store, &namespace, &config_name).await?;

    // only the mutable section is replaced, the stored identity is kept
    let mut desired = deployment.to_owned();
    desired.spec = builder::deployment(single, &config_name).spec;
    let deployment = converge(store, drift, deployment, desired).await?;

    let mut desired = service.to_owned();
    desired.spec = builder::service(single).spec;
    if let (Some(spec), Some(stored)) = (desired.spec.as_mut(), service.spec.as_ref()) {
        spec.cluster_ip = stored.cluster_ip.to_owned();
        spec.cluster_ips = stored.cluster_ips.to_owned();

        if let (Some(ports), Some(allocated)) = (spec.ports.as_mut(), stored.ports.as_ref()) {
            for port in ports.iter_mut().filter(|port| port.node_port.is_none()) {
                port.node_port = allocated
                    .iter()
                    .find(|p| p.port == port.port && p.name == port.name)
                    .and_then(|p| p.node_port);
            }
        }
    }
    let service = converge(store, drift, service, desired).await?;

    let mut desired = config_map.to_owned();
    desired.data = builder::config_map(&config_name, &namespace).data;
    converge(store, drift, config_map, desired).await?;

    Ok((deployment, service))
}

/// record the specification and generation applied by this cycle, skipped if
/// already recorded
pub async fn persist<S>(store: &S, mut single: Single) -> Result<Single, ReconcilerError>
where
    S: Store,
{
    let generation = single.meta().generation;
    let mut status = single.current_status();

    if status.last_applied.as_ref() == Some(&single.spec) && status.observed_generation == generation
    {
        return Ok(single);
    }

    status.last_applied = Some(single.spec.to_owned());
    status.observed_generation = generation;
    single.status = Some(status);

    Ok(store.update_status(&single).await?)
}
