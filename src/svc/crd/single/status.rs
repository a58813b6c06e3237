//! # Status module
//!
//! This module compute the externally visible status of a [`Single`] from its
//! observed dependents.

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use tracing::debug;

use crate::svc::{
    crd::single::{Exposure, ReconcilerError, Single, SingleStatus},
    k8s::{resource, store::Store},
};

/// returns the address to reach the instance, `None` while the service does
/// not have every part of it allocated
pub fn access_point(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    let port = spec.ports.as_ref()?.first()?;

    let exposure = match spec.type_.as_deref() {
        None | Some("ClusterIP") => Exposure::ClusterIp,
        Some("NodePort") => Exposure::NodePort,
        Some("LoadBalancer") => Exposure::LoadBalancer,
        Some(_) => return None,
    };

    match exposure {
        Exposure::ClusterIp => {
            let ip = spec.cluster_ip.as_deref().filter(|ip| !ip.is_empty())?;
            Some(format!("{}:{}", ip, port.port))
        }
        Exposure::NodePort => {
            let ip = spec.cluster_ip.as_deref().filter(|ip| !ip.is_empty())?;
            Some(format!("{}:{}", ip, port.node_port?))
        }
        Exposure::LoadBalancer => {
            let ingress = service
                .status
                .as_ref()?
                .load_balancer
                .as_ref()?
                .ingress
                .as_ref()?
                .first()?;

            let address = ingress
                .ip
                .as_deref()
                .filter(|ip| !ip.is_empty())
                .or_else(|| ingress.hostname.as_deref().filter(|host| !host.is_empty()))?;

            Some(format!("{}:{}", address, port.port))
        }
    }
}

/// returns the status projected from the observed service and deployment,
/// the bookkeeping fields are carried over
pub fn project(single: &Single, service: &Service, deployment: Option<&Deployment>) -> SingleStatus {
    let current = single.current_status();

    SingleStatus {
        access_point: access_point(service),
        size: single.spec.size(),
        ready: deployment
            .and_then(|deployment| deployment.status.as_ref())
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0),
        age: service
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|timestamp| timestamp.0.to_rfc3339()),
        observed_generation: current.observed_generation,
        last_applied: current.last_applied,
    }
}

/// write the projected status through the status subresource if it differs
/// from the stored one
pub async fn sync<S>(
    store: &S,
    mut single: Single,
    service: &Service,
    deployment: Option<&Deployment>,
) -> Result<Single, ReconcilerError>
where
    S: Store,
{
    let status = project(&single, service, deployment);
    if single.status.as_ref() == Some(&status) {
        return Ok(single);
    }

    let (namespace, name) = resource::namespaced_name(&single);
    debug!(
        namespace = &namespace,
        name = &name,
        access_point = status.access_point.as_deref().unwrap_or("<none>"),
        ready = status.ready,
        size = status.size,
        "Update status of custom resource"
    );

    single.status = Some(status);
    Ok(store.update_status(&single).await?)
}
