//! # Finalizer module
//!
//! This module guarantees the dependents of a [`Single`] are removed before
//! kubernetes is allowed to purge it.

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, PersistentVolumeClaim, Service},
};
use tracing::{debug, info, warn};

use crate::svc::{
    crd::single::{Action, ReconcilerError, Single, FINALIZER},
    k8s::{finalizer, recorder, resource, store::Store},
};

/// record an event on the deletion path, the namespace may be terminating and
/// refuse new objects so a failure must not hold the finalizer
async fn notify<S>(store: &S, single: &Single, action: &Action, message: &str)
where
    S: Store,
{
    if let Err(err) = recorder::normal(store, single, action, message).await {
        let (namespace, name) = resource::namespaced_name(single);
        warn!(
            namespace = &namespace,
            name = &name,
            action = action.to_string(),
            error = err.to_string(),
            "Could not record event for custom resource"
        );
    }
}

/// register the finalizer on the record, no-op if it is already there
pub async fn add<S>(store: &S, mut single: Single) -> Result<Single, ReconcilerError>
where
    S: Store,
{
    if !finalizer::add(&mut single, FINALIZER) {
        return Ok(single);
    }

    let (namespace, name) = resource::namespaced_name(&single);
    info!(
        namespace = &namespace,
        name = &name,
        finalizer = FINALIZER,
        "Add finalizer on custom resource"
    );

    let single = store.update(&single).await?;
    let message = format!("Add finalizer '{}'", FINALIZER);
    recorder::normal(store, &single, &Action::UpsertFinalizer, &message).await?;

    Ok(single)
}

/// delete the dependents of a record that has been marked for deletion,
/// absent dependents count as deleted
pub async fn handle<S>(store: &S, single: &Single) -> Result<(), ReconcilerError>
where
    S: Store,
{
    if !resource::deleted(single) || !finalizer::contains(single, FINALIZER) {
        return Ok(());
    }

    let (namespace, name) = resource::namespaced_name(single);
    info!(
        namespace = &namespace,
        name = &name,
        "Delete dependents of custom resource"
    );

    store
        .delete::<PersistentVolumeClaim>(&namespace, &single.claim_name())
        .await?;
    store.delete::<Deployment>(&namespace, &name).await?;
    store
        .delete::<ConfigMap>(&namespace, &single.config_name())
        .await?;
    store.delete::<Service>(&namespace, &name).await?;

    debug!(
        namespace = &namespace,
        name = &name,
        "Successfully deleted dependents of custom resource"
    );

    let message = "Delete persistent volume claim, deployment, config map and service";
    notify(store, single, &Action::DeleteDependents, message).await;

    Ok(())
}

/// release the record, no-op if the finalizer is not there
pub async fn remove<S>(store: &S, mut single: Single) -> Result<Single, ReconcilerError>
where
    S: Store,
{
    if !finalizer::remove(&mut single, FINALIZER) {
        return Ok(single);
    }

    let (namespace, name) = resource::namespaced_name(&single);
    info!(
        namespace = &namespace,
        name = &name,
        finalizer = FINALIZER,
        "Remove finalizer from custom resource"
    );

    let single = store.update(&single).await?;
    let message = format!("Remove finalizer '{}'", FINALIZER);
    notify(store, &single, &Action::DeleteFinalizer, &message).await;

    Ok(single)
}
