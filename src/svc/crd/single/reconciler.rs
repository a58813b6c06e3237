//! # Reconciler module
//!
//! This module provide the reconciliation loop of the [`Single`] custom
//! resource

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{
    runtime::{watcher, Controller},
    Api,
};
use tracing::{debug, info, warn};

use crate::svc::{
    crd::single::{
        builder,
        drift::{self, Drift},
        finalizer, status, validate, Action, Single,
    },
    k8s::{
        self, recorder, resource,
        store::{self, Object, Store},
        Context, ControllerBuilder,
    },
};

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on the object store, {0}")]
    Store(store::Error),
    #[error("failed to validate specification, {0}")]
    Validation(validate::Error),
    #[error("dependent resource '{0}' '{1}/{2}' is missing")]
    MissingDependent(String, String, String),
    #[error("failed to decode the last applied specification, {0}")]
    Snapshot(serde_json::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
}

impl From<store::Error> for ReconcilerError {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

impl From<validate::Error> for ReconcilerError {
    fn from(err: validate::Error) -> Self {
        Self::Validation(err)
    }
}

impl ReconcilerError {
    /// returns if retrying with the same specification cannot succeed
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Snapshot(_) => true,
            Self::Store(err) => !err.is_retryable(),
            _ => false,
        }
    }
}

// -----------------------------------------------------------------------------
// Helper functions

/// create the dependent resource, an already existing one is adopted as is
async fn create<S, K>(store: &S, obj: &K) -> Result<K, ReconcilerError>
where
    S: Store,
    K: Object,
{
    let (namespace, name) = resource::namespaced_name(obj);

    match store.create(obj).await {
        Ok(created) => {
            debug!(
                kind = &*K::kind(&()),
                namespace = &namespace,
                name = &name,
                "Created dependent resource"
            );

            Ok(created)
        }
        Err(store::Error::AlreadyExists(kind, namespace, name)) => {
            debug!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                "Dependent resource already exists, adopt it"
            );

            store
                .get::<K>(&namespace, &name)
                .await?
                .ok_or(ReconcilerError::MissingDependent(kind, namespace, name))
        }
        Err(err) => Err(err.into()),
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default)]
pub struct Reconciler {}

impl ControllerBuilder<Single> for Reconciler {
    fn build(&self, ctx: Arc<Context>) -> Controller<Single> {
        let client = ctx.kube.to_owned();

        Controller::new(Api::<Single>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Deployment>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Service>::all(client), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<Single> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert<S>(store: &S, origin: Single) -> Result<(), ReconcilerError>
    where
        S: Store,
    {
        let (namespace, name) = resource::namespaced_name(&origin);

        // ---------------------------------------------------------------------
        // Step 1: validate the specification

        if let Err(err) = validate::validate(&origin.spec) {
            warn!(
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Reject specification of custom resource"
            );

            let message = err.to_string();
            if let Err(event_err) =
                recorder::warning(store, &origin, &Action::RejectSpec, &message).await
            {
                warn!(
                    namespace = &namespace,
                    name = &name,
                    error = event_err.to_string(),
                    "Could not record rejection of custom resource"
                );
            }

            return Err(err.into());
        }

        // ---------------------------------------------------------------------
        // Step 2: set finalizer

        let mut single = finalizer::add(store, origin).await?;

        // ---------------------------------------------------------------------
        // Step 3: create dependents if the deployment does not exist

        if store.get::<Deployment>(&namespace, &name).await?.is_none() {
            info!(
                namespace = &namespace,
                name = &name,
                "Create dependents of custom resource"
            );

            let owner = resource::owner_reference(&single).ok_or_else(|| {
                ReconcilerError::Reconcile(format!(
                    "custom resource '{}/{}' has no identifier",
                    namespace, name
                ))
            })?;

            let mut config_map = builder::config_map(&single.config_name(), &namespace);
            config_map.metadata.labels = Some(builder::labels(&name));
            config_map.metadata.owner_references = Some(vec![owner]);

            create(store, &config_map).await?;
            create(store, &builder::volume_claim(&single)).await?;
            let deployment =
                create(store, &builder::deployment(&single, &single.config_name())).await?;
            let service = create(store, &builder::service(&single)).await?;

            let message = "Create config map, persistent volume claim, deployment and service";
            recorder::normal(store, &single, &Action::CreateDependents, message).await?;

            single = status::sync(store, single, &service, Some(&deployment)).await?;
        }

        // ---------------------------------------------------------------------
        // Step 4: converge dependents toward the specification

        let drift = drift::detect(&single)?;
        let (deployment, service) = drift::apply(store, &single, drift).await?;

        if drift == Drift::Changed {
            info!(
                namespace = &namespace,
                name = &name,
                "Specification changed, dependents have been updated"
            );

            let message = "Update deployment, service and config map";
            recorder::normal(store, &single, &Action::UpdateDependents, message).await?;
        }

        let single = drift::persist(store, single).await?;

        // ---------------------------------------------------------------------
        // Step 5: project status

        status::sync(store, single, &service, Some(&deployment)).await?;

        Ok(())
    }

    async fn delete<S>(store: &S, origin: Single) -> Result<(), ReconcilerError>
    where
        S: Store,
    {
        // ---------------------------------------------------------------------
        // Step 1: delete dependents

        finalizer::handle(store, &origin).await?;

        // ---------------------------------------------------------------------
        // Step 2: remove the finalizer

        finalizer::remove(store, origin).await?;

        Ok(())
    }

    fn permanent(err: &ReconcilerError) -> bool {
        err.is_permanent()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ConfigMap, Event, PersistentVolumeClaim};
    use kube::{runtime::controller::Action as Requeue, Resource, ResourceExt};

    use super::*;
    use crate::svc::{
        crd::single::{
            tests::{self, NAME, NAMESPACE},
            FINALIZER,
        },
        cfg::{Configuration, Operator},
        k8s::{
            finalizer as token,
            store::memory::{MemoryStore, Verb},
        },
    };

    async fn process(store: &MemoryStore) -> Result<(), ReconcilerError> {
        <Reconciler as k8s::Reconciler<Single>>::process(store, NAMESPACE, NAME).await
    }

    fn reasons(store: &MemoryStore) -> Vec<String> {
        store
            .list::<Event>(NAMESPACE)
            .into_iter()
            .filter_map(|event| event.reason)
            .collect()
    }

    fn stored(store: &MemoryStore) -> Option<Single> {
        store.fetch(NAMESPACE, NAME)
    }

    #[tokio::test]
    async fn missing_record_is_already_reconciled() {
        let store = MemoryStore::default();

        process(&store).await.unwrap();
        assert!(store.list::<Deployment>(NAMESPACE).is_empty());
    }

    #[tokio::test]
    async fn creation_creates_every_dependent() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));

        process(&store).await.unwrap();

        let single = stored(&store).unwrap();
        assert!(token::contains(&single, FINALIZER));
        assert!(store.fetch::<Deployment>(NAMESPACE, NAME).is_some());
        assert!(store.fetch::<Service>(NAMESPACE, NAME).is_some());
        assert!(store
            .fetch::<PersistentVolumeClaim>(NAMESPACE, &single.claim_name())
            .is_some());

        let config_map: ConfigMap = store.fetch(NAMESPACE, &single.config_name()).unwrap();
        assert_eq!(
            config_map.owner_references()[0].uid,
            single.uid().unwrap()
        );

        let status = single.current_status();
        assert_eq!(status.size, 1);
        assert_eq!(status.last_applied, Some(single.spec.to_owned()));
        assert_eq!(status.observed_generation, single.meta().generation);

        let reasons = reasons(&store);
        assert!(reasons.contains(&Action::UpsertFinalizer.to_string()));
        assert!(reasons.contains(&Action::CreateDependents.to_string()));
    }

    #[tokio::test]
    async fn second_cycle_is_idempotent() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));

        process(&store).await.unwrap();
        let status_writes = store.calls::<Single>(Verb::UpdateStatus);
        let record_writes = store.calls::<Single>(Verb::Update);

        process(&store).await.unwrap();

        assert_eq!(store.calls::<Deployment>(Verb::Create), 1);
        assert_eq!(store.calls::<Service>(Verb::Create), 1);
        assert_eq!(store.calls::<ConfigMap>(Verb::Create), 1);
        assert_eq!(store.calls::<PersistentVolumeClaim>(Verb::Create), 1);
        assert_eq!(store.calls::<Deployment>(Verb::Update), 0);
        assert_eq!(store.calls::<Service>(Verb::Update), 0);
        assert_eq!(store.calls::<ConfigMap>(Verb::Update), 0);
        assert_eq!(store.calls::<Single>(Verb::UpdateStatus), status_writes);
        assert_eq!(store.calls::<Single>(Verb::Update), record_writes);
        assert_eq!(store.list::<Deployment>(NAMESPACE).len(), 1);
    }

    #[tokio::test]
    async fn invalid_specification_creates_nothing() {
        let store = MemoryStore::default();
        let mut spec = tests::spec();
        spec.size = Some(0);
        store.seed(tests::single(spec));

        let err = process(&store).await.unwrap_err();

        assert!(matches!(err, ReconcilerError::Validation(_)));
        assert!(err.is_permanent());
        assert_eq!(store.calls::<ConfigMap>(Verb::Create), 0);
        assert_eq!(store.calls::<Deployment>(Verb::Create), 0);
        assert!(!token::contains(&stored(&store).unwrap(), FINALIZER));
        assert_eq!(reasons(&store), vec![Action::RejectSpec.to_string()]);
    }

    #[tokio::test]
    async fn specification_change_converges_replicas() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        process(&store).await.unwrap();

        let mut single = stored(&store).unwrap();
        single.spec.size = Some(3);
        store.update(&single).await.unwrap();

        process(&store).await.unwrap();

        let deployment: Deployment = store.fetch(NAMESPACE, NAME).unwrap();
        assert_eq!(deployment.spec.and_then(|spec| spec.replicas), Some(3));

        let single = stored(&store).unwrap();
        let status = single.current_status();
        assert_eq!(status.size, 3);
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.last_applied.and_then(|spec| spec.size), Some(3));
        assert!(reasons(&store).contains(&Action::UpdateDependents.to_string()));
    }

    #[tokio::test]
    async fn deletion_purges_the_record_after_cleanup() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        process(&store).await.unwrap();

        store.delete::<Single>(NAMESPACE, NAME).await.unwrap();
        assert!(stored(&store).is_some());

        process(&store).await.unwrap();

        assert!(stored(&store).is_none());
        assert!(store.list::<Deployment>(NAMESPACE).is_empty());
        assert!(store.list::<Service>(NAMESPACE).is_empty());
        assert!(store.list::<ConfigMap>(NAMESPACE).is_empty());
        assert!(store.list::<PersistentVolumeClaim>(NAMESPACE).is_empty());
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_the_finalizer() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        process(&store).await.unwrap();

        store.delete::<Single>(NAMESPACE, NAME).await.unwrap();
        store.fail::<ConfigMap>(Verb::Delete);

        let err = process(&store).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(token::contains(&stored(&store).unwrap(), FINALIZER));

        process(&store).await.unwrap();
        assert!(stored(&store).is_none());
    }

    #[tokio::test]
    async fn missing_dependent_is_not_recreated() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        process(&store).await.unwrap();

        store.delete::<Service>(NAMESPACE, NAME).await.unwrap();

        let err = process(&store).await.unwrap_err();
        assert!(matches!(err, ReconcilerError::MissingDependent(..)));
        assert!(store.fetch::<Service>(NAMESPACE, NAME).is_none());
        assert_eq!(store.calls::<Service>(Verb::Create), 1);
    }

    #[tokio::test]
    async fn interrupted_creation_converges() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        store.fail::<Deployment>(Verb::Create);

        assert!(process(&store).await.is_err());
        assert_eq!(store.list::<ConfigMap>(NAMESPACE).len(), 1);
        assert!(store.list::<Service>(NAMESPACE).is_empty());
        assert!(token::contains(&stored(&store).unwrap(), FINALIZER));

        process(&store).await.unwrap();

        assert_eq!(store.calls::<ConfigMap>(Verb::Create), 2);
        assert_eq!(store.list::<ConfigMap>(NAMESPACE).len(), 1);
        assert!(store.fetch::<Deployment>(NAMESPACE, NAME).is_some());
        assert!(store.fetch::<Service>(NAMESPACE, NAME).is_some());
    }

    #[tokio::test]
    async fn unavailable_store_is_retryable() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        store.fail::<Single>(Verb::Get);

        let err = process(&store).await.unwrap_err();
        assert!(matches!(err, ReconcilerError::Store(store::Error::Kube(_))));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn rejection_stays_permanent_when_events_are_refused() {
        let store = MemoryStore::default();
        let mut spec = tests::spec();
        spec.size = Some(0);
        store.seed(tests::single(spec));
        store.fail::<Event>(Verb::Create);

        let err = process(&store).await.unwrap_err();

        assert!(matches!(err, ReconcilerError::Validation(_)));
        assert!(err.is_permanent());
        assert_eq!(store.calls::<Event>(Verb::Create), 1);
        assert_eq!(store.calls::<Deployment>(Verb::Create), 0);
    }

    #[tokio::test]
    async fn deletion_completes_in_a_terminating_namespace() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        process(&store).await.unwrap();

        store.delete::<Single>(NAMESPACE, NAME).await.unwrap();
        store.fail::<Event>(Verb::Create);
        store.fail::<Event>(Verb::Create);

        process(&store).await.unwrap();

        assert!(stored(&store).is_none());
        assert!(store.list::<Deployment>(NAMESPACE).is_empty());
        assert!(store.list::<PersistentVolumeClaim>(NAMESPACE).is_empty());
    }

    #[tokio::test]
    async fn server_defaults_do_not_trigger_updates() {
        let store = MemoryStore::default();
        store.seed(tests::single(tests::spec()));
        process(&store).await.unwrap();

        for _ in 0..3 {
            let mut deployment: Deployment = store.fetch(NAMESPACE, NAME).unwrap();
            if let Some(spec) = deployment.spec.as_mut() {
                spec.revision_history_limit = Some(10);
                spec.progress_deadline_seconds = Some(600);
            }
            store.seed(deployment);

            let mut service: Service = store.fetch(NAMESPACE, NAME).unwrap();
            if let Some(spec) = service.spec.as_mut() {
                spec.session_affinity = Some("None".to_string());
                spec.cluster_ip = Some("10.0.0.5".to_string());
            }
            store.seed(service);

            process(&store).await.unwrap();
        }

        assert_eq!(store.calls::<Deployment>(Verb::Update), 0);
        assert_eq!(store.calls::<Service>(Verb::Update), 0);
    }

    #[tokio::test]
    async fn permanent_errors_wait_for_a_change() {
        let config = Configuration {
            operator: Operator {
                listen: "127.0.0.1:8000".parse().unwrap(),
                timeout: 30,
                retry: 250,
            },
            jaeger: None,
        };
        let kube = kube::Client::try_from(kube::Config::new(
            "http://127.0.0.1:6443".parse().unwrap(),
        ))
        .unwrap();
        let ctx = Arc::new(Context::new(kube, Arc::new(config)));
        let single = Arc::new(tests::single(tests::spec()));

        let rejected = ReconcilerError::Validation(validate::Error::MissingSize);
        assert_eq!(
            <Reconciler as k8s::Reconciler<Single>>::retry(single.to_owned(), &rejected, ctx.to_owned()),
            Requeue::await_change()
        );

        let unavailable = ReconcilerError::MissingDependent(
            "Service".to_string(),
            NAMESPACE.to_string(),
            NAME.to_string(),
        );
        assert_eq!(
            <Reconciler as k8s::Reconciler<Single>>::retry(single, &unavailable, ctx),
            Requeue::requeue(std::time::Duration::from_millis(250))
        );
    }
}
