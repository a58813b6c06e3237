//! # Kubernetes module
//!
//! This module provide the generic reconciliation machinery, the store
//! abstraction and helpers on kubernetes resources

use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    runtime::{
        controller::{self, Action},
        Controller,
    },
    CustomResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, trace, Instrument};

use crate::svc::{
    cfg::Configuration,
    k8s::store::{KubeStore, Object, Store},
};

pub mod client;
pub mod finalizer;
pub mod recorder;
pub mod resource;
pub mod store;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "greatsql_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'greatsql_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "greatsql_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'greatsql_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "greatsql_operator_reconciliation_event",
            "number of reconciliation event"
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'greatsql_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "greatsql_operator_reconciliation_duration",
            "duration of reconciliation"
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'greatsql_operator_reconciliation_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Context structure

/// contains the client to interact with kubernetes and the configuration
#[derive(Clone)]
pub struct Context {
    pub kube: kube::Client,
    pub config: Arc<Configuration>,
}

impl From<(kube::Client, Arc<Configuration>)> for Context {
    fn from((kube, config): (kube::Client, Arc<Configuration>)) -> Self {
        Self { kube, config }
    }
}

impl Context {
    pub fn new(kube: kube::Client, config: Arc<Configuration>) -> Self {
        Self::from((kube, config))
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Object,
{
    /// returns a new created kubernetes controller
    fn build(&self, ctx: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides the reconciliation of a custom resource, the operations go
/// through a [`Store`] so that they could be exercised without kubernetes
#[async_trait]
pub trait Reconciler<T>
where
    T: Object + CustomResourceExt,
{
    type Error: Error + From<store::Error> + Send + Sync + 'static;

    /// create or update the dependents of the object
    async fn upsert<S>(store: &S, obj: T) -> Result<(), Self::Error>
    where
        S: Store;

    /// clean up the object that has been marked for deletion
    async fn delete<S>(store: &S, obj: T) -> Result<(), Self::Error>
    where
        S: Store;

    /// returns if retrying the object with the same specification cannot
    /// succeed until it changes
    fn permanent(_err: &Self::Error) -> bool {
        false
    }

    /// returns a [`Action`] to perform following the given error
    fn retry(_obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        if Self::permanent(err) {
            debug!(
                error = err.to_string(),
                "Reconciliation cannot succeed with the current specification, wait for a change"
            );

            return Action::await_change();
        }

        let retry = ctx.config.operator.retry();

        trace!(
            duration = retry.as_millis() as u64,
            error = err.to_string(),
            "Requeue failed reconciliation"
        );

        Action::requeue(retry)
    }

    /// fetch a fresh copy of the object and route it to [`Reconciler::delete`]
    /// or [`Reconciler::upsert`], an absent object is already reconciled
    async fn process<S>(store: &S, namespace: &str, name: &str) -> Result<(), Self::Error>
    where
        S: Store,
    {
        let obj = match store.get::<T>(namespace, name).await? {
            Some(obj) => obj,
            None => {
                debug!(
                    namespace = namespace,
                    name = name,
                    "Custom resource does not exist anymore, skip reconciliation"
                );
                return Ok(());
            }
        };

        if resource::deleted(&obj) {
            Self::delete(store, obj).await
        } else {
            Self::upsert(store, obj).await
        }
    }

    /// reconcile the object within the configured deadline and wait for the
    /// next change
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let kind = T::api_resource().kind;
        let event = if resource::deleted(&*obj) {
            RECONCILIATION_DELETE_EVENT
        } else {
            RECONCILIATION_UPSERT_EVENT
        };

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            event = event,
            "Received event for custom resource"
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&kind, &namespace, event])
            .inc();

        let store = KubeStore::new(ctx.kube.to_owned(), ctx.config.operator.timeout());
        let span = info_span!("reconcile", kind = &kind, namespace = &namespace, name = &name);

        if let Err(err) = Self::process(&store, &namespace, &name)
            .instrument(span)
            .await
        {
            error!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to reconcile custom resource"
            );

            return Err(err);
        }

        Ok(Action::await_change())
    }
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of kubernetes custom
/// resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: Object + CustomResourceExt,
    Self: Send + Sync + 'static,
{
    /// listen for events of the custom resource as generic parameter, returns
    /// when the stream of events is over
    async fn watch(&self, ctx: Arc<Context>) {
        let kind = T::api_resource().kind;
        let mut stream = self
            .build(ctx.to_owned())
            .run(Self::reconcile, Self::retry, ctx)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.next().await {
                None => {
                    debug!(kind = &kind, "We have reached the end of the watch stream");
                    return;
                }
                Some(Ok((obj, _action))) => {
                    debug!(
                        kind = &kind,
                        namespace = obj.namespace.as_deref().unwrap_or("<none>"),
                        name = &obj.name,
                        "Successfully reconcile resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS.with_label_values(&[&kind]).inc();
                }
                Some(Err(controller::Error::ObjectNotFound(obj))) => {
                    debug!(
                        kind = &kind,
                        namespace = obj.namespace.as_deref().unwrap_or("<none>"),
                        name = &obj.name,
                        "Received an event about an already deleted resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS.with_label_values(&[&kind]).inc();
                }
                Some(Err(err)) => {
                    error!(
                        kind = &kind,
                        error = err.to_string(),
                        "Failed to reconcile resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED.with_label_values(&[&kind]).inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&kind, "us"])
                .inc_by(Instant::now().duration_since(instant).as_micros() as f64);
            #[cfg(not(feature = "metrics"))]
            trace!(
                kind = &kind,
                duration = Instant::now().duration_since(instant).as_micros() as u64,
                "Handled controller event"
            );
        }
    }
}

/// Blanklet implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: Object + CustomResourceExt,
    U: Reconciler<T> + ControllerBuilder<T> + Send + Sync + 'static,
{
}
