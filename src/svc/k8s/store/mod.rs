//! # Store module
//!
//! This module provide the [`Store`] trait, the primitive operations the
//! reconcilers need against the kubernetes api, and its implementation on top
//! of a [`kube::Client`].

use std::{fmt::Debug, future::Future, time::Duration};

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, PostParams},
    core::NamespaceResourceScope,
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::svc::crd::single::Single;

#[cfg(test)]
pub mod memory;

// -----------------------------------------------------------------------------
// Object trait

/// group traits needed by a namespaced resource to go through the [`Store`]
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

/// Blanklet implementation of [`Object`]
impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("resource '{0}' '{1}/{2}' does not exist")]
    NotFound(String, String, String),
    #[error("resource '{0}' '{1}/{2}' already exists")]
    AlreadyExists(String, String, String),
    #[error("failed to write resource '{0}' '{1}/{2}', the object has been modified meanwhile")]
    Conflict(String, String, String),
    #[error("request rejected by kubernetes api, {0}")]
    BadRequest(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("request did not complete within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("failed to serialize resource, {0}")]
    Serialize(serde_json::Error),
}

impl Error {
    /// returns if a later attempt of the same request could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::BadRequest(_) | Self::Serialize(_))
    }

    fn from_kube<K>(err: kube::Error, namespace: &str, name: &str) -> Self
    where
        K: Object,
    {
        let kind = K::kind(&()).to_string();

        match err {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound(kind, namespace.to_string(), name.to_string()),
                409 if response.reason == "AlreadyExists" => {
                    Self::AlreadyExists(kind, namespace.to_string(), name.to_string())
                }
                409 => Self::Conflict(kind, namespace.to_string(), name.to_string()),
                400 | 422 => Self::BadRequest(response.message),
                _ => Self::Kube(kube::Error::Api(response)),
            },
            err => Self::Kube(err),
        }
    }
}

// -----------------------------------------------------------------------------
// Store trait

/// provides the operations against the object store, keyed by kind,
/// namespace and name
#[async_trait]
pub trait Store: Send + Sync {
    /// returns the object or `None` if it does not exist
    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Object;

    /// create the object, fails with [`Error::AlreadyExists`] if it exists
    async fn create<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Object;

    /// replace the object, fails with [`Error::Conflict`] if the given
    /// resource version is stale
    async fn update<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Object;

    /// replace the status of the custom resource through its subresource
    async fn update_status(&self, obj: &Single) -> Result<Single, Error>;

    /// delete the object, succeed if it does not exist
    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Object;
}

// -----------------------------------------------------------------------------
// KubeStore structure

/// [`Store`] backed by the kubernetes api, every request has to complete
/// before the deadline given at construction
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
    deadline: Instant,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    async fn within<T, F>(&self, fut: F) -> Result<Result<T, kube::Error>, Error>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        timeout_at(self.deadline, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded(self.timeout))
    }
}

#[async_trait]
impl Store for KubeStore {
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Object,
    {
        let api: Api<K> = Api::namespaced(self.client.to_owned(), namespace);

        debug!(
            kind = &*K::kind(&()),
            namespace = namespace,
            name = name,
            "Execute a request to retrieve resource"
        );

        self.within(api.get_opt(name))
            .await?
            .map_err(|err| Error::from_kube::<K>(err, namespace, name))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn create<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Object,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.to_owned(), &namespace);

        debug!(
            kind = &*K::kind(&()),
            namespace = &namespace,
            name = &name,
            "Execute a request to create resource"
        );

        self.within(api.create(&PostParams::default(), obj))
            .await?
            .map_err(|err| Error::from_kube::<K>(err, &namespace, &name))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn update<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Object,
    {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.to_owned(), &namespace);

        debug!(
            kind = &*K::kind(&()),
            namespace = &namespace,
            name = &name,
            resource_version = obj.resource_version(),
            "Execute a request to replace resource"
        );

        self.within(api.replace(&name, &PostParams::default(), obj))
            .await?
            .map_err(|err| Error::from_kube::<K>(err, &namespace, &name))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, obj)))]
    async fn update_status(&self, obj: &Single) -> Result<Single, Error> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let api: Api<Single> = Api::namespaced(self.client.to_owned(), &namespace);
        let data = serde_json::to_vec(obj).map_err(Error::Serialize)?;

        debug!(
            kind = &*Single::kind(&()),
            namespace = &namespace,
            name = &name,
            resource_version = obj.resource_version(),
            "Execute a request to replace resource's status"
        );

        self.within(api.replace_status(&name, &PostParams::default(), data))
            .await?
            .map_err(|err| Error::from_kube::<Single>(err, &namespace, &name))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self)))]
    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Object,
    {
        let api: Api<K> = Api::namespaced(self.client.to_owned(), namespace);

        debug!(
            kind = &*K::kind(&()),
            namespace = namespace,
            name = name,
            "Execute a request to delete resource"
        );

        match self
            .within(api.delete(name, &DeleteParams::default()))
            .await?
            .map_err(|err| Error::from_kube::<K>(err, namespace, name))
        {
            Ok(_) | Err(Error::NotFound(..)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::error::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified_by_status_code() {
        assert!(matches!(
            Error::from_kube::<Deployment>(api_error(404, "NotFound"), "ns", "db"),
            Error::NotFound(kind, ns, name) if kind == "Deployment" && ns == "ns" && name == "db"
        ));
        assert!(matches!(
            Error::from_kube::<Deployment>(api_error(409, "AlreadyExists"), "ns", "db"),
            Error::AlreadyExists(..)
        ));
        assert!(matches!(
            Error::from_kube::<Deployment>(api_error(409, "Conflict"), "ns", "db"),
            Error::Conflict(..)
        ));
        assert!(matches!(
            Error::from_kube::<Deployment>(api_error(422, "Invalid"), "ns", "db"),
            Error::BadRequest(message) if message == "Invalid happened"
        ));
        assert!(matches!(
            Error::from_kube::<Deployment>(api_error(503, "ServiceUnavailable"), "ns", "db"),
            Error::Kube(_)
        ));
    }

    #[test]
    fn only_rejected_requests_are_not_retryable() {
        let kind = || "Single".to_string();

        assert!(Error::Conflict(kind(), kind(), kind()).is_retryable());
        assert!(Error::DeadlineExceeded(Duration::from_secs(1)).is_retryable());
        assert!(!Error::BadRequest("invalid".into()).is_retryable());
    }
}
