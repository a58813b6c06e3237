//! # Memory store module
//!
//! In-memory [`Store`] emulating the parts of the kubernetes api the
//! reconcilers rely on: resource versions, the status subresource, generation
//! bumps on spec changes and finalizer gated deletion.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{error::ErrorResponse, Resource, ResourceExt};
use serde_json::Value;

use crate::svc::{
    crd::single::Single,
    k8s::store::{Error, Object, Store},
};

// -----------------------------------------------------------------------------
// Verb enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
    calls: Vec<(Verb, String)>,
    failures: Vec<(Verb, String)>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// record the call and returns the injected failure if any
    fn call(&mut self, verb: Verb, kind: &str) -> Result<(), Error> {
        self.calls.push((verb, kind.to_string()));

        let position = self
            .failures
            .iter()
            .position(|(v, k)| *v == verb && k == kind);

        match position {
            Some(idx) => {
                self.failures.remove(idx);
                Err(Error::Kube(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("injected failure on {verb:?} {kind}"),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                })))
            }
            None => Ok(()),
        }
    }
}

// -----------------------------------------------------------------------------
// MemoryStore structure

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key<K: Object>(namespace: &str, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn encode<K: Object>(obj: &K) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(Error::Serialize)
}

fn decode<K: Object>(value: &Value) -> Result<K, Error> {
    serde_json::from_value(value.to_owned()).map_err(Error::Serialize)
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// insert the object as if it was created by an other actor, bypassing
    /// failures and calls accounting, status included
    pub fn seed<K: Object>(&self, mut obj: K) -> K {
        let mut inner = self.lock();
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{namespace}-{name}"));
        meta.generation.get_or_insert(1);
        meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        meta.resource_version = Some(inner.next_version());

        let value = serde_json::to_value(&obj).expect("object to be serializable");
        inner.objects.insert(key::<K>(&namespace, &name), value);
        obj
    }

    /// returns the stored object, bypassing failures and calls accounting
    pub fn fetch<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key::<K>(namespace, name))
            .map(|value| decode(value).expect("stored object to be deserializable"))
    }

    /// returns all stored objects of the kind in the namespace
    pub fn list<K: Object>(&self, namespace: &str) -> Vec<K> {
        let kind = K::kind(&()).to_string();

        self.lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, value)| decode(value).expect("stored object to be deserializable"))
            .collect()
    }

    /// make the next call with the given verb on the given kind fail with a
    /// transient error
    pub fn fail<K: Object>(&self, verb: Verb) {
        self.lock().failures.push((verb, K::kind(&()).to_string()));
    }

    /// returns the number of calls made with the given verb on the given kind
    pub fn calls<K: Object>(&self, verb: Verb) -> usize {
        let kind = K::kind(&()).to_string();

        self.lock()
            .calls
            .iter()
            .filter(|(v, k)| *v == verb && *k == kind)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: Object,
    {
        let mut inner = self.lock();
        inner.call(Verb::Get, &K::kind(&()))?;

        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(decode)
            .transpose()
    }

    async fn create<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Object,
    {
        let mut inner = self.lock();
        let kind = K::kind(&()).to_string();
        inner.call(Verb::Create, &kind)?;

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj
            .meta()
            .name
            .to_owned()
            .ok_or_else(|| Error::BadRequest("metadata.name is required".into()))?;

        let key = key::<K>(&namespace, &name);
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(kind, namespace, name));
        }

        let mut created = obj.to_owned();
        let meta = created.meta_mut();
        meta.uid = Some(format!("uid-{namespace}-{name}"));
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.resource_version = Some(inner.next_version());

        inner.objects.insert(key, encode(&created)?);
        Ok(created)
    }

    async fn update<K>(&self, obj: &K) -> Result<K, Error>
    where
        K: Object,
    {
        let mut inner = self.lock();
        let kind = K::kind(&()).to_string();
        inner.call(Verb::Update, &kind)?;

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let key = key::<K>(&namespace, &name);

        let stored_value = match inner.objects.get(&key) {
            Some(value) => value.to_owned(),
            None => return Err(Error::NotFound(kind, namespace, name)),
        };

        let stored: K = decode(&stored_value)?;
        if obj.resource_version().is_some() && obj.resource_version() != stored.resource_version()
        {
            return Err(Error::Conflict(kind, namespace, name));
        }

        let mut updated = obj.to_owned();
        let meta = updated.meta_mut();
        meta.uid = stored.meta().uid.to_owned();
        meta.creation_timestamp = stored.meta().creation_timestamp.to_owned();
        meta.deletion_timestamp = stored.meta().deletion_timestamp.to_owned();
        meta.generation = stored.meta().generation;
        meta.resource_version = Some(inner.next_version());

        let mut value = encode(&updated)?;
        if value.get("spec") != stored_value.get("spec") {
            value["metadata"]["generation"] =
                Value::from(stored.meta().generation.unwrap_or(0) + 1);
        }

        // status is owned by the status subresource
        if let Some(map) = value.as_object_mut() {
            match stored_value.get("status") {
                Some(status) => map.insert("status".to_string(), status.to_owned()),
                None => map.remove("status"),
            };
        }

        let updated: K = decode(&value)?;
        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, value);
        }

        Ok(updated)
    }

    async fn update_status(&self, obj: &Single) -> Result<Single, Error> {
        let mut inner = self.lock();
        let kind = Single::kind(&()).to_string();
        inner.call(Verb::UpdateStatus, &kind)?;

        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let key = key::<Single>(&namespace, &name);

        let mut stored: Single = match inner.objects.get(&key) {
            Some(value) => decode(value)?,
            None => return Err(Error::NotFound(kind, namespace, name)),
        };

        if obj.resource_version().is_some() && obj.resource_version() != stored.resource_version()
        {
            return Err(Error::Conflict(kind, namespace, name));
        }

        stored.status = obj.status.to_owned();
        stored.meta_mut().resource_version = Some(inner.next_version());

        inner.objects.insert(key, encode(&stored)?);
        Ok(stored)
    }

    async fn delete<K>(&self, namespace: &str, name: &str) -> Result<(), Error>
    where
        K: Object,
    {
        let mut inner = self.lock();
        inner.call(Verb::Delete, &K::kind(&()))?;

        let key = key::<K>(namespace, name);
        let mut stored: K = match inner.objects.get(&key) {
            Some(value) => decode(value)?,
            None => return Ok(()),
        };

        if stored.finalizers().is_empty() {
            inner.objects.remove(&key);
            return Ok(());
        }

        let version = inner.next_version();
        let meta = stored.meta_mut();
        meta.deletion_timestamp.get_or_insert_with(|| Time(Utc::now()));
        meta.resource_version = Some(version);

        inner.objects.insert(key, encode(&stored)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;

    fn config_map(name: &str, finalizers: Option<Vec<String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                finalizers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_update_fails_with_conflict() {
        let store = MemoryStore::default();
        let created = store.create(&config_map("db", None)).await.unwrap();

        let mut first = created.to_owned();
        first.data = Some(BTreeMap::from([("a".to_string(), "1".to_string())]));
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.data = Some(BTreeMap::from([("a".to_string(), "2".to_string())]));
        assert!(matches!(
            store.update(&stale).await,
            Err(Error::Conflict(..))
        ));
    }

    #[tokio::test]
    async fn create_twice_fails_with_already_exists() {
        let store = MemoryStore::default();
        store.create(&config_map("db", None)).await.unwrap();

        assert!(matches!(
            store.create(&config_map("db", None)).await,
            Err(Error::AlreadyExists(..))
        ));
    }

    #[tokio::test]
    async fn finalizers_gate_purge() {
        let store = MemoryStore::default();
        store.seed(config_map("db", Some(vec!["test/finalizer".into()])));

        store.delete::<ConfigMap>("default", "db").await.unwrap();
        let marked: ConfigMap = store.fetch("default", "db").unwrap();
        assert!(marked.meta().deletion_timestamp.is_some());

        let mut released = marked;
        released.meta_mut().finalizers = Some(vec![]);
        store.update(&released).await.unwrap();
        assert!(store.fetch::<ConfigMap>("default", "db").is_none());
    }

    #[tokio::test]
    async fn injected_failure_happens_once() {
        let store = MemoryStore::default();
        store.fail::<ConfigMap>(Verb::Get);

        assert!(store.get::<ConfigMap>("default", "db").await.is_err());
        assert!(store.get::<ConfigMap>("default", "db").await.unwrap().is_none());
        assert_eq!(store.calls::<ConfigMap>(Verb::Get), 2);
    }
}
