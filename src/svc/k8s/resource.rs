//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{CustomResourceExt, Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource, the namespace
/// is empty for cluster scoped ones
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// returns difference between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// returns difference between the two given object restricted to the fields
/// declared by the modified one, values defaulted by the api server on the
/// origin are not taken into account
pub fn declared_diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    let modified = serde_json::to_value(modified)?;
    let origin = restrict(&serde_json::to_value(origin)?, &modified);

    Ok(json_patch::diff(&origin, &modified))
}

fn restrict(origin: &Value, modified: &Value) -> Value {
    match (origin, modified) {
        (Value::Object(origin), Value::Object(modified)) => Value::Object(
            origin
                .iter()
                .filter_map(|(key, value)| {
                    modified
                        .get(key)
                        .map(|declared| (key.to_owned(), restrict(value, declared)))
                })
                .collect(),
        ),
        // items are matched by position, a length change is a difference
        (Value::Array(origin), Value::Array(modified)) if origin.len() == modified.len() => {
            Value::Array(
                origin
                    .iter()
                    .zip(modified)
                    .map(|(value, declared)| restrict(value, declared))
                    .collect(),
            )
        }
        _ => origin.to_owned(),
    }
}

/// returns a controller owner reference pointing to the given resource, or
/// `None` if kubernetes did not give it an identifier yet
pub fn owner_reference<T>(obj: &T) -> Option<OwnerReference>
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    Some(OwnerReference {
        api_version: api_resource.api_version,
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: api_resource.kind,
        name: obj.name_any(),
        uid: obj.uid()?,
    })
}

/// returns an object reference pointing to the given resource
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: ResourceExt + CustomResourceExt,
{
    let api_resource = T::api_resource();

    ObjectReference {
        api_version: Some(api_resource.api_version),
        kind: Some(api_resource.kind),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        resource_version: obj.resource_version(),
        uid: obj.uid(),
        field_path: None,
    }
}
