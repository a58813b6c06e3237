//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    if let Some(finalizers) = &obj.meta().finalizers {
        finalizers.iter().any(|f| finalizer == f)
    } else {
        false
    }
}

/// add finalizer to the resource, returns `false` if it was already there
pub fn add<T>(obj: &mut T, finalizer: &str) -> bool
where
    T: Resource,
{
    if contains(obj, finalizer) {
        return false;
    }

    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.into());

    true
}

/// remove finalizer from the resource, returns `false` if it was not there
pub fn remove<T>(obj: &mut T, finalizer: &str) -> bool
where
    T: Resource,
{
    if !contains(obj, finalizer) {
        return false;
    }

    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }

    true
}
