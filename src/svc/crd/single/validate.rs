//! # Validate module
//!
//! This module provide the preconditions a [`SingleSpec`] has to fulfill
//! before any dependent resource is created.

use crate::svc::crd::single::{Kind, SingleSpec};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, PartialEq, Eq, Debug)]
pub enum Error {
    #[error("field 'size' is required")]
    MissingSize,
    #[error("field 'size' has to be strictly positive, got {0}")]
    InvalidSize(i32),
    #[error("field 'podSpec.storage.persistentVolumeClaimTemplate.storageClassName' is required when a claim template is given")]
    MissingStorageClass,
    #[error("greatsql type '{0}' is not supported, only 'single' is")]
    UnsupportedKind(Kind),
}

// -----------------------------------------------------------------------------
// Helper functions

pub fn validate(spec: &SingleSpec) -> Result<(), Error> {
    match spec.size {
        None => return Err(Error::MissingSize),
        Some(size) if size <= 0 => return Err(Error::InvalidSize(size)),
        Some(_) => {}
    }

    let template = spec
        .pod_spec
        .storage
        .as_ref()
        .and_then(|storage| storage.claim_template.as_ref());

    if let Some(template) = template {
        if template
            .storage_class_name
            .as_deref()
            .map_or(true, str::is_empty)
        {
            return Err(Error::MissingStorageClass);
        }
    }

    if spec.kind != Kind::Single {
        return Err(Error::UnsupportedKind(spec.kind));
    }

    Ok(())
}
