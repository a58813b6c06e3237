//! # Event recorder module
//!
//! This module provide an alternative to the golang EventRecorder structure
//!
//! See following links for more details:
//! - <https://book-v1.book.kubebuilder.io/beyond_basics/creating_events.html>
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go#L56>

use std::{
    convert::TryFrom,
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use kube::{CustomResourceExt, ResourceExt};
use tracing::debug;

use crate::svc::k8s::store::{self, Object, Store};

pub mod event;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse '{0}', available options are 'normal' or 'warning'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl FromStr for Level {
    type Err = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "warning" => Self::Warning,
            "normal" => Self::Normal,
            _ => {
                return Err(Error::Parse(s.to_string()));
            }
        })
    }
}

impl TryFrom<String> for Level {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper methods

/// record an event for the given object, an event with the same name is
/// considered as already recorded
#[cfg_attr(feature = "trace", tracing::instrument(skip(store, obj)))]
pub async fn record<S, T, U>(
    store: &S,
    obj: &T,
    level: &Level,
    action: &U,
    message: &str,
) -> Result<(), store::Error>
where
    S: Store,
    T: Object + CustomResourceExt,
    U: ToString + Debug,
{
    debug!(
        namespace = obj.namespace().unwrap_or_else(|| "<none>".to_string()),
        name = obj.name_any(),
        action = action.to_string(),
        message = message,
        "Create event for resource",
    );

    match store.create(&event::new(obj, level, action, message)).await {
        Ok(_) | Err(store::Error::AlreadyExists(..)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// shortcut for the [`record`] method with the 'Normal' [`Level`]
#[cfg_attr(feature = "trace", tracing::instrument(skip(store, obj)))]
pub async fn normal<S, T, U>(store: &S, obj: &T, action: &U, message: &str) -> Result<(), store::Error>
where
    S: Store,
    T: Object + CustomResourceExt,
    U: ToString + Debug,
{
    record(store, obj, &Level::Normal, action, message).await
}

/// shortcut for the [`record`] method with the 'Warning' [`Level`]
#[cfg_attr(feature = "trace", tracing::instrument(skip(store, obj)))]
pub async fn warning<S, T, U>(
    store: &S,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<(), store::Error>
where
    S: Store,
    T: Object + CustomResourceExt,
    U: ToString + Debug,
{
    record(store, obj, &Level::Warning, action, message).await
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Event;

    use super::*;
    use crate::svc::{
        crd::single::{
            tests::{self, NAMESPACE},
            Action,
        },
        k8s::store::memory::MemoryStore,
    };

    #[test]
    fn level_is_parsed_case_insensitively() {
        assert_eq!("Warning".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!(Level::try_from("normal".to_string()).unwrap(), Level::Normal);
        assert!("critical".parse::<Level>().is_err());
    }

    #[tokio::test]
    async fn warning_is_stored_as_event() {
        let store = MemoryStore::default();
        let single = tests::single(tests::spec());

        warning(&store, &single, &Action::RejectSpec, "size is required")
            .await
            .unwrap();

        let events = store.list::<Event>(NAMESPACE);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_.as_deref(), Some("Warning"));
        assert_eq!(events[0].reason.as_deref(), Some("RejectSpec"));
        assert_eq!(events[0].message.as_deref(), Some("size is required"));
    }
}
