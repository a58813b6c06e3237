//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{
    convert::TryFrom,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

// -----------------------------------------------------------------------------
// Constants

pub const OPERATOR_LISTEN: &str = "0.0.0.0:8000";
pub const OPERATOR_TIMEOUT: u64 = 30;
pub const OPERATOR_RETRY: u64 = 500;

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    /// deadline of a reconciliation in seconds
    #[serde(rename = "timeout")]
    pub timeout: u64,
    /// delay before requeuing a failed reconciliation in milliseconds
    #[serde(rename = "retry")]
    pub retry: u64,
}

impl Operator {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry)
    }
}

// -----------------------------------------------------------------------------
// Jaeger structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Jaeger {
    #[serde(rename = "endpoint")]
    pub endpoint: String,
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to cast configuration, {0}")]
    Cast(ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "jaeger", default)]
    pub jaeger: Option<Jaeger>,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::load(&[(path, true)])
    }
}

impl Configuration {
    pub fn try_default() -> Result<Self, Error> {
        let name = env!("CARGO_PKG_NAME");
        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", name)),
            PathBuf::from(format!("/etc/{}/config", name)),
        ];

        if let Some(home) = std::env::var_os("HOME") {
            let home = Path::new(&home);
            paths.push(home.join(".config").join(name).join("config"));
            paths.push(home.join(".local").join("share").join(name).join("config"));
        }

        paths.push(PathBuf::from("config"));

        let sources: Vec<_> = paths.into_iter().map(|path| (path, false)).collect();
        Self::load(&sources)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
        Config::builder()
            .set_default("operator.listen", OPERATOR_LISTEN)
            .map_err(|err| Error::Default("operator.listen".into(), err))?
            .set_default("operator.timeout", OPERATOR_TIMEOUT)
            .map_err(|err| Error::Default("operator.timeout".into(), err))?
            .set_default("operator.retry", OPERATOR_RETRY)
            .map_err(|err| Error::Default("operator.retry".into(), err))
    }

    /// load the configuration from defaults, environment and the given files,
    /// later sources override earlier ones
    fn load(files: &[(PathBuf, bool)]) -> Result<Self, Error> {
        let mut builder = Self::defaults()?.add_source(
            Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
                .separator("__")
                .try_parsing(true),
        );

        for (path, required) in files {
            builder = builder.add_source(File::from(path.to_owned()).required(*required));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Cast)
    }

    pub fn help(&self) {
        info!(
            listen = self.operator.listen.to_string(),
            "Configuration key 'operator.listen' has value"
        );
        info!(
            timeout = self.operator.timeout,
            "Configuration key 'operator.timeout' has value (in seconds)"
        );
        info!(
            retry = self.operator.retry,
            "Configuration key 'operator.retry' has value (in milliseconds)"
        );

        match &self.jaeger {
            Some(jaeger) => info!(
                endpoint = &jaeger.endpoint,
                "Configuration key 'jaeger.endpoint' has value"
            ),
            None => info!("Configuration key 'jaeger' is not set, traces are not exported"),
        }
    }
}
