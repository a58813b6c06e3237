//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, Registry};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
    #[cfg(feature = "trace")]
    #[error("failed to initialize jaeger exporter, {0}")]
    Jaeger(opentelemetry::trace::TraceError),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg(not(feature = "trace"))]
pub fn initialize(_config: &Configuration, verbosity: usize) -> Result<(), Error> {
    let subscriber = Registry::default()
        .with(LevelFilter::from_level(level(verbosity)))
        .with(fmt_layer());

    tracing::subscriber::set_global_default(subscriber).map_err(Error::GlobalDefaultSubscriber)
}

#[cfg(feature = "trace")]
pub fn initialize(config: &Configuration, verbosity: usize) -> Result<(), Error> {
    let telemetry = match &config.jaeger {
        Some(jaeger) => {
            let tracer = opentelemetry_jaeger::new_collector_pipeline()
                .with_endpoint(jaeger.endpoint.to_owned())
                .with_service_name(env!("CARGO_PKG_NAME"))
                .with_reqwest()
                .install_batch(opentelemetry::runtime::Tokio)
                .map_err(Error::Jaeger)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let subscriber = Registry::default()
        .with(LevelFilter::from_level(level(verbosity)))
        .with(fmt_layer())
        .with(telemetry);

    tracing::subscriber::set_global_default(subscriber).map_err(Error::GlobalDefaultSubscriber)
}

fn fmt_layer<S>() -> tracing_subscriber::fmt::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
}
