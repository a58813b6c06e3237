//! # Telemetry module
//!
//! This module expose the health and metrics endpoints of the operator through
//! a small http server

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, time::Instant};

use hyper::{
    header::{self, HeaderValue},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use tracing::{error, info};

#[cfg(feature = "metrics")]
pub mod metrics;

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static SERVER_REQUEST: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "greatsql_operator_server_request",
            "number of request handled by the telemetry server",
        ),
        &["method", "path", "status"]
    )
    .expect("metrics 'greatsql_operator_server_request' to not be already registered")
});

#[cfg(feature = "metrics")]
static SERVER_REQUEST_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "greatsql_operator_server_request_duration",
            "duration of request handled by the telemetry server",
        ),
        &["method", "path", "unit"]
    )
    .expect("metrics 'greatsql_operator_server_request_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "metrics")]
    #[error("{0}")]
    Metrics(metrics::Error),
    #[error("failed to bind telemetry server on '{0}', {1}")]
    Bind(SocketAddr, hyper::Error),
    #[error("failed to serve telemetry requests, {0}")]
    Serve(hyper::Error),
}

// -----------------------------------------------------------------------------
// Helper methods

/// listen on the given address and answer using the [`router`] until the
/// future is dropped
pub async fn serve(addr: SocketAddr) -> Result<(), Error> {
    let server = Server::try_bind(&addr).map_err(|err| Error::Bind(addr, err))?;

    info!(listen = addr.to_string(), "Start to listen for telemetry requests");
    server
        .serve(make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|req| async move {
                Ok::<_, Infallible>(router(req).await)
            }))
        }))
        .await
        .map_err(Error::Serve)
}

#[cfg_attr(feature = "trace", tracing::instrument)]
pub async fn router(req: Request<Body>) -> Response<Body> {
    let begin = Instant::now();

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Ok(healthz()),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics::handler().map_err(Error::Metrics),
        _ => Ok(not_found()),
    };

    let res = match result {
        Ok(res) => res,
        Err(err) => {
            error!(
                method = req.method().as_str(),
                path = req.uri().path(),
                error = err.to_string(),
                "Could not handle request"
            );

            internal_error(&err)
        }
    };

    let duration = Instant::now().duration_since(begin).as_micros();
    info!(
        method = req.method().as_str(),
        path = req.uri().path(),
        status = res.status().as_u16(),
        duration = duration,
        "Receive request"
    );

    #[cfg(feature = "metrics")]
    {
        SERVER_REQUEST
            .with_label_values(&[
                req.method().as_str(),
                req.uri().path(),
                &res.status().as_u16().to_string(),
            ])
            .inc();

        SERVER_REQUEST_DURATION
            .with_label_values(&[req.method().as_str(), req.uri().path(), "us"])
            .inc_by(duration as f64);
    }

    res
}

pub fn healthz() -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NO_CONTENT;
    res
}

pub fn not_found() -> Response<Body> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

fn internal_error(err: &Error) -> Response<Body> {
    let map = BTreeMap::from([("error".to_string(), err.to_string())]);
    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    *res.body_mut() = Body::from(serde_json::to_string(&map).unwrap_or_default());
    res
}
