//! # Metrics module
//!
//! This module encode the gathered prometheus metrics

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Response, StatusCode,
};
use prometheus::{gather, Encoder, TextEncoder};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize metrics, {0}")]
    Encode(prometheus::Error),
    #[error("failed to parse header value given by prometheus, {0}")]
    InvalidHeader(InvalidHeaderValue),
}

/// returns the metrics registered in the default registry using the text
/// exposition format
pub fn handler() -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();
    let mut buf = vec![];
    encoder
        .encode(&gather(), &mut buf)
        .map_err(Error::Encode)?;

    let mut res = Response::new(Body::from(buf));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::InvalidHeader)?,
    );

    *res.status_mut() = StatusCode::OK;
    Ok(res)
}
