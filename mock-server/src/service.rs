use std::sync::Arc;

use anyhow::Error;
use http::{Request, Response, header};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use serde::Serialize;

use crate::error::ApiError;

pub type Outgoing = BoxBody<Bytes, Error>;

pub trait Service: Send + Sync {
    fn call(
        &self,
        req: Request<Incoming>,
    ) -> impl Future<Output = Result<Response<Outgoing>, Error>> + Send + '_;

    fn call_arc(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> impl Future<Output = Result<Response<Outgoing>, Error>> + Send
    where
        Self: 'static,
    {
        async move { self.call(req).await }
    }
}

pub fn empty_body() -> Outgoing {
    Empty::new().map_err(Error::new).boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> Outgoing {
    Full::new(data.into()).map_err(Error::new).boxed()
}

pub fn json_response<T: Serialize>(value: &T) -> Result<Response<Outgoing>, ApiError> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body))?)
}
