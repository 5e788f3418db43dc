use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Source of the information exposed on the admin listener.
pub trait StatusProvider: Send + Sync {
    fn is_ready(&self) -> bool;

    /// A JSON document describing the current state of the process.
    fn status(&self) -> String;
}

pub struct AdminService<E> {
    provider: Arc<dyn StatusProvider>,
    _error: PhantomData<fn() -> E>,
}

impl<E> AdminService<E> {
    pub fn new(provider: Arc<dyn StatusProvider>) -> Self {
        Self {
            provider,
            _error: PhantomData,
        }
    }
}

impl<E> Service<Request<Incoming>> for AdminService<E>
where
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route(self.provider.as_ref(), req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}

fn route(provider: &dyn StatusProvider, path: &str) -> Response<BoxBody<Bytes, Infallible>> {
    let ok_body = || Full::new(Bytes::from("ok\n")).boxed();

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match provider.is_ready() {
            true => Response::new(ok_body()),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        "/status" => {
            let mut response = Response::new(Full::new(Bytes::from(provider.status())).boxed());
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}
