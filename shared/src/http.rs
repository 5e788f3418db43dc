use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Builds an empty-bodied response carrying only the status line reason.
pub fn make_boxed_error_response(status: StatusCode) -> Response<BoxBody<Bytes, Infallible>> {
    let reason = status.canonical_reason().unwrap_or("error");
    let mut response = Response::new(Full::new(Bytes::from(format!("{reason}\n"))).boxed());
    *response.status_mut() = status;
    response
}

/// Accepts connections on `host:port` and serves them with `service` until
/// `shutdown` resolves. Connections already handed to hyper are left to finish
/// on their own.
pub async fn run_http_service<S, E, F>(
    host: &str,
    port: u16,
    service: S,
    shutdown: F,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, Infallible>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "http listener bound");
    serve(listener, service, shutdown).await
}

/// Same as [`run_http_service`] for an already bound listener.
pub async fn serve<S, E, F>(listener: TcpListener, service: S, shutdown: F) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, Infallible>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
    F: Future<Output = ()>,
{
    let service_arc = Arc::new(service);
    tokio::pin!(shutdown);

    loop {
        let (stream, _peer_addr) = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("http listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %err, "error serving connection");
            }
        });
    }
}
