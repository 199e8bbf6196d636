//! Built-in service served by `registry-node serve`. Every call on
//! `/registry.node.Ping/*` answers with an empty, successful gRPC response.

use std::convert::Infallible;
use std::future;
use std::task::{Context, Poll};

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response};
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tower::Service;

#[derive(Debug, Clone, Copy, Default)]
pub struct PingService;

impl NamedService for PingService {
    const NAME: &'static str = "registry.node.Ping";
}

impl Service<Request<Body>> for PingService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        tracing::debug!(path = %req.uri().path(), "ping");
        let mut response = Response::new(Body::empty());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        future::ready(Ok(response))
    }
}

#[must_use]
pub fn routes() -> Routes {
    let mut builder = RoutesBuilder::default();
    builder.add_service(PingService);
    builder.routes()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_with_ok_status() {
        let req = Request::builder()
            .uri("/registry.node.Ping/Ping")
            .body(Body::empty())
            .unwrap();
        let resp = PingService.call(req).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.headers()["grpc-status"], "0");
    }
}
