// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::balancer::VirtualServer;

/// Per-connection service handing each request to its virtual server.
#[derive(Clone)]
pub struct RequestHandler {
    vserver: Arc<VirtualServer>,
    remote: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(vserver: Arc<VirtualServer>) -> Self {
        Self {
            vserver,
            remote: None,
        }
    }

    pub fn for_connection(&self, remote: SocketAddr) -> Self {
        Self {
            vserver: self.vserver.clone(),
            remote: Some(remote),
        }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let vserver = self.vserver.clone();
        let remote = self.remote;
        // Routing and backend failures are already responses.
        Box::pin(async move { Ok(vserver.dispatch(req, remote).await) })
    }
}
