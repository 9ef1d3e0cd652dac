// src/controller/mod.rs
//! Administrative HTTP API over a [`Balancer`].
//!
//! Routes:
//! - `GET  /vs`              list virtual servers
//! - `GET  /vs/{name}`       text stats of one server
//! - `POST /vs/{name}`       `{"action":"enable"|"disable"}`
//! - `POST /vs/{name}/pool`  `{"action":"add"|"remove","address":..,"weight":..}`
//! - `GET  /stats`           text stats of every server
//! - `GET  /metrics`         Prometheus exposition

mod routes;

pub use routes::{ApiError, PeerAction, ServerAction, VirtualServerSummary};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::AUTHORIZATION;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::balancer::Balancer;
use crate::config::AuthConfig;
use crate::metrics::MetricsRegistry;

pub struct Controller {
    balancer: Arc<Balancer>,
    registry: Option<Arc<MetricsRegistry>>,
    auth: Option<AuthConfig>,
}

impl Controller {
    pub fn new(
        balancer: Arc<Balancer>,
        registry: Option<Arc<MetricsRegistry>>,
        auth: Option<AuthConfig>,
    ) -> Self {
        Self {
            balancer,
            registry,
            auth,
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if !self.authorized(&req) {
            return ApiError::Unauthorized.into();
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.route(req).await {
            Ok(response) => response,
            Err(err) => {
                info!(%method, %path, %err, "controller request rejected");
                err.into()
            }
        }
    }

    /// Binds `addr` and serves the API until `shutdown` resolves.
    pub fn serve<F>(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: F,
    ) -> Result<(SocketAddr, JoinHandle<()>)>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let make_service = make_service_fn(move |_| {
            let controller = self.clone();

            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let controller = controller.clone();
                    async move { Ok::<_, Infallible>(controller.handle(req).await) }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .with_context(|| format!("Failed to bind controller on {}", addr))?
            .serve(make_service);
        let local_addr = server.local_addr();

        info!("Controller listening on http://{}", local_addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = server.with_graceful_shutdown(shutdown).await {
                error!("Controller server error: {}", e);
            }
        });

        Ok((local_addr, handle))
    }

    fn authorized(&self, req: &Request<Body>) -> bool {
        let Some(auth) = &self.auth else {
            return true;
        };

        req.headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|credentials| {
                credentials
                    .split_once(':')
                    .map(|(user, pass)| user == auth.username && pass == auth.password)
            })
            .unwrap_or(false)
    }
}
