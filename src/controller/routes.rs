// src/controller/routes.rs
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Controller;
use crate::balancer::{Status, VirtualServer};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ApiError> for Response<Body> {
    fn from(err: ApiError) -> Self {
        let body = serde_json::json!({ "error": err.to_string() }).to_string();
        let mut response = json_body(body);
        *response.status_mut() = err.status_code();
        if matches!(err, ApiError::Unauthorized) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"golb\""));
        }
        response
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualServerSummary {
    pub name: String,
    pub address: String,
    pub server_name: String,
    pub protocol: String,
    pub status: Status,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ServerAction {
    Enable,
    Disable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PeerAction {
    Add {
        address: String,
        #[serde(default = "default_weight")]
        weight: u32,
    },
    Remove {
        address: String,
    },
}

fn default_weight() -> u32 {
    1
}

type ApiResult = Result<Response<Body>, ApiError>;

impl Controller {
    pub(super) async fn route(&self, req: Request<Body>) -> ApiResult {
        let path = req.uri().path().trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let method = req.method().clone();

        match (&method, segments.as_slice()) {
            (&Method::GET, ["vs"]) => self.list().await,
            (&Method::GET, ["vs", name]) => {
                let vs = self.find(name)?;
                Ok(text_body(vs.stats().await))
            }
            (&Method::POST, ["vs", name]) => {
                let vs = self.find(name)?;
                let action: ServerAction = read_json(req).await?;
                self.apply_server_action(vs, action).await
            }
            (&Method::POST, ["vs", name, "pool"]) => {
                let vs = self.find(name)?;
                let action: PeerAction = read_json(req).await?;
                self.apply_peer_action(vs, action).await
            }
            (&Method::GET, ["stats"]) => Ok(text_body(self.balancer.stats().await)),
            (&Method::GET, ["metrics"]) => self.metrics(),
            _ => Err(ApiError::NotFound(format!("route /{}", path))),
        }
    }

    async fn list(&self) -> ApiResult {
        let mut summaries = Vec::with_capacity(self.balancer.servers().len());
        for vs in self.balancer.servers() {
            summaries.push(VirtualServerSummary {
                name: vs.name().to_string(),
                address: vs.address().to_string(),
                server_name: vs.server_name().to_string(),
                protocol: vs.protocol().to_string(),
                status: vs.status().await,
                pool_size: vs.pool().size().await,
            });
        }
        to_json(&summaries)
    }

    async fn apply_server_action(&self, vs: Arc<VirtualServer>, action: ServerAction) -> ApiResult {
        let result = match action {
            ServerAction::Enable => vs.run().await,
            ServerAction::Disable => vs.stop().await,
        };
        result.map_err(|err| ApiError::Conflict(err.to_string()))?;

        to_json(&serde_json::json!({
            "name": vs.name(),
            "status": vs.status().await,
        }))
    }

    async fn apply_peer_action(&self, vs: Arc<VirtualServer>, action: PeerAction) -> ApiResult {
        let changed = match action {
            PeerAction::Add { address, weight } => {
                if address.is_empty() || weight == 0 {
                    return Err(ApiError::BadRequest(
                        "peer needs an address and a positive weight".into(),
                    ));
                }
                vs.add_peer_with_weight(&address, weight).await
            }
            PeerAction::Remove { address } => vs.remove_peer(&address).await,
        };

        to_json(&serde_json::json!({
            "name": vs.name(),
            "changed": changed,
            "pool_size": vs.pool().size().await,
        }))
    }

    fn metrics(&self) -> ApiResult {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| ApiError::NotFound("metrics".into()))?;
        let buffer = registry
            .gather()
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        let mut response = Response::new(Body::from(buffer));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
        Ok(response)
    }

    fn find(&self, name: &str) -> Result<Arc<VirtualServer>, ApiError> {
        self.balancer
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("virtual server {}", name)))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, ApiError> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    serde_json::from_slice(&body).map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> ApiResult {
    let body = serde_json::to_string(value).map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(json_body(body))
}

fn json_body(body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn text_body(body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
