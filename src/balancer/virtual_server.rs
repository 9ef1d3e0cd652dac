// src/balancer/virtual_server.rs
use arc_swap::ArcSwap;
use hyper::header::HOST;
use hyper::http::request;
use hyper::{Body, Request, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::error::{ConfigError, LifecycleError};
use crate::config::VirtualServerConfig;
use crate::load_balancer::LbMethod;
use crate::metrics::{MetricsCollector, Timer};
use crate::proxy::{
    read_limited, BodyEnd, HealthPolicy, Peer, Pool, ProxiedResponse, Proxy, ProxyError,
    DEFAULT_FAIL_TIMEOUT, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_FAILS, DEFAULT_PROXY_TIMEOUT,
};
use crate::server::listener::{bind_tcp, load_tls_acceptor};
use crate::server::{RequestHandler, ServerBuilder};

/// Server name that accepts requests for any Host.
pub const DEFAULT_SERVER_NAME: &str = "*";

pub const PROTO_HTTP: &str = "http";
pub const PROTO_HTTPS: &str = "https";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    /// An empty value selects plain HTTP.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | PROTO_HTTP => Some(Self::Http),
            PROTO_HTTPS => Some(Self::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => PROTO_HTTP,
            Self::Https => PROTO_HTTPS,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Enabled,
    Disabled,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Enabled => f.write_str("enabled"),
            Status::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone)]
struct TlsFiles {
    cert: PathBuf,
    key: PathBuf,
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// One front-end endpoint and the pool it balances over.
///
/// `run` needs an `Arc<VirtualServer>` because every accepted connection
/// keeps the server alive until its requests are answered.
pub struct VirtualServer {
    name: String,
    address: String,
    protocol: Protocol,
    tls: Option<TlsFiles>,
    lb_method: LbMethod,
    retry: bool,
    max_body_size: usize,
    server_name: ArcSwap<String>,
    pool: Pool,
    proxy: Proxy,
    metrics: Option<Arc<MetricsCollector>>,
    running: Mutex<Option<Running>>,
}

impl VirtualServer {
    /// Validates `config` and builds a disabled server.
    ///
    /// Checks run in a fixed order and the first failure is returned:
    /// name, address, protocol, TLS files (https only), lb method.
    pub fn new(config: &VirtualServerConfig) -> Result<Self, ConfigError> {
        if config.name.is_empty() {
            return Err(ConfigError::NameEmpty);
        }
        if config.address.is_empty() {
            return Err(ConfigError::AddressEmpty);
        }

        let protocol = Protocol::parse(&config.protocol)
            .ok_or_else(|| ConfigError::UnsupportedProtocol(config.protocol.clone()))?;

        let tls = match protocol {
            Protocol::Https => Some(TlsFiles {
                cert: existing_file("certificate", &config.cert_file)?,
                key: existing_file("key", &config.key_file)?,
            }),
            Protocol::Http => None,
        };

        let lb_method = LbMethod::parse(&config.lb_method)
            .ok_or_else(|| ConfigError::UnsupportedMethod(config.lb_method.clone()))?;

        let server_name = if config.server_name.is_empty() {
            DEFAULT_SERVER_NAME.to_string()
        } else {
            config.server_name.clone()
        };

        let policy = HealthPolicy {
            max_fails: config.max_fails.unwrap_or(DEFAULT_MAX_FAILS),
            fail_timeout: config.fail_timeout().unwrap_or(DEFAULT_FAIL_TIMEOUT),
        };

        Ok(Self {
            name: config.name.clone(),
            address: config.address.clone(),
            protocol,
            tls,
            lb_method,
            retry: config.retry,
            max_body_size: config.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            server_name: ArcSwap::from_pointee(server_name),
            pool: Pool::with_peers(lb_method, policy, &config.pool),
            proxy: Proxy::new(config.proxy_timeout().unwrap_or(DEFAULT_PROXY_TIMEOUT)),
            metrics: None,
            running: Mutex::new(None),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn lb_method(&self) -> LbMethod {
        self.lb_method
    }

    pub fn retry(&self) -> bool {
        self.retry
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn server_name(&self) -> Arc<String> {
        self.server_name.load_full()
    }

    /// Takes effect for the next request. Empty means match any host.
    pub fn set_server_name(&self, server_name: &str) {
        let value = if server_name.is_empty() {
            DEFAULT_SERVER_NAME
        } else {
            server_name
        };
        self.server_name.store(Arc::new(value.to_string()));
    }

    pub fn fail_timeout(&self) -> Duration {
        self.pool.policy().fail_timeout
    }

    pub async fn set_fail_timeout(&self, fail_timeout: Duration) {
        self.pool.set_fail_timeout(fail_timeout).await;
    }

    pub async fn status(&self) -> Status {
        if self.running.lock().await.is_some() {
            Status::Enabled
        } else {
            Status::Disabled
        }
    }

    /// The bound address while enabled.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Binds the listener and starts accepting connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(LifecycleError::AlreadyEnabled(self.name.clone()));
        }

        let tls = match &self.tls {
            Some(files) => Some(load_tls_acceptor(&files.cert, &files.key)?),
            None => None,
        };

        let bind_error = |source| LifecycleError::Bind {
            address: self.address.clone(),
            source,
        };
        let listener = bind_tcp(&self.address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = RequestHandler::new(self.clone());
        let accept_task = ServerBuilder::new(self.name.clone(), listener, handler)
            .with_tls(tls)
            .with_metrics(self.metrics.clone())
            .spawn(shutdown_rx);

        if let Some(metrics) = &self.metrics {
            metrics.update_pool_size(&self.name, self.pool.size().await);
        }

        info!(
            vserver = %self.name,
            address = %local_addr,
            protocol = %self.protocol,
            lb_method = %self.lb_method,
            "Virtual server enabled"
        );
        *running = Some(Running {
            shutdown,
            accept_task,
            local_addr,
        });
        Ok(())
    }

    /// Stops accepting and releases the port. Requests already being
    /// served are allowed to complete.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return Err(LifecycleError::AlreadyDisabled(self.name.clone()));
        };

        let _ = state.shutdown.send(true);
        if let Err(err) = state.accept_task.await {
            warn!(vserver = %self.name, %err, "accept loop ended abnormally");
        }

        info!(vserver = %self.name, address = %state.local_addr, "Virtual server disabled");
        Ok(())
    }

    /// Adds a weight-1 peer. Returns `false` if it was already present.
    pub async fn add_peer(&self, address: &str) -> bool {
        self.add_peer_with_weight(address, 1).await
    }

    pub async fn add_peer_with_weight(&self, address: &str, weight: u32) -> bool {
        let added = self.pool.add_peer(address, weight).await;
        self.refresh_pool_size().await;
        added
    }

    /// Returns `false` if the peer was not present.
    pub async fn remove_peer(&self, address: &str) -> bool {
        let Some(peer) = self.pool.remove_peer(address).await else {
            return false;
        };

        if let Some(metrics) = &self.metrics {
            let status_codes = peer.stats().snapshot().status_codes.into_keys();
            metrics.remove_peer(&self.name, &peer.address, status_codes);
        }
        self.refresh_pool_size().await;
        true
    }

    pub async fn stats(&self) -> String {
        self.pool.report(&self.name).await
    }

    /// Answers one client request. Every failure becomes a response.
    pub async fn dispatch(&self, req: Request<Body>, remote: Option<SocketAddr>) -> Response<Body> {
        let timer = Timer::new();
        let span = tracing::debug_span!(
            "request",
            vserver = %self.name,
            request_id = %Uuid::new_v4(),
            method = %req.method(),
            path = %req.uri().path(),
        );

        let response = self.route(req, remote).instrument(span).await;

        if let Some(metrics) = &self.metrics {
            metrics.observe_duration(&self.name, timer.elapsed());
        }
        response
    }

    async fn route(&self, req: Request<Body>, remote: Option<SocketAddr>) -> Response<Body> {
        if !self.accepts_host(&req) {
            debug!(host = ?req.headers().get(HOST), "host does not match server name");
            return self.routing_error(ProxyError::HostNotMatch, "host_not_match");
        }

        // The body is read before a peer is picked so a bad upload never
        // takes a peer's turn.
        let (parts, body) = req.into_parts();
        let body = match read_limited(body, self.max_body_size).await {
            Ok(body) => body,
            Err(err) => {
                debug!(error = %err, "client body rejected");
                return err.into();
            }
        };

        let mut peer = match self.pool.select_peer().await {
            Ok(peer) => peer,
            Err(err) => return self.routing_error(err, "peer_not_found"),
        };

        let mut retried = false;
        loop {
            match self.proxy.forward(&peer, &parts, body.clone(), remote).await {
                Ok(response) => return self.relay(peer, &parts, body.len(), response),
                Err(err) => {
                    self.charge_failure(&peer, &err.to_string());
                    if !self.retry || retried {
                        return err.into();
                    }
                    retried = true;

                    let excluded = Some(peer.address.as_str());
                    let alternate = self.pool.select_peer_excluding(excluded).await;
                    match alternate {
                        Ok(next) => {
                            debug!(
                                failed = %peer.address,
                                next = %next.address,
                                "retrying on alternate peer"
                            );
                            peer = next;
                        }
                        Err(_) => return err.into(),
                    }
                }
            }
        }
    }

    /// Streams the peer's answer to the client. Stats are recorded once
    /// the body has been relayed; a body that breaks off counts against
    /// the peer.
    fn relay(
        &self,
        peer: Arc<Peer>,
        parts: &request::Parts,
        recv_bytes: usize,
        response: ProxiedResponse,
    ) -> Response<Body> {
        let status = response.status().as_u16();
        debug!(peer = %peer.address, status, "proxied");

        let method = parts.method.to_string();
        let path = parts.uri.path().to_string();
        let recv_bytes = recv_bytes as u64;
        let vserver = self.name.clone();
        let metrics = self.metrics.clone();

        response.into_response(self.proxy.timeout(), move |end| match end {
            BodyEnd::Complete(sent) | BodyEnd::Interrupted(sent) => {
                peer.record_success(status, &method, &path, recv_bytes, sent);
                if let Some(metrics) = &metrics {
                    metrics.record_request(&vserver, &peer.address, status);
                }
            }
            BodyEnd::Failed(error) => {
                peer.record_failure();
                warn!(
                    vserver = %vserver,
                    peer = %peer.address,
                    fails = peer.fails(),
                    %error,
                    "response body failed"
                );
                if let Some(metrics) = &metrics {
                    metrics.record_peer_failure(&vserver, &peer.address);
                }
            }
        })
    }

    fn charge_failure(&self, peer: &Peer, error: &str) {
        peer.record_failure();
        warn!(peer = %peer.address, fails = peer.fails(), %error, "round trip failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_peer_failure(&self.name, &peer.address);
        }
    }

    fn routing_error(&self, err: ProxyError, reason: &str) -> Response<Body> {
        if let Some(metrics) = &self.metrics {
            metrics.record_routing_error(&self.name, reason);
        }
        err.into()
    }

    fn accepts_host(&self, req: &Request<Body>) -> bool {
        let server_name = self.server_name.load();
        if server_name.as_str() == DEFAULT_SERVER_NAME {
            return true;
        }

        let host = req
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| req.uri().host());
        host.map_or(false, |host| host_matches(host, &server_name))
    }

    async fn refresh_pool_size(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.update_pool_size(&self.name, self.pool.size().await);
        }
    }
}

/// Compares the host part of a Host value, port removed, against a server name.
pub fn host_matches(host: &str, server_name: &str) -> bool {
    strip_port(host).eq_ignore_ascii_case(server_name)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if port.parse::<u16>().is_ok() && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    }
}

fn existing_file(kind: &'static str, path: &str) -> Result<PathBuf, ConfigError> {
    let path = Path::new(path);
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(ConfigError::TlsFileMissing {
            kind,
            path: path.to_path_buf(),
        });
    }
    Ok(path.to_path_buf())
}
