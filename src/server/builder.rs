// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::metrics::MetricsCollector;
use crate::server::handler::RequestHandler;
use hyper::server::conn::Http;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

/// Assembles the accept loop of one virtual server.
pub struct ServerBuilder {
    name: String,
    listener: TcpListener,
    handler: RequestHandler,
    tls: Option<TlsAcceptor>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, listener: TcpListener, handler: RequestHandler) -> Self {
        Self {
            name: name.into(),
            listener,
            handler,
            tls: None,
            metrics: None,
        }
    }

    /// Terminate TLS on every accepted connection.
    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsCollector>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawns the accept loop. It runs until `shutdown` changes (or its
    /// sender is dropped), then drops the listener. Open connections are
    /// told to finish their in-flight request and close.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = tracing::info_span!("listener", vserver = %self.name);
        tokio::spawn(self.accept_loop(shutdown).instrument(span))
    }

    async fn accept_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_connection(stream, remote, shutdown.clone()),
                    Err(err) => {
                        tracing::error!(%err, "accept error");
                        // Avoid a hot loop on persistent errors such as fd exhaustion.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("listener closed");
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let svc = self.handler.for_connection(remote);
        let tls = self.tls.clone();
        let metrics = self.metrics.clone();
        let span = tracing::info_span!("connection", vserver = %self.name, %remote);

        // One Tokio task per connection.
        tokio::spawn(
            async move {
                if let Some(metrics) = &metrics {
                    metrics.increment_active_connections();
                }

                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_connection(stream, svc, shutdown).await,
                        Err(err) => {
                            tracing::debug!(%err, "TLS handshake failed");
                            Ok(())
                        }
                    },
                    None => serve_connection(stream, svc, shutdown).await,
                };
                if let Err(err) = result {
                    tracing::warn!(%err, "connection error");
                }

                if let Some(metrics) = &metrics {
                    metrics.decrement_active_connections();
                }
            }
            .instrument(span),
        );
    }
}

async fn serve_connection<S>(
    stream: S,
    svc: RequestHandler,
    mut shutdown: watch::Receiver<bool>,
) -> hyper::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = Http::new().serve_connection(stream, svc);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}
