// src/proxy/body.rs
use futures::Stream;
use hyper::body::{Bytes, HttpBody};
use hyper::Body;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

use super::proxy::ProxyError;

/// Largest request body buffered for forwarding.
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// How a relayed response body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEnd {
    /// Every byte the peer sent was relayed.
    Complete(u64),
    /// The client went away first.
    Interrupted(u64),
    /// The peer failed or stalled mid-body.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error(transparent)]
    Upstream(#[from] hyper::Error),

    #[error("upstream body idle for {0:?}")]
    Idle(Duration),
}

type OnEnd = Box<dyn FnOnce(BodyEnd) + Send + Sync>;

/// Streams a peer's response body to the client, counting bytes.
///
/// `on_end` runs exactly once: when the last chunk is handed over, when
/// the peer errors or stays silent for `idle_timeout`, or on drop.
pub struct CountingBody {
    inner: Body,
    sent: u64,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    on_end: Option<OnEnd>,
}

impl CountingBody {
    pub fn new<F>(inner: Body, idle_timeout: Duration, on_end: F) -> Self
    where
        F: FnOnce(BodyEnd) + Send + Sync + 'static,
    {
        Self {
            inner,
            sent: 0,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            on_end: Some(Box::new(on_end)),
        }
    }

    pub fn into_body(self) -> Body {
        Body::wrap_stream(self)
    }

    fn finish(&mut self, end: BodyEnd) {
        if let Some(on_end) = self.on_end.take() {
            on_end(end);
        }
    }
}

impl Stream for CountingBody {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                // A sized body is done once its last byte arrives; report
                // before the client can see the end.
                if this.inner.is_end_stream() {
                    let sent = this.sent;
                    this.finish(BodyEnd::Complete(sent));
                } else {
                    let deadline = Instant::now() + this.idle_timeout;
                    this.idle.as_mut().reset(deadline);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(BodyEnd::Failed(err.to_string()));
                Poll::Ready(Some(Err(BodyError::Upstream(err))))
            }
            Poll::Ready(None) => {
                let sent = this.sent;
                this.finish(BodyEnd::Complete(sent));
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.on_end.is_some() && this.idle.as_mut().poll(cx).is_ready() {
                    let err = BodyError::Idle(this.idle_timeout);
                    this.finish(BodyEnd::Failed(err.to_string()));
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        let sent = self.sent;
        self.finish(BodyEnd::Interrupted(sent));
    }
}

/// Buffers a client body, refusing anything larger than `limit` bytes.
pub async fn read_limited(mut body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    if HttpBody::size_hint(&body).lower() > limit as u64 {
        return Err(ProxyError::PayloadTooLarge);
    }

    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        if buffer.len() + chunk.len() > limit {
            return Err(ProxyError::PayloadTooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}
