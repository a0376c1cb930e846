use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant, Sleep};

use crate::events::{EventBus, ProxyEvent};
use crate::lb::Member;

/// Error type carried by every proxied body
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP body type used on every edge of the proxy
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Convert a string into a BoxBody
pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// A body with no data
pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// The member stopped sending its response body
#[derive(Debug, thiserror::Error)]
#[error("no data from member for {0:?}")]
pub struct IdleTimeout(pub Duration);

/// Response body from a member that reports the member as failed if the
/// stream breaks or goes quiet for longer than the idle timeout.
///
/// The response head is already on its way to the client by the time the
/// body is polled, so a failure here cannot be retried: the member is
/// marked offline and a single `node.error` is emitted, then the error is
/// passed on to hyper which aborts the client connection.
pub struct MonitoredBody<B = Incoming> {
    inner: B,
    member: Arc<Member>,
    events: EventBus,
    failed: bool,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    driver: Option<AbortHandle>,
}

impl<B> MonitoredBody<B> {
    /// Wrap `inner`, failing it when no frame arrives within `idle`
    pub fn new(inner: B, member: Arc<Member>, events: EventBus, idle: Duration) -> Self {
        Self {
            inner,
            member,
            events,
            failed: false,
            idle,
            deadline: Box::pin(sleep(idle)),
            driver: None,
        }
    }

    /// Task driving the member connection, aborted on idle timeout
    pub fn with_driver(mut self, driver: AbortHandle) -> Self {
        self.driver = Some(driver);
        self
    }

    fn fail(&mut self, err: &dyn fmt::Display) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.member.mark_offline();
        tracing::warn!(
            member = %self.member.id(),
            addr = %self.member.address(),
            error = %err,
            "response stream from member failed"
        );
        self.events.emit(ProxyEvent::NodeError {
            member: Arc::clone(&self.member),
            error: err.to_string(),
        });
    }
}

impl<B> Body for MonitoredBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.deadline.as_mut().reset(Instant::now() + this.idle);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                let err: BoxError = err.into();
                this.fail(&err);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    if let Some(driver) = this.driver.take() {
                        driver.abort();
                    }
                    let err: BoxError = Box::new(IdleTimeout(this.idle));
                    this.fail(&err);
                    Poll::Ready(Some(Err(err)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
