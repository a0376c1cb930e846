use anyhow::{Context, Result};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::body::{empty_body, full_body, BoxBody, BoxError, MonitoredBody};
use crate::config::ProxyConfig;
use crate::core::Core;
use crate::events::{EventBus, ProxyEvent};
use crate::lb::{Cluster, Member};

/// Why a single forwarding attempt to a member failed
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("upstream error: {0}")]
    Upstream(#[source] hyper::Error),
}

/// Produces the response for a request no member can take.
///
/// Installing one replaces the built-in 503 page. Any async function or
/// closure with the right shape works:
///
/// ```rust,no_run
/// # use blastproxy::proxy::{full_body, BoxBody};
/// # use hyper::{Request, Response};
/// async fn busy(_req: Request<BoxBody>) -> Response<BoxBody> {
///     Response::new(full_body("come back later"))
/// }
/// ```
pub trait UnavailableHandler: Send + Sync + 'static {
    fn handle(&self, req: Request<BoxBody>) -> BoxFuture<'static, Response<BoxBody>>;
}

impl<F, Fut> UnavailableHandler for F
where
    F: Fn(Request<BoxBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<BoxBody>> + Send + 'static,
{
    fn handle(&self, req: Request<BoxBody>) -> BoxFuture<'static, Response<BoxBody>> {
        Box::pin(self(req))
    }
}

/// A failed attempt, with the request handed back when it can be sent again
struct Failure {
    error: ForwardError,
    request: Option<Request<BoxBody>>,
}

impl Failure {
    fn returning(error: ForwardError, request: Request<BoxBody>) -> Self {
        Self {
            error,
            request: Some(request),
        }
    }
}

/// Head of a bodiless request, kept so the request can be rebuilt after
/// hyper has consumed the original
struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl RequestHead {
    fn of(req: &Request<BoxBody>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }

    fn rebuild(&self) -> Request<BoxBody> {
        let mut req = Request::new(empty_body());
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        req
    }
}

/// The public-facing reverse proxy
pub struct ProxyServer {
    cluster: Arc<Cluster>,
    events: EventBus,
    config: ProxyConfig,
    unavailable: Option<Arc<dyn UnavailableHandler>>,
}

impl ProxyServer {
    /// Create a proxy server routing to the core's cluster
    pub fn new(core: &Core) -> Self {
        Self {
            cluster: Arc::clone(&core.cluster),
            events: core.events.clone(),
            config: core.config.proxy.clone(),
            unavailable: None,
        }
    }

    /// Answer unroutable requests with `handler` instead of the 503 page
    pub fn with_unavailable_handler(mut self, handler: impl UnavailableHandler) -> Self {
        self.unavailable = Some(Arc::new(handler));
        self
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(self) -> Result<()> {
        let listen = self.config.listen_addr();
        let addr: SocketAddr = listen
            .parse()
            .context(format!("Invalid listen address: {}", listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        self.serve(listener).await
    }

    /// Serve proxied traffic on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            sticky_session = self.config.sticky_session,
            timeout_ms = self.config.timeout_ms,
            "proxy listening"
        );

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req: Request<Incoming>| {
                    let server = Arc::clone(&server);
                    async move {
                        let req = req.map(|body| body.map_err(BoxError::from).boxed());
                        Ok::<_, Infallible>(server.handle(req).await)
                    }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    debug!(remote = %remote_addr, error = %e, "client connection closed");
                }
            });
        }
    }

    /// Route one request to a member, failing over to the next eligible
    /// member until one answers or none is left.
    ///
    /// Selection reserves one of the member's redirects. An attempt that
    /// fails before a response head arrives gives the reservation back;
    /// a response that breaks while streaming stays counted.
    pub async fn handle(&self, req: Request<BoxBody>) -> Response<BoxBody> {
        let sticky = if self.config.sticky_session {
            sticky_member_id(req.headers(), &self.config.cookie)
        } else {
            None
        };

        let mut req = origin_form(req);
        let replay = req.body().is_end_stream().then(|| RequestHead::of(&req));

        loop {
            let Some(member) = self.cluster.select_member(sticky.as_deref()) else {
                return self.unavailable(req).await;
            };

            match self.forward(&member, req).await {
                Ok((response, driver)) => return self.relay(member, response, driver),
                Err(failure) => {
                    member.release_redirect();
                    member.mark_offline();
                    warn!(
                        member = %member.id(),
                        addr = %member.address(),
                        error = %failure.error,
                        "forwarding to member failed"
                    );
                    self.events.emit(ProxyEvent::NodeError {
                        member: Arc::clone(&member),
                        error: failure.error.to_string(),
                    });

                    req = match (failure.request, &replay) {
                        (Some(returned), _) => returned,
                        (None, Some(head)) => head.rebuild(),
                        (None, None) => {
                            debug!("request body already consumed, cannot retry");
                            return bad_gateway();
                        }
                    };
                }
            }
        }
    }

    /// One attempt against one member: connect, hand over the request and
    /// wait for the response head. The connection task is returned with
    /// the response so a stalled body can close it.
    async fn forward(
        &self,
        member: &Member,
        req: Request<BoxBody>,
    ) -> std::result::Result<(Response<Incoming>, AbortHandle), Failure> {
        let timeout = self.config.timeout();
        let addr = member.address();

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Failure::returning(ForwardError::Connect(e), req)),
            Err(_) => return Err(Failure::returning(ForwardError::Timeout(timeout), req)),
        };

        let (mut sender, conn) = match client_http1::handshake(TokioIo::new(stream)).await {
            Ok(parts) => parts,
            Err(e) => return Err(Failure::returning(ForwardError::Handshake(e), req)),
        };

        let member_id = member.id().to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(member = %member_id, error = %e, "member connection closed with error");
            }
        });

        debug!(member = %member.id(), method = %req.method(), uri = %req.uri(), "forwarding");

        match tokio::time::timeout(timeout, sender.try_send_request(req)).await {
            Ok(Ok(response)) => Ok((response, driver.abort_handle())),
            Ok(Err(mut e)) => {
                let request = e.take_message();
                Err(Failure {
                    error: ForwardError::Upstream(e.into_error()),
                    request,
                })
            }
            Err(_) => {
                driver.abort();
                Err(Failure {
                    error: ForwardError::Timeout(timeout),
                    request: None,
                })
            }
        }
    }

    /// Stream the member's response back under the idle timeout
    fn relay(
        &self,
        member: Arc<Member>,
        response: Response<Incoming>,
        driver: AbortHandle,
    ) -> Response<BoxBody> {
        if self.events.has_subscribers() {
            self.events.emit(ProxyEvent::Redirect(Arc::clone(&member)));
        }

        let (mut parts, body) = response.into_parts();
        if self.config.sticky_session {
            let cookie = format!("{}={}", self.config.cookie, member.id());
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                parts.headers.append(SET_COOKIE, value);
            }
        }

        let body = MonitoredBody::new(body, member, self.events.clone(), self.config.timeout())
            .with_driver(driver)
            .boxed();
        Response::from_parts(parts, body)
    }

    async fn unavailable(&self, req: Request<BoxBody>) -> Response<BoxBody> {
        debug!(method = %req.method(), uri = %req.uri(), "no member available");
        match &self.unavailable {
            Some(handler) => handler.handle(req).await,
            None => unavailable_page(),
        }
    }
}

/// Member id carried by the sticky-session cookie, if the client sent one
pub fn sticky_member_id(headers: &HeaderMap, cookie: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Members are addressed directly, so only path and query go upstream
fn origin_form(req: Request<BoxBody>) -> Request<BoxBody> {
    let (mut parts, body) = req.into_parts();
    parts.uri = match parts.uri.path_and_query() {
        Some(pq) => Uri::from(pq.clone()),
        None => Uri::from_static("/"),
    };
    Request::from_parts(parts, body)
}

/// The built-in page for requests no member can take
pub fn unavailable_page() -> Response<BoxBody> {
    let html = format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><title>Error 503 - Service Unavailable</title></head>\n\
         <body>\n\
         <h1>Error 503 - Service Unavailable</h1>\n\
         <p>No server is available to handle this request.</p>\n\
         <hr>\n\
         <address>{}/{}</address>\n\
         </body>\n\
         </html>\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    let mut response = Response::new(full_body(html));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

fn bad_gateway() -> Response<BoxBody> {
    let mut response = Response::new(full_body("Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
