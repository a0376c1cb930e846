use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::cluster::Cluster;
use crate::protocol::{
    parse_form, ControlError, ControlReply, RegisterForm, PING_PATH, REGISTER_PATH,
    UNREGISTER_PATH,
};
use crate::proxy::{full_body, BoxBody};

/// Largest control request body accepted
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The private HTTP endpoint members register and ping through
pub struct ControlServer {
    cluster: Arc<Cluster>,
    listen: String,
}

impl ControlServer {
    pub fn new(cluster: Arc<Cluster>, listen: String) -> Self {
        Self { cluster, listen }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid control listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind control channel to {}", addr))?;

        self.serve(listener).await
    }

    /// Serve control requests on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            authenticated = self.cluster.config().key.is_some(),
            "control channel listening"
        );

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(remote = %remote_addr, error = %e, "control connection closed");
                }
            });
        }
    }

    /// Answer one control request. Every outcome, errors included, is a
    /// JSON reply.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req
            .uri()
            .query()
            .map(|q| parse_form(q.as_bytes()))
            .unwrap_or_default();

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(path = %path, error = %e, "control request body rejected");
                return reply(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &ControlReply::from(&ControlError::InvalidRequest),
                );
            }
        };
        let fields = parse_form(&body);

        match self.dispatch(&method, &path, &query, &fields) {
            Ok(reply_body) => reply(StatusCode::OK, &reply_body),
            Err(err) => {
                debug!(path = %path, error = %err, "control request refused");
                reply(StatusCode::OK, &ControlReply::from(&err))
            }
        }
    }

    fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: &HashMap<String, String>,
        fields: &HashMap<String, String>,
    ) -> Result<ControlReply, ControlError> {
        let key = query.get("key").or_else(|| fields.get("key"));
        self.cluster.authorize(key.map(String::as_str))?;

        let id = fields.get("id").or_else(|| query.get("id")).map(String::as_str);

        match path {
            REGISTER_PATH => {
                if method != Method::POST {
                    return Err(ControlError::InvalidMethod);
                }
                let registration = self.cluster.register(&RegisterForm::from_fields(fields))?;
                Ok(ControlReply::registered(
                    registration.id,
                    registration.ping_interval.as_secs(),
                ))
            }
            PING_PATH => {
                self.cluster.ping(id)?;
                Ok(ControlReply::success())
            }
            UNREGISTER_PATH => {
                self.cluster.unregister_id(id)?;
                Ok(ControlReply::success())
            }
            _ => Err(ControlError::InvalidRequest),
        }
    }
}

fn reply(status: StatusCode, body: &ControlReply) -> Response<BoxBody> {
    // Serializing a struct of strings and integers cannot fail
    let json = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(full_body(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::events::EventBus;
    use http_body_util::Full;

    fn server(key: Option<&str>) -> ControlServer {
        let config = ClusterConfig {
            key: key.map(str::to_string),
            ..Default::default()
        };
        let cluster = Arc::new(Cluster::new(config, EventBus::default()));
        ControlServer::new(cluster, "127.0.0.1:0".to_string())
    }

    fn post(uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn call(server: &ControlServer, req: Request<Full<Bytes>>) -> (StatusCode, ControlReply) {
        let response = server.handle(req).await;
        let status = response.status();
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_ping() {
        let server = server(None);
        let (status, reply) = call(&server, post("/register", "hostname=localhost&port=5000")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(reply.is_success());
        assert_eq!(reply.ping, Some(1));
        let id = reply.id.unwrap();
        assert_eq!(id, crate::lb::fingerprint("localhost", 5000));

        let (_, reply) = call(&server, post("/ping", &format!("id={}", id))).await;
        assert_eq!(reply, ControlReply::success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_requires_post() {
        let server = server(None);
        let req = Request::builder()
            .uri("/register?hostname=localhost&port=5000")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (_, reply) = call(&server, req).await;
        assert_eq!(reply.message.as_deref(), Some("Invalid method."));
        assert_eq!(server.cluster.member_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_requests() {
        let server = server(None);

        let (_, reply) = call(&server, post("/ping", "")).await;
        assert_eq!(reply.message.as_deref(), Some("Node ID is required."));

        let (_, reply) = call(&server, post("/ping", "id=unknown")).await;
        assert_eq!(reply.message.as_deref(), Some("Node was not previously registered"));
        assert_eq!(reply.code, Some(1));

        let (_, reply) = call(&server, post("/nothing", "")).await;
        assert_eq!(reply.message.as_deref(), Some("Invalid request."));

        let (_, reply) = call(&server, post("/register", "hostname=h&port=x")).await;
        assert_eq!(reply.message.as_deref(), Some("Invalid post data."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_from_query_or_form() {
        let server = server(Some("secret"));

        let (_, reply) = call(&server, post("/register", "hostname=h&port=1")).await;
        assert_eq!(reply.message.as_deref(), Some("Invalid authentication."));
        assert_eq!(server.cluster.member_count(), 0);

        let (_, reply) = call(&server, post("/register", "hostname=h&port=1&key=nope")).await;
        assert!(!reply.is_success());

        let (_, reply) = call(&server, post("/register?key=secret", "hostname=h&port=1")).await;
        assert!(reply.is_success());

        let (_, reply) = call(&server, post("/register", "hostname=h&port=2&key=secret")).await;
        assert!(reply.is_success());
        assert_eq!(server.cluster.member_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister() {
        let server = server(None);
        let (_, reply) = call(&server, post("/register", "hostname=h&port=1")).await;
        let id = reply.id.unwrap();

        let (_, reply) = call(&server, post("/unregister", &format!("id={}", id))).await;
        assert!(reply.is_success());
        assert_eq!(server.cluster.member_count(), 0);

        let (_, reply) = call(&server, post("/unregister", &format!("id={}", id))).await;
        assert_eq!(reply.code, Some(1));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = server(None);
        let big = "a".repeat(MAX_BODY_BYTES + 1);
        let (status, reply) = call(&server, post("/register", &big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(reply.message.as_deref(), Some("Invalid request."));
    }
}
