//! Backend-side registration agent
//!
//! Keeps one backend registered with a proxy: registers it, pings at the
//! interval the proxy asks for, registers again when the proxy has
//! forgotten it (for example after a restart) and unregisters on shutdown.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::config::NodeConfig;
use crate::protocol::{ControlReply, CODE_UNKNOWN_MEMBER, PING_PATH, REGISTER_PATH, UNREGISTER_PATH};

/// Time allowed for one control request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Node agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("Hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Invalid reply: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected status: {0}")]
    Status(StatusCode),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Proxy refused request: {message}")]
    Rejected { message: String, code: Option<u8> },
}

impl AgentError {
    /// The proxy does not know this member any more
    pub fn requires_registration(&self) -> bool {
        matches!(self, AgentError::Rejected { code: Some(CODE_UNKNOWN_MEMBER), .. })
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// What the proxy answered to a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSession {
    pub id: String,
    pub ping_interval: Duration,
}

/// Registers one backend with a proxy and keeps it alive
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct NodeAgent {
    client: HyperClient<HttpConnector, Full<Bytes>>,
    config: NodeConfig,
}

impl NodeAgent {
    pub fn new(config: NodeConfig) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_connect_timeout(Some(REQUEST_TIMEOUT));

        let client = HyperClient::builder(TokioExecutor::new()).build(http);

        Self { client, config }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Register the backend and learn its id and ping interval
    pub async fn register(&self) -> Result<NodeSession> {
        let mut fields = vec![
            ("hostname", self.config.hostname.clone()),
            ("port", self.config.port.to_string()),
        ];
        if let Some(connections) = self.config.connections {
            fields.push(("connections", connections.to_string()));
        }

        let reply = self.post(REGISTER_PATH, fields).await?;
        let id = reply
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| <serde_json::Error as serde::de::Error>::missing_field("id"))?;
        let ping_interval = Duration::from_secs(reply.ping.unwrap_or(1).max(1));

        info!(
            member = %id,
            proxy = %self.config.proxy_url(),
            ping_secs = ping_interval.as_secs(),
            "registered with proxy"
        );
        Ok(NodeSession { id, ping_interval })
    }

    pub async fn ping(&self, id: &str) -> Result<()> {
        self.post(PING_PATH, vec![("id", id.to_string())]).await?;
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.post(UNREGISTER_PATH, vec![("id", id.to_string())]).await?;
        info!(member = %id, "unregistered from proxy");
        Ok(())
    }

    /// Keep the backend registered until `shutdown` resolves, then
    /// unregister it.
    ///
    /// Registration failures are retried every `retry_delay`. A ping the
    /// proxy answers with "unknown member" registers again right away; any
    /// other ping failure registers again after `retry_delay`.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let retry_delay = self.config.retry_delay();
        let mut session: Option<NodeSession> = None;

        loop {
            let current = match session.take() {
                Some(current) => current,
                None => match self.register().await {
                    Ok(registered) => registered,
                    Err(e) => {
                        warn!(error = %e, retry_secs = retry_delay.as_secs(), "registration failed");
                        tokio::select! {
                            _ = &mut shutdown => return,
                            _ = sleep(retry_delay) => continue,
                        }
                    }
                },
            };

            tokio::select! {
                _ = &mut shutdown => {
                    if let Err(e) = self.unregister(&current.id).await {
                        warn!(member = %current.id, error = %e, "unregister failed");
                    }
                    return;
                }
                _ = sleep(current.ping_interval) => {}
            }

            match self.ping(&current.id).await {
                Ok(()) => {
                    debug!(member = %current.id, "ping acknowledged");
                    session = Some(current);
                }
                Err(e) if e.requires_registration() => {
                    info!(member = %current.id, "proxy lost track of this node, registering again");
                }
                Err(e) => {
                    warn!(member = %current.id, error = %e, retry_secs = retry_delay.as_secs(), "ping failed");
                    tokio::select! {
                        _ = &mut shutdown => return,
                        _ = sleep(retry_delay) => {}
                    }
                }
            }
        }
    }

    /// POST a form to the control channel. The key travels both as a
    /// query parameter and as a form field.
    async fn post(&self, path: &str, mut fields: Vec<(&str, String)>) -> Result<ControlReply> {
        let mut uri = format!("{}{}", self.config.proxy_url(), path);
        if let Some(key) = &self.config.key {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair("key", key)
                .finish();
            uri.push('?');
            uri.push_str(&query);
            fields.push(("key", key.clone()));
        }

        let form = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (*k, v.as_str())))
            .finish();

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form)))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| AgentError::Timeout(REQUEST_TIMEOUT))??;

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(AgentError::Status(status));
        }

        let reply: ControlReply = serde_json::from_slice(&body)?;
        if !reply.is_success() {
            return Err(AgentError::Rejected {
                message: reply.message.unwrap_or_default(),
                code: reply.code,
            });
        }
        Ok(reply)
    }
}
