//! Public reverse proxy
//!
//! Accepts any HTTP request, picks a member from the cluster and streams
//! the request and response through unmodified. A failed member is marked
//! offline and the request moves on to the next eligible member; when none
//! is left the request is answered by the unavailable handler or the
//! built-in 503 page.

mod body;
mod server;

pub use body::{empty_body, full_body, BoxBody, BoxError, IdleTimeout, MonitoredBody};
pub use server::{sticky_member_id, unavailable_page, ForwardError, ProxyServer, UnavailableHandler};

use anyhow::Result;
use crate::core::Core;
use crate::lb::ControlServer;

/// Run the whole proxy: cluster supervisor, control channel and public
/// listener.
///
/// Returns when either listener fails.
pub async fn run_server(core: &Core) -> Result<()> {
    let supervisor = core.cluster.spawn();

    let control = ControlServer::new(core.cluster.clone(), core.config.cluster.listen_addr());
    let proxy = ProxyServer::new(core);

    let result = tokio::try_join!(control.run(), proxy.run()).map(|_| ());
    supervisor.abort();
    result
}
