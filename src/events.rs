//! Lifecycle and health events
//!
//! Every component publishes what happens to the cluster through an
//! [`EventBus`]. Observers (logging, metrics) subscribe to it and never
//! touch core state: events are notifications, not hooks.
//!
//! The bus is a `tokio::sync::broadcast` channel, so a slow observer only
//! loses events (it sees `Lagged`) and never blocks the proxy.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::lb::Member;

/// Default number of events buffered per subscriber
pub const DEFAULT_CAPACITY: usize = 1024;

/// Everything the proxy reports to observers
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// A member registered (or re-registered)
    NodeRegister(Arc<Member>),
    /// A member was removed from the cluster
    NodeUnregister(Arc<Member>),
    /// A member missed its ping window and went offline
    NodeTimeout(Arc<Member>),
    /// A member pinged
    NodePing(Arc<Member>),
    /// Forwarding a request to a member failed
    NodeError { member: Arc<Member>, error: String },
    /// The whole cluster reached its connection capacity
    ClusterFull,
    /// The cluster dropped back below capacity after being full
    ClusterNormal,
    /// Utilization is at or above the critical percentage
    ClusterWarning(u32),
    /// A request was delivered to a member
    Redirect(Arc<Member>),
}

impl ProxyEvent {
    /// Event name as observers know it
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::NodeRegister(_) => "node.register",
            ProxyEvent::NodeUnregister(_) => "node.unregister",
            ProxyEvent::NodeTimeout(_) => "node.timeout",
            ProxyEvent::NodePing(_) => "node.ping",
            ProxyEvent::NodeError { .. } => "node.error",
            ProxyEvent::ClusterFull => "cluster.full",
            ProxyEvent::ClusterNormal => "cluster.normal",
            ProxyEvent::ClusterWarning(_) => "cluster.warning",
            ProxyEvent::Redirect(_) => "redirect",
        }
    }

    /// The member this event is about, if any
    pub fn member(&self) -> Option<&Arc<Member>> {
        match self {
            ProxyEvent::NodeRegister(m)
            | ProxyEvent::NodeUnregister(m)
            | ProxyEvent::NodeTimeout(m)
            | ProxyEvent::NodePing(m)
            | ProxyEvent::Redirect(m)
            | ProxyEvent::NodeError { member: m, .. } => Some(m),
            ProxyEvent::ClusterFull | ProxyEvent::ClusterNormal | ProxyEvent::ClusterWarning(_) => {
                None
            }
        }
    }
}

/// Publish/subscribe surface shared by the cluster and the proxy.
///
/// Clone is cheap, all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.sender.subscribe()
    }

    /// Whether anyone is listening. Lets publishers skip building events
    /// nobody will see.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Render every event through tracing until the bus closes
pub async fn log_events(mut events: broadcast::Receiver<ProxyEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger lagging behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &ProxyEvent) {
    let name = event.name();
    match event {
        ProxyEvent::NodeRegister(m) => {
            info!(event = name, member = %m.id(), addr = %m.address(), "node registered")
        }
        ProxyEvent::NodeUnregister(m) => {
            info!(event = name, member = %m.id(), addr = %m.address(), "node unregistered")
        }
        ProxyEvent::NodeTimeout(m) => {
            warn!(event = name, member = %m.id(), addr = %m.address(), "node timed out")
        }
        ProxyEvent::NodePing(m) => trace!(event = name, member = %m.id(), "ping"),
        ProxyEvent::NodeError { member, error } => {
            warn!(event = name, member = %member.id(), addr = %member.address(), error = %error, "node error")
        }
        ProxyEvent::ClusterFull => warn!(event = name, "cluster full"),
        ProxyEvent::ClusterNormal => info!(event = name, "cluster back to normal"),
        ProxyEvent::ClusterWarning(percentage) => {
            warn!(event = name, percentage, "cluster load critical")
        }
        ProxyEvent::Redirect(m) => debug!(event = name, member = %m.id(), "redirected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_event_names() {
        assert_eq!(ProxyEvent::ClusterFull.name(), "cluster.full");
        assert_eq!(ProxyEvent::ClusterNormal.name(), "cluster.normal");
        assert_eq!(ProxyEvent::ClusterWarning(95).name(), "cluster.warning");
        assert!(ProxyEvent::ClusterWarning(95).member().is_none());
    }

    #[test]
    fn test_member_events_expose_member() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let member = Arc::new(Member::new("localhost", 4001, None, tx));
        let event = ProxyEvent::NodeError {
            member: Arc::clone(&member),
            error: "refused".to_string(),
        };
        assert_eq!(event.name(), "node.error");
        assert!(Arc::ptr_eq(event.member().unwrap(), &member));
    }

    #[test]
    fn test_subscriber_tracking() {
        let bus = EventBus::default();
        assert!(!bus.has_subscribers());
        // Publishing without subscribers is fine
        bus.emit(ProxyEvent::ClusterFull);

        let rx = bus.subscribe();
        assert!(bus.has_subscribers());
        drop(rx);
        assert!(!bus.has_subscribers());
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.clone().subscribe();

        bus.emit(ProxyEvent::ClusterWarning(91));

        assert!(matches!(a.recv().await.unwrap(), ProxyEvent::ClusterWarning(91)));
        assert!(matches!(b.recv().await.unwrap(), ProxyEvent::ClusterWarning(91)));
    }

    #[tokio::test]
    async fn test_log_events_stops_when_bus_closes() {
        let bus = EventBus::new(8);
        let logger = tokio::spawn(log_events(bus.subscribe()));
        bus.emit(ProxyEvent::ClusterNormal);
        drop(bus);
        logger.await.unwrap();
    }
}
