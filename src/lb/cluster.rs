use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};

use super::member::{Member, MemberSignal, SignalKind};
use crate::config::ClusterConfig;
use crate::events::{EventBus, ProxyEvent};
use crate::protocol::{ControlError, RegisterForm};

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Fingerprint of the member's address
    pub id: String,
    /// How often the member must ping
    pub ping_interval: Duration,
}

/// Aggregate load measured by one supervisor tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterLoad {
    /// Redirects across all members since the previous tick
    pub current: u64,
    /// Summed connection caps, None when the cluster has no ceiling
    pub capacity: Option<u64>,
    /// `current` as a rounded percentage of `capacity`
    pub percentage: Option<u32>,
}

#[derive(Default)]
struct ClusterState {
    /// Live members in registration order
    members: Vec<Arc<Member>>,
    /// Where the next round-robin scan starts
    cursor: usize,
    /// Latched once `cluster.full` fires, cleared by `cluster.normal`
    full: bool,
}

/// Registry of members plus the selection and supervision logic.
///
/// Every mutation of the member list happens under one lock, so
/// registration, removal, selection and the supervisor tick never
/// interleave. Member timers report back through a channel that the
/// cluster loop ([`Cluster::spawn`]) drains one signal at a time.
pub struct Cluster {
    config: ClusterConfig,
    events: EventBus,
    state: Mutex<ClusterState>,
    signals: UnboundedSender<MemberSignal>,
    inbox: Mutex<Option<UnboundedReceiver<MemberSignal>>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, events: EventBus) -> Self {
        let (signals, inbox) = mpsc::unbounded_channel();
        Self {
            config,
            events,
            state: Mutex::new(ClusterState::default()),
            signals,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Check a control request's key against the configured one.
    /// Always passes when the cluster has no key.
    pub fn authorize(&self, key: Option<&str>) -> Result<(), ControlError> {
        match self.config.key.as_deref() {
            None => Ok(()),
            Some(expected) if key == Some(expected) => Ok(()),
            Some(_) => Err(ControlError::InvalidAuthentication),
        }
    }

    /// Register a member, replacing any member with the same address.
    ///
    /// The replaced member is destroyed before the new one is armed so its
    /// timers can no longer fire.
    pub fn register(&self, form: &RegisterForm) -> Result<Registration, ControlError> {
        let (hostname, port, max_connections) = form.validate()?;
        let member = Arc::new(Member::new(
            hostname,
            port,
            max_connections,
            self.signals.clone(),
        ));

        let replaced = {
            let mut state = self.state.lock();
            let slot = state.members.iter_mut().find(|m| m.id() == member.id());
            let replaced = match slot {
                Some(slot) => {
                    slot.destroy();
                    *slot = Arc::clone(&member);
                    true
                }
                None => {
                    state.members.push(Arc::clone(&member));
                    false
                }
            };
            member.supervise(self.config.health_timers());
            replaced
        };

        debug!(
            member = %member.id(),
            addr = %member.address(),
            max_connections = ?member.max_connections(),
            replaced,
            "member registered"
        );
        self.events.emit(ProxyEvent::NodeRegister(Arc::clone(&member)));

        Ok(Registration {
            id: member.id().to_string(),
            ping_interval: Duration::from_secs(self.config.ping_interval_secs()),
        })
    }

    /// Handle a ping from a member. An unknown id tells the member to
    /// register again.
    pub fn ping(&self, id: Option<&str>) -> Result<(), ControlError> {
        let id = id.ok_or(ControlError::MissingNodeId)?;
        let member = self
            .get_member(id)
            .ok_or_else(|| ControlError::UnknownMember(id.to_string()))?;
        member.on_ping(self.config.timeout());
        Ok(())
    }

    /// Remove a member by id (explicit unregister from the member itself)
    pub fn unregister_id(&self, id: Option<&str>) -> Result<(), ControlError> {
        let id = id.ok_or(ControlError::MissingNodeId)?;
        let member = self
            .get_member(id)
            .ok_or_else(|| ControlError::UnknownMember(id.to_string()))?;
        self.unregister(&member);
        Ok(())
    }

    /// Remove a member from the live set and destroy it.
    ///
    /// Returns false if the member was already destroyed, so a member is
    /// unregistered at most once.
    pub fn unregister(&self, member: &Arc<Member>) -> bool {
        {
            let mut state = self.state.lock();
            if !member.destroy() {
                return false;
            }
            if let Some(idx) = state.members.iter().position(|m| Arc::ptr_eq(m, member)) {
                state.members.remove(idx);
                if idx < state.cursor {
                    state.cursor -= 1;
                }
            }
        }

        debug!(member = %member.id(), addr = %member.address(), "member unregistered");
        self.events.emit(ProxyEvent::NodeUnregister(Arc::clone(member)));
        true
    }

    /// Look up a live member by id
    pub fn get_member(&self, id: &str) -> Option<Arc<Member>> {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    /// Snapshot of the live members in registration order
    pub fn members(&self) -> Vec<Arc<Member>> {
        self.state.lock().members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Pick the member for a request and reserve one of its redirects.
    ///
    /// A sticky member that can still take requests wins without touching
    /// the rotation. Otherwise the members are scanned round-robin from
    /// the cursor, wrapping once, and the cursor moves past the pick.
    /// The returned member's `redirects` already counts this request.
    pub fn select_member(&self, sticky: Option<&str>) -> Option<Arc<Member>> {
        let mut state = self.state.lock();

        if let Some(id) = sticky {
            if let Some(member) = state.members.iter().find(|m| m.id() == id) {
                if member.try_reserve() {
                    return Some(Arc::clone(member));
                }
            }
        }

        let len = state.members.len();
        if len == 0 {
            return None;
        }
        let start = state.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if state.members[idx].try_reserve() {
                state.cursor = idx + 1;
                return Some(Arc::clone(&state.members[idx]));
            }
        }
        None
    }

    /// One supervisor pass: measure and reset every member's redirect
    /// counter, then fire capacity events.
    ///
    /// `cluster.full` and `cluster.normal` fire on transitions only.
    /// `cluster.warning` fires on every tick while utilization sits between
    /// the critical percentage and 100. Without a ceiling (no members, or
    /// any member uncapped) only the counters are reset.
    pub fn supervise(&self) -> ClusterLoad {
        let mut fired = Vec::new();
        let load = {
            let mut state = self.state.lock();
            let mut current = 0u64;
            let mut capacity = Some(0u64);
            for member in &state.members {
                current += u64::from(member.take_redirects());
                capacity = match (capacity, member.max_connections()) {
                    (Some(sum), Some(max)) => Some(sum + u64::from(max)),
                    _ => None,
                };
            }
            let capacity = capacity.filter(|c| *c > 0);
            let percentage = capacity.map(|cap| percentage(current, cap));

            if let (Some(cap), Some(pct)) = (capacity, percentage) {
                if current >= cap {
                    if !state.full {
                        state.full = true;
                        fired.push(ProxyEvent::ClusterFull);
                    }
                } else if state.full {
                    state.full = false;
                    fired.push(ProxyEvent::ClusterNormal);
                }
                if pct >= self.config.critical && pct < 100 {
                    fired.push(ProxyEvent::ClusterWarning(pct));
                }
            }

            ClusterLoad {
                current,
                capacity,
                percentage,
            }
        };

        trace!(
            current = load.current,
            capacity = ?load.capacity,
            percentage = ?load.percentage,
            "supervisor tick"
        );
        for event in fired {
            self.events.emit(event);
        }
        load
    }

    /// React to something a member's timers observed
    pub fn handle_signal(&self, signal: MemberSignal) {
        let MemberSignal { member, kind } = signal;
        if member.is_destroyed() {
            return;
        }
        match kind {
            SignalKind::Ping => {
                self.events.emit(ProxyEvent::NodePing(member));
            }
            SignalKind::Timeout => {
                debug!(member = %member.id(), "member missed its ping window");
                self.events.emit(ProxyEvent::NodeTimeout(member));
            }
            SignalKind::Expire => {
                debug!(member = %member.id(), fails = member.fails(), "member expired");
                self.unregister(&member);
            }
        }
    }

    /// Start the cluster loop: supervisor ticks and member signals, one
    /// at a time. Only the first call starts a loop.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cluster = Arc::clone(self);
        tokio::spawn(async move { cluster.run().await })
    }

    async fn run(self: Arc<Self>) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!("cluster loop already running");
            return;
        };

        let period = self.config.supervisor_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        info!(
            supervisor_secs = period.as_secs(),
            timeout_secs = self.config.timeout,
            fails = self.config.fails,
            "cluster supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.supervise();
                }
                signal = inbox.recv() => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => break,
                },
            }
        }
    }
}

/// `round(current * 100 / capacity)`, halves rounded up
fn percentage(current: u64, capacity: u64) -> u32 {
    let pct = (current * 200 + capacity) / (capacity * 2);
    u32::try_from(pct).unwrap_or(u32::MAX)
}
