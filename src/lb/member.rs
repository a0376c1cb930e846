use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

/// Health timings a member supervises itself with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTimers {
    /// Maximum time between pings before the member is marked offline
    pub timeout: Duration,
    /// Number of offline fail-checks before the member expires
    pub fails: u32,
}

/// Something a member reports to the cluster that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// A real ping arrived
    Ping,
    /// No ping within the timeout window, member is now offline
    Timeout,
    /// Too many consecutive offline fail-checks, member must be removed
    Expire,
}

/// A signal from a member, delivered to the cluster event loop
#[derive(Debug, Clone)]
pub struct MemberSignal {
    pub member: Arc<Member>,
    pub kind: SignalKind,
}

#[derive(Default)]
struct MemberTimers {
    ping_timeout: Option<JoinHandle<()>>,
    fail_check: Option<JoinHandle<()>>,
}

impl MemberTimers {
    fn cancel(&mut self) {
        if let Some(handle) = self.ping_timeout.take() {
            handle.abort();
        }
        if let Some(handle) = self.fail_check.take() {
            handle.abort();
        }
    }
}

/// A registered backend the proxy can route requests to.
///
/// Counters and flags are atomics so the proxy can read them without
/// taking the registry lock. The member owns its two health timers and
/// reports what they observe through the signal channel handed to it by
/// the cluster.
pub struct Member {
    id: String,
    hostname: String,
    port: u16,
    /// Maximum redirects per supervisor cycle (None = unlimited)
    max_connections: Option<u32>,

    /// Requests routed to this member since the last supervisor reset
    redirects: AtomicU32,
    /// Consecutive fail-checks that found the member offline
    fails: AtomicU32,
    online: AtomicBool,
    destroyed: AtomicBool,

    timers: Mutex<MemberTimers>,
    signals: UnboundedSender<MemberSignal>,
}

impl Member {
    /// Create a member for the given address. It starts offline and
    /// unsupervised until [`Member::supervise`] is called.
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        max_connections: Option<u32>,
        signals: UnboundedSender<MemberSignal>,
    ) -> Self {
        let hostname = hostname.into();
        let id = fingerprint(&hostname, port);
        Self {
            id,
            hostname,
            port,
            max_connections,
            redirects: AtomicU32::new(0),
            fails: AtomicU32::new(0),
            online: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            timers: Mutex::new(MemberTimers::default()),
            signals,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_connections(&self) -> Option<u32> {
        self.max_connections
    }

    /// `host:port` suitable for opening a TCP connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn redirects(&self) -> u32 {
        self.redirects.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Check if this member can take another request.
    ///
    /// Returns false if it is offline, destroyed, or has used up its
    /// connections for the current supervisor cycle.
    pub fn can_redirect(&self) -> bool {
        if !self.is_online() || self.is_destroyed() {
            return false;
        }
        match self.max_connections {
            Some(max) => self.redirects() < max,
            None => true,
        }
    }

    /// Claim one of this member's redirects for the current cycle.
    ///
    /// The cap check and the increment are a single compare-exchange, so
    /// concurrent callers can never take the counter past the cap.
    pub fn try_reserve(&self) -> bool {
        if !self.is_online() || self.is_destroyed() {
            return false;
        }
        match self.max_connections {
            Some(max) => self
                .redirects
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok(),
            None => {
                self.redirects.fetch_add(1, Ordering::AcqRel);
                true
            }
        }
    }

    /// Give back a reservation whose forward attempt never reached the
    /// member. A supervisor reset in between leaves the counter at zero.
    pub fn release_redirect(&self) {
        let _ = self
            .redirects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    #[cfg(test)]
    pub(crate) fn record_redirect(&self) {
        self.redirects.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset the redirect counter, returning the count it held
    pub fn take_redirects(&self) -> u32 {
        self.redirects.swap(0, Ordering::Relaxed)
    }

    /// Mark the member offline right away (used after a failed forward).
    /// The next ping brings it back.
    pub fn mark_offline(&self) {
        self.online.store(false, Ordering::Release);
    }

    /// Arm the health state machine: restart the ping-timeout and, after
    /// half a timeout, start the recurring fail-check.
    ///
    /// Counts as the first ping but does not report it.
    pub fn supervise(self: &Arc<Self>, timers: HealthTimers) {
        let fail_check = tokio::spawn(fail_check(Arc::downgrade(self), timers));
        {
            let mut guard = self.timers.lock();
            if self.is_destroyed() {
                fail_check.abort();
                return;
            }
            if let Some(old) = guard.fail_check.replace(fail_check) {
                old.abort();
            }
        }
        self.ping(timers.timeout, true);
    }

    /// A ping arrived from the backend
    pub fn on_ping(self: &Arc<Self>, timeout: Duration) {
        self.ping(timeout, false);
    }

    fn ping(self: &Arc<Self>, timeout: Duration, first: bool) {
        let mut guard = self.timers.lock();
        if self.is_destroyed() {
            return;
        }
        self.fails.store(0, Ordering::Relaxed);
        self.online.store(true, Ordering::Release);
        if let Some(old) = guard.ping_timeout.take() {
            old.abort();
        }
        if !first {
            self.signal(SignalKind::Ping);
        }
        guard.ping_timeout = Some(tokio::spawn(ping_timeout(Arc::downgrade(self), timeout)));
    }

    /// Cancel both timers and mark the member destroyed.
    ///
    /// Returns true only for the call that actually destroyed it.
    pub fn destroy(&self) -> bool {
        let mut guard = self.timers.lock();
        guard.cancel();
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    fn signal(self: &Arc<Self>, kind: SignalKind) {
        // The receiver only disappears when the cluster is gone
        let _ = self.signals.send(MemberSignal {
            member: Arc::clone(self),
            kind,
        });
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.timers.get_mut().cancel();
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("max_connections", &self.max_connections)
            .field("redirects", &self.redirects())
            .field("fails", &self.fails())
            .field("online", &self.is_online())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Stable member id: md5 of the lowercased connection string
pub fn fingerprint(hostname: &str, port: u16) -> String {
    let connection = format!("http://{}:{}", hostname.to_lowercase(), port);
    format!("{:x}", md5::compute(connection.as_bytes()))
}

async fn ping_timeout(member: Weak<Member>, timeout: Duration) {
    sleep(timeout).await;
    let Some(member) = member.upgrade() else {
        return;
    };
    if member.is_destroyed() {
        return;
    }
    member.mark_offline();
    member.signal(SignalKind::Timeout);
}

async fn fail_check(member: Weak<Member>, timers: HealthTimers) {
    sleep(timers.timeout / 2).await;
    let mut ticker = interval_at(Instant::now() + timers.timeout, timers.timeout);
    loop {
        ticker.tick().await;
        let Some(member) = member.upgrade() else {
            return;
        };
        if member.is_destroyed() {
            return;
        }
        if !member.is_online() {
            member.fails.fetch_add(1, Ordering::Relaxed);
        }
        if member.fails() >= timers.fails {
            member.signal(SignalKind::Expire);
            return;
        }
    }
}
