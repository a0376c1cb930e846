//! Cluster membership and load balancing
//!
//! Backends join the proxy dynamically through the control channel and
//! stay in the cluster only as long as they keep pinging.
//!
//! # Components
//!
//! - [`Member`]: one registered backend, with its own health timers
//! - [`Cluster`]: the registry of members, request routing and the
//!   periodic supervisor
//! - [`ControlServer`]: the HTTP endpoint members register and ping through
//!
//! # Member lifecycle
//!
//! A member comes online when it registers and goes offline when it misses
//! its ping window (`timeout`). Every `timeout` a fail-check counts how many
//! times in a row the member was found offline; once that reaches `fails`
//! the member is removed from the cluster. A ping brings an offline member
//! back and resets the count.
//!
//! # Routing
//!
//! Requests go round-robin over members that are online and still under
//! their per-cycle connection cap. With sticky sessions a client keeps
//! hitting the member named in its cookie while that member is eligible.
//! The supervisor resets the caps every `supervisor` seconds and reports
//! when the cluster runs full.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use blastproxy::config::ClusterConfig;
//! use blastproxy::events::EventBus;
//! use blastproxy::lb::Cluster;
//! use blastproxy::protocol::RegisterForm;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = Arc::new(Cluster::new(ClusterConfig::default(), EventBus::default()));
//! let supervisor = cluster.spawn();
//!
//! let registration = cluster.register(&RegisterForm {
//!     hostname: Some("10.0.0.5".to_string()),
//!     port: Some("4001".to_string()),
//!     connections: Some("1000".to_string()),
//!     ..Default::default()
//! })?;
//!
//! if let Some(member) = cluster.select_member(None) {
//!     println!("routing to {} ({})", member.address(), registration.id);
//! }
//! # supervisor.abort();
//! # Ok(())
//! # }
//! ```

mod cluster;
mod control;
mod member;

pub use cluster::{Cluster, ClusterLoad, Registration};
pub use control::{ControlServer, MAX_BODY_BYTES};
pub use member::{fingerprint, HealthTimers, Member, MemberSignal, SignalKind};
