//! Backend side of the cluster
//!
//! [`NodeAgent`] runs next to a backend HTTP server and keeps it
//! registered with the proxy's control channel.

mod agent;

pub use agent::{AgentError, NodeAgent, NodeSession};
