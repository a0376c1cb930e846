//! blastproxy - HTTP load-balancing reverse proxy with self-registering backends

pub mod config;
pub mod core;
pub mod events;
pub mod lb;
pub mod node;
pub mod protocol;
pub mod proxy;

pub use core::Core;
pub use config::Config;
