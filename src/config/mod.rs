use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::lb::HealthTimers;

/// Public proxy listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// IP to bind the proxy to
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Port users connect to
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Per-request forwarding timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Route a user back to the same member via a cookie
    #[serde(default)]
    pub sticky_session: bool,

    /// Name of the sticky session cookie
    #[serde(default = "default_cookie")]
    pub cookie: String,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    3000
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_cookie() -> String {
    "nblast".to_string()
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_proxy_port(),
            timeout_ms: default_timeout_ms(),
            sticky_session: false,
            cookie: default_cookie(),
        }
    }
}

/// Registration channel and cluster supervision configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// IP that listens for member registrations
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Port members register and ping on
    #[serde(default = "default_cluster_port")]
    pub port: u16,

    /// Key every member must present. No authentication when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Seconds between pings before a member is marked offline
    #[serde(default = "default_cluster_timeout")]
    pub timeout: u64,

    /// Offline fail-checks allowed before a member is removed
    #[serde(default = "default_fails")]
    pub fails: u32,

    /// Seconds between supervisor ticks (connection counter resets)
    #[serde(default = "default_supervisor")]
    pub supervisor: u64,

    /// Utilization percentage that triggers cluster warnings
    #[serde(default = "default_critical")]
    pub critical: u32,
}

fn default_cluster_port() -> u16 {
    18755
}

fn default_cluster_timeout() -> u64 {
    3
}

fn default_fails() -> u32 {
    2
}

fn default_supervisor() -> u64 {
    60
}

fn default_critical() -> u32 {
    90
}

impl ClusterConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor)
    }

    /// Ping interval handed to members: half the timeout, at least a second
    pub fn ping_interval_secs(&self) -> u64 {
        (self.timeout / 2).max(1)
    }

    pub fn health_timers(&self) -> HealthTimers {
        HealthTimers {
            timeout: self.timeout(),
            fails: self.fails,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_cluster_port(),
            key: None,
            timeout: default_cluster_timeout(),
            fails: default_fails(),
            supervisor: default_supervisor(),
            critical: default_critical(),
        }
    }
}

/// Settings for running a backend's registration agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hostname of the proxy's registration channel
    #[serde(default = "default_hostname")]
    pub proxy_hostname: String,

    /// Port of the proxy's registration channel
    #[serde(default = "default_cluster_port")]
    pub proxy_port: u16,

    /// Registration key, if the proxy requires one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Hostname the proxy should forward users to
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Port the proxy should forward users to
    #[serde(default = "default_node_port")]
    pub port: u16,

    /// Maximum connections per supervisor cycle (None = unlimited)
    #[serde(default = "default_connections")]
    pub connections: Option<u32>,

    /// Seconds to wait before registering again after a failure
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_node_port() -> u16 {
    4001
}

fn default_connections() -> Option<u32> {
    Some(1000)
}

fn default_retry_delay() -> u64 {
    5
}

impl NodeConfig {
    /// Base URL of the proxy's control channel
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy_hostname, self.proxy_port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            proxy_hostname: default_hostname(),
            proxy_port: default_cluster_port(),
            key: None,
            hostname: default_hostname(),
            port: default_node_port(),
            connections: default_connections(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Proxy fields an environment may override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyOverrides {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub sticky_session: Option<bool>,
    pub cookie: Option<String>,
}

/// Cluster fields an environment may override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterOverrides {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub key: Option<String>,
    pub timeout: Option<u64>,
    pub fails: Option<u32>,
    pub supervisor: Option<u64>,
    pub critical: Option<u32>,
}

/// Node agent fields an environment may override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeOverrides {
    pub proxy_hostname: Option<String>,
    pub proxy_port: Option<u16>,
    pub key: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub connections: Option<u32>,
    pub retry_delay: Option<u64>,
}

/// Per-environment overlay on top of the base configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub proxy: ProxyOverrides,
    #[serde(default)]
    pub cluster: ClusterOverrides,
    #[serde(default)]
    pub node: NodeOverrides,
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub node: NodeConfig,

    /// Named overlays, e.g. `production`, applied by [`Config::for_environment`]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environments: HashMap<String, ConfigOverrides>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            cluster: ClusterConfig::default(),
            node: NodeConfig::default(),
            environments: HashMap::new(),
        }
    }

    /// Resolve the configuration for an environment.
    ///
    /// The overlay is applied once; the returned config carries no
    /// environments of its own.
    pub fn for_environment(mut self, name: &str) -> Result<Config> {
        let overrides = self
            .environments
            .remove(name)
            .with_context(|| format!("Environment '{}' not found in configuration", name))?;
        self.environments.clear();
        self.apply(overrides);
        Ok(self)
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            proxy,
            cluster,
            node,
        } = overrides;

        let p = &mut self.proxy;
        set(&mut p.ip, proxy.ip);
        set(&mut p.port, proxy.port);
        set(&mut p.timeout_ms, proxy.timeout_ms);
        set(&mut p.sticky_session, proxy.sticky_session);
        set(&mut p.cookie, proxy.cookie);

        let c = &mut self.cluster;
        set(&mut c.ip, cluster.ip);
        set(&mut c.port, cluster.port);
        if cluster.key.is_some() {
            c.key = cluster.key;
        }
        set(&mut c.timeout, cluster.timeout);
        set(&mut c.fails, cluster.fails);
        set(&mut c.supervisor, cluster.supervisor);
        set(&mut c.critical, cluster.critical);

        let n = &mut self.node;
        set(&mut n.proxy_hostname, node.proxy_hostname);
        set(&mut n.proxy_port, node.proxy_port);
        if node.key.is_some() {
            n.key = node.key;
        }
        set(&mut n.hostname, node.hostname);
        set(&mut n.port, node.port);
        if node.connections.is_some() {
            n.connections = node.connections;
        }
        set(&mut n.retry_delay, node.retry_delay);
    }

    /// Reject settings the cluster cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster.timeout == 0 {
            anyhow::bail!("cluster.timeout must be at least 1 second");
        }
        if self.cluster.fails == 0 {
            anyhow::bail!("cluster.fails must be at least 1");
        }
        if self.cluster.supervisor == 0 {
            anyhow::bail!("cluster.supervisor must be at least 1 second");
        }
        if self.cluster.critical > 100 {
            anyhow::bail!("cluster.critical is a percentage (0-100), got {}", self.cluster.critical);
        }
        if self.proxy.timeout_ms == 0 {
            anyhow::bail!("proxy.timeout_ms must be greater than 0");
        }
        if self.proxy.cookie.trim().is_empty() {
            anyhow::bail!("proxy.cookie must not be empty");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables on top of the defaults
///
/// - BLAST_PROXY_IP, BLAST_PROXY_PORT, BLAST_PROXY_TIMEOUT_MS
/// - BLAST_STICKY_SESSION (true/1), BLAST_COOKIE
/// - BLAST_CLUSTER_IP, BLAST_CLUSTER_PORT, BLAST_CLUSTER_KEY
/// - BLAST_CLUSTER_TIMEOUT, BLAST_CLUSTER_FAILS, BLAST_CLUSTER_SUPERVISOR,
///   BLAST_CLUSTER_CRITICAL
/// - BLAST_NODE_PROXY_HOSTNAME, BLAST_NODE_PROXY_PORT, BLAST_NODE_KEY,
///   BLAST_NODE_HOSTNAME, BLAST_NODE_PORT, BLAST_NODE_CONNECTIONS,
///   BLAST_NODE_RETRY_DELAY
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(ip) = std::env::var("BLAST_PROXY_IP") {
        config.proxy.ip = ip;
    }
    env_parse("BLAST_PROXY_PORT", &mut config.proxy.port)?;
    env_parse("BLAST_PROXY_TIMEOUT_MS", &mut config.proxy.timeout_ms)?;
    if let Ok(sticky) = std::env::var("BLAST_STICKY_SESSION") {
        config.proxy.sticky_session = sticky == "true" || sticky == "1";
    }
    if let Ok(cookie) = std::env::var("BLAST_COOKIE") {
        config.proxy.cookie = cookie;
    }

    if let Ok(ip) = std::env::var("BLAST_CLUSTER_IP") {
        config.cluster.ip = ip;
    }
    env_parse("BLAST_CLUSTER_PORT", &mut config.cluster.port)?;
    if let Ok(key) = std::env::var("BLAST_CLUSTER_KEY") {
        config.cluster.key = Some(key).filter(|k| !k.is_empty());
    }
    env_parse("BLAST_CLUSTER_TIMEOUT", &mut config.cluster.timeout)?;
    env_parse("BLAST_CLUSTER_FAILS", &mut config.cluster.fails)?;
    env_parse("BLAST_CLUSTER_SUPERVISOR", &mut config.cluster.supervisor)?;
    env_parse("BLAST_CLUSTER_CRITICAL", &mut config.cluster.critical)?;

    if let Ok(hostname) = std::env::var("BLAST_NODE_PROXY_HOSTNAME") {
        config.node.proxy_hostname = hostname;
    }
    env_parse("BLAST_NODE_PROXY_PORT", &mut config.node.proxy_port)?;
    if let Ok(key) = std::env::var("BLAST_NODE_KEY") {
        config.node.key = Some(key).filter(|k| !k.is_empty());
    }
    if let Ok(hostname) = std::env::var("BLAST_NODE_HOSTNAME") {
        config.node.hostname = hostname;
    }
    env_parse("BLAST_NODE_PORT", &mut config.node.port)?;
    if let Ok(connections) = std::env::var("BLAST_NODE_CONNECTIONS") {
        config.node.connections = if connections.is_empty() {
            None
        } else {
            Some(
                connections
                    .parse()
                    .context("BLAST_NODE_CONNECTIONS must be a number")?,
            )
        };
    }
    env_parse("BLAST_NODE_RETRY_DELAY", &mut config.node.retry_delay)?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str, field: &mut T) -> Result<()>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(value) = std::env::var(name) {
        *field = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", name, value))?;
    }
    Ok(())
}

/// Load configuration from file or environment, then apply the named
/// environment overlay and validate the result.
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `environment` - Optional environment overlay to apply
pub fn load_config(config_path: Option<&str>, environment: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    let config = match environment {
        Some(name) => config.for_environment(name)?,
        None => config,
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config: Config = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.proxy.port, 3000);
        assert_eq!(config.proxy.cookie, "nblast");
        assert!(!config.proxy.sticky_session);
        assert_eq!(config.proxy.timeout(), Duration::from_secs(3));

        assert_eq!(config.cluster.port, 18755);
        assert_eq!(config.cluster.key, None);
        assert_eq!(config.cluster.timeout, 3);
        assert_eq!(config.cluster.fails, 2);
        assert_eq!(config.cluster.supervisor, 60);
        assert_eq!(config.cluster.critical, 90);

        assert_eq!(config.node.connections, Some(1000));
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml_str() {
        let yaml = r#"
proxy:
  port: 8080
  sticky_session: true
  cookie: route
cluster:
  key: secret
  timeout: 10
  critical: 75
node:
  port: 5000
  connections: 50
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.proxy.listen_addr(), "0.0.0.0:8080");
        assert!(config.proxy.sticky_session);
        assert_eq!(config.proxy.cookie, "route");
        assert_eq!(config.cluster.key.as_deref(), Some("secret"));
        assert_eq!(config.cluster.ping_interval_secs(), 5);
        assert_eq!(config.cluster.critical, 75);
        assert_eq!(config.cluster.fails, 2);
        assert_eq!(config.node.port, 5000);
        assert_eq!(config.node.connections, Some(50));
    }

    #[test]
    fn test_environment_overlay() {
        let yaml = r#"
proxy:
  port: 3000
cluster:
  critical: 90
environments:
  production:
    proxy:
      port: 80
      sticky_session: true
    cluster:
      key: prod-key
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let production = config.clone().for_environment("production").unwrap();

        assert_eq!(production.proxy.port, 80);
        assert!(production.proxy.sticky_session);
        assert_eq!(production.proxy.cookie, "nblast");
        assert_eq!(production.cluster.key.as_deref(), Some("prod-key"));
        assert_eq!(production.cluster.critical, 90);
        assert!(production.environments.is_empty());

        assert!(config.for_environment("staging").is_err());
    }

    #[test]
    fn test_unknown_override_field_rejected() {
        let yaml = r#"
environments:
  production:
    proxy:
      prot: 80
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_ping_interval_floor() {
        let cluster = ClusterConfig {
            timeout: 1,
            ..Default::default()
        };
        assert_eq!(cluster.ping_interval_secs(), 1);
        assert_eq!(cluster.health_timers().timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.cluster.timeout = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.critical = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cluster.supervisor = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.cookie = " ".to_string();
        assert!(config.validate().is_err());
    }
}
