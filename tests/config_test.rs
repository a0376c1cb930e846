use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(yaml: &str) -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();
    let path = config_path.to_string_lossy().into_owned();
    (temp_dir, path)
}

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
proxy:
  ip: 127.0.0.1
  port: 8080
  timeout_ms: 1500
  sticky_session: true
  cookie: blast

cluster:
  port: 19000
  key: secret
  timeout: 4
  fails: 3
  supervisor: 30
  critical: 80

node:
  proxy_hostname: proxy.internal
  hostname: app-1.internal
  port: 5001
  connections: 250
"#;

    let (_dir, path) = write_config(yaml);
    let config = blastproxy::config::load_from_yaml(&path).unwrap();

    assert_eq!(config.proxy.listen_addr(), "127.0.0.1:8080");
    assert_eq!(config.proxy.timeout(), Duration::from_millis(1500));
    assert!(config.proxy.sticky_session);
    assert_eq!(config.proxy.cookie, "blast");

    assert_eq!(config.cluster.listen_addr(), "0.0.0.0:19000");
    assert_eq!(config.cluster.key.as_deref(), Some("secret"));
    assert_eq!(config.cluster.timeout(), Duration::from_secs(4));
    assert_eq!(config.cluster.fails, 3);
    assert_eq!(config.cluster.supervisor_interval(), Duration::from_secs(30));
    assert_eq!(config.cluster.critical, 80);
    assert_eq!(config.cluster.ping_interval_secs(), 2);

    assert_eq!(config.node.proxy_url(), "http://proxy.internal:18755");
    assert_eq!(config.node.hostname, "app-1.internal");
    assert_eq!(config.node.port, 5001);
    assert_eq!(config.node.connections, Some(250));
    assert_eq!(config.node.retry_delay(), Duration::from_secs(5));
}

/// Test that an environment overlay is applied on top of the base values
#[test]
fn test_environment_overlay() {
    let yaml = r#"
proxy:
  port: 3000
cluster:
  timeout: 3

environments:
  production:
    proxy:
      port: 80
      sticky_session: true
    cluster:
      key: prod-key
"#;

    let (_dir, path) = write_config(yaml);

    let development = blastproxy::config::load_config(Some(path.as_str()), None).unwrap();
    assert_eq!(development.proxy.port, 3000);
    assert!(development.cluster.key.is_none());

    let production = blastproxy::config::load_config(Some(path.as_str()), Some("production")).unwrap();
    assert_eq!(production.proxy.port, 80);
    assert!(production.proxy.sticky_session);
    assert_eq!(production.cluster.key.as_deref(), Some("prod-key"));
    // Untouched values survive the overlay
    assert_eq!(production.cluster.timeout, 3);
    assert_eq!(production.proxy.cookie, "nblast");
    assert!(production.environments.is_empty());

    assert!(blastproxy::config::load_config(Some(path.as_str()), Some("staging")).is_err());
}

/// Test that invalid values are rejected when loading
#[test]
fn test_invalid_config_rejected() {
    for yaml in [
        "cluster:\n  timeout: 0\n",
        "cluster:\n  fails: 0\n",
        "cluster:\n  supervisor: 0\n",
        "cluster:\n  critical: 150\n",
        "proxy:\n  cookie: \"\"\n",
    ] {
        let (_dir, path) = write_config(yaml);
        assert!(
            blastproxy::config::load_config(Some(path.as_str()), None).is_err(),
            "accepted {:?}",
            yaml
        );
    }
}

/// Test that unknown keys inside an overlay are reported
#[test]
fn test_overlay_rejects_unknown_fields() {
    let yaml = r#"
environments:
  production:
    proxy:
      prot: 80
"#;
    let (_dir, path) = write_config(yaml);
    assert!(blastproxy::config::load_from_yaml(&path).is_err());
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    let vars = [
        ("BLAST_PROXY_PORT", "8081"),
        ("BLAST_STICKY_SESSION", "1"),
        ("BLAST_COOKIE", "sid"),
        ("BLAST_CLUSTER_KEY", "env-key"),
        ("BLAST_CLUSTER_TIMEOUT", "6"),
        ("BLAST_CLUSTER_CRITICAL", "75"),
        ("BLAST_NODE_PORT", "4100"),
        ("BLAST_NODE_CONNECTIONS", ""),
        ("BLAST_NODE_RETRY_DELAY", "9"),
    ];
    let originals: Vec<_> = vars.iter().map(|(name, _)| (*name, env::var(name).ok())).collect();
    for (name, value) in vars {
        env::set_var(name, value);
    }

    let config = blastproxy::config::load_from_env().unwrap();
    assert_eq!(config.proxy.port, 8081);
    assert!(config.proxy.sticky_session);
    assert_eq!(config.proxy.cookie, "sid");
    assert_eq!(config.cluster.key.as_deref(), Some("env-key"));
    assert_eq!(config.cluster.timeout, 6);
    assert_eq!(config.cluster.critical, 75);
    assert_eq!(config.node.port, 4100);
    assert_eq!(config.node.connections, None);
    assert_eq!(config.node.retry_delay(), Duration::from_secs(9));

    env::set_var("BLAST_CLUSTER_FAILS", "many");
    assert!(blastproxy::config::load_from_env().is_err());
    env::remove_var("BLAST_CLUSTER_FAILS");

    // Restore original env vars
    for (name, value) in originals {
        match value {
            Some(v) => env::set_var(name, v),
            None => env::remove_var(name),
        }
    }
}
