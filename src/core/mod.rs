use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::events::EventBus;
use crate::lb::Cluster;

/// Everything the proxy's components share, built once from the config
///
/// Clones share the same cluster and event bus.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub events: EventBus,
    pub cluster: Arc<Cluster>,
}

impl Core {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let events = EventBus::default();
        let cluster = Arc::new(Cluster::new(config.cluster.clone(), events.clone()));

        Ok(Self {
            config,
            events,
            cluster,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_shares_bus() {
        let core = Core::new(Config::default()).unwrap();
        let mut rx = core.events.subscribe();
        core.clone().events.emit(crate::events::ProxyEvent::ClusterFull);
        assert_eq!(rx.try_recv().unwrap().name(), "cluster.full");
        assert_eq!(core.cluster.member_count(), 0);
    }

    #[test]
    fn test_core_rejects_invalid_config() {
        let mut config = Config::default();
        config.cluster.timeout = 0;
        assert!(Core::new(config).is_err());
    }
}
