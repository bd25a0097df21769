//! Registry of the managers built at startup, keyed by name

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::forward::ForwardManager;
use super::google::{GoogleManager, GoogleVariant};
use super::remote::RemoteConnectionManager;
use crate::config::Config;
use crate::error::{Result, SnovaError};

#[derive(Default)]
pub struct ManagerRegistry {
    managers: DashMap<String, Arc<dyn RemoteConnectionManager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build `Direct`, one `Forward` manager per target, and the Google pair when enabled
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new();
        let pool_size = config.server.idle_pool_size;

        registry.register(Arc::new(ForwardManager::direct(pool_size)))?;
        for target in &config.forward.targets {
            registry.register(Arc::new(ForwardManager::new(target, pool_size)?))?;
        }

        if config.google.enabled {
            info!("Init Google");
            for variant in [GoogleVariant::Http, GoogleVariant::Https] {
                registry.register(Arc::new(GoogleManager::new(
                    variant,
                    &config.google,
                    config.upstream_proxy.as_ref(),
                    pool_size,
                )))?;
            }
        }

        Ok(registry)
    }

    /// Add a manager. Names must be unique.
    pub fn register(&self, manager: Arc<dyn RemoteConnectionManager>) -> Result<()> {
        let name = manager.name().to_string();
        match self.managers.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(SnovaError::InvalidConfig(
                format!("backend {} registered twice", entry.key()),
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!("Registered backend {} ({})", entry.key(), manager.arg());
                entry.insert(manager);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RemoteConnectionManager>> {
        self.managers.get(name).map(|m| m.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.managers.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }
}
