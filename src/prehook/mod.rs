mod relabel;

pub use relabel::RelabelConfigFilter;

use std::collections::HashMap;
use std::sync::Arc;

use crate::scrape::RelabelConfig;
use crate::target::TargetItem;

pub const RELABEL_CONFIG: &str = "relabel-config";

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("filter strategy {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("unregistered filter strategy {0:?}")]
    Unregistered(String),
}

/// A prehook that decides which discovered targets are eligible for
/// allocation at all.
pub trait Filter: Send + Sync {
    fn apply(&self, targets: HashMap<String, Arc<TargetItem>>)
    -> HashMap<String, Arc<TargetItem>>;

    /// Per job relabel rules, refreshed on every config application.
    fn update_relabel_configs(&self, configs: HashMap<String, Vec<RelabelConfig>>);
}

type FilterFactory = fn() -> Arc<dyn Filter>;

pub struct Registry {
    entries: HashMap<String, FilterFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            entries: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Registry::new();
        registry
            .register(RELABEL_CONFIG, || Arc::new(RelabelConfigFilter::new()))
            .expect("default registry must not contain duplicates");
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: FilterFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        self.entries.insert(name, factory);
        Ok(())
    }

    pub fn new_filter(&self, name: &str) -> Result<Arc<dyn Filter>, RegistryError> {
        match self.entries.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(RegistryError::Unregistered(name.to_string())),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
