mod consistent_hashing;

pub use consistent_hashing::ConsistentHashing;

use std::collections::HashMap;
use std::sync::Arc;

use crate::prehook::Filter;
use crate::target::{Collector, TargetItem};

pub const CONSISTENT_HASHING: &str = "consistent-hashing";

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("allocation strategy {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("unregistered allocation strategy {0:?}")]
    Unregistered(String),
}

/// An allocation strategy.
///
/// Mutators take `&self`, implementations guard their state with an internal
/// lock. Readers return clones so no lock outlives a call.
pub trait Allocator: Send + Sync {
    /// Replace the collector membership and reassign targets accordingly.
    fn set_collectors(&self, collectors: HashMap<String, Collector>);

    /// Replace the discovered target set. The configured filter is applied
    /// before any assignment happens.
    fn set_targets(&self, targets: HashMap<String, Arc<TargetItem>>);

    fn target_items(&self) -> HashMap<String, Arc<TargetItem>>;

    fn collectors(&self) -> HashMap<String, Collector>;

    /// Total over its whole domain, unknown collectors or jobs yield an
    /// empty vec.
    fn targets_for_collector_and_job(&self, collector: &str, job: &str) -> Vec<Arc<TargetItem>>;

    fn set_filter(&self, filter: Arc<dyn Filter>);
}

type AllocatorFactory = fn() -> Arc<dyn Allocator>;

/// Maps strategy names to constructors. Registration is explicit and not
/// idempotent, a duplicate name is a wiring bug worth failing loudly on.
pub struct Registry {
    entries: HashMap<String, AllocatorFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            entries: HashMap::new(),
        }
    }

    /// All built in strategies registered.
    pub fn with_defaults() -> Self {
        let mut registry = Registry::new();
        registry
            .register(CONSISTENT_HASHING, || Arc::new(ConsistentHashing::new()))
            .expect("default registry must not contain duplicates");
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: AllocatorFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        self.entries.insert(name, factory);
        Ok(())
    }

    pub fn new_allocator(&self, name: &str) -> Result<Arc<dyn Allocator>, RegistryError> {
        match self.entries.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(RegistryError::Unregistered(name.to_string())),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.entries.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_contain_consistent_hashing() {
        let registry = Registry::with_defaults();

        assert_eq!(registry.names(), [CONSISTENT_HASHING]);
        registry.new_allocator(CONSISTENT_HASHING).unwrap();
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = Registry::with_defaults();

        let err = registry
            .register(CONSISTENT_HASHING, || Arc::new(ConsistentHashing::new()))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyRegistered(CONSISTENT_HASHING.into())
        );
    }

    #[test]
    fn unknown_strategy_fails() {
        let registry = Registry::with_defaults();

        // no `unwrap_err`, the Ok side is not Debug
        let err = match registry.new_allocator("least-connection") {
            Ok(_) => panic!("lookup should fail"),
            Err(err) => err,
        };
        assert_eq!(err, RegistryError::Unregistered("least-connection".into()));
    }
}
