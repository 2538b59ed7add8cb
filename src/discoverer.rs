use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use indexmap::IndexMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::discovery::{Manager, Snapshot};
use crate::prehook::Filter;
use crate::scrape::ScrapeConfig;
use crate::shutdown::ShutdownSignal;
use crate::target::{ADDRESS_LABEL, TargetItem};

/// Where a configuration application came from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventSource {
    ConfigFile,
}

impl Display for EventSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::ConfigFile => f.write_str("config-file"),
        }
    }
}

/// Receives the merged job map on every config application, the HTTP server
/// caches both serialized forms of it.
pub trait ScrapeConfigsUpdater: Send + Sync {
    fn update_scrape_configs(
        &self,
        configs: &IndexMap<String, ScrapeConfig>,
    ) -> Result<(), crate::Error>;
}

/// Feeds scrape configs into discovery and turns the discovered groups into
/// allocatable target items.
pub struct TargetDiscoverer {
    manager: Arc<Manager>,
    filter: Arc<dyn Filter>,
    updater: Arc<dyn ScrapeConfigsUpdater>,
    configs: Mutex<IndexMap<EventSource, Vec<ScrapeConfig>>>,
}

impl TargetDiscoverer {
    pub fn new(
        manager: Arc<Manager>,
        filter: Arc<dyn Filter>,
        updater: Arc<dyn ScrapeConfigsUpdater>,
    ) -> Self {
        TargetDiscoverer {
            manager,
            filter,
            updater,
            configs: Mutex::new(IndexMap::new()),
        }
    }

    /// Apply the scrape configs delivered by `source`. Jobs from a later
    /// source shadow earlier ones with the same name.
    pub fn apply_config(
        &self,
        source: EventSource,
        configs: Vec<ScrapeConfig>,
    ) -> Result<(), crate::Error> {
        counter!("divvy_config_events_total", "source" => source.to_string()).increment(1);

        let merged = {
            let mut state = self.configs.lock();
            state.insert(source, configs);
            state
                .values()
                .flatten()
                .map(|config| (config.job_name.clone(), config.clone()))
                .collect::<IndexMap<_, _>>()
        };

        info!(message = "applying scrape configs", %source, jobs = merged.len());

        self.updater.update_scrape_configs(&merged)?;
        self.filter.update_relabel_configs(
            merged
                .values()
                .map(|config| (config.job_name.clone(), config.relabel_configs.clone()))
                .collect(),
        );
        self.manager.apply(merged.into_values().collect());

        Ok(())
    }

    /// Drain discovery snapshots, handing the resulting target items to
    /// `handler` until shutdown.
    pub async fn watch<F>(
        mut snapshots: mpsc::Receiver<Snapshot>,
        mut shutdown: ShutdownSignal,
        mut handler: F,
    ) -> Result<(), crate::Error>
    where
        F: FnMut(HashMap<String, Arc<TargetItem>>) + Send,
    {
        loop {
            let snapshot = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                snapshot = snapshots.recv() => match snapshot {
                    Some(snapshot) => snapshot,
                    None => return Ok(()),
                },
            };

            let items = target_items(snapshot);
            gauge!("divvy_targets_discovered").set(items.len() as f64);
            handler(items);
        }
    }
}

fn target_items(snapshot: Snapshot) -> HashMap<String, Arc<TargetItem>> {
    let mut items = HashMap::new();

    for (job, groups) in snapshot {
        for group in groups {
            for address in group.targets {
                let mut labels = group.labels.clone();
                labels.insert(ADDRESS_LABEL.to_string(), address.clone());

                let item = Arc::new(TargetItem::new(job.clone(), address, labels));
                items.insert(item.key().to_string(), item);
            }
        }
    }

    items
}
