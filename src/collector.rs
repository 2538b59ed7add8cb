use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::StreamExt;
use kubernetes::{Client, ListOptions, ObjectMeta, Resource, WatchEvent, WatchOptions};
use metrics::gauge;
use serde::Deserialize;
use tokio::time::Instant;

use crate::shutdown::ShutdownSignal;
use crate::target::Collector;

// The server closes each watch after roughly five minutes anyway, this is
// the client side cap on how long a single watch may run before it is
// re-established from the last seen resource version.
const WATCH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kubernetes(#[from] kubernetes::Error),

    #[error("api server rejected the watch, status: {0}, reason: {1}")]
    Watch(String, String),
}

/// The slice of a pod this service reads.
#[derive(Debug, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
}

impl Resource for Pod {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const PLURAL: &'static str = "pods";
}

/// Watches collector pods and reports the full membership set on every
/// change.
pub struct CollectorWatcher {
    client: Client,
    label_selector: String,
    shutdown: ShutdownSignal,
}

impl CollectorWatcher {
    pub fn new(
        client: Client,
        label_selector: &BTreeMap<String, String>,
        shutdown: ShutdownSignal,
    ) -> Self {
        CollectorWatcher {
            client,
            label_selector: format_selector(label_selector),
            shutdown,
        }
    }

    /// List the matching pods, deliver the initial set, then keep watching.
    /// `notify` receives the complete collector map after every membership
    /// change. Returns once shutdown fires, errors end the task and with it
    /// the process.
    pub async fn watch<F>(mut self, mut notify: F) -> Result<(), Error>
    where
        F: FnMut(&HashMap<String, Collector>) + Send,
    {
        let list_opts = ListOptions {
            label_selector: Some(self.label_selector.clone()),
            ..Default::default()
        };
        let watch_opts = WatchOptions {
            label_selector: Some(self.label_selector.clone()),
            ..Default::default()
        };

        let list = self.client.list::<Pod>(&list_opts).await?;
        let mut version = list.metadata.resource_version.unwrap_or_else(|| "0".into());
        let mut collectors = collectors_from_pods(list.items);
        info!(
            message = "discovered collectors",
            collectors = collectors.len(),
            selector = self.label_selector
        );
        gauge!("divvy_collectors_discovered").set(collectors.len() as f64);
        notify(&collectors);

        loop {
            let deadline = Instant::now() + WATCH_TIMEOUT;
            let mut stream = self.client.watch::<Pod>(&watch_opts, &version).await?;

            loop {
                let event = tokio::select! {
                    _ = &mut self.shutdown => return Ok(()),
                    _ = tokio::time::sleep_until(deadline) => {
                        // restart the watch, no relist needed
                        break;
                    }
                    event = stream.next() => match event {
                        Some(event) => event?,
                        None => break,
                    },
                };

                match event {
                    WatchEvent::Added(pod) => {
                        track_version(&mut version, &pod.metadata);
                        if pod.metadata.deletion_timestamp.is_some() {
                            continue;
                        }

                        debug!(message = "collector added", name = pod.metadata.name);
                        collectors.insert(
                            pod.metadata.name.clone(),
                            Collector::new(pod.metadata.name),
                        );
                    }
                    WatchEvent::Deleted(pod) => {
                        track_version(&mut version, &pod.metadata);
                        debug!(message = "collector removed", name = pod.metadata.name);
                        collectors.remove(&pod.metadata.name);
                    }
                    WatchEvent::Modified(pod) => {
                        track_version(&mut version, &pod.metadata);
                        continue;
                    }
                    WatchEvent::Error(status) if status.is_gone() => {
                        // the version was compacted away, list again
                        warn!(message = "watch expired, relisting", reason = status.reason);
                        let list = self.client.list::<Pod>(&list_opts).await?;
                        version = list.metadata.resource_version.unwrap_or_else(|| "0".into());
                        collectors = collectors_from_pods(list.items);
                        gauge!("divvy_collectors_discovered").set(collectors.len() as f64);
                        notify(&collectors);
                        break;
                    }
                    WatchEvent::Error(status) => {
                        return Err(Error::Watch(status.status, status.reason));
                    }
                }

                gauge!("divvy_collectors_discovered").set(collectors.len() as f64);
                notify(&collectors);
            }
        }
    }
}

fn track_version(version: &mut String, metadata: &ObjectMeta) {
    if let Some(new) = &metadata.resource_version {
        *version = new.clone();
    }
}

/// Pods already scheduled for deletion are not allocatable.
fn collectors_from_pods(pods: Vec<Pod>) -> HashMap<String, Collector> {
    pods.into_iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .map(|pod| {
            (
                pod.metadata.name.clone(),
                Collector::new(pod.metadata.name),
            )
        })
        .collect()
}

fn format_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
