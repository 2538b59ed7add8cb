use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{Notify, mpsc};

use crate::scrape::{Labels, ScrapeConfig};
use crate::shutdown::ShutdownSignal;

// Floor for how often file_sd files are re-read, whatever the configs say.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// One group of targets sharing a label set, the shape file_sd files and
/// static_configs use.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct TargetGroup {
    pub targets: Vec<String>,

    #[serde(default)]
    pub labels: Labels,
}

/// Job name to the target groups currently discovered for it.
pub type Snapshot = HashMap<String, Vec<TargetGroup>>;

/// Resolves scrape configs into target groups.
///
/// `static_configs` resolve immediately, `file_sd_configs` are read from
/// disk and re-read on an interval. A new snapshot is emitted whenever the
/// resolved groups differ from the last emitted ones.
pub struct Manager {
    configs: Mutex<Vec<ScrapeConfig>>,
    kick: Notify,
    tx: mpsc::Sender<Snapshot>,
}

impl Manager {
    pub fn new() -> (Self, mpsc::Receiver<Snapshot>) {
        let (tx, rx) = mpsc::channel(4);

        (
            Manager {
                configs: Mutex::new(Vec::new()),
                kick: Notify::new(),
                tx,
            },
            rx,
        )
    }

    /// Swap in a new scrape config set and trigger an immediate resolve.
    pub fn apply(&self, configs: Vec<ScrapeConfig>) {
        *self.configs.lock() = configs;
        self.kick.notify_one();
    }

    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), crate::Error> {
        let mut last: Option<Snapshot> = None;

        loop {
            let interval = self.refresh_interval();
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = self.kick.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }

            let snapshot = self.resolve().await;
            if last.as_ref() == Some(&snapshot) {
                continue;
            }

            debug!(message = "discovery produced new target groups", jobs = snapshot.len());
            last = Some(snapshot.clone());
            if self.tx.send(snapshot).await.is_err() {
                // receiver side shut down
                return Ok(());
            }
        }
    }

    /// The smallest configured file_sd refresh interval, clamped.
    fn refresh_interval(&self) -> Duration {
        self.configs
            .lock()
            .iter()
            .flat_map(|config| &config.file_sd_configs)
            .map(|sd| sd.refresh_interval)
            .min()
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
            .max(MIN_REFRESH_INTERVAL)
    }

    async fn resolve(&self) -> Snapshot {
        let configs = self.configs.lock().clone();
        let mut snapshot = Snapshot::new();

        for config in configs {
            let groups = snapshot.entry(config.job_name.clone()).or_default();

            for static_config in &config.static_configs {
                groups.push(TargetGroup {
                    targets: static_config.targets.clone(),
                    labels: static_config.labels.clone(),
                });
            }

            for sd in &config.file_sd_configs {
                for file in &sd.files {
                    match read_groups(Path::new(file)).await {
                        Ok(mut found) => groups.append(&mut found),
                        Err(err) => {
                            // the file may simply not exist yet, discovery
                            // keeps going with what it has
                            warn!(
                                message = "reading file_sd file failed",
                                file,
                                job = config.job_name,
                                %err
                            );
                        }
                    }
                }
            }
        }

        snapshot
    }
}

async fn read_groups(path: &Path) -> Result<Vec<TargetGroup>, crate::Error> {
    let data = tokio::fs::read(path).await?;

    let groups = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_slice::<Vec<TargetGroup>>(&data)?,
        _ => serde_json::from_slice::<Vec<TargetGroup>>(&data)?,
    };

    Ok(groups)
}
