mod file;

pub use file::FileWatcher;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config;
use crate::discoverer::EventSource;
use crate::scrape::ScrapeConfig;
use crate::shutdown::ShutdownSignal;

/// A change notification from one of the config sources. The event loop
/// reloads the source's config and re-applies it, payloads never travel in
/// the event itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Event {
    pub source: EventSource,
}

/// A config source the event loop can reload from.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Stream change notifications into `tx` until shutdown fires or the
    /// receiver goes away.
    async fn watch(
        &self,
        tx: mpsc::Sender<Event>,
        shutdown: ShutdownSignal,
    ) -> Result<(), crate::Error>;

    /// Re-read the source's scrape configs.
    fn load(&self) -> Result<Vec<ScrapeConfig>, config::Error>;
}
