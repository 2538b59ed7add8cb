use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exitcode::ExitCode;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::allocation;
use crate::collector::CollectorWatcher;
use crate::config::Config;
use crate::discoverer::{EventSource, TargetDiscoverer};
use crate::discovery::Manager;
use crate::prehook;
use crate::server::{self, Listener, State};
use crate::shutdown;
use crate::signal::{SignalRx, SignalTo};
use crate::tls;
use crate::watcher::{FileWatcher, Watcher};

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Everything runs as one task group. The first task to stop, cleanly or
/// not, takes the rest of the process down with it, a half-alive allocator
/// silently serving stale assignments is worse than a restart.
pub struct Application {
    config: Config,
    config_path: PathBuf,
}

impl Application {
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        Application {
            config,
            config_path,
        }
    }

    pub async fn run(self, mut signal_rx: SignalRx) -> ExitCode {
        let Application {
            config,
            config_path,
        } = self;

        let handle = match crate::metrics::init() {
            Ok(handle) => handle,
            Err(err) => {
                error!(message = "installing metrics recorder failed", %err);
                return exitcode::SOFTWARE;
            }
        };

        let allocators = allocation::Registry::with_defaults();
        let allocator = match allocators.new_allocator(&config.allocation_strategy) {
            Ok(allocator) => allocator,
            Err(err) => {
                error!(message = "unknown allocation strategy", %err);
                return exitcode::CONFIG;
            }
        };

        let filters = prehook::Registry::with_defaults();
        let filter = match filters.new_filter(&config.filter_strategy) {
            Ok(filter) => filter,
            Err(err) => {
                error!(message = "unknown filter strategy", %err);
                return exitcode::CONFIG;
            }
        };
        allocator.set_filter(Arc::clone(&filter));

        let client = match kubernetes::Client::new(config.namespace.clone()) {
            Ok(client) => client,
            Err(err) => {
                error!(message = "building kubernetes client failed", %err);
                return exitcode::UNAVAILABLE;
            }
        };

        let (manager, snapshots) = Manager::new();
        let manager = Arc::new(manager);
        let state = Arc::new(State::new(Arc::clone(&allocator), handle));
        let discoverer = Arc::new(TargetDiscoverer::new(
            Arc::clone(&manager),
            filter,
            Arc::clone(&state) as _,
        ));

        // the configured scrape configs are the first application, anything
        // wrong with them is a startup failure rather than a reload warning
        if let Err(err) = discoverer.apply_config(EventSource::ConfigFile, config.scrape_configs())
        {
            error!(message = "applying scrape configs failed", %err);
            return exitcode::CONFIG;
        }

        let http = match Listener::bind(config.listen_addr, None).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(message = "binding http listener failed", addr = %config.listen_addr, %err);
                return exitcode::UNAVAILABLE;
            }
        };

        let https = match &config.https {
            Some(https) if https.enabled => {
                let tls_config = match tls::server_config(https) {
                    Ok(tls_config) => tls_config,
                    Err(err) => {
                        error!(message = "building tls config failed", %err);
                        return exitcode::CONFIG;
                    }
                };

                match Listener::bind(https.listen_addr, Some(tls_config)).await {
                    Ok(listener) => Some(listener),
                    Err(err) => {
                        error!(message = "binding https listener failed", addr = %https.listen_addr, %err);
                        return exitcode::UNAVAILABLE;
                    }
                }
            }
            _ => None,
        };

        let (trigger, shutdown) = shutdown::channel();
        let mut tasks = JoinSet::<(&'static str, Result<(), crate::Error>)>::new();

        tasks.spawn({
            let manager = Arc::clone(&manager);
            let shutdown = shutdown.clone();
            async move { ("discovery", manager.run(shutdown).await) }
        });

        tasks.spawn({
            let allocator = Arc::clone(&allocator);
            let shutdown = shutdown.clone();
            async move {
                let result = TargetDiscoverer::watch(snapshots, shutdown, move |items| {
                    allocator.set_targets(items)
                })
                .await;

                ("target-watch", result)
            }
        });

        tasks.spawn({
            let allocator = Arc::clone(&allocator);
            let watcher = CollectorWatcher::new(client, &config.label_selector, shutdown.clone());
            async move {
                let result = watcher
                    .watch(move |collectors| allocator.set_collectors(collectors.clone()))
                    .await;

                ("collector-watch", result.map_err(Into::into))
            }
        });

        let (events_tx, mut events_rx) = mpsc::channel(4);
        let file_watcher: Arc<dyn Watcher> = Arc::new(FileWatcher::new(config_path));

        tasks.spawn({
            let file_watcher = Arc::clone(&file_watcher);
            let shutdown = shutdown.clone();
            async move { ("config-watch", file_watcher.watch(events_tx, shutdown).await) }
        });

        tasks.spawn({
            let discoverer = Arc::clone(&discoverer);
            let mut shutdown = shutdown.clone();
            async move {
                loop {
                    let event = tokio::select! {
                        _ = &mut shutdown => return ("config-apply", Ok(())),
                        event = events_rx.recv() => match event {
                            Some(event) => event,
                            None => return ("config-apply", Ok(())),
                        },
                    };

                    // a broken file must not take down a running allocator,
                    // the last good config stays in effect
                    let configs = match file_watcher.load() {
                        Ok(configs) => configs,
                        Err(err) => {
                            error!(message = "reloading configuration failed", %err);
                            continue;
                        }
                    };

                    if let Err(err) = discoverer.apply_config(event.source, configs) {
                        error!(message = "applying scrape configs failed", %err);
                    }
                }
            }
        });

        tasks.spawn({
            let state = Arc::clone(&state);
            let shutdown = shutdown.clone();
            async move { ("http", server::serve(http, state, false, shutdown).await) }
        });

        if let Some(https) = https {
            tasks.spawn({
                let state = Arc::clone(&state);
                let shutdown = shutdown.clone();
                async move { ("https", server::serve(https, state, true, shutdown).await) }
            });
        }

        let code = loop {
            tokio::select! {
                signal = signal_rx.recv() => match signal {
                    Some(SignalTo::Shutdown) | None => {
                        info!(message = "shutting down");
                        break exitcode::OK;
                    }
                    Some(SignalTo::Quit) => {
                        info!(message = "shutting down immediately");
                        tasks.shutdown().await;
                        return exitcode::OK;
                    }
                },
                result = tasks.join_next() => match result {
                    Some(Ok((name, Ok(())))) => {
                        error!(message = "task stopped unexpectedly", task = name);
                        break exitcode::SOFTWARE;
                    }
                    Some(Ok((name, Err(err)))) => {
                        error!(message = "task failed", task = name, %err);
                        break exitcode::SOFTWARE;
                    }
                    Some(Err(err)) => {
                        error!(message = "task panicked", %err);
                        break exitcode::SOFTWARE;
                    }
                    None => break exitcode::OK,
                }
            }
        };

        trigger.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(message = "some tasks did not stop in time, aborting them");
            tasks.shutdown().await;
        }

        code
    }
}
