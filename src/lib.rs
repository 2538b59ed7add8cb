#[macro_use]
extern crate tracing;

pub mod allocation;
pub mod app;
pub mod cli;
pub mod collector;
pub mod config;
pub mod discoverer;
pub mod discovery;
pub mod duration;
pub mod metrics;
pub mod prehook;
pub mod scrape;
pub mod secret;
pub mod server;
pub mod shutdown;
pub mod signal;
pub mod target;
pub mod tls;
pub mod watcher;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
