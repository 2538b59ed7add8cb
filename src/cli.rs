use std::path::PathBuf;

use argh::FromArgs;

fn default_config_path() -> PathBuf {
    PathBuf::from("/conf/divvy.yaml")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Allocates Prometheus scrape targets across a fleet of collectors.
#[derive(Debug, FromArgs)]
pub struct RootCommand {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "default_config_path()")]
    pub config: PathBuf,

    /// log level, e.g. "info" or "debug". The DIVVY_LOG environment
    /// variable takes precedence when set
    #[argh(option, default = "default_log_level()")]
    pub log_level: String,

    /// print version information and exit
    #[argh(switch)]
    pub version: bool,
}

impl RootCommand {
    pub fn show_version(&self) {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    }
}
