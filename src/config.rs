use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::allocation;
use crate::prehook;
use crate::scrape::ScrapeConfig;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading configuration file failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("parsing configuration file failed: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from_str("0.0.0.0:8080").expect("default endpoint parse ok")
}

fn default_https_listen_addr() -> SocketAddr {
    SocketAddr::from_str("0.0.0.0:8443").expect("default endpoint parse ok")
}

fn default_label_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/component".to_string(),
        "collector".to_string(),
    )])
}

fn default_allocation_strategy() -> String {
    allocation::CONSISTENT_HASHING.to_string()
}

fn default_filter_strategy() -> String {
    prehook::RELABEL_CONFIG.to_string()
}

/// Top-level service configuration, loaded from a YAML file and reloaded
/// whenever that file changes.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Pods carrying all of these labels are treated as collectors.
    #[serde(default = "default_label_selector")]
    pub label_selector: BTreeMap<String, String>,

    /// Namespace to watch for collector pods. Defaults to the namespace
    /// this service runs in.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_allocation_strategy")]
    pub allocation_strategy: String,

    #[serde(default = "default_filter_strategy")]
    pub filter_strategy: String,

    /// The Prometheus configuration subset this service understands.
    #[serde(default)]
    pub config: PrometheusConfig,

    #[serde(default)]
    pub https: Option<HttpsConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

/// The additional listener that serves scrape configs with secrets intact.
/// Client certificates are required, so only holders of a certificate signed
/// by `ca_file_path` can read them.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_https_listen_addr")]
    pub listen_addr: SocketAddr,

    pub ca_file_path: Option<PathBuf>,
    pub tls_cert_file_path: Option<PathBuf>,
    pub tls_key_file_path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let data = std::fs::read(path)?;
        let config = serde_yaml::from_slice::<Config>(&data)?;
        config.validate()?;

        Ok(config)
    }

    pub fn scrape_configs(&self) -> Vec<ScrapeConfig> {
        self.config.scrape_configs.clone()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.config.scrape_configs.is_empty() {
            return Err(Error::Invalid(
                "at least one scrape config must be defined".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for config in &self.config.scrape_configs {
            if !seen.insert(&config.job_name) {
                return Err(Error::Invalid(format!(
                    "duplicate job_name {:?}",
                    config.job_name
                )));
            }
        }

        // the https listener serves unredacted secrets, only mTLS clients
        // may reach it, so a client CA is as mandatory as the server pair
        if let Some(https) = &self.https
            && https.enabled
            && (https.ca_file_path.is_none()
                || https.tls_cert_file_path.is_none()
                || https.tls_key_file_path.is_none())
        {
            return Err(Error::Invalid(
                "https requires ca_file_path, tls_cert_file_path and tls_key_file_path".into(),
            ));
        }

        Ok(())
    }
}
