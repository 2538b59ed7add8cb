use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::secret::Secret;

pub type Labels = BTreeMap<String, String>;

fn default_scheme() -> String {
    "http".into()
}

fn default_metrics_path() -> String {
    "/metrics".into()
}

const fn default_scrape_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_separator() -> String {
    ";".into()
}

fn default_regex() -> String {
    "(.*)".into()
}

/// One scrape job, the subset of the Prometheus scrape config schema the
/// allocator understands. Unknown fields are rejected so a typo does not
/// silently drop a job.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeConfig {
    pub job_name: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default = "default_scrape_interval", with = "duration::serde")]
    pub scrape_interval: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_configs: Vec<StaticConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_sd_configs: Vec<FileSdConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabel_configs: Vec<RelabelConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BasicAuth {
    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Authorization {
    /// The scheme of the `Authorization` header, `Bearer` by convention.
    #[serde(rename = "type", default)]
    pub auth_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Secret>,
}

/// A fixed list of targets, available without any discovery round trip.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
}

/// Targets read from files on disk, re-read periodically.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileSdConfig {
    pub files: Vec<String>,

    #[serde(default = "default_refresh_interval", with = "duration::serde")]
    pub refresh_interval: Duration,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    #[default]
    Replace,
    Keep,
    Drop,
}

/// A relabel rule. Only `keep` and `drop` influence which targets reach the
/// allocator, the rest apply at scrape time and pass through untouched.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RelabelConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_labels: Vec<String>,

    #[serde(default = "default_separator")]
    pub separator: String,

    #[serde(default = "default_regex")]
    pub regex: String,

    #[serde(default)]
    pub action: RelabelAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
}
