use std::collections::BTreeMap;

use xxhash_rust::xxh3::Xxh3;

use crate::scrape::Labels;

/// The label every target carries, holding its scrape address.
pub const ADDRESS_LABEL: &str = "__address__";

/// A single discovered scrape target.
///
/// The key is derived from the job name and the full label set, so the same
/// target re-discovered later maps onto the same ring partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetItem {
    pub job_name: String,
    pub target_url: String,
    pub labels: Labels,
    key: String,
}

impl TargetItem {
    pub fn new(job_name: impl Into<String>, target_url: impl Into<String>, labels: Labels) -> Self {
        let job_name = job_name.into();
        let target_url = target_url.into();
        let key = format!("{}:{:016x}", job_name, fingerprint(&job_name, &labels));

        TargetItem {
            job_name,
            target_url,
            labels,
            key,
        }
    }

    /// Stable identity of this target, used as the ring key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Order independent hash over the job name and label set. `BTreeMap`
/// iteration is sorted, which keeps the digest stable across discoveries.
fn fingerprint(job_name: &str, labels: &BTreeMap<String, String>) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(job_name.as_bytes());
    for (name, value) in labels {
        hasher.update(&[0xff]);
        hasher.update(name.as_bytes());
        hasher.update(&[0xfe]);
        hasher.update(value.as_bytes());
    }

    hasher.digest()
}

/// A collector pod that can own targets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Collector {
    pub name: String,

    /// Targets currently assigned, recomputed on every allocation pass.
    pub num_targets: usize,
}

impl Collector {
    pub fn new(name: impl Into<String>) -> Self {
        Collector {
            name: name.into(),
            num_targets: 0,
        }
    }
}
