use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use super::{Allocator, CONSISTENT_HASHING};
use crate::prehook::Filter;
use crate::target::{Collector, TargetItem};

// Fixed partition space the ring hashes into. Power of two, and large
// enough that per collector shares stay within a few percent of even for
// any realistic fleet size.
const PARTITIONS: u64 = 1024;

// Points each member places on the ring.
const VNODES_PER_MEMBER: u32 = 100;

/// A partitioned consistent hash ring.
///
/// Every key maps to one of [`PARTITIONS`] partitions, and each partition is
/// owned by the member whose virtual node is nearest clockwise. Ownership
/// only depends on the membership set, so removing a member reassigns its
/// partitions and nothing else.
struct HashRing {
    points: BTreeMap<u64, String>,
    owners: Vec<Option<String>>,
}

impl HashRing {
    fn new() -> Self {
        HashRing {
            points: BTreeMap::new(),
            owners: vec![None; PARTITIONS as usize],
        }
    }

    fn add_member(&mut self, name: &str) {
        for index in 0..VNODES_PER_MEMBER {
            let point = xxh3_64(format!("{name}-{index}").as_bytes());

            // On the rare point collision the lexicographically smaller
            // name wins, keeping ownership deterministic.
            match self.points.get_mut(&point) {
                Some(existing) if existing.as_str() <= name => {}
                _ => {
                    self.points.insert(point, name.to_string());
                }
            }
        }

        self.rebuild();
    }

    fn remove_member(&mut self, name: &str) {
        self.points.retain(|_, member| member != name);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        for partition in 0..PARTITIONS {
            let point = xxh3_64(&partition.to_be_bytes());
            let owner = self
                .points
                .range(point..)
                .next()
                .or_else(|| self.points.iter().next())
                .map(|(_, member)| member.clone());

            self.owners[partition as usize] = owner;
        }
    }

    fn locate(&self, key: &str) -> Option<&str> {
        let partition = xxh3_64(key.as_bytes()) % PARTITIONS;
        self.owners[partition as usize].as_deref()
    }
}

#[derive(Default)]
struct Inner {
    collectors: HashMap<String, Collector>,
    targets: HashMap<String, Arc<TargetItem>>,

    /// target key -> collector name, absent while no collector exists
    assignments: HashMap<String, String>,

    /// collector -> job -> target keys, the shape the API reads
    by_collector: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl Inner {
    fn assign(&mut self, key: &str, job: &str, collector: &str) {
        self.assignments.insert(key.to_string(), collector.to_string());
        self.by_collector
            .entry(collector.to_string())
            .or_default()
            .entry(job.to_string())
            .or_default()
            .insert(key.to_string());
    }

    fn unassign(&mut self, key: &str, job: &str) {
        if let Some(collector) = self.assignments.remove(key)
            && let Some(jobs) = self.by_collector.get_mut(&collector)
            && let Some(keys) = jobs.get_mut(job)
        {
            keys.remove(key);
        }
    }

    /// Refresh the per collector counts and push them out as gauges.
    fn record_counts(&mut self) {
        gauge!("divvy_collectors_allocatable").set(self.collectors.len() as f64);
        gauge!("divvy_targets_unassigned")
            .set((self.targets.len() - self.assignments.len()) as f64);

        let counts = self
            .by_collector
            .iter()
            .map(|(name, jobs)| {
                let count: usize = jobs.values().map(|keys| keys.len()).sum();
                (name.clone(), count)
            })
            .collect::<HashMap<_, _>>();
        for (name, collector) in &mut self.collectors {
            collector.num_targets = counts.get(name).copied().unwrap_or(0);
            gauge!("divvy_targets_per_collector", "collector" => name.clone())
                .set(collector.num_targets as f64);
        }
    }
}

pub struct ConsistentHashing {
    ring: RwLock<HashRing>,
    inner: RwLock<Inner>,
    filter: RwLock<Option<Arc<dyn Filter>>>,
}

impl ConsistentHashing {
    pub fn new() -> Self {
        ConsistentHashing {
            ring: RwLock::new(HashRing::new()),
            inner: RwLock::new(Inner::default()),
            filter: RwLock::new(None),
        }
    }

    fn record_duration(method: &'static str, start: Instant) {
        histogram!(
            "divvy_time_to_allocate_seconds",
            "method" => method,
            "strategy" => CONSISTENT_HASHING,
        )
        .record(start.elapsed().as_secs_f64());
    }
}

impl Default for ConsistentHashing {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for ConsistentHashing {
    fn set_collectors(&self, collectors: HashMap<String, Collector>) {
        let start = Instant::now();
        let mut ring = self.ring.write();
        let mut inner = self.inner.write();

        let same_membership = inner.collectors.len() == collectors.len()
            && collectors.keys().all(|name| inner.collectors.contains_key(name));
        if same_membership {
            inner.collectors = collectors;
            inner.record_counts();
            Self::record_duration("set_collectors", start);
            return;
        }

        let removed = inner
            .collectors
            .keys()
            .filter(|name| !collectors.contains_key(*name))
            .cloned()
            .collect::<Vec<_>>();
        for name in &removed {
            ring.remove_member(name);
            // keep the time series from reporting a stale count
            gauge!("divvy_targets_per_collector", "collector" => name.clone()).set(0.0);
        }
        for name in collectors.keys() {
            if !inner.collectors.contains_key(name) {
                ring.add_member(name);
            }
        }
        inner.collectors = collectors;

        // Re-derive every assignment from the ring. Ownership is a pure
        // function of the membership set, so targets whose partition owner
        // survived do not move.
        inner.assignments.clear();
        inner.by_collector = inner
            .collectors
            .keys()
            .map(|name| (name.clone(), HashMap::new()))
            .collect();
        let targets = inner.targets.values().cloned().collect::<Vec<_>>();
        for target in targets {
            if let Some(owner) = ring.locate(target.key()) {
                let owner = owner.to_string();
                inner.assign(target.key(), &target.job_name, &owner);
            }
        }

        inner.record_counts();
        debug!(
            message = "collectors updated",
            collectors = inner.collectors.len(),
            removed = removed.len(),
        );
        Self::record_duration("set_collectors", start);
    }

    fn set_targets(&self, targets: HashMap<String, Arc<TargetItem>>) {
        let filter = self.filter.read().clone();
        let targets = match filter {
            Some(filter) => filter.apply(targets),
            None => targets,
        };
        counter!("divvy_targets_kept_total").increment(targets.len() as u64);

        let start = Instant::now();
        let ring = self.ring.read();
        let mut inner = self.inner.write();

        let removed = inner
            .targets
            .iter()
            .filter(|(key, _)| !targets.contains_key(*key))
            .map(|(key, target)| (key.clone(), target.job_name.clone()))
            .collect::<Vec<_>>();
        for (key, job) in &removed {
            inner.unassign(key, job);
            inner.targets.remove(key);
        }

        let mut added = 0usize;
        for (key, target) in targets {
            if inner.targets.contains_key(&key) {
                continue;
            }

            if let Some(owner) = ring.locate(&key) {
                let owner = owner.to_string();
                inner.assign(&key, &target.job_name, &owner);
            }
            inner.targets.insert(key, target);
            added += 1;
        }

        inner.record_counts();
        debug!(
            message = "targets updated",
            targets = inner.targets.len(),
            added,
            removed = removed.len(),
        );
        Self::record_duration("set_targets", start);
    }

    fn target_items(&self) -> HashMap<String, Arc<TargetItem>> {
        self.inner.read().targets.clone()
    }

    fn collectors(&self) -> HashMap<String, Collector> {
        self.inner.read().collectors.clone()
    }

    fn targets_for_collector_and_job(&self, collector: &str, job: &str) -> Vec<Arc<TargetItem>> {
        let inner = self.inner.read();

        let Some(keys) = inner
            .by_collector
            .get(collector)
            .and_then(|jobs| jobs.get(job))
        else {
            return Vec::new();
        };

        keys.iter()
            .filter_map(|key| inner.targets.get(key).cloned())
            .collect()
    }

    fn set_filter(&self, filter: Arc<dyn Filter>) {
        *self.filter.write() = Some(filter);
    }
}
