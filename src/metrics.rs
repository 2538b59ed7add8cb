use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Install the recorder that backs `/metrics`. Must happen before anything
/// records.
pub fn init() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;

    describe_gauge!(
        "divvy_collectors_allocatable",
        "Number of collectors the allocator can currently assign targets to."
    );
    describe_gauge!(
        "divvy_targets_per_collector",
        "Number of targets assigned to each collector."
    );
    describe_gauge!(
        "divvy_targets_unassigned",
        "Number of targets no collector currently owns."
    );
    describe_gauge!(
        "divvy_collectors_discovered",
        "Number of collector pods the watcher has seen, terminating ones excluded."
    );
    describe_gauge!(
        "divvy_targets_discovered",
        "Number of targets produced by the last discovery snapshot."
    );
    describe_counter!(
        "divvy_targets_kept_total",
        "Targets kept after filtering, summed over allocation passes."
    );
    describe_counter!(
        "divvy_config_events_total",
        "Configuration applications, by source."
    );
    describe_histogram!(
        "divvy_time_to_allocate_seconds",
        "Time the allocator spent applying a collector or target change."
    );
    describe_histogram!(
        "divvy_http_request_duration_seconds",
        "Time spent serving HTTP requests, by route."
    );

    Ok(handle)
}
