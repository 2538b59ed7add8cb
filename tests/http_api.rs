//! Drives the discovery, allocation and HTTP layers together, the way the
//! running service wires them, with only the kubernetes watcher replaced by
//! direct membership updates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use metrics_exporter_prometheus::PrometheusBuilder;

use divvy::allocation::{Allocator, ConsistentHashing};
use divvy::discoverer::{EventSource, TargetDiscoverer};
use divvy::discovery::Manager;
use divvy::prehook::{Filter, RelabelConfigFilter};
use divvy::scrape::ScrapeConfig;
use divvy::server::{Listener, State, serve};
use divvy::shutdown;
use divvy::target::Collector;

struct Harness {
    allocator: Arc<dyn Allocator>,
    discoverer: Arc<TargetDiscoverer>,
    addr: SocketAddr,
    _trigger: shutdown::Trigger,
}

async fn start() -> Harness {
    let allocator: Arc<dyn Allocator> = Arc::new(ConsistentHashing::new());
    let filter: Arc<dyn Filter> = Arc::new(RelabelConfigFilter::new());
    allocator.set_filter(Arc::clone(&filter));

    let handle = PrometheusBuilder::new().build_recorder().handle();
    let state = Arc::new(State::new(Arc::clone(&allocator), handle));

    let (manager, snapshots) = Manager::new();
    let manager = Arc::new(manager);
    let discoverer = Arc::new(TargetDiscoverer::new(
        Arc::clone(&manager),
        filter,
        Arc::clone(&state) as _,
    ));

    let (trigger, shutdown) = shutdown::channel();

    tokio::spawn({
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    tokio::spawn({
        let allocator = Arc::clone(&allocator);
        let shutdown = shutdown.clone();
        TargetDiscoverer::watch(snapshots, shutdown, move |items| allocator.set_targets(items))
    });

    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state, false, shutdown));

    Harness {
        allocator,
        discoverer,
        addr,
        _trigger: trigger,
    }
}

async fn get(addr: SocketAddr, path: &str) -> (http::StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let uri = format!("http://{addr}{path}").parse::<hyper::Uri>().unwrap();

    let resp = client.get(uri).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();

    (status, String::from_utf8_lossy(&body).into_owned())
}

async fn wait_for_targets(harness: &Harness, want: usize) {
    for _ in 0..100 {
        if harness.allocator.target_items().len() == want {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    panic!(
        "expected {want} targets, allocator has {}",
        harness.allocator.target_items().len()
    );
}

fn scrape_configs() -> Vec<ScrapeConfig> {
    serde_yaml::from_str(
        r#"
- job_name: node
  basic_auth:
    username: admin
    password: hunter2
  static_configs:
  - targets: ["10.0.0.1:9100", "10.0.0.2:9100", "10.0.0.3:9100"]
    labels:
      env: prod
- job_name: canary
  static_configs:
  - targets: ["10.0.1.1:9100"]
    labels:
      drop_me: "true"
  relabel_configs:
  - source_labels: [drop_me]
    regex: "true"
    action: drop
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn targets_flow_from_config_to_http() {
    let harness = start().await;

    let (status, _) = get(harness.addr, "/readyz").await;
    assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);

    harness
        .discoverer
        .apply_config(EventSource::ConfigFile, scrape_configs())
        .unwrap();
    harness.allocator.set_collectors(HashMap::from([
        (
            "collector-0".to_string(),
            Collector::new("collector-0".to_string()),
        ),
        (
            "collector-1".to_string(),
            Collector::new("collector-1".to_string()),
        ),
    ]));

    // the canary job's only target carries drop_me and never shows up
    wait_for_targets(&harness, 3).await;

    let (status, _) = get(harness.addr, "/readyz").await;
    assert_eq!(status, http::StatusCode::OK);

    let (_, body) = get(harness.addr, "/jobs").await;
    let jobs = serde_json::from_str::<serde_json::Value>(&body).unwrap();
    assert_eq!(jobs["node"]["_link"], "/jobs/node/targets");
    assert!(jobs.get("canary").is_none());

    let (_, body) = get(harness.addr, "/jobs/node/targets").await;
    let display = serde_json::from_str::<serde_json::Value>(&body).unwrap();
    let assigned = display
        .as_object()
        .unwrap()
        .values()
        .map(|entry| entry["targets"].as_array().unwrap().len())
        .sum::<usize>();
    assert_eq!(assigned, 3);

    // each target lands on exactly one collector
    let mut all = Vec::new();
    for collector in ["collector-0", "collector-1"] {
        let (_, body) = get(
            harness.addr,
            &format!("/jobs/node/targets?collector_id={collector}"),
        )
        .await;
        all.extend(serde_json::from_str::<Vec<String>>(&body).unwrap());
    }
    all.sort();
    assert_eq!(all, ["10.0.0.1:9100", "10.0.0.2:9100", "10.0.0.3:9100"]);
}

#[tokio::test]
async fn scrape_configs_stay_redacted() {
    let harness = start().await;
    harness
        .discoverer
        .apply_config(EventSource::ConfigFile, scrape_configs())
        .unwrap();

    let (status, body) = get(harness.addr, "/scrape_configs").await;
    assert_eq!(status, http::StatusCode::OK);
    assert!(body.contains("admin"));
    assert!(body.contains("<secret>"));
    assert!(!body.contains("hunter2"));
}

#[tokio::test]
async fn collector_loss_keeps_targets() {
    let harness = start().await;
    harness
        .discoverer
        .apply_config(EventSource::ConfigFile, scrape_configs())
        .unwrap();
    harness.allocator.set_collectors(HashMap::from([(
        "collector-0".to_string(),
        Collector::new("collector-0".to_string()),
    )]));
    wait_for_targets(&harness, 3).await;

    // all collectors gone, targets are retained unassigned
    harness.allocator.set_collectors(HashMap::new());
    assert_eq!(harness.allocator.target_items().len(), 3);

    let (status, body) = get(
        harness.addr,
        "/jobs/node/targets?collector_id=collector-0",
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, "[]");

    // a returning collector picks everything back up
    harness.allocator.set_collectors(HashMap::from([(
        "collector-0".to_string(),
        Collector::new("collector-0".to_string()),
    )]));
    let (_, body) = get(
        harness.addr,
        "/jobs/node/targets?collector_id=collector-0",
    )
    .await;
    assert_eq!(
        serde_json::from_str::<Vec<String>>(&body).unwrap().len(),
        3
    );
}
