use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::header::CONTENT_TYPE;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use indexmap::IndexMap;
use metrics::histogram;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use rustls::ServerConfig;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::allocation::Allocator;
use crate::discoverer::ScrapeConfigsUpdater;
use crate::scrape::ScrapeConfig;
use crate::secret;
use crate::shutdown::ShutdownSignal;

// bytes a job name may not carry verbatim in a path segment
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`');

struct CachedScrapeConfigs {
    redacted: String,
    exposed: String,
}

/// Everything the request handlers read. The scrape configs are serialized
/// once per config application, in both forms, so request handling never
/// touches the secret flag.
pub struct State {
    allocator: Arc<dyn Allocator>,
    scrape_configs: RwLock<Option<CachedScrapeConfigs>>,
    handle: PrometheusHandle,
}

impl State {
    pub fn new(allocator: Arc<dyn Allocator>, handle: PrometheusHandle) -> Self {
        State {
            allocator,
            scrape_configs: RwLock::new(None),
            handle,
        }
    }
}

impl ScrapeConfigsUpdater for State {
    fn update_scrape_configs(
        &self,
        configs: &IndexMap<String, ScrapeConfig>,
    ) -> Result<(), crate::Error> {
        let redacted = secret::with_secrets_redacted(|| serde_json::to_string(configs))?;
        let exposed = secret::with_secrets_exposed(|| serde_json::to_string(configs))?;

        *self.scrape_configs.write() = Some(CachedScrapeConfigs { redacted, exposed });

        Ok(())
    }
}

pub struct Listener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, tls: Option<ServerConfig>) -> Result<Self, crate::Error> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Listener {
            listener,
            acceptor: tls.map(|config| TlsAcceptor::from(Arc::new(config))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Accept connections until shutdown fires. `secure` listeners serve scrape
/// configs with secrets intact, so only the mTLS listener may set it.
pub async fn serve(
    listener: Listener,
    state: Arc<State>,
    secure: bool,
    mut shutdown: ShutdownSignal,
) -> Result<(), crate::Error> {
    info!(
        message = "serving http api",
        addr = %listener.local_addr()?,
        secure
    );

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            result = listener.listener.accept() => match result {
                Ok(pair) => pair,
                Err(err) => {
                    error!(message = "accept new connection failed", %err);
                    continue;
                }
            }
        };

        let state = Arc::clone(&state);
        let conn_shutdown = shutdown.clone();
        match listener.acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(stream) => {
                            serve_connection(TokioIo::new(stream), state, secure, conn_shutdown)
                                .await
                        }
                        Err(err) => {
                            debug!(message = "tls handshake failed", %peer, %err);
                        }
                    }
                });
            }
            None => {
                tokio::spawn(serve_connection(
                    TokioIo::new(stream),
                    state,
                    secure,
                    conn_shutdown,
                ));
            }
        }
    }
}

async fn serve_connection<S>(
    io: TokioIo<S>,
    state: Arc<State>,
    secure: bool,
    mut shutdown: ShutdownSignal,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle(req, state, secure) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(message = "serving http connection failed", %err);
            }
        }
        _ = &mut shutdown => {
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!(message = "serving http connection failed", %err);
            }
        }
    }
}

// the service must be infallible, a response construction error becomes a
// plain 500 instead of tearing down the connection
fn handle(
    req: Request<Incoming>,
    state: Arc<State>,
    secure: bool,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let start = Instant::now();
    let (route, resp) = match route(&req, &state, secure) {
        Ok(pair) => pair,
        Err(err) => {
            error!(message = "handling request failed", %err);

            let mut resp = Response::new(Full::default());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            ("other", resp)
        }
    };
    histogram!("divvy_http_request_duration_seconds", "path" => route)
        .record(start.elapsed().as_secs_f64());

    Ok(resp)
}

#[derive(Serialize)]
struct LinkInfo {
    #[serde(rename = "_link")]
    link: String,
}

#[derive(Serialize)]
struct CollectorTargets {
    #[serde(rename = "_link")]
    link: String,
    targets: Vec<String>,
}

fn route(
    req: &Request<Incoming>,
    state: &State,
    secure: bool,
) -> Result<(&'static str, Response<Full<Bytes>>), crate::Error> {
    // the whole api is read only
    if req.method() != Method::GET {
        let resp = Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::default())?;
        return Ok(("other", resp));
    }

    match req.uri().path() {
        "/scrape_configs" => {
            let body = match &*state.scrape_configs.read() {
                Some(cached) if secure => cached.exposed.clone(),
                Some(cached) => cached.redacted.clone(),
                None => "{}".to_string(),
            };

            Ok(("/scrape_configs", json_response(body)?))
        }
        "/jobs" => {
            let jobs = state
                .allocator
                .target_items()
                .into_values()
                .map(|item| {
                    let link = LinkInfo {
                        link: job_link(&item.job_name),
                    };

                    (item.job_name.clone(), link)
                })
                .collect::<BTreeMap<_, _>>();

            Ok(("/jobs", json_response(serde_json::to_string(&jobs)?)?))
        }
        "/metrics" => {
            let resp = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(state.handle.render().into()))?;

            Ok(("/metrics", resp))
        }
        "/livez" => Ok((
            "/livez",
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::default())?,
        )),
        "/readyz" => {
            // ready once the first config application has been cached
            let status = if state.scrape_configs.read().is_some() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };

            Ok((
                "/readyz",
                Response::builder().status(status).body(Full::default())?,
            ))
        }
        path => {
            if let Some(segment) = path
                .strip_prefix("/jobs/")
                .and_then(|rest| rest.strip_suffix("/targets"))
                && !segment.contains('/')
            {
                let job = percent_decode_str(segment).decode_utf8_lossy().into_owned();
                let resp = job_targets(state, &job, req.uri().query())?;

                return Ok(("/jobs/{job_id}/targets", resp));
            }

            Ok((
                "other",
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::default())?,
            ))
        }
    }
}

fn job_targets(
    state: &State,
    job: &str,
    query: Option<&str>,
) -> Result<Response<Full<Bytes>>, crate::Error> {
    if let Some(collector) = query_param(query, "collector_id") {
        let targets = state
            .allocator
            .targets_for_collector_and_job(&collector, job)
            .into_iter()
            .map(|item| item.target_url.clone())
            .collect::<Vec<_>>();

        return json_response(serde_json::to_string(&targets)?);
    }

    let known = state
        .allocator
        .target_items()
        .into_values()
        .any(|item| item.job_name == job);
    if !known {
        return json_response("[]".to_string());
    }

    let mut display = BTreeMap::new();
    for name in state.allocator.collectors().into_keys() {
        let targets = state
            .allocator
            .targets_for_collector_and_job(&name, job)
            .into_iter()
            .map(|item| item.target_url.clone())
            .collect::<Vec<_>>();
        if targets.is_empty() {
            continue;
        }

        display.insert(
            name.clone(),
            CollectorTargets {
                link: format!("{}?collector_id={}", job_link(job), name),
                targets,
            },
        );
    }

    json_response(serde_json::to_string(&display)?)
}

fn job_link(job: &str) -> String {
    format!("/jobs/{}/targets", utf8_percent_encode(job, SEGMENT))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| percent_decode_str(value).decode_utf8_lossy().into_owned())
    })
}

fn json_response(body: String) -> Result<Response<Full<Bytes>>, crate::Error> {
    let resp = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))?;

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::ConsistentHashing;
    use crate::shutdown::Trigger;
    use crate::target::{Collector, TargetItem};
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::collections::HashMap;

    fn test_state(allocator: Arc<dyn Allocator>) -> Arc<State> {
        // a standalone recorder, the global one can only be installed once
        let handle = PrometheusBuilder::new().build_recorder().handle();
        Arc::new(State::new(allocator, handle))
    }

    async fn start(state: Arc<State>, secure: bool) -> (SocketAddr, Trigger) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, shutdown) = crate::shutdown::channel();
        tokio::spawn(serve(listener, state, secure, shutdown));

        (addr, trigger)
    }

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let uri = format!("http://{addr}{path}").parse::<hyper::Uri>().unwrap();

        let resp = client.get(uri).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();

        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn populated_allocator() -> Arc<dyn Allocator> {
        let allocator: Arc<dyn Allocator> = Arc::new(ConsistentHashing::new());
        allocator.set_collectors(HashMap::from([
            ("collector-0".to_string(), Collector::new("collector-0".to_string())),
            ("collector-1".to_string(), Collector::new("collector-1".to_string())),
        ]));

        let targets = (0..8)
            .map(|n| {
                let address = format!("10.0.0.{n}:9100");
                let labels = crate::scrape::Labels::from([(
                    crate::target::ADDRESS_LABEL.to_string(),
                    address.clone(),
                )]);
                let item = Arc::new(TargetItem::new("node".to_string(), address, labels));

                (item.key().to_string(), item)
            })
            .collect();
        allocator.set_targets(targets);

        allocator
    }

    fn scrape_configs() -> IndexMap<String, ScrapeConfig> {
        let config = serde_yaml::from_str::<ScrapeConfig>(
            r#"
job_name: node
basic_auth:
  username: admin
  password: hunter2
static_configs:
- targets: ["10.0.0.1:9100"]
"#,
        )
        .unwrap();

        IndexMap::from([("node".to_string(), config)])
    }

    #[tokio::test]
    async fn readyz_flips_after_first_config() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(Arc::clone(&state), false).await;

        let (status, _) = get(addr, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.update_scrape_configs(&scrape_configs()).unwrap();
        let (status, _) = get(addr, "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(addr, "/livez").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn scrape_configs_are_redacted_on_the_plain_listener() {
        let state = test_state(populated_allocator());
        state.update_scrape_configs(&scrape_configs()).unwrap();
        let (addr, _trigger) = start(state, false).await;

        let (status, body) = get(addr, "/scrape_configs").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(secret::PLACEHOLDER));
        assert!(!body.contains("hunter2"));
    }

    #[tokio::test]
    async fn secure_listener_exposes_secrets() {
        let state = test_state(populated_allocator());
        state.update_scrape_configs(&scrape_configs()).unwrap();
        let (addr, _trigger) = start(state, true).await;

        let (status, body) = get(addr, "/scrape_configs").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hunter2"));
    }

    #[tokio::test]
    async fn scrape_configs_before_any_update_is_an_empty_object() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let (status, body) = get(addr, "/scrape_configs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{}");
    }

    #[tokio::test]
    async fn jobs_links_to_targets() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let (status, body) = get(addr, "/jobs").await;
        assert_eq!(status, StatusCode::OK);

        let jobs = serde_json::from_str::<serde_json::Value>(&body).unwrap();
        assert_eq!(jobs["node"]["_link"], "/jobs/node/targets");
    }

    #[tokio::test]
    async fn job_targets_grouped_by_collector() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let (status, body) = get(addr, "/jobs/node/targets").await;
        assert_eq!(status, StatusCode::OK);

        let display = serde_json::from_str::<serde_json::Value>(&body).unwrap();
        let mut total = 0;
        for (name, entry) in display.as_object().unwrap() {
            assert_eq!(
                entry["_link"],
                format!("/jobs/node/targets?collector_id={name}")
            );
            total += entry["targets"].as_array().unwrap().len();
        }
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn job_targets_for_one_collector() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let (_, zero) = get(addr, "/jobs/node/targets?collector_id=collector-0").await;
        let (_, one) = get(addr, "/jobs/node/targets?collector_id=collector-1").await;

        let zero = serde_json::from_str::<Vec<String>>(&zero).unwrap();
        let one = serde_json::from_str::<Vec<String>>(&one).unwrap();
        assert_eq!(zero.len() + one.len(), 8);

        // unknown collector is an empty list, not an error
        let (status, body) = get(addr, "/jobs/node/targets?collector_id=ghost").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn unknown_job_is_an_empty_list() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let (status, body) = get(addr, "/jobs/ghost/targets").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn only_get_is_allowed() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/jobs"))
            .body(Full::default())
            .unwrap();

        let resp = client.request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let state = test_state(populated_allocator());
        let (addr, _trigger) = start(state, false).await;

        let (status, _) = get(addr, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn job_names_are_encoded_in_links() {
        assert_eq!(job_link("node exporter"), "/jobs/node%20exporter/targets");
        assert_eq!(job_link("a/b"), "/jobs/a%2Fb/targets");
    }
}
