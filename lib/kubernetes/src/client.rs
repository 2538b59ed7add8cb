use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{trace, warn};

use super::config::{self, Auth, Config};
use super::resource::{ObjectList, Resource};

// https://github.com/kubernetes/kubernetes/issues/6513
const MAX_WATCH_TIMEOUT: u32 = 295;
const DEFAULT_WATCH_TIMEOUT: u32 = 290;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(config::Error),
    #[error("build http request failed, {0}")]
    BuildRequest(#[from] http::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(#[from] hyper::Error),
    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),
    #[error("invalid options, {0}")]
    Validation(String),
    #[error("api server error, status: {}, reason: {}, message: {}", .0.status, .0.reason, .0.message)]
    Api(Status),
    #[error("deserialize response failed, {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("read watch event failed, {0}")]
    ReadEvents(std::io::Error),
    #[error("watch event line is too large")]
    EventLineTooLong,
    #[error("refresh token failed, {0}")]
    RefreshToken(std::io::Error),
}

/// An error status returned by the API server.
#[derive(Debug, Deserialize)]
pub struct Status {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl Status {
    /// The resource version the watch was started from has been compacted
    /// away, the caller must list again.
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}

/// Query parameters for list calls on collections.
#[derive(Debug, Default)]
pub struct ListOptions {
    /// Restrict the returned objects by their labels, e.g. `app=collector`.
    pub label_selector: Option<String>,

    /// Restrict the returned objects by their fields.
    pub field_selector: Option<String>,
}

/// Query parameters for watch calls on collections.
#[derive(Debug, Default)]
pub struct WatchOptions {
    pub label_selector: Option<String>,

    pub field_selector: Option<String>,

    /// Server side timeout of the watch call, in seconds. The server closes
    /// the response stream once it elapses, regardless of activity. Defaults
    /// to 290s, and must stay below 295s.
    pub timeout: Option<u32>,
}

/// A raw event returned from a watch query.
///
/// A watch response carries many of these as newline separated JSON.
#[derive(Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
    Error(Status),
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    auth: Auth,
    endpoint: String,
    namespace: Option<String>,
}

impl Client {
    /// Build a client from `~/.kube/config` or the in-cluster environment,
    /// scoped to `namespace` when one is given.
    pub fn new(namespace: Option<String>) -> Result<Self, Error> {
        let config = Config::load().map_err(Error::Config)?;

        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(config.tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let http_client = HttpClient::builder(TokioExecutor::new()).build(connector);
        let endpoint = config.cluster_url.to_string();
        let endpoint = endpoint.strip_suffix('/').unwrap_or(&endpoint).to_string();
        let namespace = namespace.or(Some(config.default_namespace));

        Ok(Client {
            http_client,
            auth: config.auth,
            endpoint,
            namespace,
        })
    }

    /// List a collection of a resource.
    pub async fn list<R: Resource>(&self, opts: &ListOptions) -> Result<ObjectList<R>, Error> {
        let query = {
            let mut builder = form_urlencoded::Serializer::new(String::new());
            if let Some(selector) = &opts.label_selector {
                builder.append_pair("labelSelector", selector);
            }
            if let Some(selector) = &opts.field_selector {
                builder.append_pair("fieldSelector", selector);
            }
            builder.finish()
        };

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(format!(
                "{}{}?{}",
                self.endpoint,
                R::url_path(self.namespace.as_deref()),
                query
            ))
            .body(Full::<Bytes>::default())?;
        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming.collect().await?.to_bytes();
        if !parts.status.is_success() {
            let status = serde_json::from_slice::<Status>(&body)?;
            return Err(Error::Api(status));
        }

        serde_json::from_slice::<ObjectList<R>>(&body).map_err(Error::Deserialize)
    }

    /// Start a watch at `version` and stream the events. The stream ends when
    /// the server side timeout elapses or the connection drops, the caller
    /// has to call this again to keep being notified.
    pub async fn watch<R: Resource>(
        &self,
        opts: &WatchOptions,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<R>, Error>>, Error> {
        if let Some(timeout) = opts.timeout
            && timeout >= MAX_WATCH_TIMEOUT
        {
            return Err(Error::Validation(format!(
                "watch timeout must be less than {MAX_WATCH_TIMEOUT}s"
            )));
        }

        let query = {
            let mut builder = form_urlencoded::Serializer::new(String::new());
            builder.append_pair("watch", "true");
            builder.append_pair("resourceVersion", version);
            builder.append_pair(
                "timeoutSeconds",
                &opts.timeout.unwrap_or(DEFAULT_WATCH_TIMEOUT).to_string(),
            );
            if let Some(selector) = &opts.label_selector {
                builder.append_pair("labelSelector", selector);
            }
            if let Some(selector) = &opts.field_selector {
                builder.append_pair("fieldSelector", selector);
            }
            builder.finish()
        };

        let uri = format!(
            "{}{}?{}",
            self.endpoint,
            R::url_path(self.namespace.as_deref()),
            query
        );
        trace!(message = "starting watch request", uri);

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;
        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        let resp = self.http_client.request(req).await.map_err(Error::Http)?;

        // Watch responses are chunked, one JSON event per line. The chunked
        // decoder tends to report an unexpected EOF when the server ends the
        // stream after 300-ish seconds, which is treated as a normal end.
        let frames = FramedRead::new(
            StreamReader::new(resp.into_body().into_data_stream().map_err(|err| {
                if err.to_string().contains("unexpected EOF during check") {
                    return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err);
                }

                std::io::Error::other(err)
            })),
            LinesCodec::new(),
        );

        Ok(Box::pin(frames.filter_map(|result| async {
            match result {
                Ok(line) => match serde_json::from_str::<WatchEvent<R>>(&line) {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        // Incomplete trailing line from `decode_eof`.
                        if err.is_eof() {
                            return None;
                        }

                        if let Ok(status) = serde_json::from_str::<Status>(&line) {
                            return Some(Err(Error::Api(status)));
                        }

                        Some(Err(Error::Deserialize(err)))
                    }
                },
                Err(LinesCodecError::Io(err)) => match err.kind() {
                    std::io::ErrorKind::TimedOut => {
                        warn!(message = "watch stream timed out", %err);
                        None
                    }
                    std::io::ErrorKind::UnexpectedEof => {
                        warn!(message = "watch stream ended", %err);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(err))),
                },
                Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(Error::EventLineTooLong)),
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Pod {
        metadata: crate::ObjectMeta,
    }

    impl Resource for Pod {
        const GROUP: &'static str = "";
        const VERSION: &'static str = "v1";
        const PLURAL: &'static str = "pods";
    }

    #[test]
    fn decode_watch_event() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"collector-0","resourceVersion":"12345","labels":{"app.kubernetes.io/component":"collector"}}}}"#;

        let event = serde_json::from_str::<WatchEvent<Pod>>(line).unwrap();
        match event {
            WatchEvent::Added(pod) => {
                assert_eq!(pod.metadata.name, "collector-0");
                assert_eq!(pod.metadata.resource_version.as_deref(), Some("12345"));
            }
            _ => panic!("expected an ADDED event"),
        }
    }

    #[test]
    fn decode_watch_error() {
        let line = r#"{"type":"ERROR","object":{"status":"Failure","message":"too old resource version","reason":"Expired","code":410}}"#;

        let event = serde_json::from_str::<WatchEvent<Pod>>(line).unwrap();
        match event {
            WatchEvent::Error(status) => {
                assert!(status.is_gone());
                assert_eq!(status.reason, "Expired");
            }
            _ => panic!("expected an ERROR event"),
        }
    }
}
