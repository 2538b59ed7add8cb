use std::path::{Path, PathBuf};

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::CertificateResult;
use serde::Deserialize;
use tracing::debug;

use super::tls::client_identity;
use super::{Auth, Config, RefreshableToken};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("failed to parse kubeconfig YAML: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("current-context is not set")]
    CurrentContextNotSet,

    #[error("context {0:?} not found")]
    ContextNotFound(String),

    #[error("cluster {0:?} not found")]
    ClusterNotFound(String),

    #[error("user {0:?} not found")]
    UserNotFound(String),

    #[error("server url is missing on the selected cluster")]
    MissingServerUrl,

    #[error("failed to parse server url: {0}")]
    ParseServerUrl(#[source] http::uri::InvalidUri),

    #[error("failed to decode base64 data: {0}")]
    DecodeBase64(#[source] base64::DecodeError),

    #[error("failed to parse PEM-encoded certificates: {0}")]
    ParseCertificates(#[source] pem::PemError),

    #[error("load native certificates failed: {0:?}")]
    LoadNativeCertificates(Vec<rustls_native_certs::Error>),

    #[error("failed to add a root certificate: {0}")]
    AddRootCertificate(#[source] rustls::Error),

    #[error("failed to load client identity: {0}")]
    ClientIdentity(#[from] super::tls::Error),

    #[error("invalid client identity: {0}")]
    InvalidClientIdentity(#[source] rustls::Error),
}

#[derive(Clone, Default, Deserialize)]
struct User {
    username: Option<String>,
    password: Option<String>,

    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,

    #[serde(rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,

    #[serde(rename = "client-key")]
    client_key: Option<PathBuf>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
}

#[derive(Clone, Deserialize)]
struct Cluster {
    server: Option<String>,

    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
}

#[derive(Clone, Deserialize)]
struct Context {
    cluster: String,
    user: String,
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct Named<T> {
    name: String,

    #[serde(alias = "cluster", alias = "user", alias = "context")]
    value: Option<T>,
}

/// The subset of `~/.kube/config` this client understands.
#[derive(Deserialize)]
struct KubeConfig {
    clusters: Vec<Named<Cluster>>,

    #[serde(rename = "users")]
    users: Vec<Named<User>>,

    contexts: Vec<Named<Context>>,

    #[serde(rename = "current-context")]
    current_context: Option<String>,
}

fn select<T: Clone>(entries: &[Named<T>], name: &str) -> Option<T> {
    entries
        .iter()
        .find(|named| named.name == name)
        .and_then(|named| named.value.clone())
}

pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|err| Error::ReadFile(err, path.into()))?;
    let config = serde_yaml::from_slice::<KubeConfig>(&data).map_err(Error::Parse)?;

    let context_name = config.current_context.ok_or(Error::CurrentContextNotSet)?;
    let context = select(&config.contexts, &context_name)
        .ok_or_else(|| Error::ContextNotFound(context_name))?;
    let cluster = select(&config.clusters, &context.cluster)
        .ok_or_else(|| Error::ClusterNotFound(context.cluster.clone()))?;
    let user =
        select(&config.users, &context.user).ok_or_else(|| Error::UserNotFound(context.user))?;

    let roots = root_store(&cluster)?;
    let cluster_url = cluster
        .server
        .ok_or(Error::MissingServerUrl)?
        .parse::<http::Uri>()
        .map_err(Error::ParseServerUrl)?;
    let default_namespace = context.namespace.unwrap_or_else(|| String::from("default"));

    let tls = match identity_pem(&user)? {
        Some(identity) => {
            let (chain, key) = client_identity(&identity)?;
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_client_auth_cert(chain, key)
                .map_err(Error::InvalidClientIdentity)?
        }
        None => ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    };

    let auth = if let (Some(username), Some(password)) = (user.username, user.password) {
        Auth::Basic { username, password }
    } else if let Some(path) = user.token_file {
        let token =
            RefreshableToken::new(path.clone()).map_err(|err| Error::ReadFile(err, path))?;
        Auth::RefreshableToken(token)
    } else if let Some(token) = user.token {
        Auth::Bearer { token }
    } else {
        Auth::None
    };

    Ok(Config {
        cluster_url,
        default_namespace,
        auth,
        tls,
    })
}

/// Client cert and key, concatenated into one PEM blob.
fn identity_pem(user: &User) -> Result<Option<Vec<u8>>, Error> {
    let cert = load_inline_or_file(
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
    )?;
    let key = load_inline_or_file(
        user.client_key_data.as_deref(),
        user.client_key.as_deref(),
    )?;

    match (cert, key) {
        (Some(cert), Some(mut identity)) => {
            identity.extend_from_slice(&cert);
            Ok(Some(identity))
        }
        _ => Ok(None),
    }
}

fn root_store(cluster: &Cluster) -> Result<RootCertStore, Error> {
    let data = load_inline_or_file(
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
    )?;

    let mut roots = RootCertStore::empty();
    match data {
        Some(data) => {
            let certs = pem::parse_many(data)
                .map_err(Error::ParseCertificates)?
                .into_iter()
                .filter(|p| p.tag() == "CERTIFICATE")
                .map(|p| p.into_contents());

            for cert in certs {
                roots
                    .add(CertificateDer::from(cert))
                    .map_err(Error::AddRootCertificate)?;
            }
        }
        None => {
            let CertificateResult { certs, errors, .. } = rustls_native_certs::load_native_certs();
            if !errors.is_empty() {
                return Err(Error::LoadNativeCertificates(errors));
            }

            for cert in certs {
                if let Err(err) = roots.add(cert) {
                    debug!(message = "skipping unparsable native certificate", %err);
                }
            }
        }
    }

    Ok(roots)
}

/// Inline base64 data takes precedence over the file path variant.
fn load_inline_or_file(
    data: Option<&str>,
    path: Option<&Path>,
) -> Result<Option<Vec<u8>>, Error> {
    use base64::Engine;

    match (data, path) {
        (Some(data), _) => base64::engine::general_purpose::STANDARD
            .decode(data)
            .map(Some)
            .map_err(Error::DecodeBase64),
        (None, Some(path)) => std::fs::read(path)
            .map(Some)
            .map_err(|err| Error::ReadFile(err, path.into())),
        (None, None) => Ok(None),
    }
}
