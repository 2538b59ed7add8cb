use std::env;
use std::path::PathBuf;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};

use super::{Auth, Config, RefreshableToken};

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

// Mounted service account credentials
const TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const ROOT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("environment variable {0} is not set, {1}")]
    ReadEnvironment(&'static str, #[source] env::VarError),

    #[error("failed to parse api server port: {0}")]
    ParsePort(#[source] std::num::ParseIntError),

    #[error("failed to parse api server url: {0}")]
    ParseUrl(#[source] http::uri::InvalidUri),

    #[error("failed to read the default namespace: {0}")]
    ReadNamespace(#[source] std::io::Error),

    #[error("failed to read root ca {ROOT_CA_FILE}: {0}")]
    ReadRootCa(#[source] std::io::Error),

    #[error("failed to parse PEM-encoded root ca: {0}")]
    ParseRootCa(#[source] pem::PemError),

    #[error("failed to build the root cert store: {0}")]
    BuildRootStore(#[source] rustls::Error),

    #[error("failed to read token file {TOKEN_FILE}: {0}")]
    ReadToken(#[source] std::io::Error),
}

pub fn load() -> Result<Config, Error> {
    let cluster_url = api_server_url()?;
    let default_namespace =
        std::fs::read_to_string(NAMESPACE_FILE).map_err(Error::ReadNamespace)?;
    let tls = root_tls_config()?;
    let token = RefreshableToken::new(PathBuf::from(TOKEN_FILE)).map_err(Error::ReadToken)?;

    Ok(Config {
        cluster_url,
        default_namespace: default_namespace.trim().to_string(),
        auth: Auth::RefreshableToken(token),
        tls,
    })
}

fn api_server_url() -> Result<http::Uri, Error> {
    let host =
        env::var(SERVICE_HOST_ENV).map_err(|err| Error::ReadEnvironment(SERVICE_HOST_ENV, err))?;
    let port = env::var(SERVICE_PORT_ENV)
        .map_err(|err| Error::ReadEnvironment(SERVICE_PORT_ENV, err))?
        .parse::<u16>()
        .map_err(Error::ParsePort)?;

    // IPv6 hosts must be bracketed, and 443 is implied
    let url = match host.parse::<std::net::IpAddr>() {
        Ok(ip) if ip.is_ipv6() && port == 443 => format!("https://[{ip}]"),
        Ok(ip) if ip.is_ipv6() => format!("https://[{ip}]:{port}"),
        _ if port == 443 => format!("https://{host}"),
        _ => format!("https://{host}:{port}"),
    };

    url.parse().map_err(Error::ParseUrl)
}

fn root_tls_config() -> Result<ClientConfig, Error> {
    let data = std::fs::read(ROOT_CA_FILE).map_err(Error::ReadRootCa)?;
    let certs = pem::parse_many(data)
        .map_err(Error::ParseRootCa)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.into_contents());

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(CertificateDer::from(cert))
            .map_err(Error::BuildRootStore)?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
