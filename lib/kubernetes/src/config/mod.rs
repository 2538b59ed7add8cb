mod incluster;
mod kubeconfig;
mod tls;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use headers::{Authorization, HeaderMapExt};
use http::Request;

const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    InCluster(#[from] incluster::Error),

    #[error(transparent)]
    KubeConfig(#[from] kubeconfig::Error),
}

struct Cached {
    token: String,
    expire_at: Instant,
}

/// A bearer token re-read from its mounted file periodically, service
/// account tokens are rotated by the kubelet.
#[derive(Clone)]
pub struct RefreshableToken {
    path: PathBuf,
    cached: Arc<Mutex<Cached>>,
}

impl std::fmt::Debug for RefreshableToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshableToken")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RefreshableToken {
    fn new(path: PathBuf) -> std::io::Result<Self> {
        let token = std::fs::read_to_string(&path)?;

        Ok(RefreshableToken {
            path,
            cached: Arc::new(Mutex::new(Cached {
                token,
                expire_at: Instant::now() + TOKEN_REFRESH_INTERVAL,
            })),
        })
    }

    fn token(&self) -> std::io::Result<String> {
        let now = Instant::now();
        let mut cached = self.cached.lock().unwrap();

        if now > cached.expire_at {
            cached.token = std::fs::read_to_string(&self.path)?;
            cached.expire_at = now + TOKEN_REFRESH_INTERVAL;
        }

        Ok(cached.token.clone())
    }
}

#[derive(Clone, Debug)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    RefreshableToken(RefreshableToken),
}

impl Auth {
    pub fn apply<T>(&self, req: &mut Request<T>) -> std::io::Result<()> {
        match self {
            Auth::None => {}
            Auth::Basic { username, password } => {
                req.headers_mut()
                    .typed_insert(Authorization::basic(username, password));
            }
            Auth::Bearer { token } => {
                req.headers_mut().typed_insert(bearer(token)?);
            }
            Auth::RefreshableToken(refreshable) => {
                let token = refreshable.token()?;
                req.headers_mut().typed_insert(bearer(&token)?);
            }
        }

        Ok(())
    }
}

// a token with header invalid bytes must surface as an error, not a panic
fn bearer(token: &str) -> std::io::Result<Authorization<headers::authorization::Bearer>> {
    Authorization::bearer(token).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bearer token contains invalid header characters",
        )
    })
}

/// Everything the client needs to reach the API server.
#[derive(Debug)]
pub struct Config {
    pub cluster_url: http::Uri,

    pub default_namespace: String,

    pub auth: Auth,

    pub tls: rustls::ClientConfig,
}

impl Config {
    /// Prefer the user's kubeconfig, fall back to the in-cluster service
    /// account environment.
    pub fn load() -> Result<Config, Error> {
        if let Ok(home) = std::env::var("HOME") {
            let path = PathBuf::from(home).join(".kube").join("config");
            if path.exists() {
                return kubeconfig::load(&path).map_err(Into::into);
            }
        }

        incluster::load().map_err(Into::into)
    }
}
