use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};

pub const PLACEHOLDER: &str = "<secret>";

// Whether `Secret` serializes its real value. The flag is process global,
// matching how Prometheus marshals its config secrets, so every marshalling
// of secret-bearing data must go through one of the scopes below or it may
// observe another caller's flag.
static EXPOSE_SECRETS: AtomicBool = AtomicBool::new(false);
static MARSHAL_LOCK: Mutex<()> = Mutex::new(());

/// Serialize secrets verbatim for the duration of `f`.
///
/// The mTLS listener is the only consumer of the output, everything else
/// must see [`PLACEHOLDER`].
pub fn with_secrets_exposed<T>(f: impl FnOnce() -> T) -> T {
    let _guard = MARSHAL_LOCK.lock();

    EXPOSE_SECRETS.store(true, Ordering::SeqCst);
    let result = f();
    EXPOSE_SECRETS.store(false, Ordering::SeqCst);

    result
}

/// Serialize with secrets redacted, shielded from concurrent
/// [`with_secrets_exposed`] scopes.
pub fn with_secrets_redacted<T>(f: impl FnOnce() -> T) -> T {
    let _guard = MARSHAL_LOCK.lock();
    f()
}

/// A string that never leaks through `Debug`, `Display` or serialization
/// unless explicitly exposed.
#[derive(Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_string())
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(PLACEHOLDER)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if EXPOSE_SECRETS.load(Ordering::SeqCst) {
            serializer.serialize_str(&self.0)
        } else {
            serializer.serialize_str(PLACEHOLDER)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_by_default() {
        let secret = Secret::new("hunter2");

        assert_eq!(format!("{secret}"), PLACEHOLDER);
        assert_eq!(format!("{secret:?}"), PLACEHOLDER);
        assert_eq!(
            with_secrets_redacted(|| serde_json::to_string(&secret).unwrap()),
            r#""<secret>""#
        );
    }

    #[test]
    fn exposed_inside_scope() {
        let secret = Secret::new("hunter2");

        let exposed = with_secrets_exposed(|| serde_json::to_string(&secret).unwrap());
        assert_eq!(exposed, r#""hunter2""#);

        // back to redacted once the scope ends
        assert_eq!(
            with_secrets_redacted(|| serde_json::to_string(&secret).unwrap()),
            r#""<secret>""#
        );
    }
}
