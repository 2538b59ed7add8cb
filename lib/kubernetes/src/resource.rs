use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;

/// An accessor trait for a namespaced Kubernetes resource.
pub trait Resource: DeserializeOwned {
    /// The API group, or the empty string for the core group.
    const GROUP: &'static str;

    /// The API version of the resource.
    const VERSION: &'static str;

    /// The plural name, used to construct request paths.
    const PLURAL: &'static str;

    fn url_path(namespace: Option<&str>) -> String {
        let prefix = if Self::GROUP.is_empty() {
            format!("/api/{}", Self::VERSION)
        } else {
            format!("/apis/{}/{}", Self::GROUP, Self::VERSION)
        };

        match namespace {
            Some(namespace) => format!("{}/namespaces/{}/{}", prefix, namespace, Self::PLURAL),
            None => format!("{}/{}", prefix, Self::PLURAL),
        }
    }
}

/// The subset of object metadata the client cares about.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default, rename = "resourceVersion")]
    pub resource_version: Option<String>,

    /// Set once the object is scheduled for deletion, it is never cleared.
    #[serde(default, rename = "deletionTimestamp")]
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

/// A generic Kubernetes object list, e.g. `PodList`.
#[derive(Deserialize)]
pub struct ObjectList<T> {
    /// Only really used for its `resourceVersion`.
    pub metadata: ListMeta,

    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Pod {
        #[allow(dead_code)]
        metadata: ObjectMeta,
    }

    impl Resource for Pod {
        const GROUP: &'static str = "";
        const VERSION: &'static str = "v1";
        const PLURAL: &'static str = "pods";
    }

    #[test]
    fn url_path() {
        assert_eq!(Pod::url_path(None), "/api/v1/pods");
        assert_eq!(
            Pod::url_path(Some("monitoring")),
            "/api/v1/namespaces/monitoring/pods"
        );
    }
}
