//! Kready kubehub (Milestone 0) – cluster reads/writes, discovery and request pacing

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use kready_core::{KindRef, ObjectRef, PatchKind};
use serde_json::Value;

pub mod crd;
pub mod fake;
pub mod kube_source;
pub mod ratelimit;

pub use kube_source::{get_kube_client, KubeSource};
pub use ratelimit::RateLimiter;

/// Failures talking to the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("watch expired: {0}")]
    WatchExpired(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClusterError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Transport(_) | ClusterError::WatchExpired(_) | ClusterError::Throttled(_))
    }

    /// Classify an API status code.
    pub fn from_status(code: u16, msg: String) -> Self {
        match code {
            404 => ClusterError::NotFound(msg),
            401 | 403 => ClusterError::Forbidden(msg),
            409 => ClusterError::Conflict(msg),
            410 => ClusterError::WatchExpired(msg),
            429 => ClusterError::Throttled(msg),
            c if c >= 500 => ClusterError::Transport(msg),
            _ => ClusterError::Invalid(msg),
        }
    }
}

/// List/watch narrowing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListQuery {
    pub fn named(name: &str) -> Self {
        Self { label_selector: None, field_selector: Some(format!("metadata.name={name}")) }
    }

    pub fn labels(selector: Option<&str>) -> Self {
        Self { label_selector: selector.map(str::to_string), field_selector: None }
    }

    /// Client-side check of the query against an object (used by fakes and poll filtering).
    pub fn matches(&self, obj: &Value) -> bool {
        if let Some(fs) = &self.field_selector {
            for term in fs.split(',') {
                if let Some(("metadata.name", want)) = term.split_once('=') {
                    if kready_core::meta::name(obj) != Some(want) {
                        return false;
                    }
                }
            }
        }
        if let Some(ls) = &self.label_selector {
            let labels = obj.get("metadata").and_then(|m| m.get("labels"));
            for term in ls.split(',').filter(|t| !t.is_empty()) {
                let Some((k, v)) = term.split_once('=') else { continue };
                if labels.and_then(|l| l.get(k)).and_then(Value::as_str) != Some(v) {
                    return false;
                }
            }
        }
        true
    }
}

/// One event from a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Applied(Value),
    Deleted(Value),
    /// Full relist after (re)connecting.
    Restarted(Vec<Value>),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// Read side of the cluster API.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, kind: &KindRef, namespace: Option<&str>, name: &str) -> Result<Option<Value>, ClusterError>;

    async fn list(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Result<Vec<Value>, ClusterError>;

    /// Open a watch. The stream ends or yields `Err` on transport trouble; callers reopen.
    async fn watch(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Result<WatchStream, ClusterError>;
}

/// Write side of the cluster API.
#[async_trait]
pub trait ClusterWriter: Send + Sync {
    async fn create(&self, obj: &Value) -> Result<Value, ClusterError>;

    async fn patch(&self, target: &ObjectRef, kind: PatchKind, patch: &[u8]) -> Result<Value, ClusterError>;

    /// `Ok(false)` when the object was already gone.
    async fn delete(&self, target: &ObjectRef) -> Result<bool, ClusterError>;
}

/// Remove `metadata.managedFields` from a raw object.
pub fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_codes_classify_retryability() {
        assert!(ClusterError::from_status(503, "down".into()).is_retryable());
        assert!(ClusterError::from_status(410, "too old".into()).is_retryable());
        assert!(ClusterError::from_status(429, "slow down".into()).is_retryable());
        assert!(!ClusterError::from_status(403, "nope".into()).is_retryable());
        assert!(!ClusterError::from_status(404, "gone".into()).is_retryable());
        assert!(matches!(ClusterError::from_status(422, "bad".into()), ClusterError::Invalid(_)));
    }

    #[test]
    fn list_query_matches_name_and_labels() {
        let obj = json!({"metadata": {"name": "web-1", "labels": {"app": "web", "tier": "fe"}}});
        assert!(ListQuery::named("web-1").matches(&obj));
        assert!(!ListQuery::named("web-2").matches(&obj));
        assert!(ListQuery::labels(Some("app=web,tier=fe")).matches(&obj));
        assert!(!ListQuery::labels(Some("app=db")).matches(&obj));
        assert!(ListQuery::default().matches(&obj));
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = json!({"metadata": {"name": "a", "managedFields": [{}]}});
        strip_managed_fields(&mut v);
        assert_eq!(v, json!({"metadata": {"name": "a"}}));
    }
}
