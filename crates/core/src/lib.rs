//! Kready core types (Milestone 0): kinds, snapshots, await outcomes and replace decisions

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod meta;
pub mod settings;

pub use settings::{Settings, Transport};

/// Per-resource opt-out of awaiting.
pub const SKIP_AWAIT_ANNOTATION: &str = "pulumi.com/skipAwait";
/// Per-resource timeout override in seconds.
pub const TIMEOUT_ANNOTATION: &str = "pulumi.com/timeoutSeconds";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
    #[error("invalid {var}={value}: {reason}")]
    InvalidSetting { var: String, value: String, reason: String },
}

/// Group/version/kind of a Kubernetes type. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KindRef {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindRef {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(CoreError::InvalidGvk(key.to_string())),
        }
    }

    /// Build from an object's `apiVersion` (`v1` or `apps/v1`) and `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Read `apiVersion`/`kind` off a raw object.
    pub fn of_object(obj: &Value) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?;
        let kind = obj.get("kind")?.as_str()?;
        Some(Self::from_api_version(api_version, kind))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Group with legacy aliases folded: workload kinds served from `extensions`
    /// belong to `apps`, Ingress to `networking.k8s.io`.
    pub fn canonical_group(&self) -> &str {
        match (self.group.as_str(), self.kind.as_str()) {
            ("extensions", "Deployment" | "DaemonSet" | "ReplicaSet") => "apps",
            ("extensions", "Ingress") => "networking.k8s.io",
            (g, _) => g,
        }
    }

    /// Same type regardless of served version.
    pub fn same_kind(&self, other: &KindRef) -> bool {
        self.kind == other.kind && self.canonical_group() == other.canonical_group()
    }
}

impl fmt::Display for KindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Identity of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: KindRef,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: KindRef, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    /// Identity of a raw object; `None` when apiVersion/kind/name is missing.
    pub fn of_object(obj: &Value) -> Option<Self> {
        let kind = KindRef::of_object(obj)?;
        let name = meta::name(obj)?;
        Some(Self::new(kind, meta::namespace(obj), name))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind.kind, self.name),
        }
    }
}

/// Immutable snapshot of a target and the dependents observed alongside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// `None` while the target does not exist (yet, or any more).
    pub target: Option<Value>,
    pub dependents: BTreeMap<KindRef, Vec<Value>>,
    /// `status.observedGeneration` of the target, when published.
    pub observed_generation: Option<i64>,
    pub timestamp_ms: i64,
}

impl ObservedState {
    pub fn new(target: Option<Value>) -> Self {
        let observed_generation = target.as_ref().and_then(meta::observed_generation);
        Self { target, dependents: BTreeMap::new(), observed_generation, timestamp_ms: chrono::Utc::now().timestamp_millis() }
    }

    pub fn with_dependents(mut self, kind: KindRef, objects: Vec<Value>) -> Self {
        self.dependents.insert(kind, objects);
        self
    }

    /// Dependents of `kind`, matched regardless of served version.
    pub fn dependents_of<'a>(&'a self, kind: &KindRef) -> impl Iterator<Item = &'a Value> + 'a {
        let kind = kind.clone();
        self.dependents.iter().filter(move |(k, _)| k.same_kind(&kind)).flat_map(|(_, v)| v.iter())
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.target.as_ref().and_then(meta::resource_version)
    }

    pub fn generation(&self) -> Option<i64> {
        self.target.as_ref().and_then(meta::generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Ready,
    Failed,
    TimedOut,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ready => "ready",
            Outcome::Failed => "failed",
            Outcome::TimedOut => "timed_out",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Orchestrator states; the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwaitState {
    Pending,
    Observing,
    Ready,
    Failed,
    TimedOut,
    Cancelled,
}

impl AwaitState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AwaitState::Pending | AwaitState::Observing)
    }
}

impl From<Outcome> for AwaitState {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Ready => AwaitState::Ready,
            Outcome::Failed => AwaitState::Failed,
            Outcome::TimedOut => AwaitState::TimedOut,
            Outcome::Cancelled => AwaitState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// `customTimeouts` resource option, in seconds per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTimeouts {
    pub create: Option<u64>,
    pub update: Option<u64>,
    pub delete: Option<u64>,
}

impl CustomTimeouts {
    pub fn for_op(&self, op: Operation) -> Option<Duration> {
        let secs = match op {
            Operation::Create => self.create,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        };
        secs.map(Duration::from_secs)
    }
}

/// One change of the unmet set during an await run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub at_ms: i64,
    pub resource_version: Option<String>,
    pub unmet: Vec<String>,
}

/// Final value of one await run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitResult {
    pub outcome: Outcome,
    pub last_state: Option<ObservedState>,
    pub unmet: Vec<String>,
    pub message: String,
    pub trail: Vec<TrailEntry>,
    /// Snapshots consumed; zero for skipped awaits.
    pub snapshots: u64,
    pub elapsed_ms: u64,
}

impl AwaitResult {
    pub fn is_ready(&self) -> bool {
        self.outcome == Outcome::Ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchKind {
    StrategicMerge,
    JsonMerge,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::StrategicMerge => "application/strategic-merge-patch+json",
            PatchKind::JsonMerge => "application/merge-patch+json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKind::StrategicMerge => "strategic",
            PatchKind::JsonMerge => "json_merge",
        }
    }
}

/// Patch to submit and the fields forcing destroy-then-create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceDecision {
    pub patch: Vec<u8>,
    pub patch_kind: PatchKind,
    pub replace_fields: Vec<String>,
}

impl ReplaceDecision {
    pub fn requires_replace(&self) -> bool {
        !self.replace_fields.is_empty()
    }

    pub fn patch_json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.patch)
    }
}

/// `pulumi.com/skipAwait: "true"` on the object.
pub fn skip_await(obj: &Value) -> bool {
    meta::annotation(obj, SKIP_AWAIT_ANNOTATION) == Some("true")
}

/// `pulumi.com/timeoutSeconds` on the object, when it parses.
pub fn timeout_annotation(obj: &Value) -> Option<Duration> {
    meta::annotation(obj, TIMEOUT_ANNOTATION)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
