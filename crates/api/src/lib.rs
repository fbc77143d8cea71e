//! Kready public API façade (in-process).
//!
//! This crate defines the stable traits and types frontends (CLI, a resource
//! provider) depend on: awaiting readiness or deletion, replace decisions, and
//! the whole decide → submit → await sequence of one mutation.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kready_conditions::{AwaitSpec, Catalog};
use kready_core::{AwaitResult, CustomTimeouts, KindRef, ObjectRef, Operation, Outcome, PatchKind, ReplaceDecision, Settings};
use kready_kubehub::{ClusterError, ClusterSource, ClusterWriter, KubeSource};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use kready_apply::{DecideError, DiffSummary};
pub use kready_await::{AwaitRequest, Orchestrator};

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum KreadyError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KreadyResult<T> = Result<T, KreadyError>;

impl From<DecideError> for KreadyError {
    fn from(e: DecideError) -> Self {
        KreadyError::Validation(e.to_string())
    }
}

impl From<ClusterError> for KreadyError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::NotFound(m) => KreadyError::NotFound(m),
            ClusterError::Conflict(m) => KreadyError::Conflict(m),
            ClusterError::Invalid(m) => KreadyError::Validation(m),
            other => KreadyError::Internal(other.to_string()),
        }
    }
}

/// How a mutation reaches the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Create,
    Patch(PatchKind),
    /// Delete the old object, then create the new one.
    Replace,
}

impl Mutation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mutation::Create => "create",
            Mutation::Patch(_) => "patch",
            Mutation::Replace => "replace",
        }
    }
}

/// One orchestrator run within a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitPhase {
    CreateConvergence,
    UpdateConvergence,
    DeleteCompletion,
}

/// Submission strategy plus the awaits that follow it, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationPlan {
    pub mutation: Mutation,
    pub phases: Vec<AwaitPhase>,
}

impl MutationPlan {
    pub fn create() -> Self {
        Self { mutation: Mutation::Create, phases: vec![AwaitPhase::CreateConvergence] }
    }

    pub fn from_decision(d: &ReplaceDecision) -> Self {
        if d.requires_replace() {
            Self { mutation: Mutation::Replace, phases: vec![AwaitPhase::DeleteCompletion, AwaitPhase::CreateConvergence] }
        } else {
            Self { mutation: Mutation::Patch(d.patch_kind), phases: vec![AwaitPhase::UpdateConvergence] }
        }
    }
}

/// One mutation to submit and await.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Previously submitted document; `None` on first submission.
    pub last: Option<Value>,
    pub current: Value,
    #[serde(default)]
    pub custom_timeouts: CustomTimeouts,
    /// Caller timeout applied to every phase.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl ApplyRequest {
    pub fn new(last: Option<Value>, current: Value) -> Self {
        Self { last, current, custom_timeouts: CustomTimeouts::default(), timeout: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: AwaitPhase,
    pub result: AwaitResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub plan: MutationPlan,
    /// Absent when the object did not exist and was simply created.
    pub decision: Option<ReplaceDecision>,
    /// Field counts of the submitted document against the live one.
    pub summary: Option<DiffSummary>,
    /// One entry per phase that ran; a phase that does not end `Ready` stops the sequence.
    pub phases: Vec<PhaseResult>,
}

impl ApplyOutcome {
    /// Result of the last phase that ran.
    pub fn final_result(&self) -> Option<&AwaitResult> {
        self.phases.last().map(|p| &p.result)
    }

    pub fn is_ready(&self) -> bool {
        self.phases.len() == self.plan.phases.len() && self.phases.iter().all(|p| p.result.is_ready())
    }
}

/// Declarative readiness API surface.
#[async_trait::async_trait]
pub trait ReadinessApi: Send + Sync {
    /// Await create/update convergence of one object.
    async fn await_ready(&self, req: AwaitRequest, cancel: &CancellationToken) -> KreadyResult<AwaitResult>;

    /// Await the disappearance of one object.
    async fn await_deleted(&self, req: AwaitRequest, cancel: &CancellationToken) -> KreadyResult<AwaitResult>;

    /// Patch plus replace set for a mutation; nothing is submitted.
    async fn decide(&self, last: Option<&Value>, current: &Value, live: Option<&Value>) -> KreadyResult<ReplaceDecision>;

    /// Every catalog entry, sorted by gvk key.
    async fn catalog(&self) -> KreadyResult<Vec<AwaitSpec>>;

    /// The spec an await of `kind` would use (never fails for unknown kinds).
    async fn spec_for(&self, kind: &KindRef) -> KreadyResult<AwaitSpec>;

    /// Decide, submit and await one mutation.
    async fn apply(&self, req: ApplyRequest, cancel: &CancellationToken) -> KreadyResult<ApplyOutcome>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation over a live (or fake) cluster.
pub struct InProcApi {
    orchestrator: Orchestrator,
    source: Arc<dyn ClusterSource>,
    writer: Arc<dyn ClusterWriter>,
}

impl InProcApi {
    pub fn new(orchestrator: Orchestrator, source: Arc<dyn ClusterSource>, writer: Arc<dyn ClusterWriter>) -> Self {
        Self { orchestrator, source, writer }
    }

    /// Connect to the current kube context with pacing and catalog options from `settings`.
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let kube = Arc::new(KubeSource::connect(settings).await?);
        let catalog = Arc::new(Catalog::builtin()?.with_generic_await(settings.await_all)?);
        let orchestrator = Orchestrator::from_settings(catalog, kube.clone(), settings);
        Ok(Self::new(orchestrator, kube.clone(), kube))
    }

    fn request(&self, target: &ObjectRef, op: Operation, obj: &Value, req: &ApplyRequest) -> AwaitRequest {
        let r = AwaitRequest::new(target.clone(), op).with_object(obj.clone()).with_custom_timeouts(req.custom_timeouts);
        match req.timeout {
            Some(t) => r.with_timeout(t),
            None => r,
        }
    }

    async fn create_and_await(&self, req: &ApplyRequest, target: &ObjectRef, cancel: &CancellationToken) -> KreadyResult<PhaseResult> {
        let created = self.writer.create(&req.current).await?;
        let result = self.orchestrator.await_ready(self.request(target, Operation::Create, &created, req), cancel).await;
        Ok(PhaseResult { phase: AwaitPhase::CreateConvergence, result })
    }
}

#[async_trait::async_trait]
impl ReadinessApi for InProcApi {
    async fn await_ready(&self, req: AwaitRequest, cancel: &CancellationToken) -> KreadyResult<AwaitResult> {
        Ok(self.orchestrator.await_ready(req, cancel).await)
    }

    async fn await_deleted(&self, req: AwaitRequest, cancel: &CancellationToken) -> KreadyResult<AwaitResult> {
        Ok(self.orchestrator.await_deleted(req, cancel).await)
    }

    async fn decide(&self, last: Option<&Value>, current: &Value, live: Option<&Value>) -> KreadyResult<ReplaceDecision> {
        Ok(kready_apply::decide(last, current, live)?)
    }

    async fn catalog(&self) -> KreadyResult<Vec<AwaitSpec>> {
        Ok(self.orchestrator.catalog().entries().iter().map(|s| (**s).clone()).collect())
    }

    async fn spec_for(&self, kind: &KindRef) -> KreadyResult<AwaitSpec> {
        Ok((*self.orchestrator.catalog().lookup(kind)).clone())
    }

    async fn apply(&self, req: ApplyRequest, cancel: &CancellationToken) -> KreadyResult<ApplyOutcome> {
        let t0 = Instant::now();
        let target = ObjectRef::of_object(&req.current)
            .ok_or_else(|| KreadyError::Validation("current document needs apiVersion, kind and metadata.name".into()))?;
        // A rename or kind change replaces the object the last submission created.
        let previous = req.last.as_ref().and_then(ObjectRef::of_object).unwrap_or_else(|| target.clone());
        info!(obj = %target, "api: apply start");

        let live = self.source.get(&previous.kind, previous.namespace.as_deref(), &previous.name).await?;
        let Some(live) = live else {
            let plan = MutationPlan::create();
            counter!("api_mutations_total", 1u64, "mutation" => plan.mutation.as_str());
            let phase = self.create_and_await(&req, &target, cancel).await?;
            info!(obj = %target, outcome = phase.result.outcome.as_str(), took_ms = %t0.elapsed().as_millis(), "api: apply done");
            return Ok(ApplyOutcome { plan, decision: None, summary: None, phases: vec![phase] });
        };

        let decision = kready_apply::decide(req.last.as_ref(), &req.current, Some(&live))?;
        let plan = MutationPlan::from_decision(&decision);
        let summary = kready_apply::diff_summary(
            &kready_apply::strip_server_fields(req.current.clone()),
            &kready_apply::strip_server_fields(live.clone()),
        );
        counter!("api_mutations_total", 1u64, "mutation" => plan.mutation.as_str());
        info!(obj = %target, mutation = plan.mutation.as_str(), replace = ?decision.replace_fields, "api: apply planned");

        let mut phases = Vec::with_capacity(plan.phases.len());
        match plan.mutation {
            Mutation::Patch(kind) => {
                let patched = self.writer.patch(&previous, kind, &decision.patch).await?;
                let result = self.orchestrator.await_ready(self.request(&target, Operation::Update, &patched, &req), cancel).await;
                phases.push(PhaseResult { phase: AwaitPhase::UpdateConvergence, result });
            }
            Mutation::Replace => {
                if !self.writer.delete(&previous).await? {
                    warn!(obj = %previous, "api: object vanished before delete");
                }
                let result = self.orchestrator.await_deleted(self.request(&previous, Operation::Delete, &live, &req), cancel).await;
                let gone = result.outcome == Outcome::Ready;
                phases.push(PhaseResult { phase: AwaitPhase::DeleteCompletion, result });
                if gone {
                    phases.push(self.create_and_await(&req, &target, cancel).await?);
                }
            }
            Mutation::Create => phases.push(self.create_and_await(&req, &target, cancel).await?),
        }
        let outcome = phases.last().map(|p| p.result.outcome.as_str()).unwrap_or("none");
        info!(obj = %target, outcome, took_ms = %t0.elapsed().as_millis(), "api: apply done");
        Ok(ApplyOutcome { plan, decision: Some(decision), summary: Some(summary), phases })
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests.
#[derive(Default)]
pub struct MockApi {
    pub ready: Option<AwaitResult>,
    pub deleted: Option<AwaitResult>,
    pub decision: Option<ReplaceDecision>,
    pub specs: Vec<AwaitSpec>,
    pub applied: Option<ApplyOutcome>,
}

impl MockApi { pub fn new() -> Self { Self::default() } }

#[async_trait::async_trait]
impl ReadinessApi for MockApi {
    async fn await_ready(&self, _req: AwaitRequest, _cancel: &CancellationToken) -> KreadyResult<AwaitResult> {
        self.ready.clone().ok_or_else(|| KreadyError::Internal("no await result configured".into()))
    }

    async fn await_deleted(&self, _req: AwaitRequest, _cancel: &CancellationToken) -> KreadyResult<AwaitResult> {
        self.deleted.clone().ok_or_else(|| KreadyError::Internal("no delete result configured".into()))
    }

    async fn decide(&self, _last: Option<&Value>, _current: &Value, _live: Option<&Value>) -> KreadyResult<ReplaceDecision> {
        self.decision.clone().ok_or_else(|| KreadyError::Internal("no decision configured".into()))
    }

    async fn catalog(&self) -> KreadyResult<Vec<AwaitSpec>> { Ok(self.specs.clone()) }

    async fn spec_for(&self, kind: &KindRef) -> KreadyResult<AwaitSpec> {
        Ok(self.specs.iter().find(|s| s.kind.same_kind(kind)).cloned().unwrap_or_else(|| AwaitSpec::no_op(kind.clone())))
    }

    async fn apply(&self, _req: ApplyRequest, _cancel: &CancellationToken) -> KreadyResult<ApplyOutcome> {
        self.applied.clone().ok_or_else(|| KreadyError::Internal("no apply configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(fields: &[&str]) -> ReplaceDecision {
        ReplaceDecision {
            patch: b"{}".to_vec(),
            patch_kind: PatchKind::StrategicMerge,
            replace_fields: fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn plan_follows_the_replace_set() {
        let p = MutationPlan::from_decision(&decision(&[]));
        assert_eq!(p.mutation, Mutation::Patch(PatchKind::StrategicMerge));
        assert_eq!(p.phases, vec![AwaitPhase::UpdateConvergence]);
        let p = MutationPlan::from_decision(&decision(&["metadata.name"]));
        assert_eq!(p.mutation, Mutation::Replace);
        assert_eq!(p.phases, vec![AwaitPhase::DeleteCompletion, AwaitPhase::CreateConvergence]);
        assert_eq!(MutationPlan::create().phases, vec![AwaitPhase::CreateConvergence]);
    }

    #[test]
    fn cluster_errors_map_to_api_errors() {
        assert!(matches!(KreadyError::from(ClusterError::NotFound("x".into())), KreadyError::NotFound(_)));
        assert!(matches!(KreadyError::from(ClusterError::Conflict("x".into())), KreadyError::Conflict(_)));
        assert!(matches!(KreadyError::from(ClusterError::Transport("x".into())), KreadyError::Internal(_)));
        assert!(matches!(KreadyError::from(DecideError::MissingKind), KreadyError::Validation(_)));
    }

    #[tokio::test]
    async fn mock_returns_configured_values() {
        let api = MockApi { decision: Some(decision(&["spec.selector"])), ..Default::default() };
        let d = api.decide(None, &Value::Null, None).await.unwrap();
        assert!(d.requires_replace());
        let spec = api.spec_for(&KindRef::new("example.com", "v1", "Widget")).await.unwrap();
        assert!(spec.is_no_op());
        assert!(api.await_ready(AwaitRequest::new(ObjectRef::new(spec.kind, None, "w"), Operation::Create), &CancellationToken::new()).await.is_err());
    }
}
