//! Kready await (Milestone 3) – the readiness state machine.
//!
//! One [`Orchestrator`] run takes a target from `Pending` through `Observing`
//! to exactly one of `Ready`, `Failed`, `TimedOut` or `Cancelled`. Every
//! outcome is returned as an [`AwaitResult`] value; nothing here errors or
//! panics on cluster trouble. Runs share no mutable state and can proceed
//! concurrently over one `Orchestrator`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kready_conditions::{evaluate, AwaitSpec, Catalog, Evaluation};
use kready_core::{
    skip_await, timeout_annotation, AwaitResult, AwaitState, CustomTimeouts, ObjectRef, ObservedState, Operation, Outcome, Settings,
};
use kready_kubehub::ClusterSource;
use kready_observe::{Observation, Observer, ObserverConfig};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub mod diagnostic;

use diagnostic::Trail;

/// One await: which object, for which operation, with which overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct AwaitRequest {
    pub target: ObjectRef,
    pub op: Operation,
    pub custom_timeouts: CustomTimeouts,
    /// Explicit timeout from the caller; wins over everything else.
    pub timeout: Option<Duration>,
    /// The submitted object; its annotations carry skip/timeout overrides.
    /// When absent the live object is read once before observing.
    pub object: Option<Value>,
    /// Settle window override for kinds that declare one.
    pub settle: Option<Duration>,
}

impl AwaitRequest {
    pub fn new(target: ObjectRef, op: Operation) -> Self {
        Self { target, op, custom_timeouts: CustomTimeouts::default(), timeout: None, object: None, settle: None }
    }

    /// Request for a submitted object; `None` when it has no apiVersion/kind/name.
    pub fn for_object(obj: &Value, op: Operation) -> Option<Self> {
        let target = ObjectRef::of_object(obj)?;
        Some(Self::new(target, op).with_object(obj.clone()))
    }

    pub fn with_object(mut self, obj: Value) -> Self {
        self.object = Some(obj);
        self
    }

    pub fn with_custom_timeouts(mut self, ct: CustomTimeouts) -> Self {
        self.custom_timeouts = ct;
        self
    }

    pub fn with_timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }

    pub fn with_settle(mut self, d: Duration) -> Self {
        self.settle = Some(d);
        self
    }

    /// Caller timeout, then `customTimeouts[op]`, then the timeout annotation, then the spec default.
    pub fn effective_timeout(&self, spec: &AwaitSpec) -> Duration {
        self.timeout
            .or_else(|| self.custom_timeouts.for_op(self.op))
            .or_else(|| self.object.as_ref().and_then(timeout_annotation))
            .unwrap_or_else(|| spec.default_timeout(self.op))
    }

    fn skipped(&self) -> bool {
        self.object.as_ref().map(skip_await).unwrap_or(false)
    }
}

/// Drives evaluation over observed snapshots until a terminal state.
#[derive(Clone)]
pub struct Orchestrator {
    catalog: Arc<Catalog>,
    observer: Observer,
    settle: Duration,
}

impl Orchestrator {
    pub fn new(catalog: Arc<Catalog>, observer: Observer, settle: Duration) -> Self {
        Self { catalog, observer, settle }
    }

    pub fn from_settings(catalog: Arc<Catalog>, source: Arc<dyn ClusterSource>, settings: &Settings) -> Self {
        Self::new(catalog, Observer::new(source, ObserverConfig::from(settings)), settings.service_settle)
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Await create/update convergence of `req.target`.
    pub async fn await_ready(&self, req: AwaitRequest, cancel: &CancellationToken) -> AwaitResult {
        let spec = self.catalog.lookup(&req.target.kind);
        self.run(req, spec, false, cancel).await
    }

    /// Await the disappearance of `req.target`.
    pub async fn await_deleted(&self, mut req: AwaitRequest, cancel: &CancellationToken) -> AwaitResult {
        req.op = Operation::Delete;
        let spec = self.catalog.deletion(&req.target.kind);
        self.run(req, spec, true, cancel).await
    }

    async fn run(&self, req: AwaitRequest, spec: Arc<AwaitSpec>, deleting: bool, cancel: &CancellationToken) -> AwaitResult {
        let span = info_span!("await", run = %Uuid::new_v4(), obj = %req.target, op = req.op.as_str());
        let res = async {
            let req = self.with_live_object(req, cancel).await;
            Run::new(&req, spec, deleting, req.settle.unwrap_or(self.settle)).drive(&self.observer, cancel).await
        }
        .instrument(span)
        .await;
        counter!("await_runs_total", 1u64, "outcome" => res.outcome.as_str());
        histogram!("await_duration_ms", res.elapsed_ms as f64);
        res
    }
}

impl Orchestrator {
    /// Requests that carry no object read the live one once, so its
    /// skip/timeout annotations apply before observing starts.
    async fn with_live_object(&self, mut req: AwaitRequest, cancel: &CancellationToken) -> AwaitRequest {
        if req.object.is_some() {
            return req;
        }
        let t = &req.target;
        let got = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            got = self.observer.source().get(&t.kind, t.namespace.as_deref(), &t.name) => Some(got),
        };
        match got {
            Some(Ok(obj)) => req.object = obj,
            Some(Err(e)) => debug!(error = %e, "await: live object unavailable; no annotation overrides"),
            None => {}
        }
        req
    }
}

/// Per-run bookkeeping; owned by exactly one task.
struct Run<'a> {
    req: &'a AwaitRequest,
    spec: Arc<AwaitSpec>,
    deleting: bool,
    settle: Duration,
    state: AwaitState,
    started: Instant,
    last_state: Option<ObservedState>,
    last_eval: Option<Evaluation>,
    trail: Trail,
    snapshots: u64,
    settle_until: Option<Instant>,
}

impl<'a> Run<'a> {
    fn new(req: &'a AwaitRequest, spec: Arc<AwaitSpec>, deleting: bool, settle: Duration) -> Self {
        Self {
            req,
            spec,
            deleting,
            settle,
            state: AwaitState::Pending,
            started: Instant::now(),
            last_state: None,
            last_eval: None,
            trail: Trail::default(),
            snapshots: 0,
            settle_until: None,
        }
    }

    fn transition(&mut self, next: AwaitState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "await: transition");
            self.state = next;
        }
    }

    async fn drive(mut self, observer: &Observer, cancel: &CancellationToken) -> AwaitResult {
        let req = self.req;
        if req.skipped() {
            info!("await: skipAwait annotation set");
            return self.finish(Outcome::Ready, format!("{} ready (await skipped)", req.target));
        }
        let timeout = req.effective_timeout(&self.spec);
        let deadline = self.started + timeout;
        info!(timeout_s = timeout.as_secs(), rules = self.spec.rules.len(), "await: start");

        let mut obs = observer.observe(req.target.clone(), self.spec.clone(), cancel);
        loop {
            let settling = self.settling();
            let settle_at = self.settle_until.unwrap_or(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.finish(Outcome::Cancelled, format!("{}: await cancelled", req.target));
                }
                _ = sleep_until(deadline) => {
                    let msg = self.unmet_message();
                    return self.finish(Outcome::TimedOut, msg);
                }
                _ = sleep_until(settle_at), if settling => {
                    debug!("await: settle window elapsed");
                    return self.finish(Outcome::Ready, format!("{} ready", req.target));
                }
                next = obs.next() => match next {
                    Some(Observation::State(st)) => {
                        if let Some(done) = self.on_snapshot(st) {
                            return done;
                        }
                    }
                    Some(Observation::Exhausted(e)) => {
                        return self.finish(Outcome::Failed, format!("{}: observation failed: {e}", req.target));
                    }
                    None if cancel.is_cancelled() => {
                        return self.finish(Outcome::Cancelled, format!("{}: await cancelled", req.target));
                    }
                    None => {
                        return self.finish(Outcome::Failed, format!("{}: observation ended unexpectedly", req.target));
                    }
                },
            }
        }
    }

    /// Ready by rules, held back only by an open settle window.
    fn settling(&self) -> bool {
        self.last_eval.as_ref().map(Evaluation::is_ready).unwrap_or(false) && self.settle_until.is_some()
    }

    fn on_snapshot(&mut self, st: ObservedState) -> Option<AwaitResult> {
        self.snapshots += 1;
        self.transition(AwaitState::Observing);
        let ev = evaluate(&self.spec, &st);
        debug!(
            rv = st.resource_version().unwrap_or("-"),
            unmet = ?ev.unmet,
            failed = ev.terminally_failed,
            "await: evaluated"
        );
        self.trail.record(&st, &ev);
        if self.settle_until.is_none() {
            if let Some(kind) = &self.spec.settle_on {
                if st.dependents_of(kind).next().is_some() {
                    debug!(settle_ms = self.settle.as_millis() as u64, "await: settle window opened");
                    self.settle_until = Some(Instant::now() + self.settle);
                }
            }
        }
        let failed = ev.terminally_failed;
        let ready = ev.is_ready();
        self.last_state = Some(st);
        self.last_eval = Some(ev);
        if failed {
            let msg = self.last_eval.as_ref().map(|ev| diagnostic::failed(&self.req.target, ev)).unwrap_or_default();
            return Some(self.finish_in_place(Outcome::Failed, msg));
        }
        let settled = self.settle_until.map(|t| Instant::now() >= t).unwrap_or(true);
        if ready && settled {
            let msg = if self.deleting { format!("{} deleted", self.req.target) } else { format!("{} ready", self.req.target) };
            return Some(self.finish_in_place(Outcome::Ready, msg));
        }
        None
    }

    fn unmet_message(&self) -> String {
        if self.deleting {
            diagnostic::not_deleted(&self.req.target, self.last_eval.as_ref())
        } else {
            diagnostic::not_ready(&self.req.target, self.last_state.as_ref(), self.last_eval.as_ref())
        }
    }

    fn finish(mut self, outcome: Outcome, message: String) -> AwaitResult {
        self.finish_in_place(outcome, message)
    }

    fn finish_in_place(&mut self, outcome: Outcome, message: String) -> AwaitResult {
        self.transition(AwaitState::from(outcome));
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let unmet = match outcome {
            Outcome::Ready => Vec::new(),
            _ => self.last_eval.as_ref().map(|e| e.unmet.iter().cloned().collect()).unwrap_or_default(),
        };
        info!(outcome = outcome.as_str(), snapshots = self.snapshots, took_ms = elapsed_ms, message = %message, "await: done");
        AwaitResult {
            outcome,
            last_state: self.last_state.take(),
            unmet,
            message,
            trail: std::mem::take(&mut self.trail).into_vec(),
            snapshots: self.snapshots,
            elapsed_ms,
        }
    }
}
