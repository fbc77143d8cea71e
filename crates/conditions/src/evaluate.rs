//! Pure classification of one observed snapshot against an await spec.

use std::collections::{BTreeMap, BTreeSet};

use kready_core::{meta, KindRef, ObservedState};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dependents::dependents;
use crate::rule::{AwaitSpec, GenerationReq, Predicate};

/// Name reported while status lags the spec generation.
pub const OBSERVED_GENERATION: &str = "ObservedGeneration";

/// Detail key holding container waiting/terminated reasons of the Pods involved.
pub const CONTAINERS: &str = "Containers";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub satisfied: BTreeSet<String>,
    pub unmet: BTreeSet<String>,
    pub terminally_failed: bool,
    /// Why the object failed terminally.
    pub failure: Option<String>,
    /// Per unmet rule explanation, when one is available.
    pub details: BTreeMap<String, String>,
    /// Replica style progress such as `0/3 replicas ready`.
    pub progress: Option<String>,
}

impl Evaluation {
    pub fn is_ready(&self) -> bool {
        !self.terminally_failed && self.unmet.is_empty()
    }

    /// `A, B (detail)` rendering of the unmet set.
    pub fn describe_unmet(&self) -> String {
        let mut parts = Vec::with_capacity(self.unmet.len());
        for name in self.unmet.iter() {
            match self.details.get(name) {
                Some(d) => parts.push(format!("{name} ({d})")),
                None => parts.push(name.clone()),
            }
        }
        parts.join(", ")
    }
}

struct Ctx<'a> {
    spec: &'a AwaitSpec,
    state: &'a ObservedState,
    target: &'a Value,
}

fn non_empty(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

fn find_condition<'a>(subject: &'a Value, type_: &str) -> Option<&'a Value> {
    subject
        .get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn holds(pred: &Predicate, subject: &Value, ctx: &Ctx<'_>) -> bool {
    match pred {
        Predicate::Exists => !subject.is_null(),
        Predicate::Absent => subject.is_null(),
        Predicate::Equals { path, value } => path.select(subject).into_iter().any(|v| v == value),
        Predicate::OneOf { path, values } => path.select(subject).into_iter().any(|v| values.contains(v)),
        Predicate::FieldsEqual(ops) => {
            let mut resolved = ops.iter().map(|o| o.path.first(subject).or(o.default.as_ref()));
            match resolved.next() {
                Some(Some(first)) => resolved.all(|v| v == Some(first)),
                _ => false,
            }
        }
        Predicate::GreaterThan { path, value } => path.first(subject).and_then(Value::as_i64).map(|n| n > *value).unwrap_or(false),
        Predicate::NonEmpty(path) => path.select(subject).into_iter().any(non_empty),
        Predicate::Condition { type_, status, reason } => match find_condition(subject, type_) {
            Some(c) => {
                c.get("status").and_then(Value::as_str) == Some(status.as_str())
                    && reason.as_deref().map_or(true, |r| c.get("reason").and_then(Value::as_str) == Some(r))
            }
            None => false,
        },
        Predicate::MatchesTarget { path, target_path } => match (path.first(subject), target_path.first(ctx.target)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        Predicate::Not(p) => !holds(p, subject, ctx),
        Predicate::All(ps) => ps.iter().all(|p| holds(p, subject, ctx)),
        Predicate::Any(ps) => ps.iter().any(|p| holds(p, subject, ctx)),
        Predicate::When { guard, then } => !holds(guard, subject, ctx) || holds(then, subject, ctx),
        Predicate::Dependent { kind, each } => ctx.state.dependents_of(kind).any(|d| holds(each, d, ctx)),
        Predicate::EveryResolved { kind } => {
            let wanted: Vec<_> = dependents(ctx.spec, Some(ctx.target)).into_iter().filter(|r| r.kind.same_kind(kind)).collect();
            wanted.iter().all(|r| ctx.state.dependents_of(kind).any(|d| r.admits(d)))
        }
    }
}

fn generation_ok(req: &GenerationReq, state: &ObservedState, target: &Value) -> bool {
    match req {
        GenerationReq::Current => match (state.observed_generation, meta::generation(target)) {
            (Some(observed), Some(want)) => observed >= want,
            (None, Some(_)) => false,
            (_, None) => true,
        },
        GenerationReq::AtLeast(want) => state.observed_generation.map_or(false, |g| g >= *want),
    }
}

/// Current status of the first condition a predicate looks at.
fn condition_detail(pred: &Predicate, target: &Value) -> Option<String> {
    match pred {
        Predicate::Condition { type_, .. } => {
            let c = find_condition(target, type_)?;
            let status = c.get("status").and_then(Value::as_str).unwrap_or("Unknown");
            let mut out = format!("{type_}={status}");
            if let Some(r) = c.get("reason").and_then(Value::as_str) {
                out.push_str(&format!(" reason={r}"));
            }
            if let Some(m) = c.get("message").and_then(Value::as_str).filter(|m| !m.is_empty()) {
                out.push_str(&format!(": {m}"));
            }
            Some(out)
        }
        Predicate::Not(p) => condition_detail(p, target),
        Predicate::When { then, .. } => condition_detail(then, target),
        Predicate::All(ps) | Predicate::Any(ps) => ps.iter().find_map(|p| condition_detail(p, target)),
        _ => None,
    }
}

fn as_count(v: Option<&Value>) -> Option<i64> {
    v.and_then(Value::as_i64)
}

/// `ready/desired` for kinds that publish replica counters.
pub fn progress(target: &Value) -> Option<String> {
    let status = target.get("status");
    let spec = target.get("spec");
    if let Some(desired) = as_count(status.and_then(|s| s.get("desiredNumberScheduled"))) {
        let ready = as_count(status.and_then(|s| s.get("numberReady"))).unwrap_or(0);
        return Some(format!("{ready}/{desired} pods ready"));
    }
    let desired = spec.and_then(|s| s.get("replicas"))?.as_i64()?;
    let ready = as_count(status.and_then(|s| s.get("readyReplicas"))).unwrap_or(0);
    Some(format!("{ready}/{desired} replicas ready"))
}

/// Classify one snapshot. Deterministic: the same inputs give the same evaluation.
pub fn evaluate(spec: &AwaitSpec, state: &ObservedState) -> Evaluation {
    let target = state.target.as_ref().unwrap_or(&Value::Null);
    let ctx = Ctx { spec, state, target };
    let mut ev = Evaluation::default();

    if state.target.is_some() {
        if let Some(fr) = spec.fail_rules.iter().find(|fr| holds(&fr.predicate, target, &ctx)) {
            ev.terminally_failed = true;
            ev.failure = Some(match condition_detail(&fr.predicate, target) {
                Some(d) => format!("{} ({d})", fr.message),
                None => match target.get("status").and_then(|s| s.get("message")).and_then(Value::as_str) {
                    Some(m) => format!("{}: {m}", fr.message),
                    None => fr.message.clone(),
                },
            });
        }
        if spec.gate_generation {
            if let (Some(observed), Some(want)) = (state.observed_generation, meta::generation(target)) {
                if observed < want {
                    ev.unmet.insert(OBSERVED_GENERATION.to_string());
                    ev.details.insert(OBSERVED_GENERATION.to_string(), format!("status reflects generation {observed}, want {want}"));
                }
            }
        }
    }

    for rule in spec.rules.iter() {
        let fresh = rule.generation.as_ref().map_or(true, |g| state.target.is_some() && generation_ok(g, state, target));
        if fresh && holds(&rule.predicate, target, &ctx) {
            ev.satisfied.insert(rule.name.clone());
            continue;
        }
        ev.unmet.insert(rule.name.clone());
        let detail = if !fresh {
            Some("waiting for status to observe the latest generation".to_string())
        } else {
            condition_detail(&rule.predicate, target).or_else(|| rule.hint.clone())
        };
        if let Some(d) = detail {
            ev.details.insert(rule.name.clone(), d);
        }
    }

    if state.target.is_some() {
        ev.progress = progress(target);
        if !ev.unmet.is_empty() {
            let blockers = pod_blockers(spec, state, target);
            if !blockers.is_empty() {
                ev.details.insert(CONTAINERS.to_string(), blockers.join("; "));
            }
        }
    }
    ev
}

fn pod_blockers(spec: &AwaitSpec, state: &ObservedState, target: &Value) -> Vec<String> {
    let pod = KindRef::new("", "v1", "Pod");
    if spec.kind.same_kind(&pod) {
        return container_problems(target);
    }
    let mut out = Vec::new();
    for p in state.dependents_of(&pod) {
        let name = meta::name(p).unwrap_or("?");
        out.extend(container_problems(p).into_iter().map(|e| format!("pod {name}: {e}")));
    }
    out
}

fn trim_pull_message(msg: &str) -> &str {
    let msg = msg.strip_prefix("rpc error: code = Unknown desc = Error response from daemon: ").unwrap_or(msg);
    msg.strip_suffix(": manifest unknown").unwrap_or(msg)
}

fn reason_line(reason: &str, container: &str, message: Option<&str>) -> String {
    match message.map(trim_pull_message).filter(|m| !m.is_empty()) {
        Some(m) => format!("[{reason}] {container}: {m}"),
        None => format!("[{reason}] {container}"),
    }
}

/// Why the not-ready containers of `pod` are stuck, e.g. `[ImagePullBackOff] app: Back-off pulling image "web:9"`.
pub fn container_problems(pod: &Value) -> Vec<String> {
    let status = pod.get("status");
    let mut out = Vec::new();
    for field in ["initContainerStatuses", "containerStatuses"] {
        let Some(list) = status.and_then(|s| s.get(field)).and_then(Value::as_array) else { continue };
        for cs in list {
            if cs.get("ready").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let name = cs.get("name").and_then(Value::as_str).unwrap_or("?");
            let state = cs.get("state");
            let text = |v: &Value, k: &str| v.get(k).and_then(Value::as_str).map(str::to_string);
            if let Some(w) = state.and_then(|s| s.get("waiting")) {
                match text(w, "reason") {
                    Some(r) if !r.is_empty() && r != "ContainerCreating" => {
                        out.push(reason_line(&r, name, text(w, "message").as_deref()))
                    }
                    _ => {}
                }
            }
            if let Some(t) = state.and_then(|s| s.get("terminated")) {
                let Some(r) = text(t, "reason").filter(|r| !r.is_empty()) else { continue };
                match text(t, "message").filter(|m| !m.is_empty()) {
                    Some(m) => out.push(reason_line(&r, name, Some(&m))),
                    None => {
                        let code = t.get("exitCode").and_then(Value::as_i64).unwrap_or(0);
                        out.push(format!("[{r}] {name}: exited with code {code}"));
                    }
                }
            }
        }
    }
    out
}
