//! Human-readable results: the unmet-set trail and final messages.

use std::collections::{BTreeSet, VecDeque};

use kready_conditions::{Evaluation, CONTAINERS};
use kready_core::{ObjectRef, ObservedState, TrailEntry};

/// Most recent unmet-set changes kept per run.
pub const TRAIL_CAP: usize = 64;

/// Records each distinct change of the unmet set.
#[derive(Debug, Default)]
pub struct Trail {
    entries: VecDeque<TrailEntry>,
    last: Option<BTreeSet<String>>,
}

impl Trail {
    pub fn record(&mut self, state: &ObservedState, ev: &Evaluation) {
        if self.last.as_ref() == Some(&ev.unmet) {
            return;
        }
        if self.entries.len() == TRAIL_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(TrailEntry {
            at_ms: state.timestamp_ms,
            resource_version: state.resource_version().map(str::to_string),
            unmet: ev.unmet.iter().cloned().collect(),
        });
        self.last = Some(ev.unmet.clone());
    }

    pub fn into_vec(self) -> Vec<TrailEntry> {
        self.entries.into()
    }
}

/// `Deployment default/web not ready: Available (0/3 replicas ready)`.
pub fn not_ready(target: &ObjectRef, state: Option<&ObservedState>, ev: Option<&Evaluation>) -> String {
    match (state, ev) {
        (Some(st), _) if st.target.is_none() => format!("{target} not ready: object not found"),
        (_, Some(ev)) if !ev.unmet.is_empty() => {
            let head = match &ev.progress {
                Some(p) => {
                    let names: Vec<_> = ev.unmet.iter().map(String::as_str).collect();
                    format!("{target} not ready: {} ({p})", names.join(", "))
                }
                None => format!("{target} not ready: {}", ev.describe_unmet()),
            };
            match ev.details.get(CONTAINERS) {
                Some(c) => format!("{head} -- {c}"),
                None => head,
            }
        }
        (_, Some(_)) => format!("{target} not ready: waiting for endpoints to settle"),
        _ => format!("{target} not ready: no observation received"),
    }
}

/// Deletion runs: the object is still there.
pub fn not_deleted(target: &ObjectRef, ev: Option<&Evaluation>) -> String {
    match ev.and_then(|e| e.progress.as_deref()) {
        Some(p) => format!("{target} still present ({p})"),
        None => format!("{target} still present"),
    }
}

pub fn failed(target: &ObjectRef, ev: &Evaluation) -> String {
    match &ev.failure {
        Some(f) => format!("{target} failed: {f}"),
        None => format!("{target} failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kready_core::KindRef;
    use serde_json::json;

    fn web() -> ObjectRef {
        ObjectRef::new(KindRef::new("apps", "v1", "Deployment"), Some("default"), "web")
    }

    fn eval(unmet: &[&str], progress: Option<&str>) -> Evaluation {
        Evaluation {
            unmet: unmet.iter().map(|s| s.to_string()).collect(),
            progress: progress.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn not_ready_prefers_progress_counts() {
        let st = ObservedState::new(Some(json!({"metadata": {"name": "web"}})));
        let msg = not_ready(&web(), Some(&st), Some(&eval(&["Available"], Some("0/3 replicas ready"))));
        assert_eq!(msg, "Deployment default/web not ready: Available (0/3 replicas ready)");

        let mut ev = eval(&["EndpointsReady"], None);
        ev.details.insert("EndpointsReady".into(), "no addresses".into());
        assert_eq!(not_ready(&web(), Some(&st), Some(&ev)), "Deployment default/web not ready: EndpointsReady (no addresses)");
        assert_eq!(not_ready(&web(), Some(&ObservedState::new(None)), Some(&ev)), "Deployment default/web not ready: object not found");
        assert_eq!(not_ready(&web(), None, None), "Deployment default/web not ready: no observation received");
    }

    #[test]
    fn trail_keeps_changes_only_and_is_bounded() {
        let st = ObservedState::new(Some(json!({"metadata": {"name": "web", "resourceVersion": "7"}})));
        let mut t = Trail::default();
        t.record(&st, &eval(&["A", "B"], None));
        t.record(&st, &eval(&["A", "B"], None));
        t.record(&st, &eval(&["B"], None));
        let v = t.into_vec();
        assert_eq!(v.len(), 2);
        assert_eq!(v[1].unmet, vec!["B".to_string()]);
        assert_eq!(v[0].resource_version.as_deref(), Some("7"));

        let mut t = Trail::default();
        for i in 0..(TRAIL_CAP + 10) {
            let name = format!("R{i}");
            t.record(&st, &eval(&[name.as_str()], None));
        }
        let v = t.into_vec();
        assert_eq!(v.len(), TRAIL_CAP);
        assert_eq!(v[0].unmet, vec!["R10".to_string()]);
    }
}
