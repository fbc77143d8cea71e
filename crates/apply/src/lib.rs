//! Kready apply (Milestone 4): replace decisions, three-way patches and minimal diffs.
//!
//! [`decide`] turns the last-submitted, newly-submitted and live documents into the
//! patch to send and the fields that force a destroy-then-create cycle. Kinds with a
//! builtin merge schema get a strategic merge patch; everything else, and any document
//! the schema cannot express, gets an RFC 7386 merge patch.

#![forbid(unsafe_code)]

use kready_core::{KindRef, PatchKind, ReplaceDecision};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::debug;

pub mod merge;
pub mod replace;
pub mod schema;

#[derive(Debug, thiserror::Error)]
pub enum DecideError {
    #[error("{0} document is not an object")]
    NotAnObject(&'static str),
    #[error("current document missing apiVersion or kind")]
    MissingKind,
    #[error("live object is a {live}, submitted a {current}")]
    KindMismatch { live: String, current: String },
    #[error("live object is served from {live}, submitted for {current}")]
    ApiVersionMismatch { live: String, current: String },
    #[error("cannot merge {path}: {reason}")]
    Unmergeable { path: String, reason: String },
    #[error("document too large: {0}")]
    TooLarge(String),
    #[error("parsing document: {0}")]
    Parse(String),
    #[error("encoding patch: {0}")]
    Encode(#[from] serde_json::Error),
}

fn max_yaml_bytes() -> usize {
    std::env::var("KREADY_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KREADY_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse one YAML (or JSON) document, bounded by `KREADY_MAX_YAML_BYTES`/`KREADY_MAX_YAML_NODES`.
pub fn load_document(yaml: &str) -> Result<Json, DecideError> {
    if yaml.len() > max_yaml_bytes() {
        return Err(DecideError::TooLarge(format!(">{} bytes", max_yaml_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| DecideError::Parse(e.to_string()))?;
    let json = serde_json::to_value(val)?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(DecideError::TooLarge(format!(">{} nodes", max_yaml_nodes())));
    }
    Ok(json)
}

/// Drop fields the API server owns so they never show up in patches or diffs.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn prepare(v: &Json, what: &'static str) -> Result<Map<String, Json>, DecideError> {
    let Json::Object(m) = strip_server_fields(v.clone()) else {
        return Err(DecideError::NotAnObject(what));
    };
    match m.get("metadata") {
        None | Some(Json::Null) | Some(Json::Object(_)) => Ok(m),
        Some(_) => Err(DecideError::Unmergeable { path: format!("{what}.metadata"), reason: "expected an object".into() }),
    }
}

fn kind_of(m: &Map<String, Json>) -> Option<KindRef> {
    let api_version = m.get("apiVersion")?.as_str()?;
    let kind = m.get("kind")?.as_str()?;
    Some(KindRef::from_api_version(api_version, kind))
}

/// Compute the patch for `current` and the fields forcing replacement.
///
/// `last` is absent on first submission; `live` is absent when the object does
/// not exist or was not read. Errors are reported before anything is submitted.
pub fn decide(last: Option<&Json>, current: &Json, live: Option<&Json>) -> Result<ReplaceDecision, DecideError> {
    let cur = prepare(current, "current")?;
    let last = last.map(|v| prepare(v, "last")).transpose()?;
    let live = live.map(|v| prepare(v, "live")).transpose()?;
    let kind = kind_of(&cur).ok_or(DecideError::MissingKind)?;

    // A kind change is itself a replacement; otherwise the live object must be the same type.
    let kind_changed = last.as_ref().and_then(kind_of).map_or(false, |k| !k.same_kind(&kind));
    if let (false, Some(live_kind)) = (kind_changed, live.as_ref().and_then(kind_of)) {
        if live_kind.kind != kind.kind {
            return Err(DecideError::KindMismatch { live: live_kind.kind, current: kind.kind });
        }
        if live_kind.canonical_group() != kind.canonical_group() {
            return Err(DecideError::ApiVersionMismatch { live: live_kind.api_version(), current: kind.api_version() });
        }
    }

    let replace_fields = replace::replace_fields(&kind, last.as_ref(), &cur, live.as_ref());
    let (patch, patch_kind) = match schema::for_kind(&kind) {
        Some(s) => match merge::strategic_merge(last.as_ref(), &cur, live.as_ref(), s) {
            Ok(p) => (p, PatchKind::StrategicMerge),
            Err(fallback) => {
                debug!(kind = %kind, reason = %fallback, "decide: falling back to json merge");
                (merge::json_merge(last.as_ref(), &cur, live.as_ref()), PatchKind::JsonMerge)
            }
        },
        None => (merge::json_merge(last.as_ref(), &cur, live.as_ref()), PatchKind::JsonMerge),
    };

    counter!("decide_total", 1u64, "patch_kind" => patch_kind.as_str());
    if !replace_fields.is_empty() {
        counter!("decide_replace_total", 1u64);
    }
    debug!(kind = %kind, patch_kind = patch_kind.as_str(), replace = ?replace_fields, "decide: done");
    Ok(ReplaceDecision { patch: serde_json::to_vec(&patch)?, patch_kind, replace_fields })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Count field-level adds, updates and removes from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for k in bo.keys() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str, replicas: i64) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"replicas": replicas, "selector": {"matchLabels": {"app": "web"}},
                     "template": {"spec": {"containers": [{"name": "app", "image": "web:1"}]}}}
        })
    }

    fn live_of(v: &Json) -> Json {
        let mut live = v.clone();
        live["metadata"]["uid"] = json!("d-1");
        live["metadata"]["resourceVersion"] = json!("42");
        live["metadata"]["generation"] = json!(3);
        live["status"] = json!({"readyReplicas": 1});
        live
    }

    #[test]
    fn strip_server_fields_prunes_server_owned_fields() {
        let pruned = strip_server_fields(live_of(&deployment("web", 1)));
        let meta = pruned["metadata"].as_object().unwrap();
        for k in ["uid", "resourceVersion", "generation"] {
            assert!(!meta.contains_key(k), "{k}");
        }
        assert!(pruned.get("status").is_none());
    }

    #[test]
    fn scaling_a_deployment_patches_in_place() {
        let last = deployment("web", 1);
        let d = decide(Some(&last), &deployment("web", 5), Some(&live_of(&last))).unwrap();
        assert!(d.replace_fields.is_empty());
        assert!(!d.requires_replace());
        assert_eq!(d.patch_kind, PatchKind::StrategicMerge);
        assert_eq!(d.patch_json().unwrap(), json!({"spec": {"replicas": 5}}));
    }

    #[test]
    fn renaming_forces_replacement() {
        let last = deployment("web", 1);
        let d = decide(Some(&last), &deployment("web-v2", 1), Some(&live_of(&last))).unwrap();
        assert_eq!(d.replace_fields, vec!["metadata.name".to_string()]);
    }

    #[test]
    fn adopting_an_existing_service_patches_in_place() {
        let cur = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web"},
                         "spec": {"selector": {"app": "web"}, "ports": [{"port": 80}]}});
        let mut live = live_of(&cur);
        live["metadata"]["namespace"] = json!("default");
        live["spec"]["clusterIP"] = json!("10.0.0.9");
        live["spec"]["ports"][0]["protocol"] = json!("TCP");
        let d = decide(None, &cur, Some(&live)).unwrap();
        assert!(!d.requires_replace(), "{:?}", d.replace_fields);
        assert_eq!(d.patch_kind, PatchKind::StrategicMerge);
    }

    #[test]
    fn custom_kinds_use_json_merge() {
        let w = |size: i64| json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}, "spec": {"size": size}});
        let d = decide(Some(&w(1)), &w(2), None).unwrap();
        assert_eq!(d.patch_kind, PatchKind::JsonMerge);
        assert_eq!(d.patch_json().unwrap()["spec"], json!({"size": 2}));
    }

    #[test]
    fn missing_merge_key_falls_back_silently() {
        let mut cur = deployment("web", 1);
        cur["spec"]["template"]["spec"]["containers"] = json!([{"image": "web:2"}]);
        let d = decide(None, &cur, None).unwrap();
        assert_eq!(d.patch_kind, PatchKind::JsonMerge);
    }

    #[test]
    fn malformed_inputs_are_rejected_before_submission() {
        assert!(matches!(decide(None, &json!([1, 2]), None), Err(DecideError::NotAnObject("current"))));
        assert!(matches!(decide(None, &json!({"metadata": {"name": "x"}}), None), Err(DecideError::MissingKind)));
        let bad_meta = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": "x"});
        assert!(matches!(decide(None, &bad_meta, None), Err(DecideError::Unmergeable { .. })));

        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        let secret = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "x"}});
        assert!(matches!(decide(Some(&cm), &cm, Some(&secret)), Err(DecideError::KindMismatch { .. })));
        let other_group = json!({"apiVersion": "example.com/v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        assert!(matches!(decide(Some(&cm), &cm, Some(&other_group)), Err(DecideError::ApiVersionMismatch { .. })));
    }

    #[test]
    fn kind_change_is_a_replacement_not_an_error() {
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        let secret = json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "x"}});
        let d = decide(Some(&cm), &secret, Some(&cm)).unwrap();
        assert_eq!(d.replace_fields, vec!["kind".to_string()]);
    }

    #[test]
    fn load_document_reads_yaml() {
        let v = load_document("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n").unwrap();
        assert_eq!(v["metadata"]["name"], json!("x"));
        assert!(matches!(load_document("a: [1,"), Err(DecideError::Parse(_))));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }
}
