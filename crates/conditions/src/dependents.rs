//! Dependent resolution: which other objects a target's readiness depends on.

use std::collections::BTreeSet;

use kready_core::{meta, KindRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rule::{AwaitSpec, Link};

/// Address of a dependent (or a set of them, when selected by labels and owner).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependentRef {
    pub kind: KindRef,
    pub namespace: Option<String>,
    /// Exact name; `None` means "list by selector".
    pub name: Option<String>,
    pub label_selector: Option<String>,
    /// Keep only objects owned by this uid.
    pub owner_uid: Option<String>,
}

impl DependentRef {
    /// Whether a listed object belongs to this reference.
    pub fn admits(&self, obj: &Value) -> bool {
        if let Some(name) = &self.name {
            if meta::name(obj) != Some(name.as_str()) {
                return false;
            }
        }
        match &self.owner_uid {
            Some(uid) => meta::is_owned_by(obj, uid),
            None => true,
        }
    }
}

/// `matchLabels` rendered as a label selector string, sorted by key.
fn match_labels_selector(target: &Value) -> Option<String> {
    let labels = target.get("spec")?.get("selector")?.get("matchLabels")?.as_object()?;
    let mut pairs: Vec<_> = labels.iter().filter_map(|(k, v)| v.as_str().map(|v| format!("{k}={v}"))).collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort();
    Some(pairs.join(","))
}

/// Resolve the dependents of `target`. A target that does not exist yet (or has
/// no identity yet) has no dependents; that is not an error.
pub fn dependents(spec: &AwaitSpec, target: Option<&Value>) -> Vec<DependentRef> {
    let Some(target) = target else { return Vec::new() };
    let namespace = meta::namespace(target).map(str::to_string);
    let mut out = Vec::new();
    for rule in spec.dependents.iter() {
        match &rule.link {
            Link::SameName => {
                if let Some(name) = meta::name(target) {
                    out.push(DependentRef {
                        kind: rule.kind.clone(),
                        namespace: namespace.clone(),
                        name: Some(name.to_string()),
                        label_selector: None,
                        owner_uid: None,
                    });
                }
            }
            Link::OwnedBy => {
                if let Some(uid) = meta::uid(target) {
                    out.push(DependentRef {
                        kind: rule.kind.clone(),
                        namespace: namespace.clone(),
                        name: None,
                        label_selector: match_labels_selector(target),
                        owner_uid: Some(uid.to_string()),
                    });
                }
            }
            Link::Selected => {
                if let Some(selector) = match_labels_selector(target) {
                    out.push(DependentRef {
                        kind: rule.kind.clone(),
                        namespace: namespace.clone(),
                        name: None,
                        label_selector: Some(selector),
                        owner_uid: None,
                    });
                }
            }
            Link::NamesFrom(paths) => {
                let names: BTreeSet<&str> = paths
                    .iter()
                    .flat_map(|p| p.select(target))
                    .filter_map(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .collect();
                out.extend(names.into_iter().map(|n| DependentRef {
                    kind: rule.kind.clone(),
                    namespace: namespace.clone(),
                    name: Some(n.to_string()),
                    label_selector: None,
                    owner_uid: None,
                }));
            }
        }
    }
    out
}
