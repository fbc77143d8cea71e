//! Builtin strategic-merge schemas: which lists merge by key, and by which key.

use std::collections::HashMap;

use kready_core::KindRef;
use once_cell::sync::Lazy;

/// Merge keys for one kind, addressed by object-key path (list levels elided).
#[derive(Debug, Default)]
pub struct MergeSchema {
    keys: HashMap<String, &'static str>,
}

impl MergeSchema {
    /// Merge key of the list at `path`, when it merges by key.
    pub fn merge_key(&self, path: &[String]) -> Option<&'static str> {
        self.keys.get(&path.join(".")).copied()
    }

    fn add(&mut self, prefix: &[&str], rel: &[&str], key: &'static str) {
        let path: Vec<&str> = prefix.iter().chain(rel.iter()).copied().collect();
        self.keys.insert(path.join("."), key);
    }

    fn with_pod_spec(mut self, prefix: &[&str]) -> Self {
        const CONTAINER_LISTS: [&str; 3] = ["containers", "initContainers", "ephemeralContainers"];
        for c in CONTAINER_LISTS {
            self.add(prefix, &[c], "name");
            self.add(prefix, &[c, "env"], "name");
            self.add(prefix, &[c, "ports"], "containerPort");
            self.add(prefix, &[c, "volumeMounts"], "mountPath");
            self.add(prefix, &[c, "volumeDevices"], "devicePath");
        }
        self.add(prefix, &["volumes"], "name");
        self.add(prefix, &["imagePullSecrets"], "name");
        self.add(prefix, &["hostAliases"], "ip");
        self
    }

    fn base() -> Self {
        let mut s = Self::default();
        s.add(&["metadata"], &["ownerReferences"], "uid");
        s
    }
}

/// Keyed by `group/Kind` with the group canonicalized.
static SCHEMAS: Lazy<HashMap<String, MergeSchema>> = Lazy::new(|| {
    let template: &[&str] = &["spec", "template", "spec"];
    let mut m = HashMap::new();
    m.insert("/Pod".to_string(), MergeSchema::base().with_pod_spec(&["spec"]));
    for kind in ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"] {
        m.insert(format!("apps/{kind}"), MergeSchema::base().with_pod_spec(template));
    }
    m.insert("/ReplicationController".to_string(), MergeSchema::base().with_pod_spec(template));
    m.insert("batch/Job".to_string(), MergeSchema::base().with_pod_spec(template));
    m.insert("batch/CronJob".to_string(), MergeSchema::base().with_pod_spec(&["spec", "jobTemplate", "spec", "template", "spec"]));
    let mut svc = MergeSchema::base();
    svc.add(&["spec"], &["ports"], "port");
    m.insert("/Service".to_string(), svc);
    m
});

/// Builtin schema for `kind`; `None` means "merge as plain JSON".
pub fn for_kind(kind: &KindRef) -> Option<&'static MergeSchema> {
    SCHEMAS.get(&format!("{}/{}", kind.canonical_group(), kind.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(str::to_string).collect()
    }

    #[test]
    fn pod_template_lists_merge_by_key() {
        let s = for_kind(&KindRef::new("extensions", "v1beta1", "Deployment")).unwrap();
        assert_eq!(s.merge_key(&path("spec.template.spec.containers")), Some("name"));
        assert_eq!(s.merge_key(&path("spec.template.spec.containers.ports")), Some("containerPort"));
        assert_eq!(s.merge_key(&path("spec.template.spec.containers.volumeMounts")), Some("mountPath"));
        assert_eq!(s.merge_key(&path("spec.template.spec.tolerations")), None);
        let pod = for_kind(&KindRef::new("", "v1", "Pod")).unwrap();
        assert_eq!(pod.merge_key(&path("spec.volumes")), Some("name"));
        assert_eq!(pod.merge_key(&path("metadata.ownerReferences")), Some("uid"));
    }

    #[test]
    fn custom_kinds_have_no_schema() {
        assert!(for_kind(&KindRef::new("example.com", "v1", "Widget")).is_none());
        assert!(for_kind(&KindRef::new("", "v1", "ConfigMap")).is_none());
    }
}
