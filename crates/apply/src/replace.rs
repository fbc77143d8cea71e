//! Force-new fields: changes the API server refuses to apply in place.

use std::collections::{BTreeSet, HashMap};

use kready_core::KindRef;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};

type Object = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pat {
    Key(String),
    AnyIndex,
}

/// Parse `spec.containers[*].image`.
fn pattern(p: &str) -> Vec<Pat> {
    let mut out = Vec::new();
    for part in p.split('.') {
        match part.strip_suffix("[*]") {
            Some(key) => {
                out.push(Pat::Key(key.to_string()));
                out.push(Pat::AnyIndex);
            }
            None => out.push(Pat::Key(part.to_string())),
        }
    }
    out
}

fn render(path: &[Seg]) -> String {
    let mut s = String::new();
    for seg in path {
        match seg {
            Seg::Key(k) => {
                if !s.is_empty() {
                    s.push('.');
                }
                s.push_str(k);
            }
            Seg::Index(i) => s.push_str(&format!("[{i}]")),
        }
    }
    s
}

const UNIVERSAL: &[&str] = &["metadata.name", "metadata.namespace"];

const POD_FIELDS: &[&str] = &[
    "affinity", "automountServiceAccountToken", "dnsConfig", "dnsPolicy", "enableServiceLinks", "hostAliases",
    "hostIPC", "hostNetwork", "hostPID", "hostname", "imagePullSecrets", "nodeName", "nodeSelector", "overhead",
    "preemptionPolicy", "priority", "priorityClassName", "readinessGates", "restartPolicy", "runtimeClassName",
    "schedulerName", "securityContext", "serviceAccount", "serviceAccountName", "shareProcessNamespace",
    "subdomain", "terminationGracePeriodSeconds", "volumes",
];

const CONTAINER_FIELDS: &[&str] = &[
    "args", "command", "env", "image", "imagePullPolicy", "lifecycle", "livenessProbe", "ports", "readinessProbe",
    "resources", "securityContext", "stdin", "stdinOnce", "terminationMessagePath", "terminationMessagePolicy",
    "tty", "volumeDevices", "volumeMounts", "workingDir",
];

const PV_SOURCES: &[&str] = &[
    "awsElasticBlockStore", "azureDisk", "azureFile", "cephfs", "cinder", "csi", "fc", "flexVolume", "flocker",
    "gcePersistentDisk", "glusterfs", "hostPath", "iscsi", "local", "nfs", "photonPersistentDisk",
    "portworxVolume", "quobyte", "rbd", "scaleIO", "storageos", "vsphereVolume",
];

const IMMUTABLE_DATA: &[&str] = &["data", "binaryData", "stringData"];

/// Keyed by `group/Kind`, group canonicalized.
static FORCE_NEW: Lazy<HashMap<&'static str, Vec<Vec<Pat>>>> = Lazy::new(|| {
    let mut pod: Vec<String> = POD_FIELDS.iter().map(|f| format!("spec.{f}")).collect();
    for list in ["containers", "initContainers"] {
        pod.extend(CONTAINER_FIELDS.iter().map(|f| format!("spec.{list}[*].{f}")));
    }
    let pv: Vec<String> = PV_SOURCES.iter().map(|f| format!("spec.{f}")).collect();
    let fixed = |fields: &[&str]| fields.iter().map(|f| f.to_string()).collect::<Vec<_>>();

    let table: Vec<(&'static str, Vec<String>)> = vec![
        ("apps/Deployment", fixed(&["spec.selector"])),
        ("apps/DaemonSet", fixed(&["spec.selector"])),
        (
            "apps/StatefulSet",
            fixed(&[
                "spec.podManagementPolicy",
                "spec.revisionHistoryLimit",
                "spec.selector",
                "spec.serviceName",
                "spec.volumeClaimTemplates",
            ]),
        ),
        ("batch/Job", fixed(&["spec.completions", "spec.parallelism", "spec.selector", "spec.template"])),
        ("/Pod", pod),
        ("/PersistentVolume", pv),
        (
            "/PersistentVolumeClaim",
            fixed(&["spec.accessModes", "spec.selector", "spec.storageClassName", "spec.volumeName"]),
        ),
        ("/ResourceQuota", fixed(&["spec.scopes"])),
        ("/Secret", fixed(&["type"])),
        ("/Service", fixed(&["spec.clusterIP"])),
        ("policy/PodDisruptionBudget", fixed(&["spec"])),
        ("rbac.authorization.k8s.io/RoleBinding", fixed(&["roleRef"])),
        ("rbac.authorization.k8s.io/ClusterRoleBinding", fixed(&["roleRef"])),
        ("storage.k8s.io/StorageClass", fixed(&["parameters", "provisioner"])),
    ];
    table.into_iter().map(|(k, fields)| (k, fields.iter().map(|f| pattern(f)).collect())).collect()
});

fn immutable_data(kind: &KindRef, base: &Object) -> bool {
    kind.group.is_empty()
        && matches!(kind.kind.as_str(), "ConfigMap" | "Secret")
        && base.get("immutable").and_then(Value::as_bool) == Some(true)
}

/// Fields whose change between `base` (last submitted, else live) and
/// `current` forces destroy-then-create. Sorted, deduplicated.
pub fn replace_fields(kind: &KindRef, last: Option<&Object>, current: &Object, live: Option<&Object>) -> Vec<String> {
    let Some(base) = last.or(live) else {
        return Vec::new();
    };
    let mut out = BTreeSet::new();
    if let Some(base_kind) = kind_of(base) {
        if base_kind.kind != kind.kind {
            out.insert("kind".to_string());
        } else if base_kind.canonical_group() != kind.canonical_group() {
            out.insert("apiVersion".to_string());
        }
    }

    let mut patterns: Vec<Vec<Pat>> = UNIVERSAL.iter().map(|p| pattern(p)).collect();
    let key = format!("{}/{}", kind.canonical_group(), kind.kind);
    if let Some(extra) = FORCE_NEW.get(key.as_str()) {
        patterns.extend(extra.iter().cloned());
    }
    if immutable_data(kind, base) {
        patterns.extend(IMMUTABLE_DATA.iter().map(|p| pattern(p)));
    }

    // Without a previous submission, live carries server defaults the caller
    // never set; only fields present in `current` can force a replacement.
    let mut w = Walk { only_set: last.is_none(), changed: Vec::new() };
    w.object(&mut Vec::new(), base, current);
    let changed = w.changed;
    for path in &changed {
        for pat in &patterns {
            if let Some(hit) = matched(path, pat) {
                out.insert(render(hit));
            }
        }
    }
    out.into_iter().collect()
}

/// The part of `path` a pattern claims: the pattern-length prefix when the
/// pattern covers the path, the whole path when the path is a prefix of it.
fn matched<'p>(path: &'p [Seg], pat: &[Pat]) -> Option<&'p [Seg]> {
    for (seg, p) in path.iter().zip(pat) {
        let ok = match (seg, p) {
            (Seg::Key(k), Pat::Key(want)) => k == want,
            (Seg::Index(_), Pat::AnyIndex) => true,
            _ => false,
        };
        if !ok {
            return None;
        }
    }
    Some(&path[..path.len().min(pat.len())])
}

fn kind_of(m: &Object) -> Option<KindRef> {
    let api_version = m.get("apiVersion")?.as_str()?;
    let kind = m.get("kind")?.as_str()?;
    Some(KindRef::from_api_version(api_version, kind))
}

fn is_empty(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::Object(m)) => m.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

static EMPTY_OBJECT: Lazy<Object> = Lazy::new(Object::new);

fn as_obj(v: Option<&Value>) -> Option<&Object> {
    match v {
        Some(Value::Object(m)) => Some(m),
        v if is_empty(v) => Some(&*EMPTY_OBJECT),
        _ => None,
    }
}

fn as_arr(v: Option<&Value>) -> Option<&[Value]> {
    match v {
        Some(Value::Array(x)) => Some(x.as_slice()),
        v if is_empty(v) => Some(&[]),
        _ => None,
    }
}

struct Walk {
    only_set: bool,
    changed: Vec<Vec<Seg>>,
}

impl Walk {
    fn object(&mut self, path: &mut Vec<Seg>, a: &Object, b: &Object) {
        let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
        for k in keys {
            path.push(Seg::Key(k.clone()));
            self.value(path, a.get(k), b.get(k));
            path.pop();
        }
    }

    /// Changed leaf paths. Absent, null and empty containers compare equal.
    fn value(&mut self, path: &mut Vec<Seg>, a: Option<&Value>, b: Option<&Value>) {
        if is_empty(b) && (self.only_set || is_empty(a)) {
            return;
        }
        if let (Some(ao), Some(bo)) = (as_obj(a), as_obj(b)) {
            if a.map_or(false, Value::is_object) || b.map_or(false, Value::is_object) {
                self.object(path, ao, bo);
                return;
            }
        }
        if let (Some(aa), Some(ba)) = (as_arr(a), as_arr(b)) {
            for i in 0..aa.len().max(ba.len()) {
                path.push(Seg::Index(i));
                self.value(path, aa.get(i), ba.get(i));
                path.pop();
            }
            return;
        }
        if a != b {
            self.changed.push(path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Object {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn deployment(name: &str, replicas: i64, app: &str) -> Object {
        obj(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": name},
                   "spec": {"replicas": replicas, "selector": {"matchLabels": {"app": app}}}}))
    }

    fn kind() -> KindRef {
        KindRef::new("apps", "v1", "Deployment")
    }

    #[test]
    fn rename_forces_replacement_scaling_does_not() {
        let last = deployment("web", 1, "web");
        assert_eq!(replace_fields(&kind(), Some(&last), &deployment("web2", 1, "web"), None), vec!["metadata.name"]);
        assert!(replace_fields(&kind(), Some(&last), &deployment("web", 5, "web"), None).is_empty());
        assert_eq!(replace_fields(&kind(), Some(&last), &deployment("web", 1, "api"), None), vec!["spec.selector"]);
    }

    #[test]
    fn container_fields_report_the_element() {
        let pod = |image: &str| {
            obj(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
                       "spec": {"containers": [{"name": "app", "image": image}], "activeDeadlineSeconds": 30}}))
        };
        let k = KindRef::new("", "v1", "Pod");
        assert_eq!(replace_fields(&k, Some(&pod("a:1")), &pod("a:2"), None), vec!["spec.containers[0].image"]);
        let mut extra = pod("a:1");
        extra["spec"]["containers"] = json!([{"name": "app", "image": "a:1"}, {"name": "b", "image": "b:1"}]);
        assert_eq!(
            replace_fields(&k, Some(&pod("a:1")), &extra, None),
            vec!["spec.containers[1].image"]
        );
    }

    #[test]
    fn kind_and_group_changes_are_reported() {
        let last = deployment("web", 1, "web");
        let mut sts = last.clone();
        sts.insert("kind".into(), json!("StatefulSet"));
        assert_eq!(replace_fields(&KindRef::new("apps", "v1", "StatefulSet"), Some(&last), &sts, None), vec!["kind"]);

        let mut legacy = last.clone();
        legacy.insert("apiVersion".into(), json!("extensions/v1beta1"));
        assert!(replace_fields(&kind(), Some(&legacy), &last, None).is_empty());
    }

    #[test]
    fn immutable_config_map_data() {
        let cm = |v: &str, immutable: bool| {
            obj(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"},
                       "immutable": immutable, "data": {"k": v}}))
        };
        let k = KindRef::new("", "v1", "ConfigMap");
        assert_eq!(replace_fields(&k, Some(&cm("1", true)), &cm("2", true), None), vec!["data"]);
        assert!(replace_fields(&k, Some(&cm("1", false)), &cm("2", false), None).is_empty());
    }

    #[test]
    fn live_is_the_base_without_last_and_null_equals_empty() {
        let mut live = deployment("web", 1, "web");
        live["metadata"]["labels"] = Value::Null;
        let mut cur = deployment("web", 3, "web");
        cur["metadata"]["labels"] = json!({});
        assert!(replace_fields(&kind(), None, &cur, Some(&live)).is_empty());
        assert!(replace_fields(&kind(), None, &cur, None).is_empty());
    }

    #[test]
    fn adopting_ignores_server_defaults() {
        let k = KindRef::new("", "v1", "Service");
        let cur = obj(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
                             "spec": {"selector": {"app": "s"}, "ports": [{"port": 80}]}}));
        let live = obj(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s", "namespace": "default"},
                              "spec": {"selector": {"app": "s"}, "ports": [{"port": 80, "protocol": "TCP"}],
                                       "clusterIP": "10.0.0.9", "type": "ClusterIP"}}));
        assert!(replace_fields(&k, None, &cur, Some(&live)).is_empty());

        let k = KindRef::new("", "v1", "Pod");
        let pod = |image: &str| {
            obj(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
                       "spec": {"containers": [{"name": "app", "image": image}]}}))
        };
        let mut live = pod("a:1");
        live["metadata"]["namespace"] = json!("default");
        live["spec"]["nodeName"] = json!("node-1");
        live["spec"]["restartPolicy"] = json!("Always");
        live["spec"]["dnsPolicy"] = json!("ClusterFirst");
        live["spec"]["containers"][0]["imagePullPolicy"] = json!("IfNotPresent");
        live["spec"]["containers"][0]["terminationMessagePath"] = json!("/dev/termination-log");
        assert!(replace_fields(&k, None, &pod("a:1"), Some(&live)).is_empty());
        assert_eq!(replace_fields(&k, None, &pod("a:2"), Some(&live)), vec!["spec.containers[0].image"]);
    }

    #[test]
    fn service_cluster_ip_and_unknown_kinds() {
        let svc = |ip: &str| obj(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}, "spec": {"clusterIP": ip}}));
        let k = KindRef::new("", "v1", "Service");
        assert_eq!(replace_fields(&k, Some(&svc("10.0.0.1")), &svc("10.0.0.2"), None), vec!["spec.clusterIP"]);
        let w = |size: i64| obj(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}, "spec": {"size": size}}));
        assert!(replace_fields(&KindRef::new("example.com", "v1", "Widget"), Some(&w(1)), &w(2), None).is_empty());
    }
}
