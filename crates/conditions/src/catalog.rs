//! The condition catalog: readiness knowledge per kind.
//!
//! Built once, then shared read-only (`Arc<Catalog>`). Lookups are total:
//! kinds without an entry get a spec that succeeds as soon as the object
//! exists, or the generic `Ready` spec when generic await is enabled.

use std::sync::Arc;

use kready_core::KindRef;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::debug;

use crate::path::FieldPath;
use crate::rule::{AwaitSpec, ConditionRule, DependentRule, FailRule, Link, Operand, Predicate, Timeouts};
use crate::CatalogError;

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

const TEN_MINUTES: u64 = 600;
const FIVE_MINUTES: u64 = 300;

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: FxHashMap<(String, String), Arc<AwaitSpec>>,
    generic: Option<Arc<AwaitSpec>>,
}

fn key(kind: &KindRef) -> (String, String) {
    (kind.canonical_group().to_string(), kind.kind.clone())
}

fn p(s: &str) -> Result<FieldPath, CatalogError> {
    FieldPath::parse(s)
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Readiness knowledge for the built-in Kubernetes kinds.
    pub fn builtin() -> Result<Self, CatalogError> {
        let mut c = Self::empty();
        for spec in builtin_specs()? {
            c.insert(spec)?;
        }
        Ok(c)
    }

    /// Enable or disable the generic `Ready` await for kinds without an entry.
    pub fn with_generic_await(mut self, enabled: bool) -> Result<Self, CatalogError> {
        self.generic = if enabled { Some(Arc::new(generic_spec(KindRef::new("", "", "*"))?)) } else { None };
        Ok(self)
    }

    pub fn generic_await(&self) -> bool {
        self.generic.is_some()
    }

    pub fn insert(&mut self, spec: AwaitSpec) -> Result<(), CatalogError> {
        let k = key(&spec.kind);
        if self.entries.contains_key(&k) {
            return Err(CatalogError::DuplicateKind(spec.kind.gvk_key()));
        }
        self.entries.insert(k, Arc::new(spec));
        Ok(())
    }

    /// Add entries declared as a YAML list of await specs. Paths are parsed while loading.
    pub fn extend_from_yaml(&mut self, yaml: &str) -> Result<usize, CatalogError> {
        let specs: Vec<AwaitSpec> = serde_yaml::from_str(yaml).map_err(|e| CatalogError::Load(e.to_string()))?;
        let n = specs.len();
        for s in specs {
            self.insert(s)?;
        }
        Ok(n)
    }

    pub fn has_entry(&self, kind: &KindRef) -> bool {
        self.entries.contains_key(&key(kind))
    }

    /// Total lookup; never fails.
    pub fn lookup(&self, kind: &KindRef) -> Arc<AwaitSpec> {
        if let Some(s) = self.entries.get(&key(kind)) {
            return s.clone();
        }
        debug!(kind = %kind, generic = self.generic.is_some(), "catalog: no entry");
        match &self.generic {
            Some(g) => {
                let mut spec = (**g).clone();
                spec.kind = kind.clone();
                Arc::new(spec)
            }
            None => Arc::new(AwaitSpec::no_op(kind.clone())),
        }
    }

    /// Spec for awaiting the disappearance of an object of `kind`.
    pub fn deletion(&self, kind: &KindRef) -> Arc<AwaitSpec> {
        let delete = self.entries.get(&key(kind)).map(|s| s.timeouts.delete).unwrap_or(FIVE_MINUTES);
        Arc::new(AwaitSpec {
            kind: kind.clone(),
            timeouts: Timeouts { create: delete, update: delete, delete },
            rules: vec![ConditionRule::new("Deleted", Predicate::Absent)],
            fail_rules: Vec::new(),
            dependents: Vec::new(),
            settle_on: None,
            gate_generation: false,
        })
    }

    /// Entries sorted by gvk key.
    pub fn entries(&self) -> Vec<Arc<AwaitSpec>> {
        let mut out: Vec<_> = self.entries.values().cloned().collect();
        out.sort_by_key(|s| s.kind.gvk_key());
        out
    }

    /// Check every rule path against the OpenAPI schemas available. Kinds
    /// without a schema are skipped.
    pub fn validate_schemas(&self, schemas: &[(KindRef, Value)]) -> Result<(), CatalogError> {
        let schema_of = |k: &KindRef| schemas.iter().find(|(sk, _)| sk.same_kind(k)).map(|(_, s)| s);
        for spec in self.entries() {
            let mut paths = Vec::new();
            for r in spec.rules.iter() {
                r.predicate.paths(None, &mut paths);
            }
            for r in spec.fail_rules.iter() {
                r.predicate.paths(None, &mut paths);
            }
            for (scope, path) in paths {
                let kind = scope.unwrap_or(&spec.kind);
                if let Some(schema) = schema_of(kind) {
                    path.validate(schema).map_err(|segment| CatalogError::UnknownField {
                        kind: kind.gvk_key(),
                        path: path.to_string(),
                        segment,
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn rule(name: &str, predicate: Predicate) -> ConditionRule {
    ConditionRule::new(name, predicate)
}

fn spec(kind: KindRef, timeouts: Timeouts) -> AwaitSpec {
    AwaitSpec { timeouts, ..AwaitSpec::no_op(kind) }
}

fn generic_spec(kind: KindRef) -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(kind, Timeouts::uniform(TEN_MINUTES, FIVE_MINUTES));
    s.rules.push(rule("Ready", Predicate::when(Predicate::NonEmpty(p("status.conditions")?), Predicate::condition("Ready", "True"))));
    Ok(s)
}

fn deployment() -> Result<AwaitSpec, CatalogError> {
    let revision = p(&format!(r#"metadata.annotations["{REVISION_ANNOTATION}"]"#))?;
    let rs = KindRef::new("apps", "v1", "ReplicaSet");
    let mut s = spec(KindRef::new("apps", "v1", "Deployment"), Timeouts::uniform(TEN_MINUTES, TEN_MINUTES));
    s.dependents.push(DependentRule { kind: rs.clone(), link: Link::OwnedBy });
    s.dependents.push(DependentRule { kind: KindRef::new("", "v1", "Pod"), link: Link::Selected });
    s.rules.extend([
        rule("ReplicaSet", Predicate::dependent(rs, Predicate::MatchesTarget { path: revision.clone(), target_path: revision }))
            .hint("no ReplicaSet at the current revision yet"),
        rule("Available", Predicate::condition("Available", "True")).gated(),
        rule(
            "Progressing",
            Predicate::when(
                Predicate::GreaterThan { path: p("metadata.generation")?, value: 1 },
                Predicate::condition_reason("Progressing", "True", "NewReplicaSetAvailable"),
            ),
        )
        .gated(),
    ]);
    s.fail_rules.push(FailRule::new(
        "ProgressDeadlineExceeded",
        Predicate::condition_reason("Progressing", "False", "ProgressDeadlineExceeded"),
        "Deployment rollout exceeded its progress deadline",
    ));
    Ok(s)
}

fn stateful_set() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("apps", "v1", "StatefulSet"), Timeouts::uniform(TEN_MINUTES, TEN_MINUTES));
    let on_delete_rollout = Predicate::All(vec![
        Predicate::equals(p("spec.updateStrategy.type")?, "OnDelete"),
        Predicate::GreaterThan { path: p("metadata.generation")?, value: 1 },
    ]);
    s.rules.extend([
        rule(
            "Replicas",
            Predicate::FieldsEqual(vec![
                Operand::or(p("spec.replicas")?, json!(1)),
                Operand::or(p("status.replicas")?, json!(0)),
                Operand::or(p("status.currentReplicas")?, json!(0)),
                Operand::or(p("status.readyReplicas")?, json!(0)),
            ]),
        )
        .gated(),
        rule(
            "Revision",
            Predicate::when(
                Predicate::not(on_delete_rollout),
                Predicate::All(vec![
                    Predicate::NonEmpty(p("status.currentRevision")?),
                    Predicate::FieldsEqual(vec![Operand::new(p("status.currentRevision")?), Operand::new(p("status.updateRevision")?)]),
                ]),
            ),
        )
        .gated(),
    ]);
    Ok(s)
}

fn daemon_set() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("apps", "v1", "DaemonSet"), Timeouts::uniform(TEN_MINUTES, TEN_MINUTES));
    s.rules.push(
        rule(
            "Scheduled",
            Predicate::FieldsEqual(vec![
                Operand::or(p("status.desiredNumberScheduled")?, json!(0)),
                Operand::or(p("status.numberReady")?, json!(0)),
                Operand::or(p("status.updatedNumberScheduled")?, json!(0)),
            ]),
        )
        .gated(),
    );
    Ok(s)
}

fn pod() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("", "v1", "Pod"), Timeouts::uniform(TEN_MINUTES, FIVE_MINUTES));
    let phase = p("status.phase")?;
    let succeeded = Predicate::equals(phase.clone(), "Succeeded");
    for c in ["PodScheduled", "Initialized", "Ready"] {
        s.rules.push(rule(c, Predicate::Any(vec![succeeded.clone(), Predicate::condition(c, "True")])));
    }
    s.rules.push(rule("Running", Predicate::OneOf { path: phase.clone(), values: vec![json!("Running"), json!("Succeeded")] }));
    s.fail_rules.push(FailRule::new("PodFailed", Predicate::equals(phase, "Failed"), "Pod failed"));
    Ok(s)
}

fn service() -> Result<AwaitSpec, CatalogError> {
    let endpoints = KindRef::new("", "v1", "Endpoints");
    let mut s = spec(KindRef::new("", "v1", "Service"), Timeouts::uniform(TEN_MINUTES, TEN_MINUTES));
    s.dependents.push(DependentRule { kind: endpoints.clone(), link: Link::SameName });
    s.settle_on = Some(endpoints.clone());
    let svc_type = p("spec.type")?;
    let exempt = Predicate::Any(vec![
        Predicate::equals(svc_type.clone(), "ExternalName"),
        Predicate::equals(p("spec.clusterIP")?, "None"),
    ]);
    s.rules.extend([
        rule(
            "EndpointsReady",
            Predicate::when(Predicate::not(exempt), Predicate::dependent(endpoints, Predicate::NonEmpty(p("subsets[*].addresses")?))),
        )
        .hint("Service does not target any Pods. Selected Pods may not be ready, or field '.spec.selector' may not match labels on any Pods"),
        rule(
            "LoadBalancer",
            Predicate::when(Predicate::equals(svc_type, "LoadBalancer"), Predicate::NonEmpty(p("status.loadBalancer.ingress")?)),
        )
        .hint("Service was not allocated an IP address; does your cloud provider support this?"),
    ]);
    Ok(s)
}

fn ingress() -> Result<AwaitSpec, CatalogError> {
    let endpoints = KindRef::new("", "v1", "Endpoints");
    let mut s = spec(KindRef::new("networking.k8s.io", "v1", "Ingress"), Timeouts::uniform(TEN_MINUTES, TEN_MINUTES));
    s.dependents.push(DependentRule {
        kind: endpoints.clone(),
        link: Link::NamesFrom(vec![
            p("spec.rules[*].http.paths[*].backend.service.name")?,
            p("spec.rules[*].http.paths[*].backend.serviceName")?,
            p("spec.defaultBackend.service.name")?,
            p("spec.backend.serviceName")?,
        ]),
    });
    s.settle_on = Some(endpoints.clone());
    s.rules.extend([
        rule("EndpointsReady", Predicate::EveryResolved { kind: endpoints })
            .hint("Ingress has at least one rule with an unavailable target endpoint."),
        rule("LoadBalancer", Predicate::NonEmpty(p("status.loadBalancer.ingress")?)).hint("Ingress has not been allocated an address"),
    ]);
    Ok(s)
}

fn job() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("batch", "v1", "Job"), Timeouts::uniform(TEN_MINUTES, FIVE_MINUTES));
    s.fail_rules.push(FailRule::new("JobFailed", Predicate::condition("Failed", "True"), "Job failed"));
    Ok(s)
}

fn replication_controller() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("", "v1", "ReplicationController"), Timeouts::uniform(TEN_MINUTES, TEN_MINUTES));
    s.rules.push(
        rule("Available", Predicate::FieldsEqual(vec![Operand::or(p("spec.replicas")?, json!(1)), Operand::or(p("status.availableReplicas")?, json!(0))]))
            .gated(),
    );
    Ok(s)
}

fn persistent_volume() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("", "v1", "PersistentVolume"), Timeouts::uniform(FIVE_MINUTES, FIVE_MINUTES));
    let phase = p("status.phase")?;
    s.rules.push(rule("Phase", Predicate::OneOf { path: phase.clone(), values: vec![json!("Available"), json!("Bound")] }));
    s.fail_rules.push(FailRule::new("VolumeFailed", Predicate::equals(phase, "Failed"), "PersistentVolume failed"));
    Ok(s)
}

fn persistent_volume_claim() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("", "v1", "PersistentVolumeClaim"), Timeouts::uniform(FIVE_MINUTES, FIVE_MINUTES));
    let phase = p("status.phase")?;
    s.rules.push(rule("Bound", Predicate::equals(phase.clone(), "Bound")));
    s.fail_rules.push(FailRule::new("ClaimLost", Predicate::equals(phase, "Lost"), "PersistentVolumeClaim lost its volume"));
    Ok(s)
}

fn resource_quota() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("", "v1", "ResourceQuota"), Timeouts::uniform(60, FIVE_MINUTES));
    s.rules.push(rule("Hard", Predicate::FieldsEqual(vec![Operand::new(p("spec.hard")?), Operand::new(p("status.hard")?)])));
    Ok(s)
}

fn secret() -> Result<AwaitSpec, CatalogError> {
    let mut s = spec(KindRef::new("", "v1", "Secret"), Timeouts::uniform(60, FIVE_MINUTES));
    s.rules.push(rule(
        "TokenPopulated",
        Predicate::when(Predicate::equals(p("type")?, "kubernetes.io/service-account-token"), Predicate::NonEmpty(p("data")?)),
    ));
    Ok(s)
}

const NO_OP_KINDS: &[(&str, &str, &str)] = &[
    ("", "v1", "ConfigMap"),
    ("", "v1", "LimitRange"),
    ("", "v1", "Namespace"),
    ("", "v1", "ServiceAccount"),
    ("autoscaling", "v2", "HorizontalPodAutoscaler"),
    ("storage.k8s.io", "v1", "StorageClass"),
    ("rbac.authorization.k8s.io", "v1", "Role"),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
];

fn builtin_specs() -> Result<Vec<AwaitSpec>, CatalogError> {
    let mut out = vec![
        deployment()?,
        stateful_set()?,
        daemon_set()?,
        pod()?,
        service()?,
        ingress()?,
        job()?,
        replication_controller()?,
        persistent_volume()?,
        persistent_volume_claim()?,
        resource_quota()?,
        secret()?,
    ];
    out.extend(NO_OP_KINDS.iter().map(|(g, v, k)| spec(KindRef::new(g, v, k), Timeouts::uniform(TEN_MINUTES, FIVE_MINUTES))));
    Ok(out)
}
