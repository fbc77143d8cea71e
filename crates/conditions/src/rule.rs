//! Declarative readiness rules and the per-kind await spec they form.

use std::time::Duration;

use kready_core::{KindRef, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::FieldPath;

/// Generation the status must have caught up with before a rule is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GenerationReq {
    /// `status.observedGeneration >= metadata.generation`.
    Current,
    AtLeast(i64),
}

/// A field plus the value assumed when the field is absent
/// (status counters are omitted when zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub path: FieldPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Operand {
    pub fn new(path: FieldPath) -> Self {
        Self { path, default: None }
    }

    pub fn or(path: FieldPath, default: Value) -> Self {
        Self { path, default: Some(default) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    /// The subject exists.
    Exists,
    /// The subject does not exist.
    Absent,
    Equals { path: FieldPath, value: Value },
    OneOf { path: FieldPath, values: Vec<Value> },
    /// Every operand resolves and all are equal.
    FieldsEqual(Vec<Operand>),
    GreaterThan { path: FieldPath, value: i64 },
    /// Some selected value is a non-empty list, map or string, or any scalar.
    NonEmpty(FieldPath),
    /// An entry of `status.conditions` with this type and status (and reason, if given).
    Condition {
        #[serde(rename = "type")]
        type_: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The subject's `path` equals the target's `target_path`.
    MatchesTarget { path: FieldPath, target_path: FieldPath },
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    /// Vacuously true unless `guard` holds.
    When { guard: Box<Predicate>, then: Box<Predicate> },
    /// Some observed dependent of `kind` satisfies `each`.
    Dependent { kind: KindRef, each: Box<Predicate> },
    /// Every dependent of `kind` the resolver names has been observed.
    EveryResolved { kind: KindRef },
}

impl Predicate {
    pub fn condition(type_: &str, status: &str) -> Self {
        Predicate::Condition { type_: type_.to_string(), status: status.to_string(), reason: None }
    }

    pub fn condition_reason(type_: &str, status: &str, reason: &str) -> Self {
        Predicate::Condition { type_: type_.to_string(), status: status.to_string(), reason: Some(reason.to_string()) }
    }

    pub fn equals(path: FieldPath, value: impl Into<Value>) -> Self {
        Predicate::Equals { path, value: value.into() }
    }

    pub fn not(p: Predicate) -> Self {
        Predicate::Not(Box::new(p))
    }

    pub fn when(guard: Predicate, then: Predicate) -> Self {
        Predicate::When { guard: Box::new(guard), then: Box::new(then) }
    }

    pub fn dependent(kind: KindRef, each: Predicate) -> Self {
        Predicate::Dependent { kind, each: Box::new(each) }
    }

    /// Paths this predicate reads, paired with the dependent kind they are read
    /// from (`None` = the target).
    pub fn paths<'a>(&'a self, scope: Option<&'a KindRef>, out: &mut Vec<(Option<&'a KindRef>, &'a FieldPath)>) {
        match self {
            Predicate::Exists | Predicate::Absent | Predicate::Condition { .. } | Predicate::EveryResolved { .. } => {}
            Predicate::Equals { path, .. } | Predicate::OneOf { path, .. } | Predicate::GreaterThan { path, .. } | Predicate::NonEmpty(path) => {
                out.push((scope, path))
            }
            Predicate::FieldsEqual(ops) => out.extend(ops.iter().map(|o| (scope, &o.path))),
            Predicate::MatchesTarget { path, target_path } => {
                out.push((scope, path));
                out.push((None, target_path));
            }
            Predicate::Not(p) => p.paths(scope, out),
            Predicate::All(ps) | Predicate::Any(ps) => ps.iter().for_each(|p| p.paths(scope, out)),
            Predicate::When { guard, then } => {
                guard.paths(scope, out);
                then.paths(scope, out);
            }
            Predicate::Dependent { kind, each } => each.paths(Some(kind), out),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub name: String,
    pub predicate: Predicate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationReq>,
    /// Shown next to the rule name while it is unmet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ConditionRule {
    pub fn new(name: &str, predicate: Predicate) -> Self {
        Self { name: name.to_string(), predicate, generation: None, hint: None }
    }

    pub fn gated(mut self) -> Self {
        self.generation = Some(GenerationReq::Current);
        self
    }

    pub fn hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_string());
        self
    }
}

/// Terminal failure: once it holds, waiting cannot help.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRule {
    pub name: String,
    pub predicate: Predicate,
    pub message: String,
}

impl FailRule {
    pub fn new(name: &str, predicate: Predicate, message: &str) -> Self {
        Self { name: name.to_string(), predicate, message: message.to_string() }
    }
}

/// How a target maps to the dependents that must be observed with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Link {
    /// Same namespace and name as the target (Service -> Endpoints).
    SameName,
    /// Owned via `metadata.ownerReferences`, listed by the target's `spec.selector.matchLabels`.
    OwnedBy,
    /// Listed by the target's `spec.selector.matchLabels`, whoever owns them (Deployment -> Pods).
    Selected,
    /// Names read from target fields (Ingress backends -> Endpoints).
    NamesFrom(Vec<FieldPath>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentRule {
    pub kind: KindRef,
    pub link: Link,
}

/// Default timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub create: u64,
    pub update: u64,
    pub delete: u64,
}

impl Timeouts {
    pub const fn uniform(create_update: u64, delete: u64) -> Self {
        Self { create: create_update, update: create_update, delete }
    }

    pub fn for_op(&self, op: Operation) -> Duration {
        Duration::from_secs(match op {
            Operation::Create => self.create,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        })
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(600, 300)
    }
}

/// Everything the orchestrator needs to know about awaiting one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitSpec {
    pub kind: KindRef,
    #[serde(default)]
    pub timeouts: Timeouts,
    pub rules: Vec<ConditionRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fail_rules: Vec<FailRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<DependentRule>,
    /// Dependent kind whose first appearance opens the settle window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_on: Option<KindRef>,
    /// Hold every rule until `status.observedGeneration` catches up, when published.
    #[serde(default = "yes")]
    pub gate_generation: bool,
}

fn yes() -> bool {
    true
}

impl AwaitSpec {
    /// Success as soon as the object exists.
    pub fn no_op(kind: KindRef) -> Self {
        Self {
            kind,
            timeouts: Timeouts::default(),
            rules: vec![ConditionRule::new("Exists", Predicate::Exists)],
            fail_rules: Vec::new(),
            dependents: Vec::new(),
            settle_on: None,
            gate_generation: true,
        }
    }

    pub fn is_no_op(&self) -> bool {
        self.fail_rules.is_empty() && self.rules.iter().all(|r| r.predicate == Predicate::Exists)
    }

    pub fn default_timeout(&self, op: Operation) -> Duration {
        self.timeouts.for_op(op)
    }

    pub fn dependent_kinds(&self) -> Vec<KindRef> {
        self.dependents.iter().map(|d| d.kind.clone()).collect()
    }
}
