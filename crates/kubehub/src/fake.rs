//! In-memory cluster for tests and demos: objects, watches and injected failures.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use kready_core::{meta, KindRef, ObjectRef, PatchKind};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{ClusterError, ClusterSource, ClusterWriter, ListQuery, WatchEvent, WatchStream};

type Key = (String, String, Option<String>, String);

fn key_of(kind: &KindRef, namespace: Option<&str>, name: &str) -> Key {
    (kind.canonical_group().to_string(), kind.kind.clone(), namespace.map(str::to_string), name.to_string())
}

#[derive(Debug, Clone)]
enum FakeEvent {
    Event(KindRef, WatchEvent),
    Break(ClusterError),
}

#[derive(Default)]
struct Faults {
    get: VecDeque<ClusterError>,
    list: VecDeque<ClusterError>,
    watch: VecDeque<ClusterError>,
    watch_always: Option<ClusterError>,
}

/// A fake API server. Every stored object gets a fresh numeric `resourceVersion`.
pub struct FakeCluster {
    objects: Mutex<BTreeMap<Key, Value>>,
    faults: Mutex<Faults>,
    tx: broadcast::Sender<FakeEvent>,
    rv: AtomicU64,
    uid: AtomicU64,
    pub gets: AtomicUsize,
    pub lists: AtomicUsize,
    pub watches: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shallow JSON merge used for both patch kinds; `$`-directives are skipped.
fn merge(dst: &mut Value, patch: &Value) {
    match (dst, patch) {
        (Value::Object(d), Value::Object(p)) => {
            for (k, v) in p {
                if k.starts_with('$') {
                    continue;
                }
                if v.is_null() {
                    d.remove(k);
                } else {
                    merge(d.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (d, p) => *d = p.clone(),
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            tx,
            rv: AtomicU64::new(1),
            uid: AtomicU64::new(1),
            gets: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Store (create or replace) an object and notify watchers. Returns the stored copy.
    pub fn apply(&self, mut obj: Value) -> Value {
        let Some(oref) = ObjectRef::of_object(&obj) else { return obj };
        let rv = self.rv.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(m) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            m.insert("resourceVersion".into(), json!(rv.to_string()));
            if !m.contains_key("uid") {
                m.insert("uid".into(), json!(format!("uid-{}", self.uid.fetch_add(1, Ordering::SeqCst))));
            }
        }
        lock(&self.objects).insert(key_of(&oref.kind, oref.namespace.as_deref(), &oref.name), obj.clone());
        let _ = self.tx.send(FakeEvent::Event(oref.kind, WatchEvent::Applied(obj.clone())));
        obj
    }

    /// Remove an object and notify watchers.
    pub fn remove(&self, kind: &KindRef, namespace: Option<&str>, name: &str) -> Option<Value> {
        let gone = lock(&self.objects).remove(&key_of(kind, namespace, name));
        if let Some(o) = &gone {
            let _ = self.tx.send(FakeEvent::Event(kind.clone(), WatchEvent::Deleted(o.clone())));
        }
        gone
    }

    pub fn object(&self, kind: &KindRef, namespace: Option<&str>, name: &str) -> Option<Value> {
        lock(&self.objects).get(&key_of(kind, namespace, name)).cloned()
    }

    /// Break every open watch stream with `err`.
    pub fn break_watches(&self, err: ClusterError) {
        let _ = self.tx.send(FakeEvent::Break(err));
    }

    pub fn fail_next_get(&self, err: ClusterError) {
        lock(&self.faults).get.push_back(err);
    }

    pub fn fail_next_list(&self, err: ClusterError) {
        lock(&self.faults).list.push_back(err);
    }

    pub fn fail_next_watch(&self, err: ClusterError) {
        lock(&self.faults).watch.push_back(err);
    }

    /// Every watch attempt fails with `err` (e.g. a proxy that drops long-lived connections).
    pub fn fail_all_watches(&self, err: Option<ClusterError>) {
        lock(&self.faults).watch_always = err;
    }

    /// Mutations in call order, e.g. `patch:strategic:Deployment default/web`.
    pub fn mutations(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    fn snapshot(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Vec<Value> {
        lock(&self.objects)
            .iter()
            .filter(|((g, k, ns, _), _)| g == kind.canonical_group() && *k == kind.kind && (namespace.is_none() || ns.as_deref() == namespace))
            .map(|(_, v)| v)
            .filter(|v| query.matches(v))
            .cloned()
            .collect()
    }
}

fn admits(kind: &KindRef, namespace: &Option<String>, query: &ListQuery, ev_kind: &KindRef, obj: &Value) -> bool {
    ev_kind.same_kind(kind) && (namespace.is_none() || meta::namespace(obj) == namespace.as_deref()) && query.matches(obj)
}

#[async_trait]
impl ClusterSource for FakeCluster {
    async fn get(&self, kind: &KindRef, namespace: Option<&str>, name: &str) -> Result<Option<Value>, ClusterError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.faults).get.pop_front() {
            return Err(e);
        }
        Ok(self.object(kind, namespace, name))
    }

    async fn list(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Result<Vec<Value>, ClusterError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.faults).list.pop_front() {
            return Err(e);
        }
        Ok(self.snapshot(kind, namespace, query))
    }

    async fn watch(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Result<WatchStream, ClusterError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        {
            let mut f = lock(&self.faults);
            if let Some(e) = f.watch.pop_front() {
                return Err(e);
            }
            if let Some(e) = &f.watch_always {
                return Err(e.clone());
            }
        }
        let rx = self.tx.subscribe();
        let initial = WatchEvent::Restarted(self.snapshot(kind, namespace, query));
        let (kind, namespace, query) = (kind.clone(), namespace.map(str::to_string), query.clone());
        let stream = futures::stream::unfold((Some(initial), Some(rx)), move |(initial, rx)| {
            let (kind, namespace, query) = (kind.clone(), namespace.clone(), query.clone());
            async move {
                if let Some(ev) = initial {
                    return Some((Ok(ev), (None, rx)));
                }
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(FakeEvent::Event(k, ev)) => {
                            let obj = match &ev {
                                WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
                                WatchEvent::Restarted(_) => continue,
                            };
                            if admits(&kind, &namespace, &query, &k, obj) {
                                return Some((Ok(ev), (None, Some(rx))));
                            }
                        }
                        Ok(FakeEvent::Break(e)) => return Some((Err(e), (None, None))),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ClusterWriter for FakeCluster {
    async fn create(&self, obj: &Value) -> Result<Value, ClusterError> {
        let oref = ObjectRef::of_object(obj).ok_or_else(|| ClusterError::Invalid("object needs apiVersion, kind and metadata.name".into()))?;
        if self.object(&oref.kind, oref.namespace.as_deref(), &oref.name).is_some() {
            return Err(ClusterError::Conflict(format!("{oref} already exists")));
        }
        lock(&self.log).push(format!("create:{oref}"));
        let mut obj = obj.clone();
        if let Some(m) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            m.entry("generation").or_insert(json!(1));
        }
        Ok(self.apply(obj))
    }

    async fn patch(&self, target: &ObjectRef, kind: PatchKind, patch: &[u8]) -> Result<Value, ClusterError> {
        let body: Value = serde_json::from_slice(patch).map_err(|e| ClusterError::Decode(e.to_string()))?;
        let mut cur = self
            .object(&target.kind, target.namespace.as_deref(), &target.name)
            .ok_or_else(|| ClusterError::NotFound(target.to_string()))?;
        lock(&self.log).push(format!("patch:{}:{target}", kind.as_str()));
        merge(&mut cur, &body);
        if body.get("spec").is_some() {
            let next = meta::generation(&cur).unwrap_or(0) + 1;
            cur["metadata"]["generation"] = json!(next);
        }
        Ok(self.apply(cur))
    }

    async fn delete(&self, target: &ObjectRef) -> Result<bool, ClusterError> {
        lock(&self.log).push(format!("delete:{target}"));
        Ok(self.remove(&target.kind, target.namespace.as_deref(), &target.name).is_some())
    }
}
