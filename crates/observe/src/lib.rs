//! Kready observer (Milestone 2) – turns watch or poll traffic for one target and
//! its dependents into an ordered stream of `ObservedState` snapshots.
//!
//! Transient API failures are retried here with exponential backoff and never
//! reach the consumer. The stream only ends when the caller cancels (or drops
//! it), or with a single `Observation::Exhausted` once retries are spent.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, SelectAll};
use futures::{Stream, StreamExt};
use kready_conditions::{dependents, AwaitSpec, DependentRef};
use kready_core::{meta, KindRef, ObjectRef, ObservedState, Settings, Transport};
use kready_kubehub::{ClusterError, ClusterSource, ListQuery, WatchEvent};
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    State(ObservedState),
    /// Retries ran out (or the API refused outright); no more snapshots follow.
    Exhausted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObserverConfig {
    pub transport: Transport,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_retries: u32,
    pub queue_cap: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ObserverConfig {
    fn from(s: &Settings) -> Self {
        Self {
            transport: s.transport,
            poll_interval: s.poll_interval,
            backoff_base: Duration::from_millis(250),
            backoff_max: s.watch_backoff_max,
            max_retries: s.observer_max_retries,
            queue_cap: s.queue_cap,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

/// Handle over one observation run. Dropping it stops the run.
pub struct Observations {
    rx: mpsc::Receiver<Observation>,
    _guard: DropGuard,
}

impl Observations {
    pub async fn next(&mut self) -> Option<Observation> {
        self.rx.recv().await
    }
}

impl Stream for Observations {
    type Item = Observation;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Observation>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Clone)]
pub struct Observer {
    source: Arc<dyn ClusterSource>,
    cfg: ObserverConfig,
}

impl Observer {
    pub fn new(source: Arc<dyn ClusterSource>, cfg: ObserverConfig) -> Self {
        Self { source, cfg }
    }

    pub fn source(&self) -> &Arc<dyn ClusterSource> {
        &self.source
    }

    /// Start observing `target` and the dependents `spec` asks for. The run
    /// stops when `cancel` fires or the returned handle is dropped.
    pub fn observe(&self, target: ObjectRef, spec: Arc<AwaitSpec>, cancel: &CancellationToken) -> Observations {
        let (tx, rx) = mpsc::channel(self.cfg.queue_cap.max(1));
        let token = cancel.child_token();
        let run = Run {
            source: self.source.clone(),
            cfg: self.cfg.clone(),
            target_ref: target,
            spec,
            tx,
            cancel: token.clone(),
            target: None,
            last_rv: None,
            last_generation: None,
            refs: Vec::new(),
            deps: HashMap::new(),
        };
        tokio::spawn(run.run());
        Observations { rx, _guard: token.drop_guard() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Watch,
    Poll,
}

/// Whether the run should keep going after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

type DepStream = BoxStream<'static, (DependentRef, Result<WatchEvent, ClusterError>)>;

struct Run {
    source: Arc<dyn ClusterSource>,
    cfg: ObserverConfig,
    target_ref: ObjectRef,
    spec: Arc<AwaitSpec>,
    tx: mpsc::Sender<Observation>,
    cancel: CancellationToken,
    target: Option<Value>,
    last_rv: Option<String>,
    last_generation: Option<i64>,
    refs: Vec<DependentRef>,
    deps: HashMap<DependentRef, BTreeMap<String, Value>>,
}

async fn pause(cancel: &CancellationToken, d: Duration) -> Flow {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Flow::Stop,
        _ = tokio::time::sleep(d) => Flow::Continue,
    }
}

fn dep_query(r: &DependentRef) -> ListQuery {
    match &r.name {
        Some(n) => ListQuery::named(n),
        None => ListQuery::labels(r.label_selector.as_deref()),
    }
}

impl Run {
    async fn run(mut self) {
        let mut mode = match self.cfg.transport {
            Transport::Watch | Transport::Auto => Mode::Watch,
            Transport::Poll => Mode::Poll,
        };
        info!(target_obj = %self.target_ref, transport = ?self.cfg.transport, "observe: start");
        loop {
            let res = match mode {
                Mode::Watch => self.watch_loop().await,
                Mode::Poll => self.poll_loop().await,
            };
            match res {
                Ok(()) => {
                    debug!(target_obj = %self.target_ref, "observe: stopped");
                    return;
                }
                Err(e) if mode == Mode::Watch && self.cfg.transport == Transport::Auto => {
                    warn!(target_obj = %self.target_ref, error = %e, "observe: watch unusable, falling back to polling");
                    counter!("observer_fallback_poll_total", 1u64);
                    mode = Mode::Poll;
                }
                Err(e) => {
                    warn!(target_obj = %self.target_ref, error = %e, "observe: exhausted");
                    let _ = self.tx.send(Observation::Exhausted(e.to_string())).await;
                    return;
                }
            }
        }
    }

    /// Count a failure; `Err` once the budget is gone or the error is terminal.
    async fn retry(&self, failures: &mut u32, e: ClusterError) -> Result<Flow, ClusterError> {
        if !e.is_retryable() {
            return Err(e);
        }
        *failures += 1;
        counter!("observer_retries_total", 1u64);
        if *failures > self.cfg.max_retries {
            return Err(e);
        }
        let delay = backoff(*failures, self.cfg.backoff_base, self.cfg.backoff_max);
        debug!(target_obj = %self.target_ref, attempt = *failures, delay_ms = delay.as_millis() as u64, error = %e, "observe: retrying");
        Ok(pause(&self.cancel, delay).await)
    }

    async fn watch_loop(&mut self) -> Result<(), ClusterError> {
        let mut failures = 0u32;
        loop {
            let e = match self.watch_session(&mut failures).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if self.retry(&mut failures, e).await? == Flow::Stop {
                return Ok(());
            }
        }
    }

    async fn open_deps(&self) -> Result<SelectAll<DepStream>, ClusterError> {
        let mut all = SelectAll::new();
        for r in self.refs.iter() {
            let s = self.source.watch(&r.kind, r.namespace.as_deref(), &dep_query(r)).await?;
            let tag = r.clone();
            all.push(s.map(move |ev| (tag.clone(), ev)).boxed());
        }
        Ok(all)
    }

    /// One connected stretch: returns `Ok` when stopped, `Err` on transport trouble.
    async fn watch_session(&mut self, failures: &mut u32) -> Result<(), ClusterError> {
        let t = &self.target_ref;
        let mut target_stream = self.source.watch(&t.kind, t.namespace.as_deref(), &ListQuery::named(&t.name)).await?;
        let mut deps = self.open_deps().await?;
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                ev = target_stream.next() => {
                    let ev = match ev {
                        Some(Ok(ev)) => ev,
                        Some(Err(e)) => return Err(e),
                        None => return Err(ClusterError::Transport("target watch ended".into())),
                    };
                    *failures = 0;
                    if !self.on_target_event(ev) {
                        continue;
                    }
                    if self.refresh_refs() {
                        deps = self.open_deps().await?;
                    }
                    if self.emit().await == Flow::Stop {
                        return Ok(());
                    }
                }
                Some((r, ev)) = deps.next(), if !deps.is_empty() => {
                    let ev = ev?;
                    *failures = 0;
                    self.on_dep_event(&r, ev);
                    if self.emit().await == Flow::Stop {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn poll_loop(&mut self) -> Result<(), ClusterError> {
        let mut failures = 0u32;
        let cancel = self.cancel.clone();
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                r = self.poll_once() => r,
            };
            let flow = match res {
                Ok(()) => {
                    failures = 0;
                    if self.emit().await == Flow::Stop {
                        return Ok(());
                    }
                    pause(&cancel, self.cfg.poll_interval).await
                }
                Err(e) => self.retry(&mut failures, e).await?,
            };
            if flow == Flow::Stop {
                return Ok(());
            }
        }
    }

    async fn poll_once(&mut self) -> Result<(), ClusterError> {
        let t = &self.target_ref;
        let got = self.source.get(&t.kind, t.namespace.as_deref(), &t.name).await?;
        self.accept(got);
        self.refresh_refs();
        let mut fresh = HashMap::with_capacity(self.refs.len());
        for r in self.refs.iter() {
            let objs = match &r.name {
                Some(n) => self.source.get(&r.kind, r.namespace.as_deref(), n).await?.into_iter().collect(),
                None => self.source.list(&r.kind, r.namespace.as_deref(), &dep_query(r)).await?,
            };
            let by_name: BTreeMap<String, Value> = objs
                .into_iter()
                .filter(|o| r.admits(o))
                .filter_map(|o| meta::name(&o).map(str::to_string).map(|n| (n, o)))
                .collect();
            fresh.insert(r.clone(), by_name);
        }
        self.deps = fresh;
        Ok(())
    }

    /// Apply a target event; false when it was stale and dropped.
    fn on_target_event(&mut self, ev: WatchEvent) -> bool {
        let name = self.target_ref.name.as_str();
        let candidate = match ev {
            WatchEvent::Applied(o) => Some(o),
            WatchEvent::Deleted(_) => None,
            WatchEvent::Restarted(list) => list.into_iter().find(|o| meta::name(o) == Some(name)),
        };
        self.accept(candidate)
    }

    /// Snapshots older than the last one delivered (by resourceVersion, then generation) are dropped.
    fn accept(&mut self, candidate: Option<Value>) -> bool {
        match candidate {
            Some(o) => {
                let rv = meta::resource_version(&o).map(str::to_string);
                let generation = meta::generation(&o);
                if let (Some(prev), Some(cur)) = (self.last_rv.as_deref(), rv.as_deref()) {
                    if meta::resource_version_cmp(cur, prev) == Some(Ordering::Less) {
                        debug!(target_obj = %self.target_ref, rv = cur, last = prev, "observe: stale resourceVersion dropped");
                        return false;
                    }
                }
                if let (Some(prev), Some(cur)) = (self.last_generation, generation) {
                    if cur < prev {
                        debug!(target_obj = %self.target_ref, generation = cur, last = prev, "observe: stale generation dropped");
                        return false;
                    }
                }
                self.last_rv = rv;
                self.last_generation = generation;
                self.target = Some(o);
            }
            None => {
                self.last_rv = None;
                self.last_generation = None;
                self.target = None;
            }
        }
        true
    }

    fn on_dep_event(&mut self, r: &DependentRef, ev: WatchEvent) {
        let slot = self.deps.entry(r.clone()).or_default();
        match ev {
            WatchEvent::Applied(o) => {
                if let (true, Some(n)) = (r.admits(&o), meta::name(&o).map(str::to_string)) {
                    slot.insert(n, o);
                }
            }
            WatchEvent::Deleted(o) => {
                if let Some(n) = meta::name(&o) {
                    slot.remove(n);
                }
            }
            WatchEvent::Restarted(list) => {
                slot.clear();
                for o in list.into_iter().filter(|o| r.admits(o)) {
                    if let Some(n) = meta::name(&o).map(str::to_string) {
                        slot.insert(n, o);
                    }
                }
            }
        }
    }

    /// Re-resolve dependents from the current target; true when the set changed.
    fn refresh_refs(&mut self) -> bool {
        let next = dependents(&self.spec, self.target.as_ref());
        if next == self.refs {
            return false;
        }
        debug!(target_obj = %self.target_ref, count = next.len(), "observe: dependents changed");
        self.deps.retain(|k, _| next.contains(k));
        self.refs = next;
        true
    }

    fn snapshot(&self) -> ObservedState {
        let mut grouped: BTreeMap<KindRef, Vec<Value>> = BTreeMap::new();
        for k in self.spec.dependent_kinds() {
            grouped.entry(k).or_default();
        }
        for r in self.refs.iter() {
            if let Some(objs) = self.deps.get(r) {
                let slot = match grouped.keys().find(|k| k.same_kind(&r.kind)).cloned() {
                    Some(k) => grouped.entry(k).or_default(),
                    None => grouped.entry(r.kind.clone()).or_default(),
                };
                slot.extend(objs.values().cloned());
            }
        }
        let mut st = ObservedState::new(self.target.clone());
        st.dependents = grouped;
        st
    }

    async fn emit(&self) -> Flow {
        let obs = Observation::State(self.snapshot());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Flow::Stop,
            r = self.tx.send(obs) => if r.is_ok() { Flow::Continue } else { Flow::Stop },
        }
    }
}
