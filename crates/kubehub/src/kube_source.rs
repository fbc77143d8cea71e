//! `ClusterSource`/`ClusterWriter` over kube-rs dynamic objects.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kready_core::{KindRef, ObjectRef, PatchKind, Settings};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde_json::Value;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::{strip_managed_fields, ClusterError, ClusterSource, ClusterWriter, ListQuery, RateLimiter, WatchEvent, WatchStream};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide kube client from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let c = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client from default config") })
        .await?;
    Ok(c.clone())
}

pub(crate) fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => ClusterError::from_status(resp.code, format!("{}: {}", resp.reason, resp.message)),
        kube::Error::SerdeError(e) => ClusterError::Decode(e.to_string()),
        other => ClusterError::Transport(other.to_string()),
    }
}

fn map_watch_err(e: watcher::Error) -> ClusterError {
    match e {
        watcher::Error::InitialListFailed(e) | watcher::Error::WatchStartFailed(e) | watcher::Error::WatchFailed(e) => map_kube_err(e),
        watcher::Error::WatchError(resp) => ClusterError::from_status(resp.code, format!("{}: {}", resp.reason, resp.message)),
        other => ClusterError::Transport(other.to_string()),
    }
}

fn to_raw(obj: &DynamicObject) -> Result<Value, ClusterError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClusterError::Decode(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn list_params(q: &ListQuery) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = &q.label_selector {
        lp = lp.labels(l);
    }
    if let Some(f) = &q.field_selector {
        lp = lp.fields(f);
    }
    lp
}

fn watcher_config(q: &ListQuery) -> watcher::Config {
    let mut cfg = watcher::Config::default();
    if let Some(l) = &q.label_selector {
        cfg = cfg.labels(l);
    }
    if let Some(f) = &q.field_selector {
        cfg = cfg.fields(f);
    }
    cfg
}

/// Kube-backed cluster access. Every request first takes a token from the
/// shared limiter; resolved API resources are cached per kind.
pub struct KubeSource {
    client: Client,
    limiter: Arc<RateLimiter>,
    resources: RwLock<HashMap<KindRef, (ApiResource, bool)>>,
}

impl KubeSource {
    pub fn new(client: Client, limiter: Arc<RateLimiter>) -> Self {
        Self { client, limiter, resources: RwLock::new(HashMap::new()) }
    }

    /// Build from the default kube config with the limiter sized by `settings`.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let client = get_kube_client().await?;
        info!(qps = settings.kube_qps, burst = settings.kube_burst, "kubehub: connected");
        Ok(Self::new(client, Arc::new(RateLimiter::new(settings.kube_qps, settings.kube_burst))))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn resolve(&self, kind: &KindRef) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(hit) = self.resources.read().await.get(kind) {
            return Ok(hit.clone());
        }
        self.limiter.acquire().await;
        let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
        let discovery = Discovery::new(self.client.clone())
            .filter(&[kind.group.as_str()])
            .run()
            .await
            .map_err(|e| ClusterError::Discovery(e.to_string()))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.kind == gvk.kind && (ar.version == gvk.version || gvk.version.is_empty()) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(kind = %kind, plural = %ar.plural, namespaced, "kubehub: resolved resource");
                    self.resources.write().await.insert(kind.clone(), (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
            // The recommended version may differ from the one asked for.
            for ver in group.versions() {
                if ver != gvk.version {
                    continue;
                }
                for (ar, caps) in group.versioned_resources(ver) {
                    if ar.kind == gvk.kind {
                        let namespaced = matches!(caps.scope, Scope::Namespaced);
                        self.resources.write().await.insert(kind.clone(), (ar.clone(), namespaced));
                        return Ok((ar, namespaced));
                    }
                }
            }
        }
        Err(ClusterError::Discovery(format!("GVK not served: {}", kind.gvk_key())))
    }

    async fn api(&self, kind: &KindRef, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resolve(kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl ClusterSource for KubeSource {
    async fn get(&self, kind: &KindRef, namespace: Option<&str>, name: &str) -> Result<Option<Value>, ClusterError> {
        let api = self.api(kind, namespace).await?;
        self.limiter.acquire().await;
        match api.get_opt(name).await.map_err(map_kube_err)? {
            Some(o) => Ok(Some(to_raw(&o)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Result<Vec<Value>, ClusterError> {
        let api = self.api(kind, namespace).await?;
        self.limiter.acquire().await;
        let list = api.list(&list_params(query)).await.map_err(map_kube_err)?;
        list.items.iter().map(to_raw).collect()
    }

    async fn watch(&self, kind: &KindRef, namespace: Option<&str>, query: &ListQuery) -> Result<WatchStream, ClusterError> {
        let api = self.api(kind, namespace).await?;
        self.limiter.acquire().await;
        debug!(kind = %kind, ns = ?namespace, query = ?query, "kubehub: watch open");
        let stream = watcher::watcher(api, watcher_config(query)).map_err(map_watch_err).and_then(|ev| async move {
            match ev {
                Event::Applied(o) => Ok(WatchEvent::Applied(to_raw(&o)?)),
                Event::Deleted(o) => Ok(WatchEvent::Deleted(to_raw(&o)?)),
                Event::Restarted(list) => Ok(WatchEvent::Restarted(list.iter().map(to_raw).collect::<Result<_, _>>()?)),
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl ClusterWriter for KubeSource {
    async fn create(&self, obj: &Value) -> Result<Value, ClusterError> {
        let target = ObjectRef::of_object(obj).ok_or_else(|| ClusterError::Invalid("object needs apiVersion, kind and metadata.name".into()))?;
        let api = self.api(&target.kind, target.namespace.as_deref()).await?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone()).map_err(|e| ClusterError::Decode(e.to_string()))?;
        self.limiter.acquire().await;
        let created = api.create(&PostParams::default(), &dynamic).await.map_err(map_kube_err)?;
        info!(obj = %target, "kubehub: created");
        to_raw(&created)
    }

    async fn patch(&self, target: &ObjectRef, kind: PatchKind, patch: &[u8]) -> Result<Value, ClusterError> {
        let api = self.api(&target.kind, target.namespace.as_deref()).await?;
        let body: Value = serde_json::from_slice(patch).map_err(|e| ClusterError::Decode(e.to_string()))?;
        let patch = match kind {
            PatchKind::StrategicMerge => Patch::Strategic(body),
            PatchKind::JsonMerge => Patch::Merge(body),
        };
        self.limiter.acquire().await;
        let patched = api.patch(&target.name, &PatchParams::default(), &patch).await.map_err(map_kube_err)?;
        info!(obj = %target, patch_kind = kind.as_str(), "kubehub: patched");
        to_raw(&patched)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<bool, ClusterError> {
        let api = self.api(&target.kind, target.namespace.as_deref()).await?;
        self.limiter.acquire().await;
        match api.delete(&target.name, &DeleteParams::background()).await.map_err(map_kube_err) {
            Ok(_) => {
                info!(obj = %target, "kubehub: delete requested");
                Ok(true)
            }
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
