use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kready_await::{AwaitRequest, Orchestrator};
use kready_conditions::Catalog;
use kready_core::{CustomTimeouts, KindRef, ObjectRef, Operation, Outcome, Transport};
use kready_kubehub::fake::FakeCluster;
use kready_kubehub::ClusterError;
use kready_observe::{Observer, ObserverConfig};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn orchestrator(fake: &Arc<FakeCluster>, settle: Duration) -> Orchestrator {
    let cfg = ObserverConfig {
        transport: Transport::Watch,
        poll_interval: Duration::from_millis(100),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        max_retries: 3,
        queue_cap: 16,
    };
    Orchestrator::new(Arc::new(Catalog::builtin().unwrap()), Observer::new(fake.clone(), cfg), settle)
}

fn deployment(available: &str, ready: i64) -> Value {
    json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "default", "uid": "d-1", "generation": 1,
                     "annotations": {"deployment.kubernetes.io/revision": "1"}},
        "spec": {"replicas": 3, "selector": {"matchLabels": {"app": "web"}}},
        "status": {"observedGeneration": 1, "replicas": 3, "readyReplicas": ready, "availableReplicas": ready,
                   "conditions": [{"type": "Available", "status": available}]}
    })
}

fn replica_set() -> Value {
    json!({
        "apiVersion": "apps/v1", "kind": "ReplicaSet",
        "metadata": {"name": "web-1", "namespace": "default", "labels": {"app": "web"},
                     "annotations": {"deployment.kubernetes.io/revision": "1"},
                     "ownerReferences": [{"kind": "Deployment", "name": "web", "uid": "d-1"}]}
    })
}

fn service(cluster_ip: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web", "namespace": "default"},
           "spec": {"selector": {"app": "web"}, "clusterIP": cluster_ip, "type": "ClusterIP"}})
}

fn endpoints() -> Value {
    json!({"apiVersion": "v1", "kind": "Endpoints", "metadata": {"name": "web", "namespace": "default"},
           "subsets": [{"addresses": [{"ip": "10.1.0.4"}]}]})
}

fn request(obj: &Value, op: Operation) -> AwaitRequest {
    AwaitRequest::for_object(obj, op).unwrap()
}

#[tokio::test(start_paused = true)]
async fn skip_await_consumes_no_snapshot() {
    let fake = Arc::new(FakeCluster::new());
    let mut d = deployment("False", 0);
    d["metadata"]["annotations"]["pulumi.com/skipAwait"] = json!("true");
    let res = orchestrator(&fake, Duration::ZERO).await_ready(request(&d, Operation::Create), &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::Ready);
    assert_eq!(res.snapshots, 0);
    assert!(res.trail.is_empty());
    assert_eq!(fake.gets.load(Ordering::SeqCst) + fake.watches.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn live_annotations_apply_without_a_submitted_object() {
    let fake = Arc::new(FakeCluster::new());
    let mut d = deployment("False", 0);
    d["metadata"]["annotations"]["pulumi.com/skipAwait"] = json!("true");
    let d = fake.apply(d);
    let target = ObjectRef::of_object(&d).unwrap();
    let res = orchestrator(&fake, Duration::ZERO).await_ready(AwaitRequest::new(target, Operation::Create), &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::Ready);
    assert_eq!(res.snapshots, 0);
    assert_eq!(fake.gets.load(Ordering::SeqCst), 1);
    assert_eq!(fake.watches.load(Ordering::SeqCst), 0);

    let mut d = deployment("False", 0);
    d["metadata"]["annotations"]["pulumi.com/timeoutSeconds"] = json!("7");
    let d = fake.apply(d);
    fake.apply(replica_set());
    let target = ObjectRef::of_object(&d).unwrap();
    let res = orchestrator(&fake, Duration::ZERO).await_ready(AwaitRequest::new(target, Operation::Update), &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::TimedOut);
    assert_eq!(res.elapsed_ms, 7_000);
}

#[tokio::test(start_paused = true)]
async fn zero_timeout_never_reports_ready() {
    let fake = Arc::new(FakeCluster::new());
    let d = fake.apply(deployment("False", 0));
    let req = request(&d, Operation::Create).with_custom_timeouts(CustomTimeouts { create: Some(0), ..Default::default() });
    let res = orchestrator(&fake, Duration::ZERO).await_ready(req, &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::TimedOut);
    assert!(res.elapsed_ms < 1_000);
    assert!(res.trail.iter().all(|t| !t.unmet.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn deployment_converges_after_rollout() {
    let fake = Arc::new(FakeCluster::new());
    let d = fake.apply(deployment("False", 0));
    let orch = orchestrator(&fake, Duration::ZERO);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let req = request(&d, Operation::Create);
        let cancel = cancel.clone();
        async move { orch.await_ready(req, &cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    fake.apply(replica_set());
    tokio::time::sleep(Duration::from_secs(1)).await;
    fake.apply(deployment("True", 3));

    let res = task.await.unwrap();
    assert_eq!(res.outcome, Outcome::Ready, "{}", res.message);
    assert!(res.unmet.is_empty());
    assert_eq!(res.message, "Deployment default/web ready");
    let first = &res.trail[0];
    assert_eq!(first.unmet, vec!["Available".to_string(), "ReplicaSet".to_string()]);
    assert!(res.trail.last().unwrap().unmet.is_empty());
    assert!(res.snapshots >= 3);
}

#[tokio::test(start_paused = true)]
async fn timeout_reports_unmet_conditions_and_progress() {
    let fake = Arc::new(FakeCluster::new());
    let d = fake.apply(deployment("False", 0));
    fake.apply(replica_set());
    let req = request(&d, Operation::Update).with_timeout(Duration::from_secs(30));
    let res = orchestrator(&fake, Duration::ZERO).await_ready(req, &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::TimedOut);
    assert_eq!(res.message, "Deployment default/web not ready: Available (0/3 replicas ready)");
    assert_eq!(res.unmet, vec!["Available".to_string()]);
    assert_eq!(res.elapsed_ms, 30_000);
    assert!(res.last_state.unwrap().target.is_some());
}

#[tokio::test(start_paused = true)]
async fn pod_timeout_names_the_container_reason() {
    let fake = Arc::new(FakeCluster::new());
    let pod = fake.apply(json!({
        "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "api", "namespace": "default"},
        "status": {"phase": "Pending", "conditions": [{"type": "PodScheduled", "status": "True"}],
                   "containerStatuses": [{"name": "app", "ready": false,
                       "state": {"waiting": {"reason": "ImagePullBackOff", "message": "Back-off pulling image \"api:9\""}}}]}
    }));
    let req = request(&pod, Operation::Create).with_timeout(Duration::from_secs(10));
    let res = orchestrator(&fake, Duration::ZERO).await_ready(req, &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::TimedOut);
    assert!(res.message.starts_with("Pod default/api not ready: "), "{}", res.message);
    assert!(res.message.ends_with(r#" -- [ImagePullBackOff] app: Back-off pulling image "api:9""#), "{}", res.message);
}

#[tokio::test(start_paused = true)]
async fn failed_pod_short_circuits_the_timeout() {
    let fake = Arc::new(FakeCluster::new());
    let pod = fake.apply(json!({
        "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "job-x", "namespace": "default"},
        "status": {"phase": "Failed", "message": "OOMKilled"}
    }));
    let res = orchestrator(&fake, Duration::ZERO).await_ready(request(&pod, Operation::Create), &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::Failed);
    assert_eq!(res.message, "Pod default/job-x failed: Pod failed: OOMKilled");
    assert!(res.elapsed_ms < 1_000);
}

#[tokio::test(start_paused = true)]
async fn service_waits_for_endpoints_and_settles() {
    let fake = Arc::new(FakeCluster::new());
    let svc = fake.apply(service("10.0.0.9"));
    let orch = orchestrator(&fake, Duration::from_secs(5));
    let task = tokio::spawn({
        let req = request(&svc, Operation::Create);
        async move { orch.await_ready(req, &CancellationToken::new()).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    fake.apply(endpoints());

    let res = task.await.unwrap();
    assert_eq!(res.outcome, Outcome::Ready, "{}", res.message);
    assert_eq!(res.trail[0].unmet, vec!["EndpointsReady".to_string()]);
    assert!(res.elapsed_ms >= 6_000, "elapsed {}", res.elapsed_ms);
}

#[tokio::test(start_paused = true)]
async fn headless_service_is_not_delayed() {
    let fake = Arc::new(FakeCluster::new());
    let svc = fake.apply(service("None"));
    let res = orchestrator(&fake, Duration::from_secs(5)).await_ready(request(&svc, Operation::Create), &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::Ready);
    assert!(res.elapsed_ms < 1_000);
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_prompt() {
    let fake = Arc::new(FakeCluster::new());
    let d = fake.apply(deployment("False", 0));
    let orch = orchestrator(&fake, Duration::ZERO);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let req = request(&d, Operation::Create);
        let cancel = cancel.clone();
        async move { orch.await_ready(req, &cancel).await }
    });
    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();
    let res = task.await.unwrap();
    assert_eq!(res.outcome, Outcome::Cancelled);
    assert!(res.elapsed_ms < 3_000);
    assert!(!res.unmet.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_observation_fails() {
    let fake = Arc::new(FakeCluster::new());
    let d = fake.apply(deployment("False", 0));
    fake.fail_all_watches(Some(ClusterError::Forbidden("watch denied".into())));
    let res = orchestrator(&fake, Duration::ZERO).await_ready(request(&d, Operation::Create), &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::Failed);
    assert!(res.message.contains("observation failed"), "{}", res.message);
}

#[tokio::test(start_paused = true)]
async fn delete_completion() {
    let fake = Arc::new(FakeCluster::new());
    let d = fake.apply(deployment("True", 3));
    let orch = orchestrator(&fake, Duration::ZERO);
    let task = tokio::spawn({
        let req = request(&d, Operation::Delete);
        let orch = orch.clone();
        async move { orch.await_deleted(req, &CancellationToken::new()).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    fake.remove(&KindRef::new("apps", "v1", "Deployment"), Some("default"), "web");
    let res = task.await.unwrap();
    assert_eq!(res.outcome, Outcome::Ready);
    assert_eq!(res.message, "Deployment default/web deleted");

    let ds = fake.apply(json!({
        "apiVersion": "apps/v1", "kind": "DaemonSet", "metadata": {"name": "agent", "namespace": "default"},
        "status": {"desiredNumberScheduled": 3, "numberReady": 1}
    }));
    let req = request(&ds, Operation::Delete).with_timeout(Duration::from_secs(10));
    let res = orch.await_deleted(req, &CancellationToken::new()).await;
    assert_eq!(res.outcome, Outcome::TimedOut);
    assert_eq!(res.message, "DaemonSet default/agent still present (1/3 pods ready)");
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_are_independent() {
    let fake = Arc::new(FakeCluster::new());
    let pod = fake.apply(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "bad", "namespace": "default"},
                                "status": {"phase": "Failed"}}));
    let cm = fake.apply(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg", "namespace": "default"}}));
    let orch = orchestrator(&fake, Duration::ZERO);
    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        orch.await_ready(request(&pod, Operation::Create), &cancel),
        orch.await_ready(request(&cm, Operation::Create), &cancel),
    );
    assert_eq!(a.outcome, Outcome::Failed);
    assert_eq!(b.outcome, Outcome::Ready);

    let missing = ObjectRef::new(KindRef::new("example.com", "v1", "Widget"), Some("default"), "w");
    let res = orch.await_ready(AwaitRequest::new(missing, Operation::Create).with_timeout(Duration::from_secs(5)), &cancel).await;
    assert_eq!(res.outcome, Outcome::TimedOut);
    assert_eq!(res.message, "Widget default/w not ready: object not found");
}
