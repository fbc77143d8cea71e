use futures::StreamExt;
use kready_core::{KindRef, ObjectRef, PatchKind};
use kready_kubehub::fake::FakeCluster;
use kready_kubehub::{ClusterError, ClusterSource, ClusterWriter, ListQuery, WatchEvent};
use serde_json::json;

fn cm(name: &str, ns: &str) -> serde_json::Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": ns}, "data": {"k": "v"}})
}

#[tokio::test]
async fn watch_starts_with_relist_then_streams_matching_events() {
    let fake = FakeCluster::new();
    let kind = KindRef::new("", "v1", "ConfigMap");
    fake.apply(cm("a", "default"));
    let mut w = fake.watch(&kind, Some("default"), &ListQuery::named("a")).await.unwrap();

    match w.next().await {
        Some(Ok(WatchEvent::Restarted(list))) => assert_eq!(list.len(), 1),
        other => panic!("unexpected {other:?}"),
    }
    fake.apply(cm("b", "default"));
    fake.apply(cm("a", "other"));
    fake.apply(cm("a", "default"));
    match w.next().await {
        Some(Ok(WatchEvent::Applied(o))) => assert_eq!(o["metadata"]["resourceVersion"], json!("5")),
        other => panic!("unexpected {other:?}"),
    }
    fake.remove(&kind, Some("default"), "a");
    assert!(matches!(w.next().await, Some(Ok(WatchEvent::Deleted(_)))));

    fake.break_watches(ClusterError::WatchExpired("too old".into()));
    assert!(matches!(w.next().await, Some(Err(ClusterError::WatchExpired(_)))));
    assert!(w.next().await.is_none());
}

#[tokio::test]
async fn injected_faults_are_consumed_in_order() {
    let fake = FakeCluster::new();
    let kind = KindRef::new("", "v1", "ConfigMap");
    fake.fail_next_get(ClusterError::Transport("reset".into()));
    assert!(fake.get(&kind, Some("default"), "a").await.is_err());
    assert_eq!(fake.get(&kind, Some("default"), "a").await.unwrap(), None);
    fake.fail_all_watches(Some(ClusterError::Forbidden("no watch".into())));
    assert!(fake.watch(&kind, None, &ListQuery::default()).await.is_err());
    assert_eq!(fake.watches.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn writer_records_mutations_and_bumps_generation() {
    let fake = FakeCluster::new();
    let created = fake.create(&cm("a", "default")).await.unwrap();
    assert_eq!(created["metadata"]["generation"], json!(1));
    assert!(matches!(fake.create(&cm("a", "default")).await, Err(ClusterError::Conflict(_))));

    let oref = ObjectRef::of_object(&created).unwrap();
    let patched = fake.patch(&oref, PatchKind::JsonMerge, br#"{"data": {"k": null, "n": "1"}, "spec": {}}"#).await.unwrap();
    assert_eq!(patched["data"], json!({"n": "1"}));
    assert_eq!(patched["metadata"]["generation"], json!(2));

    assert!(fake.delete(&oref).await.unwrap());
    assert!(!fake.delete(&oref).await.unwrap());
    assert_eq!(fake.mutations(), vec![
        "create:ConfigMap default/a".to_string(),
        "patch:json_merge:ConfigMap default/a".to_string(),
        "delete:ConfigMap default/a".to_string(),
        "delete:ConfigMap default/a".to_string(),
    ]);
}
