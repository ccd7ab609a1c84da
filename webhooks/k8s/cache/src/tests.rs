use super::*;
use k8s::{ConfigMap, ObjectMeta};
use std::sync::Arc;
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Events = mpsc::UnboundedSender<watcher::Result<watcher::Event<ConfigMap>>>;

fn mk_cm(ns: &str, name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn events() -> (Events, UnboundedReceiverStream<watcher::Result<watcher::Event<ConfigMap>>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}

#[tokio::test]
async fn start_waits_for_initial_sync() {
    let informers = Arc::new(Informers::default());
    let (tx, rx) = events();
    let store = informers.reflect::<ConfigMap, _>(rx);

    let (_signal, watch) = drain::channel();
    let start = tokio::spawn({
        let informers = informers.clone();
        async move { informers.start(watch).await }
    });

    tx.send(Ok(watcher::Event::Init)).unwrap();
    tx.send(Ok(watcher::Event::InitApply(mk_cm("ns-0", "cm-0"))))
        .unwrap();
    time::sleep(time::Duration::from_millis(10)).await;
    assert!(!start.is_finished(), "start must block until the list completes");

    tx.send(Ok(watcher::Event::InitDone)).unwrap();
    time::timeout(time::Duration::from_secs(5), start)
        .await
        .expect("start must complete once synced")
        .expect("task must not panic")
        .expect("caches must sync");

    assert!(informers.is_started());
    assert_eq!(store.state().len(), 1);
    assert!(store
        .get(&k8s::ObjectRef::new("cm-0").within("ns-0"))
        .is_some());
}

#[tokio::test]
async fn shutdown_before_sync_fails_start() {
    let informers = Informers::default();
    let _store = informers.reflect::<ConfigMap, _>(futures::stream::pending());

    let (signal, watch) = drain::channel();
    let (res, ()) = tokio::join!(informers.start(watch), signal.drain());
    assert!(matches!(res, Err(Error::Shutdown)), "{res:?}");
}

#[tokio::test]
async fn stream_ending_before_sync_fails_start() {
    let informers = Informers::default();
    let (tx, rx) = events();
    let _store = informers.reflect::<ConfigMap, _>(rx);
    tx.send(Ok(watcher::Event::Init)).unwrap();
    drop(tx);

    let (_signal, watch) = drain::channel();
    let res = time::timeout(time::Duration::from_secs(5), informers.start(watch))
        .await
        .expect("start must not hang");
    assert!(matches!(res, Err(Error::Unsynced(_))), "{res:?}");
}

#[tokio::test]
async fn event_handlers_observe_applied_state_in_order() {
    let informers = Arc::new(Informers::default());
    let (tx, rx) = events();
    let store = informers.reflect::<ConfigMap, _>(rx);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    for id in 0..2 {
        let store = store.clone();
        let seen_tx = seen_tx.clone();
        informers.on_event::<ConfigMap>(move |ev| {
            if let watcher::Event::Apply(cm) = ev {
                let cached = store.get(&k8s::ObjectRef::from_obj(cm)).is_some();
                let _ = seen_tx.send((id, cm.metadata.name.clone(), cached));
            }
        });
    }

    tx.send(Ok(watcher::Event::Init)).unwrap();
    tx.send(Ok(watcher::Event::InitDone)).unwrap();
    let (_signal, watch) = drain::channel();
    informers.start(watch).await.expect("caches must sync");

    tx.send(Ok(watcher::Event::Apply(mk_cm("ns-0", "cm-1"))))
        .unwrap();
    let name = Some("cm-1".to_string());
    assert_eq!(seen_rx.recv().await, Some((0, name.clone(), true)));
    assert_eq!(seen_rx.recv().await, Some((1, name, true)));
}

#[tokio::test]
async fn first_registration_wins() {
    let informers = Informers::default();
    let (tx, first) = events();
    let (_unused, second) = events();
    let a = informers.reflect::<ConfigMap, _>(first);
    let b = informers.reflect::<ConfigMap, _>(second);

    tx.send(Ok(watcher::Event::Init)).unwrap();
    tx.send(Ok(watcher::Event::InitApply(mk_cm("ns-0", "cm-0"))))
        .unwrap();
    tx.send(Ok(watcher::Event::InitDone)).unwrap();

    let (_signal, watch) = drain::channel();
    time::timeout(time::Duration::from_secs(5), informers.start(watch))
        .await
        .expect("start must not hang")
        .expect("the first source must feed the cache");
    assert_eq!(a.state().len(), 1);
    assert_eq!(b.state().len(), 1);
}

#[tokio::test]
async fn store_without_client_cannot_start() {
    let informers = Informers::default();
    let _store = informers.store::<ConfigMap>();

    let (_signal, watch) = drain::channel();
    let res = informers.start(watch).await;
    assert!(matches!(res, Err(Error::NoSource(_))), "{res:?}");
}

#[tokio::test]
async fn start_without_reflectors_is_immediate() {
    let informers = Informers::default();
    let (_signal, watch) = drain::channel();
    informers.start(watch.clone()).await.expect("nothing to sync");
    informers.start(watch).await.expect("repeated start is a no-op");
}
