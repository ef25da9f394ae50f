//! Reference counting and collection of idle keys.

use std::time::Duration;

use lamina_store::{BatchOptions, ListOptions, ListPayload, ObjectPayload, Store};
use lamina_test_utils::fixtures::{employee, org_service, test_config};
use lamina_test_utils::{MockService, PrimaryKey, RecordingObserver, Status, StoreConfig};
use tokio::sync::watch;

fn setup(config: StoreConfig) -> (MockService, Store) {
    let service = org_service();
    let store = service.store(config).unwrap();
    (service, store)
}

#[tokio::test(start_paused = true)]
async fn test_subscription_keeps_key_alive() {
    let (service, store) = setup(test_config().with_key_keep_alive(Duration::from_secs(60)));
    service.fetcher.insert(employee(1, "Ada"));
    let seen = RecordingObserver::<ObjectPayload>::new();
    let sub = store
        .observe_object("Employee", &PrimaryKey::from(1), seen.clone())
        .unwrap();
    seen.wait_for(|p| p.status == Status::Loaded).await;

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(store.gc().unwrap(), 0);
    assert_eq!(store.stats().unwrap().base_entries, 1);

    drop(sub);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(store.gc().unwrap(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(store.gc().unwrap(), 1);
    let stats = store.stats().unwrap();
    assert_eq!(stats.base_entries, 0);
    assert_eq!(stats.queries, 0);
    assert_eq!(stats.subjects, 0);
}

#[tokio::test(start_paused = true)]
async fn test_listed_objects_outlive_their_own_keep_alive() {
    let (service, store) = setup(test_config().with_key_keep_alive(Duration::from_secs(10)));
    service
        .fetcher
        .insert_all([employee(1, "Ada"), employee(2, "Bob")]);
    let seen = RecordingObserver::<ListPayload>::new();
    let _sub = store
        .observe_list(&ListOptions::new("Employee"), seen.clone())
        .unwrap();
    seen.wait_for(|p| p.objects.len() == 2).await;

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.gc().unwrap(), 0);
    assert!(store.read_object("Employee", &PrimaryKey::from(2)).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_spawned_gc_collects_until_shutdown() {
    let config = test_config()
        .with_key_keep_alive(Duration::from_secs(10))
        .with_gc_interval(Duration::from_secs(1));
    let (_service, store) = setup(config);
    store
        .batch(BatchOptions::base(), |b| b.write_object(employee(1, "Ada")))
        .unwrap();
    assert_eq!(store.stats().unwrap().base_entries, 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = store.spawn_gc(shutdown_rx);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(store.stats().unwrap().base_entries, 0);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
