//! Optimistic jobs end to end.

use lamina_store::{BatchOptions, CacheKey, ListOptions, ListPayload, ObjectPayload, Store};
use lamina_test_utils::fixtures::{employee, org_service, test_config};
use lamina_test_utils::{
    CacheError, FetchError, MockService, ObjectSnapshot, PrimaryKey, RecordingObserver, Status,
    WhereClause,
};
use lamina_core::OptimisticError;
use serde_json::{json, Map, Value};

fn setup() -> (MockService, Store) {
    let service = org_service();
    let store = service.store(test_config()).unwrap();
    (service, store)
}

fn properties(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn names(payload: &ListPayload) -> Vec<String> {
    payload
        .objects
        .iter()
        .filter_map(|o| o.property("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

fn teammate(pk: i64, name: &str, team: &str) -> ObjectSnapshot {
    employee(pk, name).with_property("team", team)
}

fn member_pks(store: &Store, key: &CacheKey) -> Vec<PrimaryKey> {
    let mut pks: Vec<PrimaryKey> = store
        .read(key)
        .unwrap()
        .as_ref()
        .and_then(|e| e.collection().cloned())
        .map(|c| {
            c.members
                .iter()
                .filter_map(|m| m.primary_key().cloned())
                .collect()
        })
        .unwrap_or_default();
    pks.sort_by_key(|pk| pk.to_string());
    pks
}

#[tokio::test]
async fn test_disposed_job_leaves_no_trace() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let seen = RecordingObserver::<ObjectPayload>::new();
    let _sub = store
        .observe_object("Employee", &PrimaryKey::from(1), seen.clone())
        .unwrap();
    seen.wait_for(|p| p.status == Status::Loaded).await;

    let job = store.run_optimistic_job(|b| {
        b.update_object(employee(1, "Ada (renaming)"));
    });
    job.applied().await.unwrap();
    let pending = seen.wait_for(|p| p.is_optimistic).await;
    assert_eq!(
        pending.object.unwrap().property("name"),
        Some(&json!("Ada (renaming)"))
    );

    job.dispose().await.unwrap();
    assert!(store.optimistic_layer_keys(job.id()).unwrap().is_empty());
    let restored = seen.wait_for(|p| !p.is_optimistic).await;
    assert_eq!(restored.object.unwrap().property("name"), Some(&json!("Ada")));
    assert_eq!(store.stats().unwrap().optimistic_layers, 0);
}

#[tokio::test]
async fn test_failed_creation_rolls_back_the_whole_job() {
    let (_service, store) = setup();
    let job = store.run_optimistic_job(|b| {
        b.update_object(employee(1, "Ada"));
        b.create_object("Contractor", properties(json!({"id": 5, "name": "Eve"})));
    });

    let err = job.applied().await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Optimistic(OptimisticError::CreationFailed { ref object_type, .. })
            if object_type == "Contractor"
    ));
    assert!(store.optimistic_layer_keys(job.id()).unwrap().is_empty());
    assert!(store.read_object("Employee", &PrimaryKey::from(1)).unwrap().is_none());
    job.dispose().await.unwrap();
}

#[tokio::test]
async fn test_created_object_appears_in_matching_list() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Bob"));
    let seen = RecordingObserver::<ListPayload>::new();
    let _sub = store
        .observe_list(
            &ListOptions::new("Employee").with_order_by(lamina_test_utils::OrderBy::none().asc("name")),
            seen.clone(),
        )
        .unwrap();
    seen.wait_for(|p| p.status == Status::Loaded).await;

    let job = store.run_optimistic_job(|b| {
        b.create_object("Employee", properties(json!({"id": 2, "name": "Ada"})));
    });
    job.applied().await.unwrap();
    let with_new = seen.wait_for(|p| p.objects.len() == 2).await;
    assert_eq!(names(&with_new), vec!["Ada", "Bob"]);
    assert!(with_new.is_optimistic);

    job.dispose().await.unwrap();
    let rolled_back = seen.wait_for(|p| p.objects.len() == 1).await;
    assert_eq!(names(&rolled_back), vec!["Bob"]);
}

#[tokio::test]
async fn test_optimistic_delete_hides_list_member() {
    let (service, store) = setup();
    service
        .fetcher
        .insert_all([employee(1, "Ada"), employee(2, "Bob")]);
    let seen = RecordingObserver::<ListPayload>::new();
    let _sub = store
        .observe_list(&ListOptions::new("Employee"), seen.clone())
        .unwrap();
    seen.wait_for(|p| p.objects.len() == 2).await;

    let job = store.run_optimistic_job(|b| {
        b.delete_object("Employee", 1);
    });
    job.applied().await.unwrap();
    assert_eq!(names(&seen.last().unwrap()), vec!["Bob"]);

    job.dispose().await.unwrap();
    let restored = seen.wait_for(|p| p.objects.len() == 2).await;
    assert_eq!(names(&restored), vec!["Ada", "Bob"]);
}

#[tokio::test]
async fn test_apply_with_optimistic_settles_on_server_state() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let seen = RecordingObserver::<ObjectPayload>::new();
    let _sub = store
        .observe_object("Employee", &PrimaryKey::from(1), seen.clone())
        .unwrap();
    seen.wait_for(|p| p.status == Status::Loaded).await;

    let server = service.fetcher.clone();
    let result = store
        .apply_with_optimistic(
            |b| {
                b.update_object(employee(1, "Ada (saving)"));
            },
            async move {
                server.insert(employee(1, "Ada Lovelace"));
                Ok::<_, CacheError>(42)
            },
        )
        .await;

    assert_eq!(result.unwrap(), 42);
    assert!(seen.values().iter().any(|p| p.is_optimistic));
    let settled = seen
        .wait_for(|p| {
            p.object.as_ref().and_then(|o| o.property("name")) == Some(&json!("Ada Lovelace"))
        })
        .await;
    assert!(!settled.is_optimistic);
    assert_eq!(store.stats().unwrap().optimistic_layers, 0);
}

#[tokio::test]
async fn test_apply_with_optimistic_returns_write_error() {
    let (_service, store) = setup();
    let result: Result<(), CacheError> = store
        .apply_with_optimistic(
            |b| {
                b.update_object(employee(7, "Gone soon"));
            },
            async {
                Err::<(), CacheError>(
                    FetchError::PermissionDenied {
                        reason: "read only".into(),
                    }
                    .into(),
                )
            },
        )
        .await;

    assert!(matches!(
        result,
        Err(CacheError::Fetch(FetchError::PermissionDenied { .. }))
    ));
    assert_eq!(store.stats().unwrap().optimistic_layers, 0);
}

#[tokio::test]
async fn test_refetch_matching_optimistic_value_still_settles_base() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let seen = RecordingObserver::<ObjectPayload>::new();
    let _sub = store
        .observe_object("Employee", &PrimaryKey::from(1), seen.clone())
        .unwrap();
    seen.wait_for(|p| p.status == Status::Loaded).await;

    service.fetcher.insert(employee(1, "Bob"));
    let job = store.run_optimistic_job(|b| {
        b.update_object(employee(1, "Bob"));
    });
    job.applied().await.unwrap();

    // The server now agrees with the optimistic value.
    let query = store.get_object_query("Employee", &PrimaryKey::from(1)).unwrap();
    query.revalidate(true).await.unwrap();

    job.dispose().await.unwrap();
    let entry = store.read(query.key()).unwrap().unwrap();
    assert_eq!(entry.status(), Status::Loaded);
    assert_eq!(
        entry.object().and_then(|o| o.property("name").cloned()),
        Some(json!("Bob"))
    );
    let settled = seen.last().unwrap();
    assert_eq!(settled.status, Status::Loaded);
    assert!(!settled.is_optimistic);
}

#[tokio::test]
async fn test_base_write_under_optimistic_layer_keeps_membership_apart() {
    let (service, store) = setup();
    service.fetcher.insert(teammate(1, "Ada", "core"));
    let list = store
        .get_list_query(&ListOptions::new("Employee").with_where(WhereClause::eq("team", "core")))
        .unwrap();
    list.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, list.key()), vec![PrimaryKey::from(1)]);

    store
        .batch(BatchOptions::base(), |b| b.write_object(teammate(5, "Eve", "infra")))
        .unwrap();
    let job = store.run_optimistic_job(|b| {
        b.update_object(teammate(5, "Eve", "core"));
    });
    job.applied().await.unwrap();
    assert_eq!(
        member_pks(&store, list.key()),
        vec![PrimaryKey::from(1), PrimaryKey::from(5)]
    );

    // A confirmed write lands while the optimistic layer is still active.
    // The layer's own copy of the list keeps shadowing the base list.
    store
        .batch(BatchOptions::base(), |b| b.write_object(teammate(2, "Bob", "core")))
        .unwrap();
    assert_eq!(
        member_pks(&store, list.key()),
        vec![PrimaryKey::from(1), PrimaryKey::from(5)]
    );

    job.dispose().await.unwrap();
    assert_eq!(
        member_pks(&store, list.key()),
        vec![PrimaryKey::from(1), PrimaryKey::from(2)]
    );
    let eve = store.read_object("Employee", &PrimaryKey::from(5)).unwrap().unwrap();
    assert_eq!(eve.property("team"), Some(&json!("infra")));
}
