//! Object, list, link and aggregation queries against the mock service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use lamina_store::{
    AggregationOptions, AutoFetchMore, BatchOptions, CacheKey, InterfaceListOptions, KeyKind,
    LinkOptions, ListOptions, ListPayload, ObjectPayload, Store,
};
use lamina_test_utils::fixtures::{employee, office, org_service, region, test_config};
use lamina_test_utils::{
    AggregateSpec, AggregationBucket, AggregationResult, FetchCall, MockService, OrderBy,
    PivotInfo, PrimaryKey, RecordingObserver, Status, WhereClause,
};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (MockService, Store) {
    init_tracing();
    let service = org_service();
    let store = service.store(test_config()).unwrap();
    (service, store)
}

fn member_pks(store: &Store, key: &CacheKey) -> Vec<PrimaryKey> {
    store
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
        .unwrap_or_default()
}

fn pks(values: &[i64]) -> Vec<PrimaryKey> {
    values.iter().map(|v| PrimaryKey::from(*v)).collect()
}

fn page_calls(service: &MockService) -> Vec<lamina_test_utils::PageRequest> {
    service
        .fetcher
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            FetchCall::Page(request) => Some(request),
            _ => None,
        })
        .collect()
}

// ============================================================================
// OBJECTS AND BULK LOADING
// ============================================================================

#[tokio::test]
async fn test_bulk_loader_coalesces_into_two_requests() {
    let (service, store) = setup();
    service
        .fetcher
        .insert_all((1..=140).map(|pk| employee(pk, &format!("E{}", pk))));

    let queries: Vec<_> = (1..=150)
        .map(|pk| store.get_object_query("Employee", &PrimaryKey::from(pk)).unwrap())
        .collect();
    let results = join_all(queries.iter().map(|q| q.revalidate(false))).await;
    assert!(results.iter().all(Result::is_ok));

    let mut sizes: Vec<Option<u32>> = page_calls(&service).iter().map(|r| r.page_size).collect();
    sizes.sort();
    assert_eq!(sizes, vec![Some(50), Some(100)]);
    assert_eq!(service.fetcher.call_count(), 2);
    assert_eq!(store.stats().unwrap().bulk_batches, 2);

    let found = store.read_object("Employee", &PrimaryKey::from(140)).unwrap();
    assert_eq!(found.unwrap().property("name"), Some(&json!("E140")));

    let missing_key = store.object_key("Employee", &PrimaryKey::from(145)).unwrap();
    let missing = store.read(&missing_key).unwrap().unwrap();
    assert_eq!(missing.status(), Status::Error);
    assert!(missing.error().unwrap().is_not_found());
}

#[tokio::test]
async fn test_observed_object_loads_in_background() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));

    let seen = RecordingObserver::<ObjectPayload>::new();
    let _sub = store
        .observe_object("Employee", &PrimaryKey::from(1), seen.clone())
        .unwrap();
    let loaded = seen.wait_for(|p| p.status == Status::Loaded).await;

    assert_eq!(loaded.object.unwrap().property("name"), Some(&json!("Ada")));
    assert_eq!(seen.values()[0].status, Status::Init);
    assert!(seen.values().iter().any(|p| p.status == Status::Loading));
}

#[tokio::test]
async fn test_concurrent_revalidations_share_one_fetch() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let query = store.get_object_query("Employee", &PrimaryKey::from(1)).unwrap();

    let (a, b, c) = tokio::join!(
        query.revalidate(true),
        query.revalidate(true),
        query.revalidate(false)
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(service.fetcher.call_count(), 1);
}

#[tokio::test]
async fn test_fetch_failure_is_reported_as_state() {
    let (service, store) = setup();
    service
        .fetcher
        .fail_type("Employee", lamina_test_utils::FetchError::transient("offline"));
    let query = store.get_object_query("Employee", &PrimaryKey::from(1)).unwrap();
    query.revalidate(false).await.unwrap();

    let entry = store.read(query.key()).unwrap().unwrap();
    assert_eq!(entry.status(), Status::Error);
    assert!(entry.error().unwrap().is_retryable());
}

#[tokio::test]
async fn test_fetch_failure_reaches_observer_error_channel() {
    let (service, store) = setup();
    service
        .fetcher
        .fail_type("Employee", lamina_test_utils::FetchError::transient("offline"));
    let seen = RecordingObserver::<ObjectPayload>::new();
    let _sub = store
        .observe_object("Employee", &PrimaryKey::from(1), seen.clone())
        .unwrap();

    let watcher = seen.clone();
    let failed = seen.wait_for(move |_| !watcher.errors().is_empty()).await;
    assert_eq!(failed.status, Status::Error);
    let errors = seen.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("offline"));
    assert!(!seen.is_completed());
}

// ============================================================================
// LISTS
// ============================================================================

#[tokio::test]
async fn test_list_pages_on_demand() {
    init_tracing();
    let service = org_service();
    // Keeps the subscription's background load from refetching page one.
    let store = service
        .store(test_config().with_dedupe_interval(Duration::from_secs(60)))
        .unwrap();
    service
        .fetcher
        .insert_all((1..=5).map(|pk| employee(pk, &format!("E{}", pk))));
    let options = ListOptions::new("Employee").with_page_size(2);

    let seen = RecordingObserver::<ListPayload>::new();
    let _sub = store.observe_list(&options, seen.clone()).unwrap();
    let list = store.get_list_query(&options).unwrap();
    list.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[1, 2]));

    let first = seen.last().unwrap();
    assert_eq!(first.status, Status::Loaded);
    assert!(first.has_more);
    assert_eq!(first.total_count, Some(5));

    list.fetch_more().await.unwrap();
    list.fetch_more().await.unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[1, 2, 3, 4, 5]));
    let done = seen.last().unwrap();
    assert_eq!(done.objects.len(), 5);
    assert!(!done.has_more);

    let calls = service.fetcher.call_count();
    list.fetch_more().await.unwrap();
    assert_eq!(service.fetcher.call_count(), calls);
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn test_auto_fetch_more_loads_every_page() {
    let (service, store) = setup();
    service
        .fetcher
        .insert_all((1..=5).map(|pk| employee(pk, &format!("E{}", pk))));
    let list = store
        .get_list_query(
            &ListOptions::new("Employee")
                .with_page_size(2)
                .with_auto_fetch_more(AutoFetchMore::All),
        )
        .unwrap();

    list.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[1, 2, 3, 4, 5]));
    assert_eq!(page_calls(&service).len(), 3);
}

#[tokio::test]
async fn test_auto_fetch_more_stops_at_threshold() {
    let (service, store) = setup();
    service
        .fetcher
        .insert_all((1..=9).map(|pk| employee(pk, &format!("E{}", pk))));
    let list = store
        .get_list_query(
            &ListOptions::new("Employee")
                .with_page_size(2)
                .with_auto_fetch_more(AutoFetchMore::AtLeast(3)),
        )
        .unwrap();

    list.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[1, 2, 3, 4]));
}

#[tokio::test]
async fn test_reordered_list_reuses_loaded_sibling() {
    let (service, store) = setup();
    service.fetcher.insert_all([
        employee(1, "A").with_property("score", 5),
        employee(2, "B").with_property("score", 5),
        employee(3, "C").with_property("score", 3),
    ]);
    let unordered = store.get_list_query(&ListOptions::new("Employee")).unwrap();
    unordered.revalidate(false).await.unwrap();
    assert_eq!(service.fetcher.call_count(), 1);

    let by_score = store
        .get_list_query(&ListOptions::new("Employee").with_order_by(OrderBy::none().desc("score")))
        .unwrap();
    by_score.revalidate(false).await.unwrap();

    // Ties keep their relative order.
    assert_eq!(member_pks(&store, by_score.key()), pks(&[1, 2, 3]));
    assert_eq!(service.fetcher.call_count(), 1);

    by_score.revalidate(true).await.unwrap();
    assert_eq!(service.fetcher.call_count(), 2);
    assert_eq!(member_pks(&store, by_score.key()), pks(&[1, 2, 3]));
}

#[tokio::test]
async fn test_written_objects_flow_into_matching_lists() {
    let (service, store) = setup();
    service
        .fetcher
        .insert(employee(2, "Bob").with_property("active", true));
    let list = store
        .get_list_query(
            &ListOptions::new("Employee")
                .with_where(WhereClause::eq("active", true))
                .with_order_by(OrderBy::none().asc("name")),
        )
        .unwrap();
    list.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[2]));

    store
        .batch(BatchOptions::base(), |b| {
            b.write_object(employee(1, "Ada").with_property("active", true))?;
            b.write_object(employee(3, "Cy").with_property("active", false))
        })
        .unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[1, 2]));
    let total = store
        .read(list.key())
        .unwrap()
        .and_then(|e| e.collection().and_then(|c| c.total_count));
    assert_eq!(total, Some(2));

    store
        .batch(BatchOptions::base(), |b| {
            b.write_object(employee(2, "Bob").with_property("active", false))
        })
        .unwrap();
    assert_eq!(member_pks(&store, list.key()), pks(&[1]));
}

#[tokio::test]
async fn test_member_change_reemits_list() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let options = ListOptions::new("Employee");
    let seen = RecordingObserver::<ListPayload>::new();
    let _sub = store.observe_list(&options, seen.clone()).unwrap();
    seen.wait_for(|p| p.status == Status::Loaded).await;

    store
        .batch(BatchOptions::base(), |b| b.write_object(employee(1, "Ada Byron")))
        .unwrap();
    let renamed = seen.last().unwrap();
    assert_eq!(renamed.objects.len(), 1);
    assert_eq!(renamed.objects[0].property("name"), Some(&json!("Ada Byron")));
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_pivoted_list_follows_source_type_invalidation() {
    let (service, store) = setup();
    service.fetcher.insert_all([employee(1, "Ada"), office(10, "Paris")]);
    service
        .fetcher
        .link("Employee", 1, "office", [PrimaryKey::from(10)]);

    let offices_via_employees = store
        .get_list_query(
            &ListOptions::new("Employee").with_pivot(PivotInfo::through(["office"])),
        )
        .unwrap();
    let plain_offices = store.get_list_query(&ListOptions::new("Office")).unwrap();
    offices_via_employees.revalidate(false).await.unwrap();
    plain_offices.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, offices_via_employees.key()), pks(&[10]));
    service.fetcher.reset_calls();

    assert_eq!(store.invalidate_object_type("Employee").await, 1);
    let calls = page_calls(&service);
    assert_eq!(calls.len(), 1);
    assert!(calls[0].pivot.is_some());

    service.fetcher.reset_calls();
    assert_eq!(store.invalidate_object_type("Office").await, 2);
    assert_eq!(page_calls(&service).len(), 2);

    let types = offices_via_employees
        .ensure_invalidation_types_ready()
        .await
        .unwrap();
    assert!(types.contains("Employee") && types.contains("Office"));
}

#[tokio::test]
async fn test_invalidate_object_refetches_cached_object() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    store
        .get_object_query("Employee", &PrimaryKey::from(1))
        .unwrap()
        .revalidate(false)
        .await
        .unwrap();

    service.fetcher.insert(employee(1, "Ada v2"));
    store.invalidate_object("Employee", &PrimaryKey::from(1)).await;
    let read = store.read_object("Employee", &PrimaryKey::from(1)).unwrap().unwrap();
    assert_eq!(read.property("name"), Some(&json!("Ada v2")));

    // Unknown objects are ignored.
    let calls = service.fetcher.call_count();
    store.invalidate_object("Employee", &PrimaryKey::from(99)).await;
    assert_eq!(service.fetcher.call_count(), calls);
}

// ============================================================================
// LINKS AND AGGREGATIONS
// ============================================================================

#[tokio::test]
async fn test_link_query_lists_linked_objects() {
    let (service, store) = setup();
    service
        .fetcher
        .insert_all([office(10, "Paris"), employee(1, "Ada"), employee(2, "Bob")]);
    service
        .fetcher
        .link("Office", 10, "employees", pks(&[2, 1]));

    let links = store
        .get_link_query(
            &LinkOptions::new("Office", 10, "employees").with_order_by(OrderBy::none().asc("name")),
        )
        .unwrap();
    links.revalidate(false).await.unwrap();
    assert_eq!(member_pks(&store, links.key()), pks(&[1, 2]));

    let types = links.ensure_invalidation_types_ready().await.unwrap();
    assert!(types.contains("Office") && types.contains("Employee"));
}

#[tokio::test]
async fn test_aggregation_result_is_cached() {
    let (service, store) = setup();
    let mut metrics = BTreeMap::new();
    metrics.insert("count".to_string(), json!(3));
    service.fetcher.set_aggregation(
        "Employee",
        AggregationResult {
            buckets: vec![AggregationBucket {
                group: BTreeMap::new(),
                metrics,
            }],
        },
    );

    let query = store
        .get_aggregation_query(&AggregationOptions::new("Employee", AggregateSpec::count()))
        .unwrap();
    query.revalidate(false).await.unwrap();

    let entry = store.read(query.key()).unwrap().unwrap();
    let result = entry.value().and_then(|v| v.as_aggregation()).map(Arc::clone);
    assert_eq!(result.unwrap().metric("count"), Some(&json!(3)));
}

#[tokio::test]
async fn test_aggregation_ignores_unrelated_type() {
    let (service, store) = setup();
    let query = store
        .get_aggregation_query(&AggregationOptions::new("Employee", AggregateSpec::count()))
        .unwrap();
    query.revalidate(false).await.unwrap();
    let fetched = service.fetcher.call_count();

    assert!(!query.invalidate_object_type("Office").await.unwrap());
    assert_eq!(store.invalidate_object_type("Office").await, 0);
    assert_eq!(service.fetcher.call_count(), fetched);

    assert!(query.invalidate_object_type("Employee").await.unwrap());
    assert_eq!(service.fetcher.call_count(), fetched + 1);
}

// ============================================================================
// INTERFACE LISTS
// ============================================================================

fn names(payload: &ListPayload) -> Vec<String> {
    payload
        .objects
        .iter()
        .filter_map(|o| o.property("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_interface_list_spans_implementing_types() {
    let (service, store) = setup();
    service
        .fetcher
        .insert_all([employee(1, "Ada"), office(3, "Paris")]);
    service.fetcher.insert(region(7, "North"));

    let seen = RecordingObserver::<ListPayload>::new();
    let _sub = store
        .observe_interface_list(
            &InterfaceListOptions::new("Named").with_order_by(OrderBy::none().asc("name")),
            seen.clone(),
        )
        .unwrap();
    let loaded = seen.wait_for(|p| p.status == Status::Loaded).await;

    // Interface pages carry only keys; members arrive reloaded in full.
    assert_eq!(names(&loaded), vec!["Ada", "North"]);
    let types: Vec<&str> = loaded.objects.iter().map(|o| o.object_type.as_str()).collect();
    assert_eq!(types, vec!["Employee", "Region"]);
    let north = store.read_object("Region", &PrimaryKey::from(7)).unwrap().unwrap();
    assert_eq!(north.property("name"), Some(&json!("North")));
}

#[tokio::test]
async fn test_interface_list_ignores_local_writes() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let query = store
        .get_interface_list_query(&InterfaceListOptions::new("Named"))
        .unwrap();
    query.revalidate(false).await.unwrap();
    assert_eq!(query.key().kind(), KeyKind::InterfaceList);
    assert_eq!(member_pks(&store, query.key()), pks(&[1]));

    store
        .batch(BatchOptions::base(), |b| b.write_object(employee(2, "Bea")))
        .unwrap();
    assert_eq!(member_pks(&store, query.key()), pks(&[1]));

    store
        .batch(BatchOptions::base(), |b| b.write_object(employee(1, "Ada King")))
        .unwrap();
    let entry = store.read(query.key()).unwrap().unwrap();
    let member = entry.collection().unwrap().members[0].clone();
    let renamed = store.read(&member).unwrap().unwrap();
    assert_eq!(
        renamed.object().and_then(|o| o.property("name").cloned()),
        Some(json!("Ada King"))
    );
}

#[tokio::test]
async fn test_interface_list_follows_implementing_type_invalidation() {
    let (service, store) = setup();
    service.fetcher.insert(employee(1, "Ada"));
    let query = store
        .get_interface_list_query(&InterfaceListOptions::new("Named"))
        .unwrap();
    query.revalidate(false).await.unwrap();

    service.fetcher.insert(region(7, "North"));
    service.fetcher.reset_calls();
    assert_eq!(store.invalidate_object_type("Office").await, 0);
    assert_eq!(service.fetcher.call_count(), 0);

    assert_eq!(store.invalidate_object_type("Region").await, 1);
    assert_eq!(member_pks(&store, query.key()).len(), 2);
    assert!(query.invalidate_object_type("Named").await.unwrap());
}
