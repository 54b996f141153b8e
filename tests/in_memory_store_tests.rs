use std::time::Duration;

use dataplane_store::{
    Criterion, DataAddress, DataFlow, DataFlowState, InMemoryStateStore, LeaseConfig, QuerySpec,
    SortOrder, StateEntityStore, StoreError, now_millis,
};

fn flow(id: &str, now: i64) -> DataFlow {
    let mut flow = DataFlow::new(id, DataAddress::new("s3"), DataAddress::new("blob"), now);
    flow.state_timestamp = 0;
    flow
}

#[tokio::test]
async fn test_batch_lease_save_cycle() {
    let store = InMemoryStateStore::<DataFlow>::new(LeaseConfig::new("runtime-a"));
    store.save(&flow("f1", now_millis())).await.expect("save failed");

    let filter = [Criterion::eq("state", DataFlowState::NotStarted.code())];
    let batch = store.next_not_leased(10, &filter).await.expect("next_not_leased failed");
    assert_eq!(batch.len(), 1);
    assert!(store.is_leased("f1").await);

    let empty = store.next_not_leased(10, &filter).await.expect("next_not_leased failed");
    assert!(empty.is_empty());

    let mut processed = batch[0].clone();
    processed.transition_to(DataFlowState::Started.code(), now_millis());
    store.save(&processed).await.expect("save failed");
    assert!(!store.is_leased("f1").await);

    let loaded = store.find_by_id("f1").await.expect("find failed").expect("exists");
    assert_eq!(loaded.state, DataFlowState::Started.code());
    assert_eq!(loaded.state_count, 1);
}

#[tokio::test]
async fn test_mutual_exclusion_between_holders() {
    let store = InMemoryStateStore::<DataFlow>::new(LeaseConfig::new("selector"));
    store.save(&flow("f1", now_millis())).await.expect("save failed");

    store.find_by_id_and_lease("f1", "worker-a").await.expect("lease failed");

    let conflict = store.find_by_id_and_lease("f1", "worker-b").await;
    assert!(matches!(conflict, Err(StoreError::AlreadyLeased(_))), "got {conflict:?}");

    // Same holder re-claiming a live lease is also a conflict; release goes
    // through save
    let again = store.find_by_id_and_lease("f1", "worker-a").await;
    assert!(matches!(again, Err(StoreError::AlreadyLeased(_))));

    let missing = store.find_by_id_and_lease("nope", "worker-b").await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_expired_lease_is_reclaimable() {
    let store = InMemoryStateStore::<DataFlow>::new(
        LeaseConfig::new("selector").with_duration(Duration::from_millis(200)),
    );
    store.save(&flow("f1", now_millis())).await.expect("save failed");

    store.find_by_id_and_lease("f1", "worker-a").await.expect("lease failed");
    assert!(store.is_leased("f1").await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!store.is_leased("f1").await);
    store
        .find_by_id_and_lease("f1", "worker-b")
        .await
        .expect("expired lease should be reclaimable");
}

#[tokio::test]
async fn test_save_breaks_only_own_lease() {
    // The store's holder is "selector"; a lease taken by a different holder
    // must survive a save
    let store = InMemoryStateStore::<DataFlow>::new(LeaseConfig::new("selector"));
    let f1 = flow("f1", now_millis());
    store.save(&f1).await.expect("save failed");

    store.find_by_id_and_lease("f1", "worker-a").await.expect("lease failed");
    store.save(&f1).await.expect("save failed");
    assert!(store.is_leased("f1").await, "foreign lease must not be broken by save");
}

#[tokio::test]
async fn test_delete_by_id() {
    let store = InMemoryStateStore::<DataFlow>::new(LeaseConfig::new("runtime-a"));
    store.save(&flow("f1", now_millis())).await.expect("save failed");

    let deleted = store.delete_by_id("f1").await.expect("delete failed");
    assert_eq!(deleted.id, "f1");
    assert!(store.find_by_id("f1").await.expect("find failed").is_none());

    let again = store.delete_by_id("f1").await;
    assert!(matches!(again, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_eligibility_ordering_and_limit() {
    let store = InMemoryStateStore::<DataFlow>::new(LeaseConfig::new("runtime-a"));
    for (id, ts) in [("f-late", 300i64), ("f-early", 100), ("f-mid", 200)] {
        let mut f = flow(id, now_millis());
        f.state_timestamp = ts;
        store.save(&f).await.expect("save failed");
    }
    let mut deferred = flow("f-deferred", now_millis());
    deferred.state_timestamp = now_millis() + 60_000;
    store.save(&deferred).await.expect("save failed");

    let batch = store.next_not_leased(2, &[]).await.expect("next_not_leased failed");
    let ids: Vec<&str> = batch.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, ["f-early", "f-mid"]);

    let rest = store.next_not_leased(10, &[]).await.expect("next_not_leased failed");
    let ids: Vec<&str> = rest.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, ["f-late"]);
}

#[tokio::test]
async fn test_query_matches_sql_semantics() {
    let store = InMemoryStateStore::<DataFlow>::new(LeaseConfig::new("runtime-a"));
    for (i, dest) in ["blob", "kafka", "blob"].iter().enumerate() {
        let mut f = flow(&format!("f{i}"), 1_000 + i as i64);
        f.destination = DataAddress::new(*dest);
        store.save(&f).await.expect("save failed");
    }

    let spec = QuerySpec::all()
        .with_filter(Criterion::eq("destination.type", "blob"))
        .sorted_by("created_at", SortOrder::Descending);
    let result = store.query(&spec).await.expect("query failed");
    let ids: Vec<&str> = result.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, ["f2", "f0"]);

    let spec = QuerySpec::all().with_limit(1).with_offset(2);
    let page = store.query(&spec).await.expect("query failed");
    let ids: Vec<&str> = page.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, ["f2"]);
}
