//! End-to-end tests for the event store over the in-memory engine

use cost_event_store::storage::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const EXECUTION: &str = "general_1700000000";

fn test_config() -> StorageConfig {
    StorageConfigBuilder::new().without_delays().build()
}

async fn setup() -> (Arc<InMemoryEngine>, StorageManager) {
    let engine = Arc::new(InMemoryEngine::new());
    let storage = StorageManager::new(engine.clone(), test_config())
        .await
        .expect("storage should start");
    (engine, storage)
}

fn status_event(execution: &str, resource: &str, event_time: i64, status: i64) -> String {
    json!({
        "ExecutionID": execution,
        "ResourceName": resource,
        "EventType": "service_status",
        "EventTime": event_time,
        "Timestamp": "2023-11-14T22:13:20Z",
        "Data": { "Status": status, "ErrorMessage": "" }
    })
    .to_string()
}

fn resource_event(execution: &str, resource: &str, data: Value) -> String {
    json!({
        "ExecutionID": execution,
        "ResourceName": resource,
        "EventType": "resource_detected",
        "EventTime": 1700000000,
        "Timestamp": "2023-11-14T22:13:20Z",
        "Data": data
    })
    .to_string()
}

async fn save_all(storage: &StorageManager, events: &[String]) {
    for event in events {
        assert!(storage.save(event).await, "event should be stored: {}", event);
    }
}

#[tokio::test]
async fn test_startup_creates_current_partition() {
    let (engine, storage) = setup().await;

    let current = storage.current_partition().expect("partition should be current");
    let today = chrono::Utc::now().date_naive();
    assert_eq!(current, partition_name("finala", today));
    assert_eq!(engine.create_calls(), 1);

    storage.shutdown();
}

#[tokio::test]
async fn test_startup_fails_when_engine_never_verifies_settings() {
    let engine = Arc::new(InMemoryEngine::new().with_settings_lag(1_000));
    let result = StorageManager::new(engine, test_config()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_saved_event_is_retrievable_by_resources() {
    let (_engine, storage) = setup().await;
    let event = resource_event(EXECUTION, "aws_ebs", json!({ "PricePerMonth": 4.2, "Region": "eu-west-1" }));
    save_all(&storage, &[event]).await;

    let resources = storage
        .get_resources("aws_ebs", EXECUTION, &HashMap::new(), "", &Cancellation::never())
        .await
        .unwrap();

    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["ResourceName"], "aws_ebs");
    assert_eq!(resources[0]["Data"]["Region"], "eu-west-1");
    assert!(resources[0].contains_key("id"));
}

#[tokio::test]
async fn test_resources_free_text_search() {
    let (_engine, storage) = setup().await;
    save_all(
        &storage,
        &[
            resource_event(EXECUTION, "aws_ec2", json!({ "InstanceType": "t3.micro" })),
            resource_event(EXECUTION, "aws_ec2", json!({ "InstanceType": "m5.large" })),
        ],
    )
    .await;

    let resources = storage
        .get_resources("aws_ec2", EXECUTION, &HashMap::new(), "m5", &Cancellation::never())
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["Data"]["InstanceType"], "m5.large");
}

#[tokio::test]
async fn test_resource_type_with_spaced_operator() {
    let (_engine, storage) = setup().await;
    save_all(&storage, &[resource_event(EXECUTION, "a = b", json!({ "PricePerMonth": 1 }))]).await;

    let resources = storage
        .get_resources("a = b", EXECUTION, &HashMap::new(), "", &Cancellation::never())
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["ResourceName"], "a = b");
}

#[tokio::test]
async fn test_costs_count_hits_with_any_timestamp_shape() {
    let (_engine, storage) = setup().await;
    let events: Vec<String> = [json!("2023-11-14T22:13:20Z"), json!(1700000000), json!("2023-11-14 22:13:20")]
        .into_iter()
        .map(|timestamp| {
            json!({
                "ExecutionID": EXECUTION,
                "ResourceName": "ebs",
                "EventType": "resource_detected",
                "Timestamp": timestamp,
                "Data": { "PricePerMonth": 10 }
            })
            .to_string()
        })
        .collect();
    save_all(&storage, &events).await;

    let summary = storage
        .get_summary(EXECUTION, &HashMap::new(), &Cancellation::never())
        .await
        .unwrap();
    assert_eq!(summary["ebs"].resource_count, 3);
    assert_eq!(summary["ebs"].total_spent, 30.0);

    let points = storage
        .get_resource_trends("ebs", &HashMap::new(), 10, &Cancellation::never())
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].cost_sum, 30.0);
}

#[tokio::test]
async fn test_summary_latest_status_and_costs() {
    let (_engine, storage) = setup().await;
    save_all(
        &storage,
        &[
            status_event(EXECUTION, "ebs", 100, 0),
            status_event(EXECUTION, "ebs", 200, 2),
            resource_event(EXECUTION, "ebs", json!({ "PricePerMonth": 10 })),
            resource_event(EXECUTION, "ebs", json!({ "PricePerMonth": 0 })),
            resource_event(EXECUTION, "ebs", json!({ "PricePerMonth": 5 })),
            resource_event(EXECUTION, "lambda", json!({})),
            resource_event("other_1700000500", "ebs", json!({ "PricePerMonth": 99 })),
        ],
    )
    .await;

    let summary = storage
        .get_summary(EXECUTION, &HashMap::new(), &Cancellation::never())
        .await
        .unwrap();

    let ebs = &summary["ebs"];
    assert_eq!(ebs.event_time, 200);
    assert_eq!(ebs.status, CollectStatus::Finish);
    assert_eq!(ebs.resource_count, 3);
    assert_eq!(ebs.total_spent, 15.0);
    assert_eq!(ebs.category, Some(Category::PotentialCostSaving));

    let lambda = &summary["lambda"];
    assert_eq!(lambda.resource_count, 1);
    assert_eq!(lambda.status, CollectStatus::Fetch);
    assert_eq!(lambda.category, Some(Category::UnusedResource));
}

#[tokio::test]
async fn test_summary_returns_partial_data_on_second_pass_failure() {
    let (engine, storage) = setup().await;
    save_all(&storage, &[status_event(EXECUTION, "ebs", 100, 1)]).await;

    let partition = storage.current_partition().unwrap();
    let cancel = Cancellation::never();
    let queries = storage.queries();
    let hits_before = engine.search_calls();
    let summary = queries
        .get_summary_in(&partition, EXECUTION, &HashMap::new(), &cancel)
        .await
        .unwrap();
    assert_eq!(engine.search_calls() - hits_before, 2);
    assert_eq!(summary["ebs"].status, CollectStatus::Error);

    // Fail the status pass (three attempts) and the resource pass (three attempts)
    engine.fail_next_searches(6);
    let err = queries
        .get_summary_in(&partition, EXECUTION, &HashMap::new(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err.source, StorageError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.partial.is_empty());

    // Status pass succeeds; the extra filter is never filterable
    let filters: HashMap<String, String> =
        [("Data.Region".to_string(), "eu-west-1".to_string())].into();
    let err = queries
        .get_summary_in(&partition, EXECUTION, &filters, &cancel)
        .await
        .unwrap_err();
    assert!(err.source.is_not_filterable());
    assert_eq!(err.partial["ebs"].status, CollectStatus::Error);
}

#[tokio::test]
async fn test_executions_first_seen_with_extracted_time() {
    let (_engine, storage) = setup().await;
    save_all(
        &storage,
        &[
            status_event("general_1700000100", "ebs", 1, 0),
            status_event("general_1700000000", "ebs", 1, 0),
            status_event("general_1700000100", "ec2", 1, 2),
            status_event("adhoc-run", "ebs", 1, 2),
        ],
    )
    .await;

    let executions = storage.get_executions(100, &Cancellation::never()).await.unwrap();

    let ids: Vec<_> = executions.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["general_1700000100", "general_1700000000", "adhoc-run"]);
    assert_eq!(executions[0].name, "Execution general_1700000100");
    assert_eq!(executions[1].time.timestamp(), 1700000000);
    assert_eq!(executions[2].time.timestamp(), 0);
}

#[tokio::test]
async fn test_executions_limit_caps_engine_hits() {
    let (_engine, storage) = setup().await;
    save_all(
        &storage,
        &[
            status_event("a_1", "ebs", 1, 0),
            status_event("a_1", "ec2", 1, 0),
            status_event("b_2", "ebs", 1, 0),
        ],
    )
    .await;

    let executions = storage.get_executions(2, &Cancellation::never()).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, "a_1");
}

#[tokio::test]
async fn test_resource_trends_per_execution() {
    let (_engine, storage) = setup().await;
    save_all(
        &storage,
        &[
            resource_event("general_1700000000", "aws_ebs", json!({ "PricePerMonth": 10 })),
            resource_event("general_1700000000", "aws_ebs", json!({ "PricePerMonth": "2.5" })),
            resource_event("broken", "aws_ebs", json!({ "PricePerMonth": 0 })),
            resource_event("general_1700000000", "aws_ec2", json!({ "PricePerMonth": 50 })),
            status_event("general_1700000000", "aws_ebs", 1, 2),
        ],
    )
    .await;

    let mut points = storage
        .get_resource_trends("aws_ebs", &HashMap::new(), 10, &Cancellation::never())
        .await
        .unwrap();
    sort_by_timestamp(&mut points);

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].execution_id, "broken");
    assert_eq!(points[0].extracted_timestamp, 0);
    assert_eq!(points[0].cost_sum, 0.0);
    assert_eq!(points[1].execution_id, "general_1700000000");
    assert_eq!(points[1].extracted_timestamp, 1700000000);
    assert_eq!(points[1].cost_sum, 12.5);
}

#[tokio::test]
async fn test_execution_tags_are_deduplicated() {
    let (_engine, storage) = setup().await;
    save_all(
        &storage,
        &[
            resource_event(EXECUTION, "aws_ebs", json!({ "Tag": { "env": "prod" } })),
            resource_event(EXECUTION, "aws_ec2", json!({ "Tag": { "env": "prod", "team": "x" } })),
            resource_event(EXECUTION, "aws_s3", json!({ "Tag": { "owner": 7 } })),
            resource_event("other_1", "aws_ebs", json!({ "Tag": { "env": "dev" } })),
        ],
    )
    .await;

    let tags = storage
        .get_execution_tags(EXECUTION, &Cancellation::never())
        .await
        .unwrap();

    let mut expected = BTreeMap::new();
    expected.insert("env".to_string(), vec!["prod".to_string()]);
    expected.insert("team".to_string(), vec!["x".to_string()]);
    assert_eq!(tags, expected);
}

#[tokio::test]
async fn test_save_assigns_unique_ids() {
    let (engine, storage) = setup().await;
    let event = resource_event(EXECUTION, "aws_ebs", json!({}));

    let storage = Arc::new(storage);
    let mut handles = Vec::new();
    for _ in 0..50 {
        let storage = storage.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move { storage.save(&event).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let partition = storage.current_partition().unwrap();
    assert_eq!(engine.document_count(&partition), 50);
}

#[tokio::test]
async fn test_query_repairs_lost_schema() {
    let (engine, storage) = setup().await;
    save_all(&storage, &[status_event(EXECUTION, "ebs", 1, 2)]).await;

    let partition = storage.current_partition().unwrap();
    engine.clear_filterable(&partition);

    let executions = storage.get_executions(10, &Cancellation::never()).await.unwrap();
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn test_cancelled_query() {
    let (_engine, storage) = setup().await;
    let (handle, cancel) = Cancellation::new();
    handle.cancel();

    let err = storage.get_executions(10, &cancel).await.unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));
}

#[tokio::test]
async fn test_invalid_filter_key_is_invalid_query() {
    let (_engine, storage) = setup().await;
    let filters: HashMap<String, String> =
        [("Region OR 1".to_string(), "x".to_string())].into();

    let err = storage
        .get_resource_trends("aws_ebs", &filters, 10, &Cancellation::never())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidQuery(_)));
    assert!(err.to_string().starts_with("invalid query"));
}

#[tokio::test]
async fn test_explicit_partition_queries() {
    let (engine, storage) = setup().await;
    let old = "finala-2020-01-01";
    storage.client().ensure_partition(old).await.unwrap();
    let mut document: Document =
        serde_json::from_str(&status_event("past_1577836800", "ebs", 1, 2)).unwrap();
    ensure_document_id(&mut document);
    engine.add_document(old, &document).await.unwrap();

    let executions = storage
        .queries()
        .get_executions_in(old, 10, &Cancellation::never())
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, "past_1577836800");

    let current = storage.get_executions(10, &Cancellation::never()).await.unwrap();
    assert!(current.is_empty());

    let partitions = storage.client().list_partitions().await.unwrap();
    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0], old);
}

#[tokio::test]
async fn test_metrics_are_recorded() {
    let (_engine, storage) = setup().await;
    save_all(&storage, &[status_event(EXECUTION, "ebs", 1, 2)]).await;
    assert!(!storage.save("garbage").await);
    storage.get_executions(10, &Cancellation::never()).await.unwrap();

    let text = metrics::gather_text();
    assert!(text.contains("cost_store_events_ingested_total{outcome=\"stored\"}"));
    assert!(text.contains("cost_store_events_ingested_total{outcome=\"rejected\"}"));
    assert!(text.contains("cost_store_queries_total{operation=\"executions\",outcome=\"success\"}"));
}
