//! Client-side aggregation over raw hits
//!
//! The engine has no GROUP BY, so every derived aggregate is a fold over the
//! hits of one query. Each fold makes a single pass, skips (and logs) hits it
//! cannot decode, and never fails as a whole.

use crate::storage::document::{
    decode_tags, extract_timestamp, CollectStatus, Document, EventType, PriceValue,
    ServiceStatusData, DATA_FIELD, EXECUTION_ID_FIELD, PRICE_FIELD, TAG_FIELD,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use strum::{AsRefStr, Display};
use tracing::{debug, warn};

/// Cost category of a resource type within one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    PotentialCostSaving,
    UnusedResource,
}

/// Per-resource-type view of one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CollectorsSummary {
    pub resource_name: String,
    pub resource_count: u64,
    pub total_spent: f64,
    pub status: CollectStatus,
    pub error_message: String,
    pub event_time: i64,
    pub has_pricing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

impl CollectorsSummary {
    fn empty(resource_name: &str) -> Self {
        Self {
            resource_name: resource_name.to_string(),
            ..Default::default()
        }
    }
}

/// One scan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl Execution {
    /// Build from an execution id; an id without a timestamp maps to the epoch
    pub fn from_id(id: &str) -> Self {
        let seconds = extract_timestamp(id).unwrap_or(0);
        Self {
            id: id.to_string(),
            name: format!("Execution {}", id),
            time: DateTime::from_timestamp(seconds, 0).unwrap_or_default(),
        }
    }
}

/// Total monthly cost of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionCost {
    #[serde(rename = "ExecutionID")]
    pub execution_id: String,
    pub extracted_timestamp: i64,
    pub cost_sum: f64,
}

/// Fields the status fold reads from a hit
#[derive(Debug, Deserialize)]
struct StatusHit {
    #[serde(rename = "ResourceName")]
    resource_name: String,

    #[serde(rename = "EventType", default)]
    event_type: Option<String>,

    #[serde(rename = "EventTime", default)]
    event_time: i64,

    #[serde(rename = "Data")]
    data: ServiceStatusData,
}

/// Fields the cost folds read from a hit; everything else may be in any shape
#[derive(Debug, Deserialize)]
struct ResourceHit {
    #[serde(rename = "ResourceName", default)]
    resource_name: String,

    #[serde(rename = "ExecutionID", default)]
    execution_id: String,

    #[serde(rename = "EventType", default)]
    event_type: Option<String>,

    #[serde(rename = "Data", default)]
    data: Value,
}

impl ResourceHit {
    fn is(&self, event_type: EventType) -> bool {
        self.event_type.as_deref() == Some(event_type.as_ref())
    }

    fn price(&self) -> Option<PriceValue> {
        self.data
            .get(PRICE_FIELD)
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
    }

    /// Positive monthly price, numbers only
    fn priced(&self) -> Option<f64> {
        self.price()
            .and_then(|p| p.as_number())
            .filter(|p| *p > 0.0)
    }
}

fn project<T: DeserializeOwned>(hit: &Document) -> Option<T> {
    match serde_json::from_value(Value::Object(hit.clone())) {
        Ok(projection) => Some(projection),
        Err(e) => {
            warn!(error = %e, id = ?hit.get("id"), "Could not parse hit, skipping");
            None
        }
    }
}

/// Latest `service_status` per resource type.
///
/// A later hit replaces the kept one only when its `EventTime` is strictly
/// greater.
pub fn fold_latest_status<'a, I>(hits: I) -> HashMap<String, CollectorsSummary>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut summary: HashMap<String, CollectorsSummary> = HashMap::new();

    for hit in hits.into_iter().filter_map(project::<StatusHit>) {
        if hit.event_type.as_deref() != Some(EventType::ServiceStatus.as_ref()) {
            debug!(resource = %hit.resource_name, "Ignoring non-status hit");
            continue;
        }

        if let Some(existing) = summary.get(&hit.resource_name) {
            if hit.event_time <= existing.event_time {
                continue;
            }
        }

        summary.insert(
            hit.resource_name.clone(),
            CollectorsSummary {
                resource_name: hit.resource_name,
                status: hit.data.status,
                error_message: hit.data.error_message,
                event_time: hit.event_time,
                ..Default::default()
            },
        );
    }

    summary
}

/// Fold `resource_detected` hits into an existing summary.
///
/// Counts every hit, sums positive numeric prices, and marks the resource
/// type `potential_cost_saving` once any hit was priced. Types without a
/// status entry get a zero-valued one.
pub fn merge_resource_costs<'a, I>(summary: &mut HashMap<String, CollectorsSummary>, hits: I)
where
    I: IntoIterator<Item = &'a Document>,
{
    for hit in hits.into_iter().filter_map(project::<ResourceHit>) {
        if !hit.is(EventType::ResourceDetected) || hit.resource_name.is_empty() {
            debug!(resource = %hit.resource_name, "Ignoring non-resource hit");
            continue;
        }

        let price = hit.priced();
        if price.is_none() {
            debug!(
                resource = %hit.resource_name,
                "PricePerMonth missing or zero, treating as unused resource"
            );
        }

        let entry = summary
            .entry(hit.resource_name.clone())
            .or_insert_with(|| CollectorsSummary::empty(&hit.resource_name));

        entry.resource_count += 1;
        entry.total_spent += price.unwrap_or(0.0);
        entry.has_pricing |= price.is_some();
        entry.category = Some(if entry.has_pricing {
            Category::PotentialCostSaving
        } else {
            Category::UnusedResource
        });
    }
}

/// Distinct executions in order of first appearance
pub fn fold_first_seen_executions<'a, I>(hits: I) -> Vec<Execution>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut seen = std::collections::HashSet::new();
    let mut executions = Vec::new();

    for hit in hits {
        let Some(id) = hit.get(EXECUTION_ID_FIELD).and_then(|v| v.as_str()) else {
            debug!("Hit without ExecutionID, skipping");
            continue;
        };
        if seen.insert(id.to_string()) {
            executions.push(Execution::from_id(id));
        }
    }

    executions
}

/// Summed monthly price per execution, in order of first appearance.
///
/// Prices encoded as numeric strings count too.
pub fn fold_execution_costs<'a, I>(hits: I) -> Vec<ExecutionCost>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut order: Vec<String> = Vec::new();
    let mut sums: HashMap<String, f64> = HashMap::new();

    for hit in hits.into_iter().filter_map(project::<ResourceHit>) {
        if hit.is(EventType::ServiceStatus) || hit.execution_id.is_empty() {
            continue;
        }
        let price = hit
            .price()
            .and_then(|p| p.as_lenient_number())
            .unwrap_or(0.0);

        match sums.get_mut(&hit.execution_id) {
            Some(sum) => *sum += price,
            None => {
                order.push(hit.execution_id.clone());
                sums.insert(hit.execution_id, price);
            }
        }
    }

    order
        .into_iter()
        .map(|execution_id| ExecutionCost {
            extracted_timestamp: extract_timestamp(&execution_id).unwrap_or(0),
            cost_sum: sums.get(&execution_id).copied().unwrap_or(0.0),
            execution_id,
        })
        .collect()
}

/// Observed values per tag key, each list de-duplicated in first-seen order
pub fn fold_tags<'a, I>(hits: I) -> BTreeMap<String, Vec<String>>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for hit in hits {
        let Some(raw) = hit.get(DATA_FIELD).and_then(|data| data.get(TAG_FIELD)) else {
            continue;
        };
        for (key, value) in decode_tags(raw.clone()) {
            let values = tags.entry(key).or_default();
            if !values.contains(&value) {
                values.push(value);
            }
        }
    }

    tags
}

/// Chronological order for trend points
pub fn sort_by_timestamp(costs: &mut [ExecutionCost]) {
    costs.sort_by(|a, b| {
        a.extracted_timestamp
            .cmp(&b.extracted_timestamp)
            .then_with(|| a.execution_id.cmp(&b.execution_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn hits(values: Vec<Value>) -> Vec<Document> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn status(resource: &str, event_time: i64, status: i64) -> Value {
        json!({
            "ExecutionID": "general_1700000000",
            "ResourceName": resource,
            "EventType": "service_status",
            "EventTime": event_time,
            "Data": { "Status": status, "ErrorMessage": format!("t{}", event_time) }
        })
    }

    fn resource(execution: &str, name: &str, price: Value) -> Value {
        json!({
            "ExecutionID": execution,
            "ResourceName": name,
            "EventType": "resource_detected",
            "Data": { "PricePerMonth": price }
        })
    }

    #[test]
    fn test_latest_status_wins() {
        let docs = hits(vec![status("ebs", 100, 0), status("ebs", 200, 2), status("ebs", 150, 1)]);
        let summary = fold_latest_status(&docs);

        let ebs = &summary["ebs"];
        assert_eq!(ebs.event_time, 200);
        assert_eq!(ebs.status, CollectStatus::Finish);
        assert_eq!(ebs.error_message, "t200");
    }

    #[test]
    fn test_equal_event_time_keeps_first() {
        let docs = hits(vec![status("ebs", 100, 0), status("ebs", 100, 1)]);
        let summary = fold_latest_status(&docs);
        assert_eq!(summary["ebs"].status, CollectStatus::Fetch);
    }

    #[test]
    fn test_resource_costs_sum_and_categorize() {
        let docs = hits(vec![
            resource("general_1", "ebs", json!(10)),
            resource("general_1", "ebs", json!(0)),
            resource("general_1", "ebs", json!(5)),
            resource("general_1", "lambda", Value::Null),
        ]);
        let mut summary = fold_latest_status(&hits(vec![status("ebs", 1, 2)]));
        merge_resource_costs(&mut summary, &docs);

        let ebs = &summary["ebs"];
        assert_eq!(ebs.resource_count, 3);
        assert_eq!(ebs.total_spent, 15.0);
        assert!(ebs.has_pricing);
        assert_eq!(ebs.category, Some(Category::PotentialCostSaving));
        assert_eq!(ebs.status, CollectStatus::Finish);

        let lambda = &summary["lambda"];
        assert_eq!(lambda.resource_count, 1);
        assert_eq!(lambda.total_spent, 0.0);
        assert!(!lambda.has_pricing);
        assert_eq!(lambda.category, Some(Category::UnusedResource));
        assert_eq!(lambda.event_time, 0);
    }

    #[test]
    fn test_string_price_is_unpriced_in_summary() {
        let docs = hits(vec![resource("general_1", "ebs", json!("7.5"))]);
        let mut summary = HashMap::new();
        merge_resource_costs(&mut summary, &docs);
        assert_eq!(summary["ebs"].total_spent, 0.0);
        assert_eq!(summary["ebs"].category, Some(Category::UnusedResource));
    }

    #[test]
    fn test_cost_folds_ignore_timestamp_shape() {
        let mut docs = Vec::new();
        for timestamp in [json!("2023-11-14T22:13:20Z"), json!(1700000000), json!("2023-11-14 22:13:20")] {
            let mut hit = resource("general_1700000000", "ebs", json!(10));
            hit["Timestamp"] = timestamp;
            hit["EventTime"] = json!("late");
            docs.push(hit);
        }
        let docs = hits(docs);

        let mut summary = HashMap::new();
        merge_resource_costs(&mut summary, &docs);
        assert_eq!(summary["ebs"].resource_count, 3);
        assert_eq!(summary["ebs"].total_spent, 30.0);

        let costs = fold_execution_costs(&docs);
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].cost_sum, 30.0);
    }

    #[test]
    fn test_status_fold_ignores_timestamp_shape() {
        let mut hit = status("ebs", 100, 2);
        hit["Timestamp"] = json!(1700000000);
        let summary = fold_latest_status(&hits(vec![hit]));
        assert_eq!(summary["ebs"].status, CollectStatus::Finish);
    }

    #[test]
    fn test_first_seen_executions() {
        let docs = hits(vec![
            json!({"ExecutionID": "b_1700000100"}),
            json!({"ExecutionID": "a_1700000000"}),
            json!({"ExecutionID": "b_1700000100"}),
            json!({"ExecutionID": "broken"}),
            json!({"ResourceName": "no-execution"}),
        ]);
        let executions = fold_first_seen_executions(&docs);

        let ids: Vec<_> = executions.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b_1700000100", "a_1700000000", "broken"]);
        assert_eq!(executions[0].name, "Execution b_1700000100");
        assert_eq!(executions[0].time.timestamp(), 1700000100);
        assert_eq!(executions[2].time.timestamp(), 0);
    }

    #[test]
    fn test_execution_costs() {
        let docs = hits(vec![
            resource("general_1700000000", "ebs", json!(10)),
            resource("general_1700000000", "ebs", json!("2.5")),
            resource("malformed", "ebs", json!(0)),
            resource("malformed", "ebs", json!("n/a")),
        ]);
        let costs = fold_execution_costs(&docs);

        assert_eq!(costs.len(), 2);
        assert_eq!(costs[0].execution_id, "general_1700000000");
        assert_eq!(costs[0].cost_sum, 12.5);
        assert_eq!(costs[0].extracted_timestamp, 1700000000);
        assert_eq!(costs[1].cost_sum, 0.0);
        assert_eq!(costs[1].extracted_timestamp, 0);
    }

    #[test]
    fn test_tags_are_deduplicated() {
        let docs = hits(vec![
            json!({"Data": {"Tag": {"env": "prod"}}}),
            json!({"Data": {"Tag": {"env": "prod", "team": "x"}}}),
            json!({"Data": {"Tag": {"env": "dev", "size": 3}}}),
            json!({"Data": {}}),
        ]);
        let tags = fold_tags(&docs);

        assert_eq!(tags["env"], vec!["prod", "dev"]);
        assert_eq!(tags["team"], vec!["x"]);
        assert!(!tags.contains_key("size"));
    }

    #[test]
    fn test_undecodable_hits_are_skipped() {
        let docs = hits(vec![
            json!({"ResourceName": "ebs", "EventType": "service_status"}),
            status("ec2", 5, 2),
        ]);
        let summary = fold_latest_status(&docs);
        assert_eq!(summary.len(), 1);
        assert!(summary.contains_key("ec2"));
    }

    #[test]
    fn test_sort_by_timestamp() {
        let mut costs = vec![
            ExecutionCost { execution_id: "b".into(), extracted_timestamp: 20, cost_sum: 1.0 },
            ExecutionCost { execution_id: "a".into(), extracted_timestamp: 10, cost_sum: 1.0 },
        ];
        sort_by_timestamp(&mut costs);
        assert_eq!(costs[0].execution_id, "a");
    }

    #[test]
    fn test_summary_serializes_pascal_case() {
        let mut summary = CollectorsSummary::empty("ebs");
        summary.category = Some(Category::UnusedResource);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["ResourceName"], "ebs");
        assert_eq!(json["Category"], "unused_resource");
        assert_eq!(json["Status"], 0);
    }
}
