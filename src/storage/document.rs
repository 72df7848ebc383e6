//! Event documents as produced by the resource scanners
//!
//! Documents travel as JSON objects with PascalCase keys:
//!
//! ```json
//! {
//!   "id": "1717171717000000001",
//!   "ExecutionID": "general_1717171717",
//!   "ResourceName": "aws_ebs",
//!   "EventType": "resource_detected",
//!   "EventTime": 1717171717,
//!   "Timestamp": "2024-05-31T16:08:37Z",
//!   "Data": { "PricePerMonth": 12.5, "Tag": { "env": "prod" } }
//! }
//! ```
//!
//! `Data` is decoded according to `EventType`. The typed [`Event`] is built
//! at the ingestion boundary; queries move raw [`Document`]s and the folds
//! read only the fields they need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use strum::{AsRefStr, Display, EnumString};

/// A raw engine document
pub type Document = Map<String, Value>;

/// Primary key attribute required by the engine
pub const ID_FIELD: &str = "id";
pub const EXECUTION_ID_FIELD: &str = "ExecutionID";
pub const RESOURCE_NAME_FIELD: &str = "ResourceName";
pub const EVENT_TYPE_FIELD: &str = "EventType";
pub const TIMESTAMP_FIELD: &str = "Timestamp";
pub const DATA_FIELD: &str = "Data";
pub const TAG_FIELD: &str = "Tag";
pub const PRICE_FIELD: &str = "PricePerMonth";

/// Kind of event emitted by a scanner
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    /// Collector lifecycle for one resource type (started, failed, finished)
    ServiceStatus,
    /// A billable resource that was found
    ResourceDetected,
}

/// Collector lifecycle state carried by `service_status` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum CollectStatus {
    #[default]
    Fetch,
    Error,
    Finish,
    Other(i64),
}

impl From<i64> for CollectStatus {
    fn from(value: i64) -> Self {
        match value {
            0 => CollectStatus::Fetch,
            1 => CollectStatus::Error,
            2 => CollectStatus::Finish,
            other => CollectStatus::Other(other),
        }
    }
}

impl From<CollectStatus> for i64 {
    fn from(status: CollectStatus) -> Self {
        match status {
            CollectStatus::Fetch => 0,
            CollectStatus::Error => 1,
            CollectStatus::Finish => 2,
            CollectStatus::Other(other) => other,
        }
    }
}

/// Payload of a `service_status` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusData {
    #[serde(rename = "Status", default)]
    pub status: CollectStatus,

    #[serde(rename = "ErrorMessage", default)]
    pub error_message: String,
}

/// `PricePerMonth` as found in the wild: scanners are not consistent about its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceValue {
    Number(f64),
    Text(String),
    Other(Value),
}

impl PriceValue {
    /// The price only when it was encoded as a JSON number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PriceValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The price as a number, accepting numeric strings too
    pub fn as_lenient_number(&self) -> Option<f64> {
        match self {
            PriceValue::Number(n) => Some(*n),
            PriceValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            PriceValue::Other(_) => None,
        }
    }
}

/// Payload of a `resource_detected` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDetectedData {
    #[serde(rename = "PricePerMonth", default, skip_serializing_if = "Option::is_none")]
    pub price_per_month: Option<PriceValue>,

    #[serde(rename = "Tag", default, deserialize_with = "deserialize_tags")]
    pub tag: BTreeMap<String, String>,

    /// Resource-specific fields (region, instance type, metric, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceDetectedData {
    /// Positive monthly price, numbers only
    pub fn priced(&self) -> Option<f64> {
        self.price_per_month
            .as_ref()
            .and_then(PriceValue::as_number)
            .filter(|p| *p > 0.0)
    }
}

/// Event payload, keyed by [`EventType`]
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    ServiceStatus(ServiceStatusData),
    ResourceDetected(ResourceDetectedData),
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::ServiceStatus(_) => EventType::ServiceStatus,
            EventData::ResourceDetected(_) => EventType::ResourceDetected,
        }
    }
}

/// One detection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub struct Event {
    pub id: Option<String>,
    pub execution_id: String,
    pub resource_name: String,
    pub event_time: i64,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }

    /// Decode an engine hit
    pub fn from_document(doc: &Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(doc.clone()))
    }

    /// Encode as an engine document
    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(serde::ser::Error::custom("event did not serialize to an object")),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawEvent {
    #[serde(
        rename = "id",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_id"
    )]
    id: Option<String>,

    #[serde(rename = "ExecutionID")]
    execution_id: String,

    #[serde(rename = "ResourceName")]
    resource_name: String,

    #[serde(rename = "EventType")]
    event_type: EventType,

    #[serde(rename = "EventTime", default)]
    event_time: i64,

    #[serde(rename = "Timestamp", default)]
    timestamp: DateTime<Utc>,

    #[serde(rename = "Data", default)]
    data: Value,
}

impl TryFrom<RawEvent> for Event {
    type Error = serde_json::Error;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let data = match raw.event_type {
            EventType::ServiceStatus => EventData::ServiceStatus(serde_json::from_value(raw.data)?),
            EventType::ResourceDetected => {
                let payload = if raw.data.is_null() { Value::Object(Map::new()) } else { raw.data };
                EventData::ResourceDetected(serde_json::from_value(payload)?)
            }
        };

        Ok(Event {
            id: raw.id,
            execution_id: raw.execution_id,
            resource_name: raw.resource_name,
            event_time: raw.event_time,
            timestamp: raw.timestamp,
            data,
        })
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        let event_type = event.event_type();
        let data = match event.data {
            EventData::ServiceStatus(d) => serde_json::to_value(d),
            EventData::ResourceDetected(d) => serde_json::to_value(d),
        }
        .unwrap_or(Value::Null);

        RawEvent {
            id: event.id,
            execution_id: event.execution_id,
            resource_name: event.resource_name,
            event_type,
            event_time: event.event_time,
            timestamp: event.timestamp,
            data,
        }
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(decode_tags).unwrap_or_default())
}

/// Read a `Tag` value as a string map.
///
/// A well-formed string map is taken as is; any other object keeps only its
/// string-valued entries. Non-objects yield no tags.
pub fn decode_tags(value: Value) -> BTreeMap<String, String> {
    match serde_json::from_value::<BTreeMap<String, String>>(value.clone()) {
        Ok(tags) => tags,
        Err(_) => match value {
            Value::Object(generic) => generic
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        },
    }
}

/// Creation timestamp (unix seconds) encoded in an execution id.
///
/// Execution ids are `<name>_<unix seconds>`; the segment after the last
/// underscore carries the timestamp.
pub fn extract_timestamp(execution_id: &str) -> Option<i64> {
    let (_, suffix) = execution_id.rsplit_once('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse::<i64>().ok()
}

static LAST_DOCUMENT_ID: AtomicU64 = AtomicU64::new(0);

/// Synthetic primary key from the nanosecond clock.
///
/// Strictly increasing within the process, so two calls never collide even
/// when the clock reads the same value twice.
pub fn next_document_id() -> String {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(0);

    let previous = LAST_DOCUMENT_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or(now);

    now.max(previous.saturating_add(1)).to_string()
}

/// Assign a synthetic `id` when the document has none. Returns the id in use.
pub fn ensure_document_id(doc: &mut Document) -> String {
    match doc.get(ID_FIELD) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            let id = next_document_id();
            doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            id
        }
    }
}
