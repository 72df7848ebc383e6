//! In-process search engine for tests and local runs

use crate::storage::document::{Document, ID_FIELD};
use crate::storage::engine::{IndexSettings, SearchEngine, SearchRequest};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::filter::Filter;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct MemoryIndex {
    primary_key: String,
    documents: Vec<Document>,
    positions: HashMap<String, usize>,
    filterable: Vec<String>,
    /// Submitted settings not yet visible, and reads left until they are
    pending: Option<(Vec<String>, u32)>,
}

impl MemoryIndex {
    fn upsert(&mut self, document: Document) -> StorageResult<()> {
        let key = match document.get(&self.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(StorageError::Engine {
                    status: 400,
                    message: format!("document is missing primary key `{}`", self.primary_key),
                })
            }
        };

        match self.positions.get(&key) {
            Some(&pos) => self.documents[pos] = document,
            None => {
                self.positions.insert(key, self.documents.len());
                self.documents.push(document);
            }
        }
        Ok(())
    }

    /// One read of the filterable list, ticking down any pending update
    fn read_filterable(&mut self) -> Vec<String> {
        if let Some((attributes, remaining)) = self.pending.take() {
            if remaining == 0 {
                self.filterable = attributes;
            } else {
                self.pending = Some((attributes, remaining - 1));
            }
        }
        self.filterable.clone()
    }

    fn apply_pending(&mut self) {
        if let Some((attributes, _)) = self.pending.take() {
            self.filterable = attributes;
        }
    }
}

/// Thread-safe in-memory [`SearchEngine`].
///
/// Mirrors the behavior the storage client depends on: filters over
/// non-filterable attributes are rejected with
/// [`StorageError::NotFilterable`], and settings can be made to lag behind
/// their submission to exercise the verification protocol.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    indexes: DashMap<String, MemoryIndex>,
    settings_lag: AtomicU32,
    unhealthy: AtomicBool,
    search_failures: AtomicU32,
    create_failures: AtomicU32,
    create_calls: AtomicU64,
    settings_calls: AtomicU64,
    search_calls: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep submitted settings invisible for the next `reads` verification reads
    pub fn with_settings_lag(self, reads: u32) -> Self {
        self.settings_lag.store(reads, Ordering::SeqCst);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Fail the next `count` searches with a transport error
    pub fn fail_next_searches(&self, count: u32) {
        self.search_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` index creations with a transport error
    pub fn fail_next_creates(&self, count: u32) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    /// Drop an index's filterable attributes, as after a schema loss
    pub fn clear_filterable(&self, index: &str) {
        if let Some(mut entry) = self.indexes.get_mut(index) {
            entry.filterable.clear();
            entry.pending = None;
        }
    }

    /// Make every submitted settings update visible immediately
    pub fn apply_pending_settings(&self) {
        for mut entry in self.indexes.iter_mut() {
            entry.apply_pending();
        }
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indexes
            .get(index)
            .map(|entry| entry.documents.len())
            .unwrap_or(0)
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn settings_calls(&self) -> u64 {
        self.settings_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> u64 {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn missing(index: &str) -> StorageError {
        StorageError::PartitionNotFound(index.to_string())
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SearchEngine for InMemoryEngine {
    async fn health(&self) -> StorageResult<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(StorageError::Connection("engine unavailable".to_string()));
        }
        Ok(())
    }

    async fn create_index(&self, name: &str, primary_key: &str) -> StorageResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_injected_failure(&self.create_failures) {
            return Err(StorageError::Transport("injected create failure".to_string()));
        }
        self.indexes.entry(name.to_string()).or_insert_with(|| MemoryIndex {
            primary_key: primary_key.to_string(),
            ..Default::default()
        });
        Ok(())
    }

    async fn index_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.indexes.contains_key(name))
    }

    async fn delete_index(&self, name: &str) -> StorageResult<bool> {
        Ok(self.indexes.remove(name).is_some())
    }

    async fn list_indexes(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn add_document(&self, index: &str, document: &Document) -> StorageResult<()> {
        let mut entry = self.indexes.get_mut(index).ok_or_else(|| Self::missing(index))?;
        entry.upsert(document.clone())
    }

    async fn update_settings(&self, index: &str, settings: &IndexSettings) -> StorageResult<()> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        let mut entry = self.indexes.get_mut(index).ok_or_else(|| Self::missing(index))?;

        let attributes = settings.filterable_attributes.clone();
        let lag = self.settings_lag.load(Ordering::SeqCst);
        // A resubmission keeps the countdown of the update already in flight
        let remaining = entry.pending.as_ref().map(|(_, r)| *r).unwrap_or(lag);
        entry.pending = Some((attributes, remaining));
        Ok(())
    }

    async fn filterable_attributes(&self, index: &str) -> StorageResult<Vec<String>> {
        let mut entry = self.indexes.get_mut(index).ok_or_else(|| Self::missing(index))?;
        Ok(entry.read_filterable())
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> StorageResult<Vec<Document>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_injected_failure(&self.search_failures) {
            return Err(StorageError::Transport("injected search failure".to_string()));
        }

        let filter = request.filter.as_deref().map(Filter::parse).transpose()?;

        let entry = self.indexes.get(index).ok_or_else(|| Self::missing(index))?;
        if let Some(filter) = &filter {
            if let Some(attr) = filter
                .attributes()
                .into_iter()
                .find(|a| !entry.filterable.iter().any(|f| f.as_str() == *a))
            {
                return Err(StorageError::NotFilterable(format!(
                    "Attribute `{}` is not filterable. Available filterable attributes are: {:?}.",
                    attr, entry.filterable
                )));
            }
        }

        let needle = request.q.trim().to_lowercase();
        Ok(entry
            .documents
            .iter()
            .filter(|doc| filter.as_ref().map_or(true, |f| f.matches(doc)))
            .filter(|doc| needle.is_empty() || contains_text(doc, &needle))
            .take(request.limit)
            .cloned()
            .collect())
    }
}

fn contains_text(doc: &Document, needle: &str) -> bool {
    doc.iter()
        .any(|(key, value)| key != ID_FIELD && value_contains(value, needle))
}

fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Number(n) => n.to_string().contains(needle),
        Value::Array(items) => items.iter().any(|v| value_contains(v, needle)),
        Value::Object(map) => map.values().any(|v| value_contains(v, needle)),
        Value::Bool(_) | Value::Null => false,
    }
}
