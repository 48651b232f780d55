use crate::types::{NewProcessedSample, NewRawSample, ProcessedSample, RawSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Storage failures. Every variant is retriable at the queue layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Filter and pagination for the read API.
#[derive(Debug, Clone, Default)]
pub struct SampleQuery {
    pub device_id: Option<String>,
    pub trip_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
}

impl SampleQuery {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            ..Self::default()
        }
    }
}

/// One page of query results, ordered by `(timestamp, id)` ascending.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching records before pagination.
    pub total: usize,
    pub offset: usize,
}

/// Port to the two append-only time-series collections the pipeline
/// reads and writes: raw samples as received, processed samples as
/// emitted.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert_raw(&self, sample: NewRawSample) -> Result<String, StorageError>;

    async fn find_raw(&self, id: &str) -> Result<Option<RawSample>, StorageError>;

    /// Insert an emitted sample. Implementations enforce the idempotence
    /// key: a second insert for the same `(device_id, raw_sample_id)`
    /// returns the existing id without inserting.
    async fn insert_processed(&self, sample: NewProcessedSample) -> Result<String, StorageError>;

    /// Most recent processed sample for the device by `(timestamp, id)`.
    async fn find_latest_processed(
        &self,
        device_id: &str,
    ) -> Result<Option<ProcessedSample>, StorageError>;

    /// Up to `n` most recent processed samples, newest first.
    async fn find_recent_processed(
        &self,
        device_id: &str,
        n: usize,
    ) -> Result<Vec<ProcessedSample>, StorageError>;

    /// Stop-coalesce update: set `last_seen`, bump `stop_count`. The
    /// only mutation a processed sample ever sees.
    async fn update_stop_metadata(
        &self,
        id: &str,
        last_seen: DateTime<Utc>,
        stop_count_inc: u32,
    ) -> Result<(), StorageError>;

    async fn list_raw(&self, query: &SampleQuery) -> Result<Page<RawSample>, StorageError>;

    async fn list_processed(
        &self,
        query: &SampleQuery,
    ) -> Result<Page<ProcessedSample>, StorageError>;
}

#[derive(Default)]
struct StoreInner {
    raw: HashMap<String, RawSample>,
    processed: HashMap<String, ProcessedSample>,
    /// Per-device `(timestamp, id) -> id` secondary index. Gives the
    /// latest-point lookup in O(log N) and keeps reads time-ordered even
    /// when racing writers insert out of order.
    processed_index: HashMap<String, BTreeMap<(DateTime<Utc>, String), String>>,
    /// Idempotence key: `(device_id, raw_sample_id) -> processed id`.
    processed_sources: HashMap<(String, String), String>,
}

/// In-memory reference implementation of [`SampleStore`].
///
/// Backs the test suite and the demo binary; a production deployment
/// points the same port at a real time-series store.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn matches(
        query: &SampleQuery,
        device_id: &str,
        trip_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if let Some(device) = &query.device_id {
            if device != device_id {
                return false;
            }
        }
        if let Some(trip) = &query.trip_id {
            if trip_id != Some(trip.as_str()) {
                return false;
            }
        }
        if let Some(from) = query.from {
            if timestamp < from {
                return false;
            }
        }
        if let Some(to) = query.to {
            if timestamp > to {
                return false;
            }
        }
        true
    }

    fn paginate<T>(mut items: Vec<T>, query: &SampleQuery) -> Page<T> {
        let total = items.len();
        let start = query.offset.min(total);
        items.drain(..start);
        if query.limit > 0 {
            items.truncate(query.limit);
        }
        Page {
            items,
            total,
            offset: query.offset,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn insert_raw(&self, sample: NewRawSample) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let record = RawSample {
            id: id.clone(),
            device_id: sample.device_id,
            trip_id: sample.trip_id,
            timestamp: sample.timestamp,
            coords: sample.coords,
            accuracy: sample.accuracy,
            speed: sample.speed,
            heading: sample.heading,
        };
        self.lock().raw.insert(id.clone(), record);
        Ok(id)
    }

    async fn find_raw(&self, id: &str) -> Result<Option<RawSample>, StorageError> {
        Ok(self.lock().raw.get(id).cloned())
    }

    async fn insert_processed(&self, sample: NewProcessedSample) -> Result<String, StorageError> {
        let mut inner = self.lock();

        let source_key = (
            sample.device_id.clone(),
            sample.metadata.raw_sample_id.clone(),
        );
        if let Some(existing) = inner.processed_sources.get(&source_key) {
            return Ok(existing.clone());
        }

        let id = Uuid::new_v4().to_string();
        let record = ProcessedSample {
            id: id.clone(),
            device_id: sample.device_id,
            trip_id: sample.trip_id,
            timestamp: sample.timestamp,
            coords: sample.coords,
            metadata: sample.metadata,
        };

        inner
            .processed_index
            .entry(record.device_id.clone())
            .or_default()
            .insert((record.timestamp, id.clone()), id.clone());
        inner.processed_sources.insert(source_key, id.clone());
        inner.processed.insert(id.clone(), record);
        Ok(id)
    }

    async fn find_latest_processed(
        &self,
        device_id: &str,
    ) -> Result<Option<ProcessedSample>, StorageError> {
        let inner = self.lock();
        let latest = inner
            .processed_index
            .get(device_id)
            .and_then(|index| index.last_key_value())
            .and_then(|(_, id)| inner.processed.get(id))
            .cloned();
        Ok(latest)
    }

    async fn find_recent_processed(
        &self,
        device_id: &str,
        n: usize,
    ) -> Result<Vec<ProcessedSample>, StorageError> {
        let inner = self.lock();
        let recent = inner
            .processed_index
            .get(device_id)
            .map(|index| {
                index
                    .values()
                    .rev()
                    .take(n)
                    .filter_map(|id| inner.processed.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(recent)
    }

    async fn update_stop_metadata(
        &self,
        id: &str,
        last_seen: DateTime<Utc>,
        stop_count_inc: u32,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let sample = inner
            .processed
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        sample.metadata.last_seen = Some(last_seen);
        sample.metadata.stop_count += stop_count_inc;
        Ok(())
    }

    async fn list_raw(&self, query: &SampleQuery) -> Result<Page<RawSample>, StorageError> {
        let inner = self.lock();
        let mut items: Vec<RawSample> = inner
            .raw
            .values()
            .filter(|s| Self::matches(query, &s.device_id, s.trip_id.as_deref(), s.timestamp))
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(Self::paginate(items, query))
    }

    async fn list_processed(
        &self,
        query: &SampleQuery,
    ) -> Result<Page<ProcessedSample>, StorageError> {
        let inner = self.lock();
        let mut items: Vec<ProcessedSample> = inner
            .processed
            .values()
            .filter(|s| Self::matches(query, &s.device_id, s.trip_id.as_deref(), s.timestamp))
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(Self::paginate(items, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinates, ProcessedMetadata, ProcessingMethod};
    use chrono::Duration;

    fn raw(device: &str, timestamp: DateTime<Utc>) -> NewRawSample {
        NewRawSample::new(device, timestamp, Coordinates::new(28.6129, 77.2295))
    }

    fn processed(
        device: &str,
        raw_id: &str,
        timestamp: DateTime<Utc>,
    ) -> NewProcessedSample {
        NewProcessedSample {
            device_id: device.to_string(),
            trip_id: None,
            timestamp,
            coords: Coordinates::new(28.6129, 77.2295),
            metadata: ProcessedMetadata {
                distance_meters: 0.0,
                time_diff_seconds: 0.0,
                speed_ms: 0.0,
                processing_method: ProcessingMethod::RawFirst,
                matching_confidence: 0.0,
                processed_at: timestamp,
                raw_sample_id: raw_id.to_string(),
                last_seen: None,
                stop_count: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_raw_insert_and_find() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let id = store.insert_raw(raw("dev-1", now)).await.unwrap();
        let found = store.find_raw(&id).await.unwrap().unwrap();
        assert_eq!(found.device_id, "dev-1");
        assert_eq!(found.timestamp, now);

        assert!(store.find_raw("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_survives_out_of_order_inserts() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .insert_processed(processed("dev-1", "raw-b", now))
            .await
            .unwrap();
        // A racing worker lands an older point afterwards.
        store
            .insert_processed(processed("dev-1", "raw-a", now - Duration::seconds(30)))
            .await
            .unwrap();

        let latest = store.find_latest_processed("dev-1").await.unwrap().unwrap();
        assert_eq!(latest.metadata.raw_sample_id, "raw-b");
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for i in 0..5 {
            store
                .insert_processed(processed(
                    "dev-1",
                    &format!("raw-{}", i),
                    base + Duration::seconds(i),
                ))
                .await
                .unwrap();
        }

        let recent = store.find_recent_processed("dev-1", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].metadata.raw_sample_id, "raw-4");
        assert_eq!(recent[2].metadata.raw_sample_id, "raw-2");

        assert!(store
            .find_recent_processed("dev-unknown", 3)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_idempotence_key() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = store
            .insert_processed(processed("dev-1", "raw-a", now))
            .await
            .unwrap();
        let second = store
            .insert_processed(processed("dev-1", "raw-a", now))
            .await
            .unwrap();

        assert_eq!(first, second);
        let page = store
            .list_processed(&SampleQuery::for_device("dev-1"))
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        // Same raw id on a different device is a distinct record.
        let other = store
            .insert_processed(processed("dev-2", "raw-a", now))
            .await
            .unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_update_stop_metadata() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = store
            .insert_processed(processed("dev-1", "raw-a", now))
            .await
            .unwrap();

        let seen = now + Duration::seconds(30);
        store.update_stop_metadata(&id, seen, 1).await.unwrap();
        store
            .update_stop_metadata(&id, seen + Duration::seconds(30), 1)
            .await
            .unwrap();

        let sample = store.find_latest_processed("dev-1").await.unwrap().unwrap();
        assert_eq!(sample.metadata.stop_count, 2);
        assert_eq!(sample.metadata.last_seen, Some(seen + Duration::seconds(30)));

        let err = store.update_stop_metadata("missing", seen, 1).await;
        assert!(matches!(err, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_and_pagination() {
        let store = MemoryStore::new();
        let base = Utc::now();

        for i in 0..10 {
            let mut sample = raw("dev-1", base + Duration::seconds(i));
            if i % 2 == 0 {
                sample = sample.with_trip("trip-1");
            }
            store.insert_raw(sample).await.unwrap();
        }
        store.insert_raw(raw("dev-2", base)).await.unwrap();

        let device_page = store
            .list_raw(&SampleQuery::for_device("dev-1"))
            .await
            .unwrap();
        assert_eq!(device_page.total, 10);

        let trip_page = store
            .list_raw(&SampleQuery {
                device_id: Some("dev-1".to_string()),
                trip_id: Some("trip-1".to_string()),
                ..SampleQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(trip_page.total, 5);

        let windowed = store
            .list_raw(&SampleQuery {
                device_id: Some("dev-1".to_string()),
                from: Some(base + Duration::seconds(3)),
                to: Some(base + Duration::seconds(6)),
                ..SampleQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(windowed.total, 4);

        let paged = store
            .list_raw(&SampleQuery {
                device_id: Some("dev-1".to_string()),
                offset: 8,
                limit: 5,
                ..SampleQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.total, 10);
        assert_eq!(paged.items.len(), 2);
        // Ascending timestamp order within the page.
        assert!(paged.items[0].timestamp < paged.items[1].timestamp);
    }
}
