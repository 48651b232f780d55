use crate::geo;
use crate::kalman::KalmanBank;
use crate::osrm::{MapMatcher, TracePoint};
use crate::queue::{JobError, JobHandler};
use crate::storage::{SampleStore, StorageError};
use crate::types::{
    Coordinates, NewProcessedSample, ProcessedMetadata, ProcessingMethod, RawSample,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Classification thresholds, overridable via environment (see config).
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Below this distance a sample coalesces into its predecessor.
    pub stop_threshold_m: f64,
    /// Gap above this since the last processed point resets the filter.
    pub stale_age_secs: i64,
    /// Trailing window handed to the map matcher, current point included.
    pub context_points: usize,
    /// Minimum matcher confidence to accept snapped coordinates.
    pub min_confidence: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            stop_threshold_m: 5.0,
            stale_age_secs: 300,
            context_points: 10,
            min_confidence: 0.5,
        }
    }
}

/// Map matching needs at least this many context points to run.
const MIN_CONTEXT_POINTS: usize = 3;

/// Faults escaping a processing run. Only missing input and storage
/// trouble are retriable; everything the map matcher does is absorbed
/// inside the run.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("raw sample not found: {0}")]
    RawSampleMissing(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid sample {id}: {reason}")]
    InvalidSample { id: String, reason: String },
}

impl ProcessError {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProcessError::InvalidSample { .. })
    }
}

/// What one processing run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Device had no processed history; raw coordinates emitted as-is.
    FirstPoint { processed_id: String },
    /// Gap since the last processed point exceeded the stale age; the
    /// filter was reset and raw coordinates emitted as-is.
    StaleGap { processed_id: String },
    /// Sample is older than the device's processed head.
    SkippedOutOfOrder,
    /// Movement below the stop threshold; the predecessor absorbed it.
    StopCoalesced { predecessor_id: String },
    /// A cleaned sample was emitted.
    Inserted {
        processed_id: String,
        method: ProcessingMethod,
    },
}

/// Running method-mix counters. The only operator-visible signal of map
/// matcher trouble is `kalman_fallback` growing against `osrm`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub raw_first: AtomicU64,
    pub kalman: AtomicU64,
    pub osrm: AtomicU64,
    pub kalman_fallback: AtomicU64,
    pub stops_coalesced: AtomicU64,
    pub skipped_out_of_order: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default)]
pub struct PipelineStatsSnapshot {
    pub raw_first: u64,
    pub kalman: u64,
    pub osrm: u64,
    pub kalman_fallback: u64,
    pub stops_coalesced: u64,
    pub skipped_out_of_order: u64,
}

impl PipelineStats {
    fn record(&self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::FirstPoint { .. } | ProcessOutcome::StaleGap { .. } => {
                self.raw_first.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::SkippedOutOfOrder => {
                self.skipped_out_of_order.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::StopCoalesced { .. } => {
                self.stops_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::Inserted { method, .. } => {
                let counter = match method {
                    ProcessingMethod::RawFirst => &self.raw_first,
                    ProcessingMethod::Kalman => &self.kalman,
                    ProcessingMethod::Osrm => &self.osrm,
                    ProcessingMethod::KalmanFallback => &self.kalman_fallback,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            raw_first: self.raw_first.load(Ordering::Relaxed),
            kalman: self.kalman.load(Ordering::Relaxed),
            osrm: self.osrm.load(Ordering::Relaxed),
            kalman_fallback: self.kalman_fallback.load(Ordering::Relaxed),
            stops_coalesced: self.stops_coalesced.load(Ordering::Relaxed),
            skipped_out_of_order: self.skipped_out_of_order.load(Ordering::Relaxed),
        }
    }
}

/// The per-job state machine: load the raw sample, classify it against
/// the device's processed head, smooth, map-match, persist.
///
/// Jobs for distinct devices run in parallel; jobs for the same device
/// may race. Each run is an independent classification against the
/// current head, so races cost at most a rare out-of-order insert that
/// readers sort away — no cross-job locks are held.
pub struct TrackProcessor {
    store: Arc<dyn SampleStore>,
    matcher: Arc<dyn MapMatcher>,
    kalman: Arc<KalmanBank>,
    config: ProcessorConfig,
    stats: PipelineStats,
}

impl TrackProcessor {
    pub fn new(
        store: Arc<dyn SampleStore>,
        matcher: Arc<dyn MapMatcher>,
        kalman: Arc<KalmanBank>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            matcher,
            kalman,
            config,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the classification state machine for one enqueued raw sample.
    pub async fn process(&self, raw_sample_id: &str) -> Result<ProcessOutcome, ProcessError> {
        let raw = self
            .store
            .find_raw(raw_sample_id)
            .await?
            .ok_or_else(|| ProcessError::RawSampleMissing(raw_sample_id.to_string()))?;

        if !raw.coords.is_valid() {
            return Err(ProcessError::InvalidSample {
                id: raw.id.clone(),
                reason: format!(
                    "coordinates out of range: ({}, {})",
                    raw.coords.lat, raw.coords.lon
                ),
            });
        }

        let outcome = self.classify(&raw).await?;
        self.stats.record(&outcome);
        Ok(outcome)
    }

    async fn classify(&self, raw: &RawSample) -> Result<ProcessOutcome, ProcessError> {
        let last = match self.store.find_latest_processed(&raw.device_id).await? {
            Some(last) => last,
            None => {
                let id = self
                    .persist(raw, raw.coords, self.passthrough_metadata(raw, 0.0, 0.0))
                    .await?;
                log::info!("device {}: first point emitted as-is", raw.device_id);
                return Ok(ProcessOutcome::FirstPoint { processed_id: id });
            }
        };

        let dt = (raw.timestamp - last.timestamp).num_milliseconds() as f64 / 1000.0;
        if dt < 0.0 {
            log::debug!(
                "device {}: sample {} older than processed head, skipped",
                raw.device_id,
                raw.id
            );
            return Ok(ProcessOutcome::SkippedOutOfOrder);
        }

        let distance = geo::distance(last.coords, raw.coords);
        if !distance.is_finite() {
            return Err(ProcessError::InvalidSample {
                id: raw.id.clone(),
                reason: "non-finite distance from previous point".to_string(),
            });
        }

        // Staleness is measured against the wall clock, not the sample
        // gap: a long-idle device gets a fresh filter.
        let head_age_secs = (Utc::now() - last.timestamp).num_seconds();
        if head_age_secs > self.config.stale_age_secs {
            self.kalman.reset(&raw.device_id);
            let id = self
                .persist(raw, raw.coords, self.passthrough_metadata(raw, distance, dt))
                .await?;
            log::info!(
                "device {}: stale gap ({} s), filter reset, raw point emitted",
                raw.device_id,
                head_age_secs
            );
            return Ok(ProcessOutcome::StaleGap { processed_id: id });
        }

        if distance < self.config.stop_threshold_m {
            self.store
                .update_stop_metadata(&last.id, raw.timestamp, 1)
                .await?;
            log::debug!(
                "device {}: {:.1} m move coalesced into {}",
                raw.device_id,
                distance,
                last.id
            );
            return Ok(ProcessOutcome::StopCoalesced {
                predecessor_id: last.id,
            });
        }

        // Two-stage cleaning: Kalman first, then map matching over the
        // trailing context window.
        let (smooth_lat, smooth_lon) =
            self.kalman
                .filter(&raw.device_id, raw.coords.lat, raw.coords.lon);
        let smoothed = Coordinates::new(smooth_lat, smooth_lon);

        let (final_coords, method, confidence) = self.match_or_fallback(raw, smoothed).await?;

        let metadata = ProcessedMetadata {
            distance_meters: distance,
            time_diff_seconds: dt,
            speed_ms: geo::speed(distance, dt),
            processing_method: method,
            matching_confidence: confidence,
            processed_at: Utc::now(),
            raw_sample_id: raw.id.clone(),
            last_seen: None,
            stop_count: 0,
        };
        let id = self.persist(raw, final_coords, metadata).await?;
        Ok(ProcessOutcome::Inserted {
            processed_id: id,
            method,
        })
    }

    /// Second cleaning stage: snap the smoothed point to the road
    /// network, falling back to the smoothed coordinates when the
    /// matcher declines or is unreachable.
    async fn match_or_fallback(
        &self,
        raw: &RawSample,
        smoothed: Coordinates,
    ) -> Result<(Coordinates, ProcessingMethod, f64), ProcessError> {
        let context = self.build_context(raw, smoothed).await?;
        if context.len() < MIN_CONTEXT_POINTS {
            return Ok((smoothed, ProcessingMethod::Kalman, 0.0));
        }

        match self.matcher.match_trace(&context).await {
            Ok(matched) => match matched.last() {
                Some(tail) if tail.confidence >= self.config.min_confidence => {
                    Ok((tail.coords, ProcessingMethod::Osrm, tail.confidence))
                }
                Some(tail) => Ok((smoothed, ProcessingMethod::Kalman, tail.confidence)),
                None => Ok((smoothed, ProcessingMethod::Kalman, 0.0)),
            },
            Err(e) => {
                log::warn!(
                    "device {}: map matcher unavailable ({}), keeping smoothed point",
                    raw.device_id,
                    e
                );
                Ok((smoothed, ProcessingMethod::KalmanFallback, 0.0))
            }
        }
    }

    /// Trailing context for the matcher: the last `context_points - 1`
    /// processed samples oldest-first, with the current smoothed point
    /// appended as the tail.
    async fn build_context(
        &self,
        raw: &RawSample,
        smoothed: Coordinates,
    ) -> Result<Vec<TracePoint>, ProcessError> {
        let history = self
            .store
            .find_recent_processed(&raw.device_id, self.config.context_points.saturating_sub(1))
            .await?;

        let mut context: Vec<TracePoint> = history
            .into_iter()
            .rev()
            .map(|p| TracePoint {
                coords: p.coords,
                timestamp: p.timestamp,
                accuracy: None,
            })
            .collect();
        context.push(TracePoint {
            coords: smoothed,
            timestamp: raw.timestamp,
            accuracy: raw.accuracy,
        });
        Ok(context)
    }

    /// Metadata for points emitted without cleaning (first point,
    /// post-stale-gap point).
    fn passthrough_metadata(&self, raw: &RawSample, distance: f64, dt: f64) -> ProcessedMetadata {
        ProcessedMetadata {
            distance_meters: distance,
            time_diff_seconds: dt,
            speed_ms: geo::speed(distance, dt),
            processing_method: ProcessingMethod::RawFirst,
            matching_confidence: 0.0,
            processed_at: Utc::now(),
            raw_sample_id: raw.id.clone(),
            last_seen: None,
            stop_count: 0,
        }
    }

    async fn persist(
        &self,
        raw: &RawSample,
        coords: Coordinates,
        metadata: ProcessedMetadata,
    ) -> Result<String, ProcessError> {
        let id = self
            .store
            .insert_processed(NewProcessedSample {
                device_id: raw.device_id.clone(),
                trip_id: raw.trip_id.clone(),
                timestamp: raw.timestamp,
                coords,
                metadata,
            })
            .await?;
        Ok(id)
    }
}

#[async_trait]
impl JobHandler for TrackProcessor {
    async fn handle(&self, job_id: &str) -> Result<(), JobError> {
        match self.process(job_id).await {
            Ok(outcome) => {
                log::debug!("job {}: {:?}", job_id, outcome);
                Ok(())
            }
            Err(e) if e.is_retriable() => Err(JobError::retriable(e.to_string())),
            Err(e) => {
                log::error!("job {}: dropping sample: {}", job_id, e);
                Err(JobError::fatal(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osrm::{MatchError, MatchedPoint};
    use crate::storage::MemoryStore;
    use crate::types::NewRawSample;
    use chrono::{DateTime, Duration};
    use std::sync::Mutex;

    struct EchoMatcher {
        context_lengths: Mutex<Vec<usize>>,
    }

    impl EchoMatcher {
        fn new() -> Self {
            Self {
                context_lengths: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MapMatcher for EchoMatcher {
        async fn match_trace(
            &self,
            points: &[TracePoint],
        ) -> Result<Vec<MatchedPoint>, MatchError> {
            self.context_lengths.lock().unwrap().push(points.len());
            Ok(points
                .iter()
                .map(|p| MatchedPoint {
                    coords: p.coords,
                    confidence: 0.0,
                })
                .collect())
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn setup(matcher: Arc<dyn MapMatcher>) -> (Arc<MemoryStore>, TrackProcessor) {
        let store = Arc::new(MemoryStore::new());
        let processor = TrackProcessor::new(
            store.clone(),
            matcher,
            Arc::new(KalmanBank::new(Default::default())),
            ProcessorConfig::default(),
        );
        (store, processor)
    }

    async fn ingest(
        store: &MemoryStore,
        device: &str,
        timestamp: DateTime<Utc>,
        lat: f64,
        lon: f64,
    ) -> String {
        store
            .insert_raw(NewRawSample::new(
                device,
                timestamp,
                Coordinates::new(lat, lon),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_raw_sample_is_retriable() {
        let (_, processor) = setup(Arc::new(EchoMatcher::new()));
        let err = processor.process("nope").await.unwrap_err();
        assert!(matches!(err, ProcessError::RawSampleMissing(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_invalid_coords_are_fatal() {
        let (store, processor) = setup(Arc::new(EchoMatcher::new()));
        let id = ingest(&store, "dev-1", Utc::now(), 91.0, 0.0).await;

        let err = processor.process(&id).await.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidSample { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_context_window_shape() {
        let matcher = Arc::new(EchoMatcher::new());
        let (store, processor) = setup(matcher.clone());
        let base = Utc::now() - Duration::seconds(120);

        // Walk north in ~44 m hops; first two insertions never reach the
        // matcher (first point, then a 2-long context).
        for i in 0..6 {
            let id = ingest(
                &store,
                "dev-1",
                base + Duration::seconds(i * 20),
                28.6129 + i as f64 * 0.0004,
                77.2295,
            )
            .await;
            processor.process(&id).await.unwrap();
        }

        let lengths = matcher.context_lengths.lock().unwrap().clone();
        // Calls start once 2 prior points exist: contexts of 3, 4, 5, 6.
        assert_eq!(lengths, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_stats_record_method_mix() {
        let (store, processor) = setup(Arc::new(EchoMatcher::new()));
        let base = Utc::now() - Duration::seconds(60);

        let first = ingest(&store, "dev-1", base, 28.6129, 77.2295).await;
        processor.process(&first).await.unwrap();
        let move_id = ingest(
            &store,
            "dev-1",
            base + Duration::seconds(30),
            28.6133,
            77.2295,
        )
        .await;
        processor.process(&move_id).await.unwrap();

        let stats = processor.stats();
        assert_eq!(stats.raw_first, 1);
        assert_eq!(stats.kalman, 1);
        assert_eq!(stats.osrm, 0);
    }
}
