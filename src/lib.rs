//! GPS track-processing pipeline.
//!
//! Ingests raw device GPS samples by id from a job queue, classifies
//! each one against the device's processed stream (first point,
//! out-of-order, stale gap, stop, move), smooths movement with a
//! per-device Kalman filter, snaps it to the road network through an
//! external OSRM map matcher with graceful fallback, and persists the
//! result with derived metadata.

pub mod config;
pub mod geo;
pub mod kalman;
pub mod osrm;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use kalman::{KalmanBank, KalmanConfig};
pub use osrm::{MapMatcher, MatchError, MatchedPoint, OsrmClient, TracePoint};
pub use processor::{
    PipelineStatsSnapshot, ProcessError, ProcessOutcome, ProcessorConfig, TrackProcessor,
};
pub use queue::{
    EnqueueOutcome, FailedJob, JobError, JobHandler, JobQueue, QueueConfig, QueueStats,
};
pub use storage::{MemoryStore, Page, SampleQuery, SampleStore, StorageError};
pub use types::{
    Coordinates, NewProcessedSample, NewRawSample, ProcessedMetadata, ProcessedSample,
    ProcessingMethod, RawSample,
};
