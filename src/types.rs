use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Geographic position in degrees (WGS-84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Both components finite and inside WGS-84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// How a processed sample's coordinates were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    /// First point of a device, or the first after a stale gap: raw
    /// coordinates pass through untouched.
    RawFirst,
    /// Kalman-smoothed; map matching declined the point or had too
    /// little context.
    Kalman,
    /// Snapped to the road network by the map matcher.
    Osrm,
    /// Kalman-smoothed because the map matcher was unreachable.
    KalmanFallback,
}

impl ProcessingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMethod::RawFirst => "raw_first",
            ProcessingMethod::Kalman => "kalman",
            ProcessingMethod::Osrm => "osrm",
            ProcessingMethod::KalmanFallback => "kalman_fallback",
        }
    }
}

/// An as-received GPS measurement.
///
/// Written once at ingestion, read once by the processor, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub id: String,
    pub device_id: String,
    pub trip_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub coords: Coordinates,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

/// Insert form of [`RawSample`]; the store assigns the id on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawSample {
    pub device_id: String,
    pub trip_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub coords: Coordinates,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

impl NewRawSample {
    pub fn new(device_id: &str, timestamp: DateTime<Utc>, coords: Coordinates) -> Self {
        Self {
            device_id: device_id.to_string(),
            trip_id: None,
            timestamp,
            coords,
            accuracy: None,
            speed: None,
            heading: None,
        }
    }

    pub fn with_trip(mut self, trip_id: &str) -> Self {
        self.trip_id = Some(trip_id.to_string());
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}

/// Derived metadata attached to every processed sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMetadata {
    /// Meters from the previous processed point.
    pub distance_meters: f64,
    pub time_diff_seconds: f64,
    pub speed_ms: f64,
    pub processing_method: ProcessingMethod,
    /// Map-matcher quality score in [0, 1]; 0 when matching did not run
    /// or declined the point.
    pub matching_confidence: f64,
    pub processed_at: DateTime<Utc>,
    pub raw_sample_id: String,
    /// Timestamp of the most recent sub-threshold sample coalesced into
    /// this one, if any.
    pub last_seen: Option<DateTime<Utc>>,
    /// Number of sub-threshold samples coalesced into this one.
    pub stop_count: u32,
}

/// An emitted measurement: the raw sample's identity with post-pipeline
/// coordinates and derived metadata.
///
/// Immutable once inserted, except for the two stop-coalesce fields
/// (`last_seen`, `stop_count`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSample {
    pub id: String,
    pub device_id: String,
    pub trip_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub coords: Coordinates,
    pub metadata: ProcessedMetadata,
}

/// Insert form of [`ProcessedSample`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProcessedSample {
    pub device_id: String,
    pub trip_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub coords: Coordinates,
    pub metadata: ProcessedMetadata,
}
