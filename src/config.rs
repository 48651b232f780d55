use crate::kalman::KalmanConfig;
use crate::processor::ProcessorConfig;
use crate::queue::QueueConfig;

/// Process-level configuration, overridable via environment variables.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub processor: ProcessorConfig,
    pub kalman: KalmanConfig,
    pub queue: QueueConfig,
    pub osrm_base_url: Option<String>,
}

impl PipelineConfig {
    /// Read configuration from the environment, falling back to the
    /// defaults. Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_var::<f64>("STOP_THRESHOLD_METERS") {
            config.processor.stop_threshold_m = v;
        }
        if let Some(v) = read_var::<i64>("MAX_LAST_LOCATION_AGE_SECONDS") {
            config.processor.stale_age_secs = v;
        }
        if let Some(v) = read_var::<usize>("OSRM_CONTEXT_POINTS") {
            config.processor.context_points = v;
        }
        if let Some(v) = read_var::<f64>("OSRM_MIN_CONFIDENCE") {
            config.processor.min_confidence = v;
        }
        if let Some(v) = read_var::<f64>("KALMAN_Q") {
            config.kalman.process_noise = v;
        }
        if let Some(v) = read_var::<f64>("KALMAN_R") {
            config.kalman.measurement_noise = v;
        }
        if let Some(v) = read_var::<usize>("WORKER_CONCURRENCY") {
            config.queue.workers = v;
        }
        if let Some(v) = read_var::<u32>("QUEUE_RATE_LIMIT") {
            config.queue.rate_limit_per_sec = v;
        }
        config.osrm_base_url = std::env::var("OSRM_BASE_URL")
            .ok()
            .filter(|s| !s.is_empty());

        config
    }
}

fn read_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring unparseable {}={:?}", key, value);
            None
        }
    }
}
