use std::collections::HashMap;
use std::sync::Mutex;

/// Tunables for the per-device position filter.
#[derive(Debug, Clone, Copy)]
pub struct KalmanConfig {
    /// Process noise variance Q.
    pub process_noise: f64,
    /// Measurement noise variance R.
    pub measurement_noise: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.001,
            measurement_noise: 5.0,
        }
    }
}

/// Per-device filter state: one estimate per axis, one shared covariance.
#[derive(Debug, Clone, Copy)]
struct KalmanState {
    lat: f64,
    lon: f64,
    p: f64,
}

const INITIAL_COVARIANCE: f64 = 1.0;

/// Bank of 1-D Kalman filters, one per device.
///
/// Latitude and longitude are modeled as two independent random walks
/// sharing a single scalar error covariance, updated once per step.
/// State lives only in memory: a process restart behaves exactly like a
/// per-device reset, which lines up with the stale-gap semantics of the
/// track processor.
pub struct KalmanBank {
    config: KalmanConfig,
    states: Mutex<HashMap<String, KalmanState>>,
}

impl KalmanBank {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Run one filter step for the device and return the smoothed position.
    ///
    /// The first observation after creation or a reset initializes the
    /// state and passes through unchanged.
    pub fn filter(&self, device_id: &str, lat: f64, lon: f64) -> (f64, f64) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(device_id) {
            // Predict covariance, compute gain, update both axes,
            // persist the shared covariance once.
            let p_pred = state.p + self.config.process_noise;
            let gain = p_pred / (p_pred + self.config.measurement_noise);
            state.lat += gain * (lat - state.lat);
            state.lon += gain * (lon - state.lon);
            state.p = (1.0 - gain) * p_pred;
            return (state.lat, state.lon);
        }

        states.insert(
            device_id.to_string(),
            KalmanState {
                lat,
                lon,
                p: INITIAL_COVARIANCE,
            },
        );
        (lat, lon)
    }

    /// Discard the device's state; the next `filter` call passes through.
    pub fn reset(&self, device_id: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(device_id);
    }

    /// Discard all device state.
    pub fn clear_all(&self) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.clear();
    }

    /// Number of devices with live filter state.
    pub fn tracked_devices(&self) -> usize {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.len()
    }
}
