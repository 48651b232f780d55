use crate::types::Coordinates;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// One input point of a trace handed to the map matcher.
#[derive(Debug, Clone)]
pub struct TracePoint {
    pub coords: Coordinates,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
}

/// One output point, positionally paired with its input.
#[derive(Debug, Clone)]
pub struct MatchedPoint {
    pub coords: Coordinates,
    pub confidence: f64,
}

/// Map-matching failures that reach the caller.
///
/// "No solution" responses (`NoMatch`, `NoSegment`, per-point null
/// tracepoints) are not errors: the client echoes the inputs back with
/// zero confidence instead.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("network timeout")]
    Timeout,
    #[error("HTTP error: {0}")]
    Http(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Port to an external HMM-based map matcher.
#[async_trait]
pub trait MapMatcher: Send + Sync {
    /// Match an ordered trace to the road network.
    ///
    /// Returns exactly one matched point per input. Traces shorter than
    /// three points and no-solution responses come back as the inputs
    /// echoed with zero confidence; only infrastructure failures
    /// (transport, timeout, HTTP status, unparseable payload) are `Err`.
    async fn match_trace(&self, points: &[TracePoint]) -> Result<Vec<MatchedPoint>, MatchError>;

    /// Probe the matcher with a constant two-point trace. True iff it
    /// answers successfully within the probe deadline.
    async fn health_check(&self) -> bool;
}

const MATCH_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Search radius pinned on the first and last trace point, meters.
const ENDPOINT_RADIUS_M: u32 = 25;
/// Interior search radius when the sample carries no accuracy, meters.
const DEFAULT_RADIUS_M: u32 = 15;
/// Below this the matcher has nothing to work with.
const MIN_TRACE_POINTS: usize = 3;

#[derive(Debug, Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    matchings: Vec<Matching>,
    #[serde(default)]
    tracepoints: Vec<Option<Tracepoint>>,
}

#[derive(Debug, Deserialize)]
struct Matching {
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct Tracepoint {
    /// `[lon, lat]` per the OSRM wire format.
    location: [f64; 2],
}

/// HTTP client for an OSRM `match` service.
pub struct OsrmClient {
    client: reqwest::Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(MATCH_TIMEOUT)
            .user_agent("track-pipeline/0.1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        OsrmClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build the match request URL.
    ///
    /// Coordinates go on the path as `lon,lat` pairs joined by `;`.
    /// Timestamps are integer epoch seconds. Radii pin the first and
    /// last point to 25 m; interior points use the sample accuracy when
    /// present, else 15 m.
    fn build_match_url(&self, points: &[TracePoint]) -> String {
        let coords = points
            .iter()
            .map(|p| format!("{},{}", p.coords.lon, p.coords.lat))
            .collect::<Vec<_>>()
            .join(";");

        let timestamps = points
            .iter()
            .map(|p| p.timestamp.timestamp().to_string())
            .collect::<Vec<_>>()
            .join(";");

        let last = points.len().saturating_sub(1);
        let radiuses = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let radius = if i == 0 || i == last {
                    ENDPOINT_RADIUS_M
                } else {
                    p.accuracy
                        .map(|a| a.round() as u32)
                        .unwrap_or(DEFAULT_RADIUS_M)
                };
                radius.to_string()
            })
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}/match/v1/driving/{}?timestamps={}&radiuses={}&overview=full&steps=true&gaps=ignore&tidy=true",
            self.base_url, coords, timestamps, radiuses
        )
    }

    fn echo_unmatched(points: &[TracePoint]) -> Vec<MatchedPoint> {
        points
            .iter()
            .map(|p| MatchedPoint {
                coords: p.coords,
                confidence: 0.0,
            })
            .collect()
    }

    /// Decode a match response against its input trace.
    ///
    /// Every matched tracepoint carries the overall confidence of the
    /// first matching group; null tracepoints echo their input with zero
    /// confidence.
    fn decode_response(points: &[TracePoint], body: &str) -> Result<Vec<MatchedPoint>, MatchError> {
        let response: MatchResponse =
            serde_json::from_str(body).map_err(|e| MatchError::Parse(e.to_string()))?;

        if response.code != "Ok" {
            // NoMatch, NoSegment and friends: the road network has no
            // answer for this trace. Not a fault.
            return Ok(Self::echo_unmatched(points));
        }

        let confidence = response
            .matchings
            .first()
            .map(|m| m.confidence)
            .unwrap_or(0.0);

        let matched = points
            .iter()
            .enumerate()
            .map(|(i, p)| match response.tracepoints.get(i).and_then(|t| t.as_ref()) {
                Some(tp) => MatchedPoint {
                    coords: Coordinates::new(tp.location[1], tp.location[0]),
                    confidence,
                },
                None => MatchedPoint {
                    coords: p.coords,
                    confidence: 0.0,
                },
            })
            .collect();

        Ok(matched)
    }
}

#[async_trait]
impl MapMatcher for OsrmClient {
    async fn match_trace(&self, points: &[TracePoint]) -> Result<Vec<MatchedPoint>, MatchError> {
        if points.len() < MIN_TRACE_POINTS {
            return Ok(Self::echo_unmatched(points));
        }

        let url = self.build_match_url(points);
        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(MatchError::Timeout),
            Err(e) => return Err(MatchError::Transport(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(MatchError::Http(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MatchError::Transport(e.to_string()))?;

        Self::decode_response(points, &body)
    }

    async fn health_check(&self) -> bool {
        // Constant two-point probe; only reachability matters, so we hit
        // the wire directly instead of going through the short-trace
        // short-circuit in match_trace.
        let now = Utc::now();
        let probe = [
            TracePoint {
                coords: Coordinates::new(52.517037, 13.388860),
                timestamp: now,
                accuracy: None,
            },
            TracePoint {
                coords: Coordinates::new(52.517305, 13.397634),
                timestamp: now + chrono::Duration::seconds(10),
                accuracy: None,
            },
        ];

        let url = self.build_match_url(&probe);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trace(points: &[(f64, f64, i64, Option<f64>)]) -> Vec<TracePoint> {
        points
            .iter()
            .map(|&(lat, lon, secs, accuracy)| TracePoint {
                coords: Coordinates::new(lat, lon),
                timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
                accuracy,
            })
            .collect()
    }

    #[test]
    fn test_build_match_url() {
        let client = OsrmClient::new("http://osrm.example:5000/");
        let points = trace(&[
            (28.6129, 77.2295, 1700000000, None),
            (28.6132, 77.2298, 1700000030, Some(8.4)),
            (28.6135, 77.2301, 1700000060, None),
            (28.6140, 77.2306, 1700000090, None),
        ]);

        let url = client.build_match_url(&points);

        // Trailing slash trimmed, coordinates lon-first on the path.
        assert!(url.starts_with("http://osrm.example:5000/match/v1/driving/77.2295,28.6129;"));
        assert!(url.contains("timestamps=1700000000;1700000030;1700000060;1700000090"));
        // Endpoints pinned to 25 m; interior accuracy rounds, missing
        // accuracy defaults to 15 m.
        assert!(url.contains("radiuses=25;8;15;25"));
        assert!(url.contains("overview=full"));
        assert!(url.contains("steps=true"));
        assert!(url.contains("gaps=ignore"));
        assert!(url.contains("tidy=true"));
    }

    #[test]
    fn test_decode_matched_response() {
        let points = trace(&[
            (28.6129, 77.2295, 0, None),
            (28.6132, 77.2298, 30, None),
            (28.6135, 77.2301, 60, None),
        ]);
        let body = r#"{
            "code": "Ok",
            "matchings": [{"confidence": 0.87}],
            "tracepoints": [
                {"location": [77.22951, 28.61291]},
                {"location": [77.22981, 28.61321]},
                {"location": [77.23011, 28.61351]}
            ]
        }"#;

        let matched = OsrmClient::decode_response(&points, body).unwrap();
        assert_eq!(matched.len(), 3);
        // Wire order is [lon, lat]; every point carries the overall
        // confidence of the first matching.
        assert!((matched[0].coords.lat - 28.61291).abs() < 1e-9);
        assert!((matched[0].coords.lon - 77.22951).abs() < 1e-9);
        for point in &matched {
            assert_eq!(point.confidence, 0.87);
        }
    }

    #[test]
    fn test_decode_null_tracepoint_echoes_input() {
        let points = trace(&[
            (28.6129, 77.2295, 0, None),
            (28.6132, 77.2298, 30, None),
            (28.6135, 77.2301, 60, None),
        ]);
        let body = r#"{
            "code": "Ok",
            "matchings": [{"confidence": 0.9}],
            "tracepoints": [
                {"location": [77.22951, 28.61291]},
                null,
                {"location": [77.23011, 28.61351]}
            ]
        }"#;

        let matched = OsrmClient::decode_response(&points, body).unwrap();
        assert_eq!(matched[1].coords, points[1].coords);
        assert_eq!(matched[1].confidence, 0.0);
        assert_eq!(matched[0].confidence, 0.9);
    }

    #[test]
    fn test_decode_no_match_echoes_all() {
        let points = trace(&[
            (28.6129, 77.2295, 0, None),
            (28.6132, 77.2298, 30, None),
            (28.6135, 77.2301, 60, None),
        ]);
        let body = r#"{"code": "NoMatch"}"#;

        let matched = OsrmClient::decode_response(&points, body).unwrap();
        assert_eq!(matched.len(), 3);
        for (output, input) in matched.iter().zip(points.iter()) {
            assert_eq!(output.coords, input.coords);
            assert_eq!(output.confidence, 0.0);
        }
    }

    #[test]
    fn test_decode_garbage_is_parse_error() {
        let points = trace(&[(28.6129, 77.2295, 0, None)]);
        let result = OsrmClient::decode_response(&points, "<html>502</html>");
        assert!(matches!(result, Err(MatchError::Parse(_))));
    }

    #[test]
    fn test_decode_missing_matchings_zero_confidence() {
        let points = trace(&[(28.6129, 77.2295, 0, None)]);
        let body = r#"{"code": "Ok", "tracepoints": [{"location": [77.22951, 28.61291]}]}"#;

        let matched = OsrmClient::decode_response(&points, body).unwrap();
        assert_eq!(matched[0].confidence, 0.0);
    }

    #[tokio::test]
    async fn test_short_trace_short_circuits() {
        // Two points never reach the network, so an unroutable base URL
        // still answers.
        let client = OsrmClient::new("http://127.0.0.1:1");
        let points = trace(&[(28.6129, 77.2295, 0, None), (28.6132, 77.2298, 30, None)]);

        let matched = client.match_trace(&points).await.unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].coords, points[0].coords);
        assert_eq!(matched[0].confidence, 0.0);
    }

    #[tokio::test]
    async fn test_unreachable_matcher_is_transport_error() {
        let client = OsrmClient::new("http://127.0.0.1:1");
        let points = trace(&[
            (28.6129, 77.2295, 0, None),
            (28.6132, 77.2298, 30, None),
            (28.6135, 77.2301, 60, None),
        ]);

        let result = client.match_trace(&points).await;
        assert!(matches!(
            result,
            Err(MatchError::Transport(_)) | Err(MatchError::Timeout)
        ));
    }
}
