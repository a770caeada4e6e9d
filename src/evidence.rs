//! Detector Evidence Intake
//!
//! Detectors are black boxes returning boxes + confidences. This module
//! defines the evidence records, the `EvidenceSource` seam, and the
//! bounded-timeout gathering used by the orchestrator: a source that times
//! out or fails is reported as unavailable, never retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Raw output of one detector for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorEvidence {
    pub detector_id: String,
    #[serde(default)]
    pub bounding_boxes: Vec<BoundingBox>,
    pub confidence: f64,
    #[serde(default)]
    pub class_label: String,
    /// Detector-supplied variance, if it reports one
    #[serde(default)]
    pub variance: Option<f64>,
}

/// Per-detector input to fusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorReading {
    pub detector_id: String,
    pub confidence: f64,
    pub variance: f64,
}

impl DetectorReading {
    pub fn new(detector_id: impl Into<String>, confidence: f64, variance: f64) -> Self {
        Self {
            detector_id: detector_id.into(),
            confidence,
            variance,
        }
    }
}

impl DetectorEvidence {
    /// Reduce to a fusion reading. Without a reported variance, the Bernoulli
    /// variance c(1-c) is shrunk by the number of boxes backing it.
    pub fn to_reading(&self) -> Option<DetectorReading> {
        if !self.confidence.is_finite() {
            return None;
        }
        let c = self.confidence.clamp(0.0, 1.0);
        let variance = match self.variance {
            Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
            Some(_) => return None,
            None => c * (1.0 - c) / (1.0 + self.bounding_boxes.len() as f64),
        };
        Some(DetectorReading::new(self.detector_id.clone(), c, variance))
    }
}

/// One reading per detector: the highest-confidence item wins
pub fn readings_from_evidence(evidence: &[DetectorEvidence]) -> Vec<DetectorReading> {
    let mut best: HashMap<&str, &DetectorEvidence> = HashMap::new();
    for item in evidence.iter().filter(|e| e.confidence.is_finite()) {
        best.entry(item.detector_id.as_str())
            .and_modify(|cur| {
                if item.confidence > cur.confidence {
                    *cur = item;
                }
            })
            .or_insert(item);
    }

    let mut readings: Vec<DetectorReading> =
        best.values().filter_map(|e| e.to_reading()).collect();
    readings.sort_by(|a, b| a.detector_id.cmp(&b.detector_id));
    readings
}

/// Total detections reported across all evidence
pub fn detection_count(evidence: &[DetectorEvidence]) -> usize {
    evidence.iter().map(|e| e.bounding_boxes.len()).sum()
}

/// What the detectors are asked to look at
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRequest {
    pub assessment_id: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
}

/// A detector service
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn detector_id(&self) -> &str;
    async fn fetch(&self, request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError>;
}

/// Detector reachable over HTTP: `POST {url}` with an `EvidenceRequest`,
/// answered by a JSON array of `DetectorEvidence`
pub struct HttpEvidenceSource {
    detector_id: String,
    url: String,
    client: reqwest::Client,
}

impl HttpEvidenceSource {
    pub fn new(detector_id: impl Into<String>, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            detector_id: detector_id.into(),
            url: url.into(),
            client,
        }
    }

    /// Parse `id=url`
    pub fn parse(arg: &str, client: reqwest::Client) -> Option<Self> {
        let (id, url) = arg.split_once('=')?;
        let (id, url) = (id.trim(), url.trim());
        if id.is_empty() || url.is_empty() {
            return None;
        }
        Some(Self::new(id, url, client))
    }
}

#[async_trait]
impl EvidenceSource for HttpEvidenceSource {
    fn detector_id(&self) -> &str {
        &self.detector_id
    }

    async fn fetch(&self, request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
        let unavailable = |reason: String| EngineError::EvidenceUnavailable {
            detector: self.detector_id.clone(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status())));
        }
        let mut items: Vec<DetectorEvidence> = response
            .json()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        // a detector only speaks for itself
        for item in items.iter_mut() {
            item.detector_id = self.detector_id.clone();
        }
        Ok(items)
    }
}

/// Evidence collected under timeouts
#[derive(Debug, Clone, Default)]
pub struct GatheredEvidence {
    pub items: Vec<DetectorEvidence>,
    /// Detectors that timed out, failed or returned nothing
    pub unavailable: Vec<String>,
}

impl GatheredEvidence {
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }

    /// Mark every expected detector without a usable reading as unavailable
    pub fn require<'a>(&mut self, expected: impl IntoIterator<Item = &'a str>) {
        let readings = readings_from_evidence(&self.items);
        for id in expected {
            let reported = readings.iter().any(|r| r.detector_id == id);
            if !reported && !self.unavailable.iter().any(|u| u == id) {
                self.unavailable.push(id.to_string());
            }
        }
        self.unavailable.sort();
    }
}

/// Query every source concurrently, each bounded by `timeout`
pub async fn gather_evidence(
    sources: &[Arc<dyn EvidenceSource>],
    request: &EvidenceRequest,
    timeout: Duration,
) -> GatheredEvidence {
    let mut set = JoinSet::new();
    for source in sources {
        let source = Arc::clone(source);
        let request = request.clone();
        set.spawn(async move {
            let id = source.detector_id().to_string();
            let result = tokio::time::timeout(timeout, source.fetch(&request)).await;
            (id, result)
        });
    }

    let mut gathered = GatheredEvidence::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((id, Ok(Ok(items)))) if items.is_empty() => {
                warn!(detector = %id, "Detector returned nothing");
                gathered.unavailable.push(id);
            }
            Ok((_, Ok(Ok(items)))) => gathered.items.extend(items),
            Ok((id, Ok(Err(e)))) => {
                warn!(detector = %id, error = %e, "Detector returned an error");
                gathered.unavailable.push(id);
            }
            Ok((id, Err(_))) => {
                warn!(detector = %id, timeout_ms = timeout.as_millis() as u64, "Detector timed out");
                gathered.unavailable.push(id);
            }
            Err(e) => {
                warn!(error = %e, "Detector task failed");
                gathered.unavailable.push("unknown".to_string());
            }
        }
    }
    gathered.unavailable.sort();
    gathered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(id: &str, confidence: f64, boxes: usize) -> DetectorEvidence {
        DetectorEvidence {
            detector_id: id.to_string(),
            bounding_boxes: vec![
                BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0
                };
                boxes
            ],
            confidence,
            class_label: "crack".to_string(),
            variance: None,
        }
    }

    struct Fixed(&'static str, f64);

    #[async_trait]
    impl EvidenceSource for Fixed {
        fn detector_id(&self) -> &str {
            self.0
        }
        async fn fetch(&self, _request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
            Ok(vec![evidence(self.0, self.1, 1)])
        }
    }

    struct Slow;

    #[async_trait]
    impl EvidenceSource for Slow {
        fn detector_id(&self) -> &str {
            "slow"
        }
        async fn fetch(&self, _request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_default_variance_shrinks_with_boxes() {
        let one = evidence("sam3", 0.8, 0).to_reading().unwrap();
        let many = evidence("sam3", 0.8, 3).to_reading().unwrap();
        assert!((one.variance - 0.16).abs() < 1e-12);
        assert!((many.variance - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_readings_keep_best_per_detector() {
        let items = vec![
            evidence("sam3", 0.6, 1),
            evidence("sam3", 0.9, 2),
            evidence("gpt4", 0.7, 0),
            evidence("gpt4", f64::NAN, 0),
        ];
        let readings = readings_from_evidence(&items);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].detector_id, "gpt4");
        assert_eq!(readings[1].confidence, 0.9);
        assert_eq!(detection_count(&items), 3);
    }

    #[test]
    fn test_http_source_parse() {
        let client = reqwest::Client::new();
        let source = HttpEvidenceSource::parse("sam3=http://localhost:9001/detect", client.clone()).unwrap();
        assert_eq!(source.detector_id(), "sam3");
        assert!(HttpEvidenceSource::parse("no-url", client.clone()).is_none());
        assert!(HttpEvidenceSource::parse("=http://x", client).is_none());
    }

    #[tokio::test]
    async fn test_gather_marks_timeouts_unavailable() {
        let sources: Vec<Arc<dyn EvidenceSource>> = vec![Arc::new(Fixed("sam3", 0.8)), Arc::new(Slow)];
        let gathered = gather_evidence(
            &sources,
            &EvidenceRequest::default(),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(gathered.items.len(), 1);
        assert_eq!(gathered.unavailable, vec!["slow".to_string()]);
        assert!(!gathered.is_complete());
    }

    struct Empty;

    #[async_trait]
    impl EvidenceSource for Empty {
        fn detector_id(&self) -> &str {
            "gpt4"
        }
        async fn fetch(&self, _request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_gather_marks_empty_answer_unavailable() {
        let sources: Vec<Arc<dyn EvidenceSource>> = vec![Arc::new(Fixed("sam3", 0.8)), Arc::new(Empty)];
        let gathered = gather_evidence(
            &sources,
            &EvidenceRequest::default(),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(gathered.items.len(), 1);
        assert_eq!(gathered.unavailable, vec!["gpt4".to_string()]);
    }

    #[test]
    fn test_require_flags_missing_detectors() {
        let mut gathered = GatheredEvidence {
            items: vec![evidence("sam3", 0.8, 1), evidence("gpt4", f64::NAN, 1)],
            unavailable: Vec::new(),
        };
        gathered.require(["sam3", "gpt4", "scene_graph"]);
        assert_eq!(gathered.unavailable, vec!["gpt4".to_string(), "scene_graph".to_string()]);

        gathered.require(["scene_graph"]);
        assert_eq!(gathered.unavailable.len(), 2);
    }
}
