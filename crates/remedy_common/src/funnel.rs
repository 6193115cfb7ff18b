//! Funnel metrics: one record per ticket run and the success-rate aggregate.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How the problem was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Signature,
    Keyword,
    Semantic,
    Llm,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::Keyword => "keyword",
            Self::Semantic => "semantic",
            Self::Llm => "llm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "signature" => Some(Self::Signature),
            "keyword" => Some(Self::Keyword),
            "semantic" => Some(Self::Semantic),
            "llm" => Some(Self::Llm),
            _ => None,
        }
    }
}

/// One ticket-processing run. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisMetricsRecord {
    pub ticket_id: String,
    pub problem_detected: bool,
    pub problem_type: Option<String>,
    pub detection_method: Option<DetectionMethod>,
    pub detection_time_ms: u64,
    pub fix_generated: bool,
    pub fix_type: Option<String>,
    pub fix_generation_time_ms: u64,
    pub fix_applied: bool,
    pub fix_success: bool,
    pub fix_application_time_ms: u64,
    pub post_fix_verification_passed: bool,
    pub post_fix_verification_time_ms: u64,
    pub total_processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl DiagnosisMetricsRecord {
    /// Record with every stage unset
    pub fn new(ticket_id: &str) -> Self {
        Self {
            ticket_id: ticket_id.to_string(),
            problem_detected: false,
            problem_type: None,
            detection_method: None,
            detection_time_ms: 0,
            fix_generated: false,
            fix_type: None,
            fix_generation_time_ms: 0,
            fix_applied: false,
            fix_success: false,
            fix_application_time_ms: 0,
            post_fix_verification_passed: false,
            post_fix_verification_time_ms: 0,
            total_processing_time_ms: 0,
            created_at: Utc::now(),
        }
    }
}

/// Marker for a rate that cannot be derived from the data model.
///
/// Undetected problems leave no trace, so there is no ground truth for a
/// false-negative rate. Serializes as the string `"unmeasured"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unmeasured;

impl Serialize for Unmeasured {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("unmeasured")
    }
}

impl<'de> Deserialize<'de> for Unmeasured {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value == "unmeasured" {
            Ok(Unmeasured)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected \"unmeasured\", got {:?}",
                value
            )))
        }
    }
}

impl std::fmt::Display for Unmeasured {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unmeasured")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Aggregate over a window of records. All rates are in 0..=1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRateMetrics {
    pub problem_detection_rate: f64,
    pub fix_generation_rate: f64,
    pub fix_success_rate: f64,
    /// Detections whose fix was verified as not working, or never confirmed
    pub false_positive_rate: f64,
    /// Detections whose fix was generated but never applied: plan-only
    /// matches, fixes held at the approval gate or rejected by the whitelist.
    /// No post-fix verification ran for these, so they are not false positives.
    #[serde(default)]
    pub unapplied_fix_rate: f64,
    pub false_negative_rate: Unmeasured,
    pub average_processing_time_ms: f64,
    pub total_tickets: usize,
    pub period: Period,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl SuccessRateMetrics {
    /// Aggregate the records created within `[start, end]`
    pub fn aggregate(
        records: &[DiagnosisMetricsRecord],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        let window: Vec<_> = records
            .iter()
            .filter(|r| r.created_at >= start && r.created_at <= end)
            .collect();

        let total = window.len();
        let detected = window.iter().filter(|r| r.problem_detected).count();
        let generated = window.iter().filter(|r| r.fix_generated).count();
        let applied = window.iter().filter(|r| r.fix_applied).count();
        let succeeded = window.iter().filter(|r| r.fix_success).count();
        let unapplied = window
            .iter()
            .filter(|r| r.problem_detected && r.fix_generated && !r.fix_applied)
            .count();
        let false_positives = window
            .iter()
            .filter(|r| r.problem_detected && !r.post_fix_verification_passed)
            .filter(|r| !(r.fix_generated && !r.fix_applied))
            .count();
        let total_time: u64 = window.iter().map(|r| r.total_processing_time_ms).sum();

        Self {
            problem_detection_rate: ratio(detected, total),
            fix_generation_rate: ratio(generated, detected),
            fix_success_rate: ratio(succeeded, applied),
            false_positive_rate: ratio(false_positives, detected),
            unapplied_fix_rate: ratio(unapplied, detected),
            false_negative_rate: Unmeasured,
            average_processing_time_ms: if total == 0 {
                0.0
            } else {
                total_time as f64 / total as f64
            },
            total_tickets: total,
            period: Period { start, end },
        }
    }

    /// Aggregate over the last `days` days ending now
    pub fn for_last_days(records: &[DiagnosisMetricsRecord], days: i64) -> Self {
        let end = Utc::now();
        Self::aggregate(records, end - Duration::days(days), end)
    }

    /// Aggregate over the last 24 hours
    pub fn current(records: &[DiagnosisMetricsRecord]) -> Self {
        let end = Utc::now();
        Self::aggregate(records, end - Duration::hours(24), end)
    }
}
