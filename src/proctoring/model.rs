use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const UNKNOWN_STUDENT: &str = "Unknown Student";
pub const UNKNOWN_ASSESSMENT: &str = "Unknown Assessment";
pub const UNKNOWN_VIOLATOR: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Active,
    Flagged,
    Disconnected,
}

impl Default for StudentStatus {
    fn default() -> Self {
        Self::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// One exam-taker currently (or recently) visible to the admin
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStudent {
    pub id: String,
    pub name: String,
    pub email: String,
    pub assessment_id: String,
    pub assessment_title: String,
    pub joined_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_time: Option<DateTime<Utc>>,
    pub violations: u32,
    pub tab_switches: u32,
    pub face_detected: bool,
    pub audio_level: f64,
    pub status: StudentStatus,
}

impl LiveStudent {
    /// A freshly joined student with zeroed counters
    pub fn joined(
        id: impl Into<String>,
        assessment_id: impl Into<String>,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: UNKNOWN_STUDENT.to_string(),
            email: String::new(),
            assessment_id: assessment_id.into(),
            assessment_title: UNKNOWN_ASSESSMENT.to_string(),
            joined_at,
            last_frame: None,
            last_frame_time: None,
            violations: 0,
            tab_switches: 0,
            face_detected: true,
            audio_level: 0.0,
            status: StudentStatus::Active,
        }
    }
}

/// Immutable record of a reported rule violation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringViolation {
    pub id: String,
    pub student_id: String,
    /// Copied at creation so the entry survives the student record
    pub student_name: String,
    pub assessment_id: String,
    #[serde(rename = "type")]
    pub violation_type: String,
    pub description: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Time-based id with a random suffix so violations arriving in the same
/// millisecond stay distinct.
pub fn generate_violation_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    format!("{}-{:04x}", now.timestamp_millis(), rng.gen_range(0..0x10000u32))
}

/// `start + span`, saturating at the latest representable instant
pub fn deadline(start: DateTime<Utc>, span: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| start.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
