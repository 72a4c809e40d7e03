//! Wire format of the proctoring event stream.
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Inbound payloads are decoded field-by-field: a missing or mistyped
//! optional field becomes `None` so the reconciler can apply its fallback,
//! instead of failing the whole event.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::model::{Severity, StudentStatus};
use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinProctoringSession(JoinAsAdmin),
    GetActiveStudents(EmptyPayload),
    AdminMessage(AdminMessage),
    Ping(PingPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinAsAdmin {
    pub role: &'static str,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminMessageKind {
    Warning,
    AutoSubmit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminMessage {
    pub student_id: String,
    #[serde(rename = "type")]
    pub kind: AdminMessageKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingPayload {
    /// Epoch milliseconds, echoed back in `pong`
    pub timestamp: i64,
}

impl OutboundEvent {
    pub fn join_as_admin() -> Self {
        OutboundEvent::JoinProctoringSession(JoinAsAdmin { role: "admin" })
    }

    pub fn request_active_students() -> Self {
        OutboundEvent::GetActiveStudents(EmptyPayload {})
    }

    pub fn ping(now: DateTime<Utc>) -> Self {
        OutboundEvent::Ping(PingPayload {
            timestamp: now.timestamp_millis(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinProctoringSession(_) => "join_proctoring_session",
            OutboundEvent::GetActiveStudents(_) => "get_active_students",
            OutboundEvent::AdminMessage(_) => "admin_message",
            OutboundEvent::Ping(_) => "ping",
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events pushed by the proctoring server
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ActiveStudentsList(SnapshotPayload),
    StudentJoined(JoinedPayload),
    StudentLeft(StudentRef),
    VideoFrame(FramePayload),
    ProctoringData(StatusPayload),
    Violation(ViolationPayload),
    StatusUpdate(StatusUpdatePayload),
    AssessmentStarted,
    AssessmentEnded(AssessmentRef),
    Pong(PongPayload),
    Unknown(String),
}

impl InboundEvent {
    pub fn name(&self) -> &str {
        match self {
            InboundEvent::ActiveStudentsList(_) => "active_students_list",
            InboundEvent::StudentJoined(_) => "student_joined_proctoring",
            InboundEvent::StudentLeft(_) => "student_left_proctoring",
            InboundEvent::VideoFrame(_) => "video_frame",
            InboundEvent::ProctoringData(_) => "proctoring_data",
            InboundEvent::Violation(_) => "proctoring_violation",
            InboundEvent::StatusUpdate(_) => "student_status_update",
            InboundEvent::AssessmentStarted => "assessment_started",
            InboundEvent::AssessmentEnded(_) => "assessment_ended",
            InboundEvent::Pong(_) => "pong",
            InboundEvent::Unknown(name) => name,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let data = envelope.data;

        let event = match envelope.event.as_str() {
            "active_students_list" => InboundEvent::ActiveStudentsList(payload(data)?),
            "student_joined_proctoring" => InboundEvent::StudentJoined(payload(data)?),
            "student_left_proctoring" => InboundEvent::StudentLeft(payload(data)?),
            "video_frame" => InboundEvent::VideoFrame(payload(data)?),
            "proctoring_data" => InboundEvent::ProctoringData(payload(data)?),
            "proctoring_violation" => InboundEvent::Violation(payload(data)?),
            "student_status_update" => InboundEvent::StatusUpdate(payload(data)?),
            "assessment_started" => InboundEvent::AssessmentStarted,
            "assessment_ended" => InboundEvent::AssessmentEnded(payload(data)?),
            "pong" => InboundEvent::Pong(payload(data)?),
            other => InboundEvent::Unknown(other.to_string()),
        };

        Ok(event)
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

fn payload<T: DeserializeOwned + Default>(data: Value) -> Result<T> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|e| MonitorError::InvalidMessage(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SnapshotPayload {
    /// `None` when the server sent something other than an array
    #[serde(default, deserialize_with = "lenient_list")]
    pub students: Option<Vec<StudentSnapshot>>,
}

/// One entry of `active_students_list`. The server is inconsistent about
/// key names, so both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSnapshot {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub student_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub student_email: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub assessment_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub assessment_title: Option<String>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub violations: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub tab_switches: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub face_detected: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub audio_level: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<StudentStatus>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_frame: Option<String>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub last_frame_time: Option<DateTime<Utc>>,
}

impl StudentSnapshot {
    pub fn resolved_id(&self) -> Option<&str> {
        self.student_id.as_deref().or(self.id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub student_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub student_email: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub assessment_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub assessment_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub frame: Option<String>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub metadata: Option<FrameMetadata>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetadata {
    #[serde(default, deserialize_with = "lenient")]
    pub face_detected: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub audio_level: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub violations: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub tab_switches: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub face_detected: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub audio_level: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub violations: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub tab_switches: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<StudentStatus>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub student_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub assessment_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub violation: Option<ViolationDetail>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ViolationDetail {
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    pub violation_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub severity: Option<Severity>,
    #[serde(default, deserialize_with = "lenient_time")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    #[serde(default, deserialize_with = "lenient")]
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<StudentStatus>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRef {
    #[serde(default, deserialize_with = "lenient")]
    pub assessment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PongPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub timestamp: Option<i64>,
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_list<'de, D, T>(deserializer: D) -> std::result::Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(Some(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        )),
        _ => Ok(None),
    }
}

fn lenient_time<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value))
}

/// Accepts RFC 3339 strings and epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_join_shape() {
        let json = serde_json::to_value(OutboundEvent::join_as_admin()).unwrap();
        assert_eq!(json, json!({"event": "join_proctoring_session", "data": {"role": "admin"}}));
    }

    #[test]
    fn test_outbound_snapshot_request_shape() {
        let json = serde_json::to_value(OutboundEvent::request_active_students()).unwrap();
        assert_eq!(json, json!({"event": "get_active_students", "data": {}}));
    }

    #[test]
    fn test_outbound_admin_message_shape() {
        let event = OutboundEvent::AdminMessage(AdminMessage {
            student_id: "s1".to_string(),
            kind: AdminMessageKind::AutoSubmit,
            message: "Policy violation".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({
                "event": "admin_message",
                "data": {"studentId": "s1", "type": "auto_submit", "message": "Policy violation"}
            })
        );
        assert_eq!(event.name(), "admin_message");
    }

    #[test]
    fn test_outbound_ping_carries_millis() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let json = serde_json::to_value(OutboundEvent::ping(now)).unwrap();
        assert_eq!(json["data"]["timestamp"], 1_700_000_000_123i64);
    }

    #[test]
    fn test_decode_snapshot_accepts_both_key_spellings() {
        let text = json!({
            "event": "active_students_list",
            "data": {"students": [
                {"studentId": "s1", "studentName": "Ann", "assessmentId": "a1"},
                {"id": "s2", "name": "Bob", "assessmentId": "a1", "status": "flagged"},
                "garbage"
            ]}
        })
        .to_string();

        let event = InboundEvent::decode(&text).unwrap();
        let InboundEvent::ActiveStudentsList(snapshot) = event else {
            panic!("expected snapshot");
        };
        let students = snapshot.students.unwrap();
        assert_eq!(students.len(), 2);
        assert_eq!(students[0].resolved_id(), Some("s1"));
        assert_eq!(students[1].resolved_id(), Some("s2"));
        assert_eq!(students[1].status, Some(StudentStatus::Flagged));
    }

    #[test]
    fn test_decode_snapshot_without_array() {
        let text = r#"{"event":"active_students_list","data":{"students":"nope"}}"#;
        let InboundEvent::ActiveStudentsList(snapshot) = InboundEvent::decode(text).unwrap() else {
            panic!("expected snapshot");
        };
        assert!(snapshot.students.is_none());
    }

    #[test]
    fn test_decode_mistyped_fields_become_absent() {
        let text = json!({
            "event": "proctoring_data",
            "data": {"studentId": "s1", "audioLevel": "loud", "violations": 3, "status": "banned"}
        })
        .to_string();

        let InboundEvent::ProctoringData(data) = InboundEvent::decode(&text).unwrap() else {
            panic!("expected proctoring_data");
        };
        assert_eq!(data.student_id.as_deref(), Some("s1"));
        assert_eq!(data.audio_level, None);
        assert_eq!(data.violations, Some(3));
        assert_eq!(data.status, None);
    }

    #[test]
    fn test_decode_violation() {
        let text = json!({
            "event": "proctoring_violation",
            "data": {
                "studentId": "s1",
                "assessmentId": "a1",
                "violation": {
                    "type": "gaze",
                    "description": "Looking away",
                    "severity": "high",
                    "timestamp": "2024-05-01T10:00:00Z"
                }
            }
        })
        .to_string();

        let InboundEvent::Violation(payload) = InboundEvent::decode(&text).unwrap() else {
            panic!("expected violation");
        };
        let detail = payload.violation.unwrap();
        assert_eq!(detail.violation_type.as_deref(), Some("gaze"));
        assert_eq!(detail.severity, Some(Severity::High));
        assert!(detail.timestamp.is_some());
    }

    #[test]
    fn test_decode_unit_and_unknown_events() {
        assert_eq!(
            InboundEvent::decode(r#"{"event":"assessment_started","data":{}}"#).unwrap(),
            InboundEvent::AssessmentStarted
        );
        assert_eq!(
            InboundEvent::decode(r#"{"event":"assessment_started"}"#).unwrap(),
            InboundEvent::AssessmentStarted
        );
        assert_eq!(
            InboundEvent::decode(r#"{"event":"heartbeat-ack","data":{}}"#).unwrap(),
            InboundEvent::Unknown("heartbeat-ack".to_string())
        );
    }

    #[test]
    fn test_decode_rejects_non_envelope() {
        assert!(InboundEvent::decode("not json").is_err());
        assert!(InboundEvent::decode(r#"{"data":{}}"#).is_err());
        assert!(matches!(
            InboundEvent::decode(r#"{"event":"video_frame","data":"frame"}"#),
            Err(MonitorError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let from_str = parse_timestamp(&json!("2024-05-01T10:00:00Z")).unwrap();
        let from_millis = parse_timestamp(&json!(from_str.timestamp_millis())).unwrap();
        assert_eq!(from_str, from_millis);
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
    }
}
