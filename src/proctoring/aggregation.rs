//! Dashboard summaries derived from the canonical state.
//!
//! Nothing here owns state: every summary is recomputed from the student
//! collection and the ledger, and the memo only skips the recomputation
//! when neither input changed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ledger::ViolationLedger;
use super::model::{
    ConnectionStatus, LiveStudent, ProctoringViolation, Severity, StudentStatus,
};
use super::notice::Notice;
use super::reconciler::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSummary {
    pub id: String,
    pub title: String,
    pub students_count: usize,
    pub active_students: usize,
    /// Students of this exam currently flagged
    pub flagged_behaviors: usize,
    /// Earliest join observed for the exam
    pub start_time: DateTime<Utc>,
    pub duration_minutes: u32,
}

impl ExamSummary {
    /// Elapsed share of the exam window, 0 to 100
    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        let duration_ms = f64::from(self.duration_minutes) * 60_000.0;
        if duration_ms <= 0.0 {
            return 100.0;
        }
        let elapsed_ms = (now - self.start_time).num_milliseconds().max(0) as f64;
        (elapsed_ms / duration_ms * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationView {
    pub id: String,
    pub exam_id: String,
    pub student_id: String,
    pub student_name: String,
    pub student_email: String,
    pub behavior: String,
    pub violation_type: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub reviewed: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringOverview {
    pub active_exams: Vec<ExamSummary>,
    pub flagged_behaviors: Vec<ViolationView>,
    /// Completed exams are archived elsewhere; always empty here
    pub exam_history: Vec<ExamSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub active: usize,
    pub flagged: usize,
    pub disconnected: usize,
}

impl StatusCounts {
    pub fn tally(students: &[LiveStudent]) -> Self {
        students.iter().fold(Self::default(), |mut counts, student| {
            counts.total += 1;
            match student.status {
                StudentStatus::Active => counts.active += 1,
                StudentStatus::Flagged => counts.flagged += 1,
                StudentStatus::Disconnected => counts.disconnected += 1,
            }
            counts
        })
    }
}

pub fn compute_summaries(
    students: &[LiveStudent],
    ledger: &ViolationLedger,
    default_duration_minutes: u32,
) -> ProctoringOverview {
    let mut active_exams: Vec<ExamSummary> = Vec::new();

    for student in students {
        let exam = match active_exams.iter().position(|e| e.id == student.assessment_id) {
            Some(index) => &mut active_exams[index],
            None => {
                active_exams.push(ExamSummary {
                    id: student.assessment_id.clone(),
                    title: student.assessment_title.clone(),
                    students_count: 0,
                    active_students: 0,
                    flagged_behaviors: 0,
                    start_time: student.joined_at,
                    duration_minutes: default_duration_minutes,
                });
                let last = active_exams.len() - 1;
                &mut active_exams[last]
            }
        };

        exam.students_count += 1;
        exam.start_time = exam.start_time.min(student.joined_at);
        match student.status {
            StudentStatus::Active => exam.active_students += 1,
            StudentStatus::Flagged => exam.flagged_behaviors += 1,
            StudentStatus::Disconnected => {}
        }
    }

    let flagged_behaviors = ledger
        .iter()
        .map(|violation| violation_view(violation, students, ledger))
        .collect();

    ProctoringOverview {
        active_exams,
        flagged_behaviors,
        exam_history: Vec::new(),
    }
}

fn violation_view(
    violation: &ProctoringViolation,
    students: &[LiveStudent],
    ledger: &ViolationLedger,
) -> ViolationView {
    let student_email = students
        .iter()
        .find(|s| s.id == violation.student_id)
        .map(|s| s.email.clone())
        .unwrap_or_default();

    ViolationView {
        id: violation.id.clone(),
        exam_id: violation.assessment_id.clone(),
        student_id: violation.student_id.clone(),
        student_name: violation.student_name.clone(),
        student_email,
        behavior: violation.description.clone(),
        violation_type: violation.violation_type.clone(),
        severity: violation.severity,
        timestamp: violation.timestamp,
        reviewed: ledger.is_reviewed(&violation.id),
    }
}

/// Caches the last overview, keyed on the state and ledger revisions
#[derive(Debug, Default)]
pub struct SummaryMemo {
    key: Option<(u64, u64)>,
    cached: ProctoringOverview,
}

impl SummaryMemo {
    pub fn overview(&mut self, state: &SessionState, default_duration_minutes: u32) -> &ProctoringOverview {
        let key = (state.revision(), state.ledger().revision());
        if self.key != Some(key) {
            self.cached = compute_summaries(state.students(), state.ledger(), default_duration_minutes);
            self.key = Some(key);
        }
        &self.cached
    }
}

/// Everything a dashboard renders, published after every change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorView {
    pub status: ConnectionStatus,
    pub students: Vec<LiveStudent>,
    pub overview: ProctoringOverview,
    pub counts: StatusCounts,
    pub violation_count: usize,
    pub notices: Vec<Notice>,
    pub latency_ms: Option<i64>,
    pub awaiting_snapshot: bool,
    pub unconfirmed_auto_submits: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl MonitorView {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            students: Vec::new(),
            overview: ProctoringOverview::default(),
            counts: StatusCounts::default(),
            violation_count: 0,
            notices: Vec::new(),
            latency_ms: None,
            awaiting_snapshot: false,
            unconfirmed_auto_submits: Vec::new(),
            updated_at: now,
        }
    }

    pub fn student(&self, student_id: &str) -> Option<&LiveStudent> {
        self.students.iter().find(|s| s.id == student_id)
    }

    pub fn exam(&self, assessment_id: &str) -> Option<&ExamSummary> {
        self.overview.active_exams.iter().find(|e| e.id == assessment_id)
    }
}
