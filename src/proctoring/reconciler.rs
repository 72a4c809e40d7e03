use chrono::{DateTime, Utc};

use super::ledger::ViolationLedger;
use super::model::{
    generate_violation_id, LiveStudent, ProctoringViolation, Severity, StudentStatus,
    UNKNOWN_ASSESSMENT, UNKNOWN_STUDENT, UNKNOWN_VIOLATOR,
};
use super::protocol::{
    FramePayload, InboundEvent, JoinedPayload, SnapshotPayload, StatusPayload, StudentSnapshot,
    ViolationPayload,
};

/// Work the connection layer has to do after an event was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    RequestSnapshot,
    /// Round trip of a ping, in milliseconds
    Latency(i64),
}

/// Canonical live state: the student collection and the violation ledger.
///
/// Events are applied one at a time in arrival order; the later event
/// always wins for a given field. Time is passed in so replays are
/// deterministic.
#[derive(Debug, Default)]
pub struct SessionState {
    students: Vec<LiveStudent>,
    ledger: ViolationLedger,
    prune_on_snapshot: bool,
    revision: u64,
}

impl SessionState {
    pub fn new(prune_on_snapshot: bool) -> Self {
        Self {
            prune_on_snapshot,
            ..Self::default()
        }
    }

    pub fn students(&self) -> &[LiveStudent] {
        &self.students
    }

    pub fn student(&self, student_id: &str) -> Option<&LiveStudent> {
        self.students.iter().find(|s| s.id == student_id)
    }

    pub fn ledger(&self) -> &ViolationLedger {
        &self.ledger
    }

    /// Bumped on every change to the student collection
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn mark_reviewed(&mut self, violation_id: &str) -> bool {
        self.ledger.mark_reviewed(violation_id)
    }

    /// Optimistic local transition used after an auto-submit was sent
    pub fn mark_disconnected(&mut self, student_id: &str) -> bool {
        self.set_status(student_id, StudentStatus::Disconnected)
    }

    pub fn apply(&mut self, event: &InboundEvent, now: DateTime<Utc>) -> Option<FollowUp> {
        match event {
            InboundEvent::ActiveStudentsList(snapshot) => {
                self.apply_snapshot(snapshot, now);
                None
            }
            InboundEvent::StudentJoined(joined) => {
                self.apply_join(joined, now);
                None
            }
            InboundEvent::StudentLeft(left) => {
                if let Some(student_id) = left.student_id.as_deref() {
                    tracing::info!(student_id = %student_id, "Student left proctoring");
                    self.set_status(student_id, StudentStatus::Disconnected);
                }
                None
            }
            InboundEvent::VideoFrame(frame) => {
                self.apply_frame(frame, now);
                None
            }
            InboundEvent::ProctoringData(data) => {
                self.apply_status_data(data);
                None
            }
            InboundEvent::Violation(violation) => {
                self.apply_violation(violation, now);
                None
            }
            InboundEvent::StatusUpdate(update) => {
                if let (Some(student_id), Some(status)) = (update.student_id.as_deref(), update.status) {
                    self.set_status(student_id, status);
                }
                None
            }
            InboundEvent::AssessmentStarted => Some(FollowUp::RequestSnapshot),
            InboundEvent::AssessmentEnded(ended) => {
                if let Some(assessment_id) = ended.assessment_id.as_deref() {
                    self.remove_assessment(assessment_id);
                }
                None
            }
            InboundEvent::Pong(pong) => {
                let sent = pong.timestamp?;
                match now.timestamp_millis().checked_sub(sent) {
                    Some(latency) if latency >= 0 => Some(FollowUp::Latency(latency)),
                    _ => {
                        tracing::warn!(timestamp = sent, "Pong timestamp out of range, ignoring");
                        None
                    }
                }
            }
            InboundEvent::Unknown(name) => {
                tracing::debug!(event = %name, "Ignoring unknown proctoring event");
                None
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: &SnapshotPayload, now: DateTime<Utc>) {
        let Some(entries) = snapshot.students.as_ref() else {
            tracing::warn!("Snapshot without a student list, ignoring");
            return;
        };

        let mut seen = Vec::with_capacity(entries.len());
        for entry in entries {
            match student_from_snapshot(entry, now) {
                Some(student) => {
                    seen.push(student.id.clone());
                    self.upsert(student);
                }
                None => tracing::warn!("Snapshot entry without a student id, skipping"),
            }
        }

        if self.prune_on_snapshot {
            let before = self.students.len();
            self.students.retain(|s| seen.contains(&s.id));
            let pruned = before - self.students.len();
            if pruned > 0 {
                tracing::info!(pruned, "Pruned students missing from snapshot");
            }
        }

        tracing::info!(
            received = entries.len(),
            tracked = self.students.len(),
            "Applied active students snapshot"
        );
        self.revision += 1;
    }

    fn apply_join(&mut self, joined: &JoinedPayload, now: DateTime<Utc>) {
        let Some(student_id) = joined.student_id.as_deref() else {
            tracing::warn!("Join event without a student id, ignoring");
            return;
        };

        if let Some(existing) = self.students.iter_mut().find(|s| s.id == student_id) {
            existing.status = StudentStatus::Active;
            tracing::info!(student_id = %student_id, "Student rejoined proctoring");
        } else {
            let mut student = LiveStudent::joined(
                student_id,
                joined.assessment_id.clone().unwrap_or_default(),
                now,
            );
            if let Some(name) = &joined.student_name {
                student.name = name.clone();
            }
            if let Some(email) = &joined.student_email {
                student.email = email.clone();
            }
            if let Some(title) = &joined.assessment_title {
                student.assessment_title = title.clone();
            }
            tracing::info!(
                student_id = %student_id,
                assessment_id = %student.assessment_id,
                "Student joined proctoring"
            );
            self.students.push(student);
        }
        self.revision += 1;
    }

    fn apply_frame(&mut self, frame: &FramePayload, now: DateTime<Utc>) {
        let Some(student_id) = frame.student_id.as_deref() else {
            return;
        };
        let Some(student) = self.students.iter_mut().find(|s| s.id == student_id) else {
            tracing::trace!(student_id = %student_id, "Frame for unknown student");
            return;
        };

        if let Some(image) = &frame.frame {
            student.last_frame = Some(image.clone());
        }
        student.last_frame_time = Some(frame.timestamp.unwrap_or(now));

        if let Some(metadata) = &frame.metadata {
            student.face_detected = metadata.face_detected.unwrap_or(student.face_detected);
            student.audio_level = metadata.audio_level.unwrap_or(student.audio_level);
            student.violations = metadata.violations.unwrap_or(student.violations);
            student.tab_switches = metadata.tab_switches.unwrap_or(student.tab_switches);
        }

        // A frame is proof of life
        student.status = StudentStatus::Active;
        self.revision += 1;
    }

    fn apply_status_data(&mut self, data: &StatusPayload) {
        let Some(student_id) = data.student_id.as_deref() else {
            return;
        };
        let Some(student) = self.students.iter_mut().find(|s| s.id == student_id) else {
            return;
        };

        student.face_detected = data.face_detected.unwrap_or(student.face_detected);
        student.audio_level = data.audio_level.unwrap_or(student.audio_level);
        student.violations = data.violations.unwrap_or(student.violations);
        student.tab_switches = data.tab_switches.unwrap_or(student.tab_switches);
        student.status = data.status.unwrap_or(student.status);
        self.revision += 1;
    }

    fn apply_violation(&mut self, payload: &ViolationPayload, now: DateTime<Utc>) {
        let student_id = payload.student_id.clone().unwrap_or_default();
        let known = self.student(&student_id);

        let student_name = known
            .map(|s| s.name.clone())
            .or_else(|| payload.student_name.clone())
            .unwrap_or_else(|| UNKNOWN_VIOLATOR.to_string());
        let assessment_id = payload
            .assessment_id
            .clone()
            .or_else(|| known.map(|s| s.assessment_id.clone()))
            .unwrap_or_default();

        let detail = payload.violation.clone().unwrap_or_default();
        let violation = ProctoringViolation {
            id: generate_violation_id(now),
            student_id: student_id.clone(),
            student_name,
            assessment_id,
            violation_type: detail.violation_type.unwrap_or_else(|| "unknown".to_string()),
            description: detail.description.unwrap_or_default(),
            severity: detail.severity.unwrap_or_default(),
            timestamp: detail.timestamp.unwrap_or(now),
        };

        tracing::warn!(
            student_id = %violation.student_id,
            violation_type = %violation.violation_type,
            severity = ?violation.severity,
            "Proctoring violation reported"
        );

        let flag = violation.severity == Severity::High;
        self.ledger.append(violation);

        // High severity is the only way a student becomes flagged
        if flag {
            self.set_status(&student_id, StudentStatus::Flagged);
        }
    }

    fn set_status(&mut self, student_id: &str, status: StudentStatus) -> bool {
        match self.students.iter_mut().find(|s| s.id == student_id) {
            Some(student) => {
                student.status = status;
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    fn remove_assessment(&mut self, assessment_id: &str) {
        let before = self.students.len();
        self.students.retain(|s| s.assessment_id != assessment_id);
        tracing::info!(
            assessment_id = %assessment_id,
            removed = before - self.students.len(),
            "Assessment ended"
        );
        self.revision += 1;
    }

    fn upsert(&mut self, student: LiveStudent) {
        match self.students.iter_mut().find(|s| s.id == student.id) {
            Some(existing) => *existing = student,
            None => self.students.push(student),
        }
    }
}

fn student_from_snapshot(entry: &StudentSnapshot, now: DateTime<Utc>) -> Option<LiveStudent> {
    let id = entry.resolved_id()?.to_string();

    Some(LiveStudent {
        id,
        name: entry
            .student_name
            .clone()
            .or_else(|| entry.name.clone())
            .unwrap_or_else(|| UNKNOWN_STUDENT.to_string()),
        email: entry
            .student_email
            .clone()
            .or_else(|| entry.email.clone())
            .unwrap_or_default(),
        assessment_id: entry.assessment_id.clone().unwrap_or_default(),
        assessment_title: entry
            .assessment_title
            .clone()
            .unwrap_or_else(|| UNKNOWN_ASSESSMENT.to_string()),
        joined_at: entry.joined_at.unwrap_or(now),
        last_frame: entry.last_frame.clone(),
        last_frame_time: entry.last_frame_time,
        violations: entry.violations.unwrap_or(0),
        tab_switches: entry.tab_switches.unwrap_or(0),
        face_detected: entry.face_detected.unwrap_or(true),
        audio_level: entry.audio_level.unwrap_or(0.0),
        status: entry.status.unwrap_or_default(),
    })
}
