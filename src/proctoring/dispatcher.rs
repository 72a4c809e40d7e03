use chrono::{DateTime, Utc};
use serde::Serialize;

use super::connection::ConnectionHandle;
use super::model::{deadline, ConnectionStatus};
use super::protocol::{AdminMessage, AdminMessageKind, OutboundEvent};

pub const DEFAULT_WARNING: &str = "Please maintain proper exam conduct";
pub const DEFAULT_AUTO_SUBMIT_REASON: &str = "Assessment auto-submitted due to policy violation";
pub const AUTO_SUBMIT_PROMPT: &str =
    "Are you sure you want to auto-submit this student's assessment? This action cannot be undone.";

/// Asks a human to approve a destructive command
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F: Fn(&str) -> bool> Confirm for F {
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// An auto-submit that has been approved. The only way to build one is
/// through a positive confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedAutoSubmit {
    student_id: String,
    reason: String,
}

impl ConfirmedAutoSubmit {
    pub fn request<C: Confirm + ?Sized>(student_id: &str, reason: &str, confirm: &C) -> Option<Self> {
        if !confirm.confirm(AUTO_SUBMIT_PROMPT) {
            tracing::info!(student_id = %student_id, "Auto-submit declined by operator");
            return None;
        }
        Some(Self {
            student_id: student_id.to_string(),
            reason: non_empty_or(reason, DEFAULT_AUTO_SUBMIT_REASON),
        })
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Warning { student_id: String, message: String },
    AutoSubmit(ConfirmedAutoSubmit),
}

impl AdminCommand {
    pub fn warning(student_id: &str, message: &str) -> Self {
        AdminCommand::Warning {
            student_id: student_id.to_string(),
            message: non_empty_or(message, DEFAULT_WARNING),
        }
    }

    pub fn student_id(&self) -> &str {
        match self {
            AdminCommand::Warning { student_id, .. } => student_id,
            AdminCommand::AutoSubmit(submit) => submit.student_id(),
        }
    }

    pub fn to_outbound(&self) -> OutboundEvent {
        let message = match self {
            AdminCommand::Warning { student_id, message } => AdminMessage {
                student_id: student_id.clone(),
                kind: AdminMessageKind::Warning,
                message: message.clone(),
            },
            AdminCommand::AutoSubmit(submit) => AdminMessage {
                student_id: submit.student_id.clone(),
                kind: AdminMessageKind::AutoSubmit,
                message: submit.reason.clone(),
            },
        };
        OutboundEvent::AdminMessage(message)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOutcome {
    /// Written to the connection; delivery is not acknowledged
    Sent,
    /// No connection; nothing was sent or queued
    Offline,
    /// The operator did not confirm
    Declined,
}

#[derive(Debug, Clone)]
struct PendingSubmit {
    student_id: String,
    sent_at: DateTime<Utc>,
    reported: bool,
}

/// Optimistic auto-submits still waiting for `student_left_proctoring`.
/// Overdue entries are only reported; local state is never rolled back.
#[derive(Debug)]
pub struct PendingAutoSubmits {
    timeout: std::time::Duration,
    pending: Vec<PendingSubmit>,
}

impl PendingAutoSubmits {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            timeout,
            pending: Vec::new(),
        }
    }

    pub fn track(&mut self, student_id: &str, now: DateTime<Utc>) {
        self.pending.retain(|p| p.student_id != student_id);
        self.pending.push(PendingSubmit {
            student_id: student_id.to_string(),
            sent_at: now,
            reported: false,
        });
    }

    /// Returns true if the student had an outstanding auto-submit
    pub fn confirm(&mut self, student_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.student_id != student_id);
        before != self.pending.len()
    }

    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<String> {
        self.pending
            .iter()
            .filter(|p| deadline(p.sent_at, self.timeout) <= now)
            .map(|p| p.student_id.clone())
            .collect()
    }

    /// Overdue entries not reported before; each is returned once
    pub fn newly_overdue(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.timeout;
        self.pending
            .iter_mut()
            .filter(|p| !p.reported && deadline(p.sent_at, timeout) <= now)
            .map(|p| {
                p.reported = true;
                p.student_id.clone()
            })
            .collect()
    }
}

/// Operator-facing command API over a connection handle
#[derive(Clone)]
pub struct CommandDispatcher {
    handle: ConnectionHandle,
}

impl CommandDispatcher {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    pub async fn send_warning(&self, student_id: &str, message: &str) -> DispatchOutcome {
        if self.handle.status() != ConnectionStatus::Connected {
            tracing::debug!(student_id = %student_id, "Warning dropped, not connected");
            return DispatchOutcome::Offline;
        }
        self.handle.dispatch(AdminCommand::warning(student_id, message)).await
    }

    /// Asks `confirm` first; the student is shown as disconnected as soon
    /// as the command is written, without waiting for the server.
    pub async fn auto_submit<C: Confirm + ?Sized>(
        &self,
        student_id: &str,
        reason: &str,
        confirm: &C,
    ) -> DispatchOutcome {
        if self.handle.status() != ConnectionStatus::Connected {
            tracing::debug!(student_id = %student_id, "Auto-submit dropped, not connected");
            return DispatchOutcome::Offline;
        }
        match ConfirmedAutoSubmit::request(student_id, reason, confirm) {
            Some(submit) => self.handle.dispatch(AdminCommand::AutoSubmit(submit)).await,
            None => DispatchOutcome::Declined,
        }
    }
}
