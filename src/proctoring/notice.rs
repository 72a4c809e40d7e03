use chrono::{DateTime, Utc};
use serde::Serialize;

use super::model::deadline;
use crate::config::NoticeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
}

/// Transient banner shown to the operator, dismissed on expiry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub expires_at: DateTime<Utc>,
}

/// Holds at most one banner per kind; a newer one replaces the older.
#[derive(Debug)]
pub struct Notices {
    config: NoticeConfig,
    success: Option<Notice>,
    error: Option<Notice>,
}

impl Notices {
    pub fn new(config: NoticeConfig) -> Self {
        Self {
            config,
            success: None,
            error: None,
        }
    }

    pub fn success(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.success = Some(Notice {
            kind: NoticeKind::Success,
            message: message.into(),
            expires_at: deadline(now, self.config.success_ttl),
        });
    }

    pub fn error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.error = Some(Notice {
            kind: NoticeKind::Error,
            message: message.into(),
            expires_at: deadline(now, self.config.error_ttl),
        });
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Drops expired banners; returns true if anything was removed
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for slot in [&mut self.success, &mut self.error] {
            if slot.as_ref().is_some_and(|n| n.expires_at <= now) {
                *slot = None;
                changed = true;
            }
        }
        changed
    }

    pub fn active(&self) -> Vec<Notice> {
        self.error.iter().chain(self.success.iter()).cloned().collect()
    }
}
