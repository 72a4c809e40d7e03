//! Live proctoring monitor
//!
//! Keeps a consistent picture of every student under remote proctoring by
//! reconciling the proctoring server's event stream into one canonical
//! state, and lets an operator act on it.
//!
//! - `connection`: actor task owning the WebSocket link and the state
//! - `reconciler`: pure event reducer over students and the ledger
//! - `aggregation`: per-exam summaries and the published view
//! - `dispatcher`: operator commands (warning, confirmed auto-submit)

pub mod aggregation;
pub mod connection;
pub mod dispatcher;
pub mod ledger;
pub mod model;
pub mod notice;
pub mod protocol;
pub mod reconciler;
pub mod scheduler;

pub use aggregation::{ExamSummary, MonitorView, ProctoringOverview, StatusCounts, ViolationView};
pub use connection::{ConnectionHandle, ConnectionManager, StudentDetail};
pub use dispatcher::{CommandDispatcher, Confirm, DispatchOutcome};
pub use model::{ConnectionStatus, LiveStudent, ProctoringViolation, Severity, StudentStatus};
