//! Connection manager: a single task that owns the WebSocket link to the
//! proctoring server together with the canonical session state.
//!
//! Everything else talks to it through a [`ConnectionHandle`]: commands go
//! in over an unbounded channel, connection status and the rendered
//! [`MonitorView`] come back out over `watch` channels.

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::aggregation::{MonitorView, StatusCounts, SummaryMemo};
use super::dispatcher::{AdminCommand, DispatchOutcome, PendingAutoSubmits};
use super::model::{ConnectionStatus, LiveStudent, ProctoringViolation};
use super::notice::Notices;
use super::protocol::{InboundEvent, OutboundEvent};
use super::reconciler::{FollowUp, SessionState};
use super::scheduler::{ReconnectTimer, RefreshScheduler};
use crate::config::ProctoringConfig;
use crate::error::{MonitorError, Result};

pub const CONNECTED_NOTICE: &str = "Connected to proctoring server";
pub const RECONNECTED_NOTICE: &str = "Reconnected to proctoring server";
pub const CONNECT_FAILED_NOTICE: &str =
    "Failed to connect to proctoring server. Please check your connection.";
pub const WARNING_SENT_NOTICE: &str = "Warning sent to student";
pub const AUTO_SUBMITTED_NOTICE: &str = "Assessment auto-submitted for student";

const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

type WsLink = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = Pin<Box<dyn Future<Output = Result<WsLink>> + Send>>;

/// A connect attempt in flight; polled from the run loop so commands keep
/// being served while the server is slow to answer
struct PendingHandshake {
    automatic: bool,
    future: Handshake,
}

#[derive(Debug)]
pub enum MonitorCommand {
    Connect,
    Disconnect,
    /// Drop the current link (if any) and open a fresh one
    Reconnect,
    RequestSnapshot,
    Ping,
    Dispatch {
        command: AdminCommand,
        reply: oneshot::Sender<DispatchOutcome>,
    },
    MarkReviewed {
        violation_id: String,
        reply: oneshot::Sender<bool>,
    },
    StudentDetail {
        student_id: String,
        reply: oneshot::Sender<Option<StudentDetail>>,
    },
    Shutdown,
}

/// A student record together with its violations, newest first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentDetail {
    pub student: LiveStudent,
    pub violations: Vec<ProctoringViolation>,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
    status: watch::Receiver<ConnectionStatus>,
    view: watch::Receiver<Arc<MonitorView>>,
}

impl ConnectionHandle {
    pub fn connect(&self) -> Result<()> {
        self.send(MonitorCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(MonitorCommand::Disconnect)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.send(MonitorCommand::Reconnect)
    }

    pub fn request_snapshot(&self) -> Result<()> {
        self.ensure_connected()?;
        self.send(MonitorCommand::RequestSnapshot)
    }

    pub fn ping(&self) -> Result<()> {
        self.ensure_connected()?;
        self.send(MonitorCommand::Ping)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(MonitorCommand::Shutdown)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn view(&self) -> Arc<MonitorView> {
        self.view.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<Arc<MonitorView>> {
        self.view.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Returns false when the violation id is unknown
    pub async fn mark_reviewed(&self, violation_id: &str) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.send(MonitorCommand::MarkReviewed {
            violation_id: violation_id.to_string(),
            reply,
        })?;
        response.await.map_err(|_| MonitorError::MonitorStopped)
    }

    pub async fn student_detail(&self, student_id: &str) -> Result<Option<StudentDetail>> {
        let (reply, response) = oneshot::channel();
        self.send(MonitorCommand::StudentDetail {
            student_id: student_id.to_string(),
            reply,
        })?;
        response.await.map_err(|_| MonitorError::MonitorStopped)
    }

    pub(crate) async fn dispatch(&self, command: AdminCommand) -> DispatchOutcome {
        let student_id = command.student_id().to_string();
        let (reply, response) = oneshot::channel();
        if let Err(e) = self.send(MonitorCommand::Dispatch { command, reply }) {
            tracing::error!(student_id = %student_id, error = %e, "Cannot dispatch admin command");
            return DispatchOutcome::Offline;
        }
        response.await.unwrap_or(DispatchOutcome::Offline)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(MonitorError::NotConnected)
        }
    }

    fn send(&self, command: MonitorCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MonitorError::MonitorStopped)
    }
}

pub struct ConnectionManager {
    config: ProctoringConfig,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
    view_tx: watch::Sender<Arc<MonitorView>>,
    link: Option<WsLink>,
    handshake: Option<PendingHandshake>,
    status: ConnectionStatus,
    session: SessionState,
    memo: SummaryMemo,
    notices: Notices,
    pending: PendingAutoSubmits,
    refresh: RefreshScheduler,
    reconnect: ReconnectTimer,
    latency_ms: Option<i64>,
    awaiting_snapshot: bool,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime
    pub fn new(config: ProctoringConfig) -> (Self, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (view_tx, view_rx) = watch::channel(Arc::new(MonitorView::empty(Utc::now())));

        let manager = Self {
            session: SessionState::new(config.prune_on_snapshot),
            memo: SummaryMemo::default(),
            notices: Notices::new(config.notices.clone()),
            pending: PendingAutoSubmits::new(config.auto_submit_confirm_timeout),
            refresh: RefreshScheduler::new(config.refresh_interval),
            reconnect: ReconnectTimer::default(),
            config,
            commands,
            status_tx,
            view_tx,
            link: None,
            handshake: None,
            status: ConnectionStatus::Disconnected,
            latency_ms: None,
            awaiting_snapshot: false,
        };
        let handle = ConnectionHandle {
            commands: commands_tx,
            status: status_rx,
            view: view_rx,
        };
        (manager, handle)
    }

    /// Runs until `shutdown` is requested or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!(server_url = %self.config.server_url, "Proctoring monitor started");

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(MonitorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                frame = next_frame(&mut self.link) => self.handle_frame(frame).await,
                (automatic, outcome) = next_handshake(&mut self.handshake) => {
                    self.handshake = None;
                    self.finish_open(automatic, outcome).await;
                }
                _ = self.refresh.tick(), if self.status == ConnectionStatus::Connected => {
                    tracing::debug!("Periodic snapshot refresh");
                    self.request_snapshot().await;
                    self.publish();
                }
                _ = self.reconnect.fired() => {
                    tracing::info!("Attempting reconnect to proctoring server");
                    self.open(true);
                }
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }

        self.close().await;
        self.publish();
        tracing::info!("Proctoring monitor stopped");
    }

    async fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Connect => self.open(false),
            MonitorCommand::Disconnect => {
                self.close().await;
                self.publish();
            }
            MonitorCommand::Reconnect => {
                self.close().await;
                self.open(false);
            }
            MonitorCommand::RequestSnapshot => {
                if self.status == ConnectionStatus::Connected {
                    self.request_snapshot().await;
                    self.publish();
                }
            }
            MonitorCommand::Ping => {
                if self.status == ConnectionStatus::Connected {
                    self.emit(OutboundEvent::ping(Utc::now())).await;
                }
            }
            MonitorCommand::Dispatch { command, reply } => {
                let outcome = self.dispatch(command).await;
                let _ = reply.send(outcome);
            }
            MonitorCommand::MarkReviewed { violation_id, reply } => {
                let found = self.session.mark_reviewed(&violation_id);
                if found {
                    tracing::info!(violation_id = %violation_id, "Violation marked as reviewed");
                    self.publish();
                }
                let _ = reply.send(found);
            }
            MonitorCommand::StudentDetail { student_id, reply } => {
                let detail = self.session.student(&student_id).map(|student| StudentDetail {
                    student: student.clone(),
                    violations: self
                        .session
                        .ledger()
                        .filter_by_student(&student_id)
                        .cloned()
                        .collect(),
                });
                let _ = reply.send(detail);
            }
            MonitorCommand::Shutdown => {}
        }
    }

    /// Starts a connect attempt; the outcome is handled by `finish_open`
    fn open(&mut self, automatic: bool) {
        if self.status != ConnectionStatus::Disconnected {
            tracing::debug!(status = ?self.status, "Connect ignored, link already up");
            return;
        }

        self.reconnect.cancel();
        self.set_status(ConnectionStatus::Connecting);
        self.handshake = Some(PendingHandshake {
            automatic,
            future: handshake(self.config.server_url.clone(), self.config.connect_timeout),
        });
        self.publish();
    }

    async fn finish_open(&mut self, automatic: bool, outcome: Result<WsLink>) {
        match outcome {
            Ok(link) => {
                self.link = Some(link);
                self.set_status(ConnectionStatus::Connected);
                tracing::info!(server_url = %self.config.server_url, automatic, "Connected to proctoring server");

                if self.emit(OutboundEvent::join_as_admin()).await {
                    self.request_snapshot().await;
                    self.refresh.restart();

                    self.notices.clear_error();
                    let message = if automatic { RECONNECTED_NOTICE } else { CONNECTED_NOTICE };
                    self.notices.success(message, Utc::now());
                }
            }
            Err(e) => {
                tracing::error!(
                    server_url = %self.config.server_url,
                    error = %e,
                    "Failed to connect to proctoring server"
                );
                self.set_status(ConnectionStatus::Disconnected);
                self.notices.error(CONNECT_FAILED_NOTICE, Utc::now());
            }
        }
        self.publish();
    }

    async fn close(&mut self) {
        self.reconnect.cancel();
        if self.handshake.take().is_some() {
            tracing::info!("Connect attempt cancelled");
        }
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close(None).await {
                tracing::debug!(error = %e, "Close handshake did not complete");
            }
            tracing::info!("Disconnected from proctoring server");
        }
        self.awaiting_snapshot = false;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// The link is gone without a close handshake from our side
    fn link_lost(&mut self) {
        self.link = None;
        self.awaiting_snapshot = false;
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn handle_frame(&mut self, frame: Option<std::result::Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
            Some(Ok(Message::Close(close))) => {
                let reason = close.map(|c| c.reason.to_string()).unwrap_or_default();
                tracing::warn!(reason = %reason, "Proctoring server closed the connection");
                // Flushes the queued close reply before the socket is dropped
                if let Some(mut link) = self.link.take() {
                    if let Err(e) = link.close(None).await {
                        tracing::debug!(error = %e, "Close reply not delivered");
                    }
                }
                self.link_lost();
                let delay = self.config.reconnect_delay;
                if self.reconnect.arm(delay) {
                    let delay_ms = delay.as_millis() as u64;
                    tracing::info!(delay_ms, "Reconnect scheduled");
                }
                self.publish();
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::debug!(len = data.len(), "Ignoring binary frame");
            }
            // Ping/pong control frames are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Proctoring connection lost");
                self.link_lost();
                self.publish();
            }
            None => {
                tracing::warn!("Proctoring connection ended");
                self.link_lost();
                self.publish();
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let event = match InboundEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed proctoring message");
                return;
            }
        };
        tracing::trace!(event = %event.name(), "Received proctoring event");

        match &event {
            InboundEvent::ActiveStudentsList(_) => self.awaiting_snapshot = false,
            InboundEvent::StudentLeft(left) => {
                if let Some(student_id) = left.student_id.as_deref() {
                    if self.pending.confirm(student_id) {
                        tracing::info!(student_id = %student_id, "Auto-submit confirmed by server");
                    }
                }
            }
            _ => {}
        }

        let now = Utc::now();
        match self.session.apply(&event, now) {
            Some(FollowUp::RequestSnapshot) => self.request_snapshot().await,
            Some(FollowUp::Latency(latency_ms)) => {
                tracing::info!(latency_ms, "Connection test successful");
                self.latency_ms = Some(latency_ms);
                self.notices.success(
                    format!("Connection test successful! Latency: {}ms", latency_ms),
                    now,
                );
            }
            None => {}
        }
        self.publish();
    }

    async fn dispatch(&mut self, command: AdminCommand) -> DispatchOutcome {
        if self.status != ConnectionStatus::Connected {
            return DispatchOutcome::Offline;
        }
        if !self.emit(command.to_outbound()).await {
            self.publish();
            return DispatchOutcome::Offline;
        }

        let now = Utc::now();
        match &command {
            AdminCommand::Warning { student_id, .. } => {
                tracing::info!(student_id = %student_id, "Warning sent to student");
                self.notices.success(WARNING_SENT_NOTICE, now);
            }
            AdminCommand::AutoSubmit(submit) => {
                let student_id = submit.student_id();
                tracing::info!(student_id = %student_id, "Auto-submit sent to student");
                self.session.mark_disconnected(student_id);
                self.pending.track(student_id, now);
                self.notices.success(AUTO_SUBMITTED_NOTICE, now);
            }
        }
        self.publish();
        DispatchOutcome::Sent
    }

    async fn request_snapshot(&mut self) {
        if self.emit(OutboundEvent::request_active_students()).await {
            self.awaiting_snapshot = true;
        }
    }

    /// Sends one event; a failed write takes the link down
    async fn emit(&mut self, event: OutboundEvent) -> bool {
        match self.send(&event).await {
            Ok(()) => {
                tracing::debug!(event = event.name(), "Sent proctoring event");
                true
            }
            Err(MonitorError::NetworkError(reason)) => {
                tracing::warn!(event = event.name(), error = %reason, "Write failed, dropping link");
                self.link_lost();
                false
            }
            Err(e) => {
                tracing::error!(event = event.name(), error = %e, "Failed to send proctoring event");
                false
            }
        }
    }

    async fn send(&mut self, event: &OutboundEvent) -> Result<()> {
        let link = self.link.as_mut().ok_or(MonitorError::NotConnected)?;
        let text = event.encode()?;
        link.send(Message::Text(text))
            .await
            .map_err(|e| MonitorError::network(e.to_string()))
    }

    fn housekeeping(&mut self) {
        let now = Utc::now();
        let mut changed = self.notices.expire(now);
        for student_id in self.pending.newly_overdue(now) {
            tracing::warn!(
                student_id = %student_id,
                timeout_secs = self.config.auto_submit_confirm_timeout.as_secs(),
                "Auto-submit not confirmed by server, local state kept"
            );
            changed = true;
        }
        if changed {
            self.publish();
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            tracing::debug!(from = ?self.status, to = ?status, "Connection status changed");
        }
        self.status = status;
        self.status_tx.send_replace(status);
    }

    fn publish(&mut self) {
        let now = Utc::now();
        let overview = self
            .memo
            .overview(&self.session, self.config.default_exam_minutes)
            .clone();
        let students = self.session.students();

        let view = MonitorView {
            status: self.status,
            students: students.to_vec(),
            overview,
            counts: StatusCounts::tally(students),
            violation_count: self.session.ledger().count_all(),
            notices: self.notices.active(),
            latency_ms: self.latency_ms,
            awaiting_snapshot: self.awaiting_snapshot,
            unconfirmed_auto_submits: self.pending.overdue(now),
            updated_at: now,
        };
        self.view_tx.send_replace(Arc::new(view));
    }
}

fn handshake(url: String, limit: Duration) -> Handshake {
    Box::pin(async move {
        match timeout(limit, connect_async(url.as_str())).await {
            Ok(Ok((link, _response))) => Ok(link),
            Ok(Err(e)) => Err(MonitorError::Handshake(e)),
            Err(_) => Err(MonitorError::ConnectTimeout(limit.as_secs())),
        }
    })
}

/// Outcome of the connect attempt in flight; pending forever while there is none
async fn next_handshake(pending: &mut Option<PendingHandshake>) -> (bool, Result<WsLink>) {
    match pending.as_mut() {
        Some(attempt) => (attempt.automatic, (&mut attempt.future).await),
        None => future::pending().await,
    }
}

/// Next frame from the link; pending forever while there is no link
async fn next_frame(link: &mut Option<WsLink>) -> Option<std::result::Result<Message, WsError>> {
    match link.as_mut() {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}
