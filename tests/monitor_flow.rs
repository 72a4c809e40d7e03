// Integration tests for the proctoring monitor
// An in-process warp WebSocket server stands in for the proctoring server; the
// monitor connects to it over a real socket and is driven end to end.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use proctor_monitor::api;
use proctor_monitor::config::ProctoringConfig;
use proctor_monitor::proctoring::dispatcher::{DEFAULT_AUTO_SUBMIT_REASON, DEFAULT_WARNING};
use proctor_monitor::proctoring::{
    CommandDispatcher, ConnectionHandle, ConnectionManager, ConnectionStatus, DispatchOutcome,
    MonitorView, StudentStatus,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum ServerPush {
    Event(Value),
    Close,
}

struct FakeProctoringServer {
    url: String,
    received: mpsc::UnboundedReceiver<Value>,
    push: broadcast::Sender<ServerPush>,
    task: JoinHandle<()>,
}

impl FakeProctoringServer {
    async fn start(snapshot: Value) -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);
        let pushes = push.clone();

        let route = warp::path("proctoring").and(warp::ws()).map(move |ws: warp::ws::Ws| {
            let received_tx = received_tx.clone();
            let pushes = pushes.subscribe();
            let snapshot = snapshot.clone();
            ws.on_upgrade(move |socket| serve_monitor(socket, received_tx, pushes, snapshot))
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));

        Self {
            url: format!("ws://{}/proctoring", addr),
            received,
            push,
            task: tokio::spawn(server),
        }
    }

    fn send_event(&self, event: &str, data: Value) {
        self.push
            .send(ServerPush::Event(json!({ "event": event, "data": data })))
            .expect("no monitor connected");
    }

    fn close_connections(&self) {
        self.push.send(ServerPush::Close).expect("no monitor connected");
    }

    /// Next message from the monitor with the given event name
    async fn expect_event(&mut self, name: &str) -> Value {
        self.events_until(name).await.pop().expect("at least the awaited event")
    }

    /// Every message received up to and including the next `name` event
    async fn events_until(&mut self, name: &str) -> Vec<Value> {
        timeout(WAIT, async {
            let mut seen = Vec::new();
            loop {
                match self.received.recv().await {
                    Some(message) => {
                        let done = message["event"] == name;
                        seen.push(message);
                        if done {
                            return seen;
                        }
                    }
                    None => panic!("fake server stopped"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("monitor never sent {}", name))
    }

    /// Messages received so far and not yet consumed
    fn drain(&mut self) -> Vec<Value> {
        let mut seen = Vec::new();
        while let Ok(message) = self.received.try_recv() {
            seen.push(message);
        }
        seen
    }
}

impl Drop for FakeProctoringServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_monitor(
    socket: WebSocket,
    received: mpsc::UnboundedSender<Value>,
    mut pushes: broadcast::Receiver<ServerPush>,
    snapshot: Value,
) {
    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            incoming = rx.next() => {
                let Some(Ok(message)) = incoming else { break };
                let Ok(text) = message.to_str() else { continue };
                let Ok(value) = serde_json::from_str::<Value>(text) else { continue };

                let reply = match value["event"].as_str() {
                    Some("get_active_students") => {
                        Some(json!({ "event": "active_students_list", "data": snapshot }))
                    }
                    Some("ping") => Some(json!({
                        "event": "pong",
                        "data": { "timestamp": value["data"]["timestamp"] }
                    })),
                    _ => None,
                };
                let _ = received.send(value);

                if let Some(reply) = reply {
                    if tx.send(Message::text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
            push = pushes.recv() => match push {
                Ok(ServerPush::Event(event)) => {
                    if tx.send(Message::text(event.to_string())).await.is_err() {
                        break;
                    }
                }
                Ok(ServerPush::Close) => {
                    let _ = tx.send(Message::close()).await;
                    // Report whether the monitor completed the close handshake
                    let replied = timeout(WAIT, async {
                        while let Some(Ok(message)) = rx.next().await {
                            if message.is_close() {
                                return true;
                            }
                        }
                        false
                    })
                    .await
                    .unwrap_or(false);
                    if replied {
                        let _ = received.send(json!({ "event": "close_reply" }));
                    }
                    break;
                }
                Err(_) => break,
            },
        }
    }
}

fn one_student_snapshot() -> Value {
    json!({ "students": [
        { "id": "s1", "name": "Ann", "email": "ann@example.com", "assessmentId": "a1",
          "assessmentTitle": "Mathematics Final", "status": "active" }
    ]})
}

fn monitor_config(url: &str) -> ProctoringConfig {
    ProctoringConfig {
        server_url: url.to_string(),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        ..ProctoringConfig::default()
    }
}

fn start_monitor(config: ProctoringConfig) -> (ConnectionHandle, JoinHandle<()>) {
    let (manager, handle) = ConnectionManager::new(config);
    (handle, tokio::spawn(manager.run()))
}

async fn wait_view(
    handle: &ConnectionHandle,
    predicate: impl FnMut(&Arc<MonitorView>) -> bool,
) -> Arc<MonitorView> {
    let mut views = handle.subscribe_view();
    let view = timeout(WAIT, views.wait_for(predicate))
        .await
        .expect("view never reached the expected state")
        .expect("monitor stopped")
        .clone();
    view
}

/// Connects and waits until the first snapshot has been applied
async fn connected_monitor(
    server: &mut FakeProctoringServer,
    config: ProctoringConfig,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (handle, task) = start_monitor(config);
    handle.connect().unwrap();
    server.expect_event("get_active_students").await;
    wait_view(&handle, |v| {
        v.status == ConnectionStatus::Connected && !v.students.is_empty() && !v.awaiting_snapshot
    })
    .await;
    (handle, task)
}

async fn stop(handle: ConnectionHandle, task: JoinHandle<()>) {
    handle.shutdown().unwrap();
    timeout(WAIT, task).await.expect("monitor did not stop").unwrap();
}

#[tokio::test]
async fn test_connect_joins_as_admin_and_requests_snapshot() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let (handle, task) = start_monitor(monitor_config(&server.url));

    handle.connect().unwrap();
    let join = server.expect_event("join_proctoring_session").await;
    assert_eq!(join["data"]["role"], "admin");
    let request = server.expect_event("get_active_students").await;
    assert_eq!(request["data"], json!({}));

    let view = wait_view(&handle, |v| v.students.len() == 1).await;
    assert_eq!(view.status, ConnectionStatus::Connected);
    assert_eq!(view.students[0].name, "Ann");
    assert!(view
        .notices
        .iter()
        .any(|n| n.message == "Connected to proctoring server"));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_snapshot_then_join_builds_exam_summary() {
    let mut server = FakeProctoringServer::start(json!({ "students": [
        { "id": "s1", "name": "Ann", "assessmentId": "a1", "status": "active" }
    ]}))
    .await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    server.send_event(
        "student_joined_proctoring",
        json!({ "studentId": "s2", "assessmentId": "a1" }),
    );
    let view = wait_view(&handle, |v| v.students.len() == 2).await;

    let exam = view.exam("a1").expect("exam a1 summarized");
    assert_eq!(exam.students_count, 2);
    assert_eq!(exam.active_students, 2);
    assert_eq!(view.counts.total, 2);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_high_violation_flags_student_live() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    server.send_event(
        "proctoring_violation",
        json!({ "studentId": "s1", "violation": {
            "type": "gaze", "severity": "high", "description": "Looking away"
        }}),
    );
    let view = wait_view(&handle, |v| v.violation_count == 1).await;

    assert_eq!(view.student("s1").unwrap().status, StudentStatus::Flagged);
    let flagged = &view.overview.flagged_behaviors[0];
    assert_eq!(flagged.student_name, "Ann");
    assert_eq!(flagged.exam_id, "a1");

    let detail = handle.student_detail("s1").await.unwrap().unwrap();
    assert_eq!(detail.violations.len(), 1);
    assert!(handle.mark_reviewed(&flagged.id).await.unwrap());
    let view = wait_view(&handle, |v| v.overview.flagged_behaviors[0].reviewed).await;
    assert_eq!(view.violation_count, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_auto_submit_is_optimistic() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;
    let dispatcher = CommandDispatcher::new(handle.clone());

    let outcome = dispatcher.auto_submit("s1", "", &|_: &str| true).await;
    assert_eq!(outcome, DispatchOutcome::Sent);

    // No inbound confirmation has been sent by the server at this point
    let view = handle.view();
    assert_eq!(view.student("s1").unwrap().status, StudentStatus::Disconnected);
    assert!(view
        .notices
        .iter()
        .any(|n| n.message == "Assessment auto-submitted for student"));

    let message = server.expect_event("admin_message").await;
    assert_eq!(
        message["data"],
        json!({ "studentId": "s1", "type": "auto_submit", "message": DEFAULT_AUTO_SUBMIT_REASON })
    );

    stop(handle, task).await;
}

#[tokio::test]
async fn test_declined_auto_submit_sends_nothing() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;
    let dispatcher = CommandDispatcher::new(handle.clone());

    let outcome = dispatcher.auto_submit("s1", "cheating", &|_: &str| false).await;
    assert_eq!(outcome, DispatchOutcome::Declined);
    assert_eq!(handle.view().student("s1").unwrap().status, StudentStatus::Active);

    // The next admin message the server sees is the warning, not an auto-submit
    assert_eq!(dispatcher.send_warning("s1", "").await, DispatchOutcome::Sent);
    let message = server.expect_event("admin_message").await;
    assert_eq!(message["data"]["type"], "warning");
    assert_eq!(message["data"]["message"], DEFAULT_WARNING);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_unconfirmed_auto_submit_is_reported_until_student_leaves() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = ProctoringConfig {
        auto_submit_confirm_timeout: Duration::from_secs(1),
        ..monitor_config(&server.url)
    };
    let (handle, task) = connected_monitor(&mut server, config).await;
    let dispatcher = CommandDispatcher::new(handle.clone());

    dispatcher.auto_submit("s1", "", &|_: &str| true).await;
    let view = wait_view(&handle, |v| !v.unconfirmed_auto_submits.is_empty()).await;
    assert_eq!(view.unconfirmed_auto_submits, vec!["s1".to_string()]);
    // Reported only; the optimistic transition stands
    assert_eq!(view.student("s1").unwrap().status, StudentStatus::Disconnected);

    server.send_event("student_left_proctoring", json!({ "studentId": "s1" }));
    wait_view(&handle, |v| v.unconfirmed_auto_submits.is_empty()).await;

    stop(handle, task).await;
}

#[tokio::test]
async fn test_server_close_reconnects_without_losing_state() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    server.send_event(
        "proctoring_violation",
        json!({ "studentId": "s1", "violation": { "type": "noise", "severity": "low" } }),
    );
    server.send_event(
        "student_joined_proctoring",
        json!({ "studentId": "s9", "assessmentId": "a9" }),
    );
    wait_view(&handle, |v| v.violation_count == 1 && v.students.len() == 2).await;

    server.close_connections();
    server.expect_event("join_proctoring_session").await;
    let view = wait_view(&handle, |v| {
        v.status == ConnectionStatus::Connected
            && v.notices.iter().any(|n| n.message == "Reconnected to proctoring server")
    })
    .await;

    // s9 is not in the server's snapshot but stays tracked
    assert_eq!(view.students.len(), 2);
    assert_eq!(view.violation_count, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_server_close_is_answered_with_close_frame() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    server.close_connections();
    server.expect_event("close_reply").await;

    stop(handle, task).await;
}

#[tokio::test]
async fn test_connect_while_connected_is_ignored() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    handle.connect().unwrap();
    handle.ping().unwrap();
    let mut seen = server.events_until("ping").await;
    sleep(Duration::from_millis(300)).await;
    seen.extend(server.drain());

    assert!(seen.iter().all(|m| m["event"] != "join_proctoring_session"));
    assert_eq!(handle.status(), ConnectionStatus::Connected);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_refresh_runs_only_while_connected() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = ProctoringConfig {
        refresh_interval: Duration::from_secs(1),
        ..monitor_config(&server.url)
    };
    let (handle, task) = connected_monitor(&mut server, config).await;

    // Periodic refresh while the link is up
    server.expect_event("get_active_students").await;

    handle.disconnect().unwrap();
    wait_view(&handle, |v| v.status == ConnectionStatus::Disconnected).await;
    sleep(Duration::from_millis(200)).await;
    server.drain();

    sleep(Duration::from_millis(2500)).await;
    assert!(server
        .drain()
        .iter()
        .all(|m| m["event"] != "get_active_students"));

    handle.connect().unwrap();
    server.expect_event("join_proctoring_session").await;
    server.expect_event("get_active_students").await;
    // The tick resumes after reconnecting
    server.expect_event("get_active_students").await;

    stop(handle, task).await;
}

#[tokio::test]
async fn test_disconnect_stops_commands_and_does_not_retry() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;
    let dispatcher = CommandDispatcher::new(handle.clone());

    handle.disconnect().unwrap();
    wait_view(&handle, |v| v.status == ConnectionStatus::Disconnected).await;

    assert_eq!(dispatcher.send_warning("s1", "hello").await, DispatchOutcome::Offline);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    assert_eq!(handle.view().students.len(), 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_ping_reports_latency() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    handle.ping().unwrap();
    let ping = server.expect_event("ping").await;
    assert!(ping["data"]["timestamp"].as_i64().is_some());

    let view = wait_view(&handle, |v| v.latency_ms.is_some()).await;
    assert!(view.latency_ms.unwrap() >= 0);
    assert!(view
        .notices
        .iter()
        .any(|n| n.message.starts_with("Connection test successful! Latency: ")));

    stop(handle, task).await;
}

#[tokio::test]
async fn test_assessment_started_triggers_snapshot() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    server.send_event("assessment_started", json!({ "assessmentId": "a1" }));
    server.expect_event("get_active_students").await;

    stop(handle, task).await;
}

#[tokio::test]
async fn test_dashboard_routes_against_live_monitor() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;
    let routes = api::routes(handle.clone());

    let response = warp::test::request()
        .method("GET")
        .path("/proctoring/students/s1")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["student"]["name"], "Ann");

    let response = warp::test::request()
        .method("GET")
        .path("/proctoring/exams/a1")
        .reply(&routes)
        .await;
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["exam"]["title"], "Mathematics Final");
    assert!(body["progress"].as_f64().unwrap() <= 100.0);

    let response = warp::test::request()
        .method("POST")
        .path("/proctoring/students/s1/auto-submit")
        .json(&json!({ "reason": "Phone detected" }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = warp::test::request()
        .method("POST")
        .path("/proctoring/students/s1/auto-submit")
        .json(&json!({ "reason": "Phone detected", "confirm": true }))
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let message = server.expect_event("admin_message").await;
    assert_eq!(message["data"]["message"], "Phone detected");

    let response = warp::test::request()
        .method("POST")
        .path("/proctoring/refresh")
        .reply(&routes)
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    server.expect_event("get_active_students").await;

    stop(handle, task).await;
}

#[tokio::test]
async fn test_live_feed_pushes_view() {
    let mut server = FakeProctoringServer::start(one_student_snapshot()).await;
    let config = monitor_config(&server.url);
    let (handle, task) = connected_monitor(&mut server, config).await;

    let (addr, dashboard) = warp::serve(api::routes(handle.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
    let dashboard = tokio::spawn(dashboard);

    let url = format!("ws://{}/proctoring/live", addr);
    let (mut feed, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let first = timeout(WAIT, feed.next()).await.unwrap().unwrap().unwrap();
    let view: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(view["status"], "connected");
    assert_eq!(view["students"][0]["id"], "s1");

    server.send_event("student_left_proctoring", json!({ "studentId": "s1" }));
    let update = timeout(WAIT, async {
        loop {
            let frame = feed.next().await.unwrap().unwrap();
            let view: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            if view["students"][0]["status"] == "disconnected" {
                return view;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update["counts"]["disconnected"], 1);

    feed.close(None).await.unwrap();
    dashboard.abort();
    stop(handle, task).await;
}
