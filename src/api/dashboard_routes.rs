use std::convert::Infallible;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

use super::dashboard_websocket;
use crate::error::MonitorError;
use crate::proctoring::{CommandDispatcher, ConnectionHandle, DispatchOutcome};

type StatusReply = WithStatus<Json>;

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct StudentsQuery {
    pub assessment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ViolationsQuery {
    pub student: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WarningRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AutoSubmitRequest {
    #[serde(default)]
    pub reason: String,
    /// Explicit operator confirmation; absent means not confirmed
    #[serde(default)]
    pub confirm: bool,
}

/// All dashboard routes under `/proctoring`
pub fn routes(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    health(handle.clone())
        .or(summary(handle.clone()))
        .or(students(handle.clone()))
        .or(student_detail(handle.clone()))
        .or(exam(handle.clone()))
        .or(violations(handle.clone()))
        .or(review_violation(handle.clone()))
        .or(send_warning(handle.clone()))
        .or(auto_submit(handle.clone()))
        .or(refresh(handle.clone()))
        .or(reconnect(handle.clone()))
        .or(ping(handle.clone()))
        .or(live(handle))
}

pub fn health(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "health")
        .and(warp::get())
        .and(with_handle(handle))
        .map(|handle: ConnectionHandle| {
            warp::reply::json(&json!({
                "status": "healthy",
                "service": "Proctoring Monitor",
                "version": env!("CARGO_PKG_VERSION"),
                "connection": handle.status(),
            }))
        })
}

pub fn summary(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "summary")
        .and(warp::get())
        .and(with_handle(handle))
        .map(|handle: ConnectionHandle| {
            let view = handle.view();
            warp::reply::json(&json!({
                "status": view.status,
                "overview": view.overview,
                "counts": view.counts,
                "violationCount": view.violation_count,
                "notices": view.notices,
                "latencyMs": view.latency_ms,
                "awaitingSnapshot": view.awaiting_snapshot,
                "unconfirmedAutoSubmits": view.unconfirmed_auto_submits,
                "updatedAt": view.updated_at,
            }))
        })
}

pub fn students(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "students")
        .and(warp::get())
        .and(warp::query::<StudentsQuery>())
        .and(with_handle(handle))
        .map(|query: StudentsQuery, handle: ConnectionHandle| {
            let view = handle.view();
            let students: Vec<_> = view
                .students
                .iter()
                .filter(|s| {
                    query
                        .assessment
                        .as_deref()
                        .map_or(true, |assessment| s.assessment_id == assessment)
                })
                .collect();
            warp::reply::json(&students)
        })
}

pub fn student_detail(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "students" / String)
        .and(warp::get())
        .and(with_handle(handle))
        .and_then(|student_id: String, handle: ConnectionHandle| async move {
            let student_id = decode_segment(student_id);
            let reply = match handle.student_detail(&student_id).await {
                Ok(Some(detail)) => warp::reply::with_status(warp::reply::json(&detail), StatusCode::OK),
                Ok(None) => not_found("student", &student_id),
                Err(e) => error_reply(&e),
            };
            Ok::<_, Infallible>(reply)
        })
}

pub fn exam(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "exams" / String)
        .and(warp::get())
        .and(with_handle(handle))
        .map(|assessment_id: String, handle: ConnectionHandle| {
            let assessment_id = decode_segment(assessment_id);
            let view = handle.view();
            match view.exam(&assessment_id) {
                Some(exam) => warp::reply::with_status(
                    warp::reply::json(&json!({
                        "exam": exam,
                        "progress": exam.progress(Utc::now()),
                    })),
                    StatusCode::OK,
                ),
                None => not_found("exam", &assessment_id),
            }
        })
}

pub fn violations(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "violations")
        .and(warp::get())
        .and(warp::query::<ViolationsQuery>())
        .and(with_handle(handle))
        .map(|query: ViolationsQuery, handle: ConnectionHandle| {
            let view = handle.view();
            let violations: Vec<_> = view
                .overview
                .flagged_behaviors
                .iter()
                .filter(|v| {
                    query
                        .student
                        .as_deref()
                        .map_or(true, |student_id| v.student_id == student_id)
                })
                .collect();
            warp::reply::json(&violations)
        })
}

pub fn review_violation(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "violations" / String / "review")
        .and(warp::post())
        .and(with_handle(handle))
        .and_then(|violation_id: String, handle: ConnectionHandle| async move {
            let violation_id = decode_segment(violation_id);
            let reply = match handle.mark_reviewed(&violation_id).await {
                Ok(true) => warp::reply::with_status(
                    warp::reply::json(&json!({ "id": violation_id, "reviewed": true })),
                    StatusCode::OK,
                ),
                Ok(false) => not_found("violation", &violation_id),
                Err(e) => error_reply(&e),
            };
            Ok::<_, Infallible>(reply)
        })
}

pub fn send_warning(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "students" / String / "warning")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<WarningRequest>())
        .and(with_dispatcher(handle))
        .and_then(
            |student_id: String, request: WarningRequest, dispatcher: CommandDispatcher| async move {
                let student_id = decode_segment(student_id);
                let outcome = dispatcher.send_warning(&student_id, &request.message).await;
                Ok::<_, Infallible>(outcome_reply(&student_id, outcome))
            },
        )
}

pub fn auto_submit(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "students" / String / "auto-submit")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<AutoSubmitRequest>())
        .and(with_dispatcher(handle))
        .and_then(
            |student_id: String, request: AutoSubmitRequest, dispatcher: CommandDispatcher| async move {
                let student_id = decode_segment(student_id);
                let confirmed = request.confirm;
                let outcome = dispatcher
                    .auto_submit(&student_id, &request.reason, &move |_: &str| confirmed)
                    .await;
                Ok::<_, Infallible>(outcome_reply(&student_id, outcome))
            },
        )
}

pub fn refresh(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "refresh")
        .and(warp::post())
        .and(with_handle(handle))
        .map(|handle: ConnectionHandle| accepted(handle.request_snapshot(), "refresh"))
}

pub fn reconnect(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "reconnect")
        .and(warp::post())
        .and(with_handle(handle))
        .map(|handle: ConnectionHandle| accepted(handle.reconnect(), "reconnect"))
}

pub fn ping(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "ping")
        .and(warp::post())
        .and(with_handle(handle))
        .map(|handle: ConnectionHandle| accepted(handle.ping(), "ping"))
}

pub fn live(
    handle: ConnectionHandle,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("proctoring" / "live")
        .and(warp::ws())
        .and(with_handle(handle))
        .map(|ws: warp::ws::Ws, handle: ConnectionHandle| {
            ws.on_upgrade(move |websocket| dashboard_websocket::handle_live_websocket(websocket, handle))
        })
}

fn with_handle(
    handle: ConnectionHandle,
) -> impl Filter<Extract = (ConnectionHandle,), Error = Infallible> + Clone {
    warp::any().map(move || handle.clone())
}

fn with_dispatcher(
    handle: ConnectionHandle,
) -> impl Filter<Extract = (CommandDispatcher,), Error = Infallible> + Clone {
    warp::any().map(move || CommandDispatcher::new(handle.clone()))
}

/// Path segments arrive percent-encoded
fn decode_segment(raw: String) -> String {
    let decoded = urlencoding::decode(&raw).map(|s| s.into_owned());
    decoded.unwrap_or(raw)
}

fn outcome_reply(student_id: &str, outcome: DispatchOutcome) -> StatusReply {
    let status = match outcome {
        DispatchOutcome::Sent => StatusCode::OK,
        DispatchOutcome::Declined => StatusCode::CONFLICT,
        DispatchOutcome::Offline => StatusCode::SERVICE_UNAVAILABLE,
    };
    warp::reply::with_status(
        warp::reply::json(&json!({ "studentId": student_id, "outcome": outcome })),
        status,
    )
}

fn accepted(result: crate::error::Result<()>, action: &str) -> StatusReply {
    match result {
        Ok(()) => warp::reply::with_status(
            warp::reply::json(&json!({ "action": action, "accepted": true })),
            StatusCode::ACCEPTED,
        ),
        Err(e) => error_reply(&e),
    }
}

fn not_found(kind: &str, id: &str) -> StatusReply {
    warp::reply::with_status(
        warp::reply::json(&json!({ "error": format!("Unknown {}: {}", kind, id) })),
        StatusCode::NOT_FOUND,
    )
}

fn error_reply(error: &MonitorError) -> StatusReply {
    let status = match error {
        MonitorError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(warp::reply::json(&json!({ "error": error.to_string() })), status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProctoringConfig;
    use crate::proctoring::ConnectionManager;

    #[test]
    fn test_decode_segment() {
        assert_eq!(decode_segment("student%201".to_string()), "student 1");
        assert_eq!(decode_segment("plain".to_string()), "plain");
    }

    #[tokio::test]
    async fn test_health_reports_connection_status() {
        let (_manager, handle) = ConnectionManager::new(ProctoringConfig::default());
        let response = warp::test::request()
            .method("GET")
            .path("/proctoring/health")
            .reply(&routes(handle))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connection"], "disconnected");
    }

    #[tokio::test]
    async fn test_unknown_student_is_404() {
        let (manager, handle) = ConnectionManager::new(ProctoringConfig::default());
        let task = tokio::spawn(manager.run());

        let response = warp::test::request()
            .method("GET")
            .path("/proctoring/students/nobody")
            .reply(&routes(handle.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = warp::test::request()
            .method("GET")
            .path("/proctoring/exams/a1")
            .reply(&routes(handle.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_while_offline_are_503() {
        let (_manager, handle) = ConnectionManager::new(ProctoringConfig::default());
        let filter = routes(handle);

        let response = warp::test::request()
            .method("POST")
            .path("/proctoring/students/s1/warning")
            .json(&json!({ "message": "Eyes on screen" }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = warp::test::request()
            .method("POST")
            .path("/proctoring/students/s1/auto-submit")
            .json(&json!({ "reason": "cheating", "confirm": true }))
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = warp::test::request()
            .method("POST")
            .path("/proctoring/refresh")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_empty_listings() {
        let (_manager, handle) = ConnectionManager::new(ProctoringConfig::default());
        let filter = routes(handle);

        let response = warp::test::request()
            .method("GET")
            .path("/proctoring/students?assessment=a1")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"[]");

        let response = warp::test::request()
            .method("GET")
            .path("/proctoring/violations")
            .reply(&filter)
            .await;
        assert_eq!(response.body().as_ref(), b"[]");
    }
}
