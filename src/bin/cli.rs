// Proctoring Monitor CLI
// Inspects the monitor's live state and issues operator commands through the dashboard API

use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::io::{self, Write};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use proctor_monitor::logging;
use proctor_monitor::proctoring::dispatcher::AUTO_SUBMIT_PROMPT;
use proctor_monitor::proctoring::Confirm;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Proctoring Monitor CLI", long_about = None)]
struct Cli {
    /// Dashboard address (default: 127.0.0.1:8090)
    #[arg(short, long, default_value = "127.0.0.1:8090")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check monitor health and connection status
    Health,

    /// Exam summaries, status counts and active notices
    Summary,

    /// List live students
    Students {
        /// Only students of this assessment
        #[arg(short, long)]
        assessment: Option<String>,
    },

    /// Show one student and their violations
    Student {
        /// Student ID
        student_id: String,
    },

    /// List violations, newest first
    Violations {
        /// Only violations of this student
        #[arg(short, long)]
        student: Option<String>,
    },

    /// Send a warning to a student
    Warn {
        /// Student ID
        student_id: String,

        /// Warning text (default: "Please maintain proper exam conduct")
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Auto-submit a student's assessment
    AutoSubmit {
        /// Student ID
        student_id: String,

        /// Reason shown to the student
        #[arg(short, long)]
        reason: Option<String>,

        /// Skip the interactive confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Mark a violation as reviewed
    Review {
        /// Violation ID
        violation_id: String,
    },

    /// Request a fresh student snapshot
    Refresh,

    /// Drop and re-open the proctoring connection
    Reconnect,

    /// Measure round trip to the proctoring server
    Ping,

    /// Follow the live view (press Ctrl+C to exit)
    Watch,
}

/// Asks on the terminal; anything but y/yes declines
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{} {} [y/N] ", "?".yellow().bold(), prompt);
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() {
    logging::init("warn");
    let cli = Cli::parse();
    let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            println!("{} Cannot create HTTP client: {}", "✗".red(), e);
            return;
        }
    };
    let api = ApiClient {
        client,
        base: format!("http://{}/proctoring", cli.server),
    };

    match &cli.command {
        Commands::Health => check_health(&api, &cli.server).await,
        Commands::Summary => show_summary(&api).await,
        Commands::Students { assessment } => list_students(&api, assessment.as_deref()).await,
        Commands::Student { student_id } => show_student(&api, student_id).await,
        Commands::Violations { student } => list_violations(&api, student.as_deref()).await,
        Commands::Warn { student_id, message } => {
            send_warning(&api, student_id, message.as_deref().unwrap_or_default()).await;
        }
        Commands::AutoSubmit {
            student_id,
            reason,
            yes,
        } => {
            auto_submit(&api, student_id, reason.as_deref().unwrap_or_default(), *yes).await;
        }
        Commands::Review { violation_id } => review_violation(&api, violation_id).await,
        Commands::Refresh => trigger(&api, "refresh", "Snapshot refresh requested").await,
        Commands::Reconnect => trigger(&api, "reconnect", "Reconnect requested").await,
        Commands::Ping => ping(&api).await,
        Commands::Watch => watch(&cli.server).await,
    }
}

struct ApiClient {
    client: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    async fn get(&self, path: &str) -> Option<(StatusCode, Value)> {
        let url = self.url(path);
        tracing::debug!(url = %url, "GET");
        self.finish(self.client.get(&url).send().await).await
    }

    async fn post(&self, path: &str, body: Value) -> Option<(StatusCode, Value)> {
        let url = self.url(path);
        tracing::debug!(url = %url, "POST");
        self.finish(self.client.post(&url).json(&body).send().await).await
    }

    async fn finish(&self, result: reqwest::Result<reqwest::Response>) -> Option<(StatusCode, Value)> {
        match result {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.json::<Value>().await.unwrap_or(Value::Null);
                Some((status, body))
            }
            Err(e) => {
                println!("{} Cannot connect to monitor: {}", "✗".red(), e);
                None
            }
        }
    }

    /// Successful body, or prints the failure
    async fn fetch(&self, path: &str) -> Option<Value> {
        let (status, body) = self.get(path).await?;
        if status.is_success() {
            Some(body)
        } else {
            print_failure(status, &body);
            None
        }
    }
}

fn segment(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

fn print_failure(status: StatusCode, body: &Value) {
    match body["error"].as_str() {
        Some(error) => println!("{} {} ({})", "✗".red(), error, status),
        None => println!("{} Request failed: {}", "✗".red(), status),
    }
}

fn colored_status(status: &str) -> ColoredString {
    match status {
        "active" | "connected" => status.green(),
        "flagged" => status.red().bold(),
        "connecting" => status.yellow(),
        _ => status.dimmed(),
    }
}

fn colored_severity(severity: &str) -> ColoredString {
    match severity {
        "high" => severity.red().bold(),
        "medium" => severity.yellow(),
        _ => severity.normal(),
    }
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}

async fn check_health(api: &ApiClient, server: &str) {
    println!("{}", "Checking monitor health...".cyan());

    match api.get("health").await {
        Some((status, body)) if status.is_success() => {
            println!("{} Health check passed", "✓".green());
            println!("  Service: {}", text(&body, "service"));
            println!("  Version: {}", text(&body, "version"));
            println!("  Connection: {}", colored_status(text(&body, "connection")));
        }
        Some((status, body)) => print_failure(status, &body),
        None => println!("  Make sure the monitor is running on {}", server),
    }
}

async fn show_summary(api: &ApiClient) {
    let Some(summary) = api.fetch("summary").await else {
        return;
    };

    println!("{} {}", "Connection:".bold(), colored_status(text(&summary, "status")));
    if let Some(latency) = summary["latencyMs"].as_i64() {
        println!("{} {}ms", "Latency:".bold(), latency);
    }

    let counts = &summary["counts"];
    println!(
        "{} {} total, {} active, {} flagged, {} disconnected",
        "Students:".bold(),
        counts["total"],
        counts["active"].to_string().green(),
        counts["flagged"].to_string().red(),
        counts["disconnected"].to_string().dimmed()
    );
    println!("{} {}", "Violations:".bold(), summary["violationCount"]);

    println!("\n{}", "Active Exams".bold());
    println!("{}", "─".repeat(60));
    match summary["overview"]["activeExams"].as_array() {
        Some(exams) if !exams.is_empty() => {
            for exam in exams {
                let title = match text(exam, "title") {
                    "" => text(exam, "id"),
                    title => title,
                };
                println!(
                    "  {} {} students, {} active, {} flagged",
                    title.cyan(),
                    exam["studentsCount"],
                    exam["activeStudents"],
                    exam["flaggedBehaviors"]
                );
            }
        }
        _ => println!("  No active exams"),
    }

    if let Some(unconfirmed) = summary["unconfirmedAutoSubmits"].as_array() {
        if !unconfirmed.is_empty() {
            println!(
                "\n{} Auto-submits not yet confirmed by server: {}",
                "⚠".yellow(),
                unconfirmed.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", ")
            );
        }
    }
    print_notices(&summary["notices"]);
}

fn print_notices(notices: &Value) {
    for notice in notices.as_array().into_iter().flatten() {
        let message = text(notice, "message");
        match text(notice, "kind") {
            "error" => println!("{} {}", "✗".red(), message.red()),
            _ => println!("{} {}", "✓".green(), message),
        }
    }
}

async fn list_students(api: &ApiClient, assessment: Option<&str>) {
    let path = match assessment {
        Some(assessment) => format!("students?assessment={}", segment(assessment)),
        None => "students".to_string(),
    };
    let Some(students) = api.fetch(&path).await else {
        return;
    };

    let students = students.as_array().cloned().unwrap_or_default();
    if students.is_empty() {
        println!("{}", "No students".yellow());
        return;
    }

    for student in &students {
        println!(
            "  {:<14} {:<20} {:<16} {} violations, {} tab switches, face {}",
            colored_status(text(student, "status")),
            text(student, "id").bold(),
            text(student, "assessmentId"),
            student["violations"],
            student["tabSwitches"],
            if student["faceDetected"].as_bool().unwrap_or(false) { "✓".green() } else { "✗".red() }
        );
    }
    println!("\n{} student(s)", students.len());
}

async fn show_student(api: &ApiClient, student_id: &str) {
    let Some(detail) = api.fetch(&format!("students/{}", segment(student_id))).await else {
        return;
    };

    let student = &detail["student"];
    println!("\n{}", "═".repeat(50).green());
    println!("{} {}", text(student, "name").bold(), format!("({})", text(student, "id")).dimmed());
    println!("{}", "═".repeat(50).green());
    println!("  Email: {}", text(student, "email"));
    println!(
        "  Assessment: {} {}",
        text(student, "assessmentTitle"),
        format!("[{}]", text(student, "assessmentId")).dimmed()
    );
    println!("  Status: {}", colored_status(text(student, "status")));
    println!("  Joined: {}", text(student, "joinedAt"));
    println!("  Face detected: {}", student["faceDetected"]);
    println!("  Audio level: {}", student["audioLevel"]);
    println!("  Tab switches: {}", student["tabSwitches"]);
    if let Some(frame_time) = student["lastFrameTime"].as_str() {
        println!("  Last frame: {}", frame_time);
    }

    let violations = detail["violations"].as_array().cloned().unwrap_or_default();
    println!("\n{} ({})", "Violations".bold(), violations.len());
    for violation in &violations {
        println!(
            "  {} {:<8} {} {}",
            text(violation, "timestamp").dimmed(),
            colored_severity(text(violation, "severity")),
            text(violation, "type").cyan(),
            text(violation, "description")
        );
    }
}

async fn list_violations(api: &ApiClient, student: Option<&str>) {
    let path = match student {
        Some(student) => format!("violations?student={}", segment(student)),
        None => "violations".to_string(),
    };
    let Some(violations) = api.fetch(&path).await else {
        return;
    };

    let violations = violations.as_array().cloned().unwrap_or_default();
    if violations.is_empty() {
        println!("{}", "No violations".green());
        return;
    }

    for violation in &violations {
        let reviewed = if violation["reviewed"].as_bool().unwrap_or(false) {
            "reviewed".dimmed()
        } else {
            "open".yellow()
        };
        println!(
            "  {} {:<8} {:<10} {} {} {}",
            text(violation, "timestamp").dimmed(),
            colored_severity(text(violation, "severity")),
            reviewed,
            text(violation, "studentName").bold(),
            text(violation, "violationType").cyan(),
            text(violation, "behavior")
        );
        println!("    {}", format!("id: {}", text(violation, "id")).dimmed());
    }
}

async fn send_warning(api: &ApiClient, student_id: &str, message: &str) {
    let path = format!("students/{}/warning", segment(student_id));
    if let Some((status, body)) = api.post(&path, json!({ "message": message })).await {
        print_outcome(status, &body, "Warning sent to student");
    }
}

async fn auto_submit(api: &ApiClient, student_id: &str, reason: &str, yes: bool) {
    let confirmed = yes || TerminalConfirm.confirm(AUTO_SUBMIT_PROMPT);
    if !confirmed {
        println!("{} Auto-submit cancelled", "✗".yellow());
        return;
    }

    let path = format!("students/{}/auto-submit", segment(student_id));
    let body = json!({ "reason": reason, "confirm": true });
    if let Some((status, body)) = api.post(&path, body).await {
        print_outcome(status, &body, "Assessment auto-submitted for student");
    }
}

fn print_outcome(status: StatusCode, body: &Value, success: &str) {
    match status {
        StatusCode::OK => println!("{} {}", "✓".green(), success),
        StatusCode::SERVICE_UNAVAILABLE => {
            println!("{} Monitor is not connected to the proctoring server", "✗".red());
        }
        StatusCode::CONFLICT => println!("{} Not confirmed, nothing sent", "✗".yellow()),
        _ => print_failure(status, body),
    }
}

async fn review_violation(api: &ApiClient, violation_id: &str) {
    let path = format!("violations/{}/review", segment(violation_id));
    match api.post(&path, json!({})).await {
        Some((status, _)) if status.is_success() => {
            println!("{} Violation {} marked as reviewed", "✓".green(), violation_id);
        }
        Some((status, body)) => print_failure(status, &body),
        None => {}
    }
}

async fn trigger(api: &ApiClient, path: &str, success: &str) {
    match api.post(path, json!({})).await {
        Some((status, _)) if status.is_success() => println!("{} {}", "✓".green(), success),
        Some((status, body)) => print_failure(status, &body),
        None => {}
    }
}

async fn ping(api: &ApiClient) {
    let before = match api.fetch("summary").await {
        Some(summary) => summary["updatedAt"].as_str().map(str::to_string),
        None => return,
    };

    match api.post("ping", json!({})).await {
        Some((status, _)) if status.is_success() => println!("{}", "Ping sent, waiting for pong...".cyan()),
        Some((status, body)) => {
            print_failure(status, &body);
            return;
        }
        None => return,
    }

    // The pong lands in the summary as a success notice
    let waited = timeout(Duration::from_secs(5), async {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let Some((_, summary)) = api.get("summary").await else {
                return None;
            };
            let changed = summary["updatedAt"].as_str().map(str::to_string) != before;
            let latency = summary["latencyMs"].as_i64();
            let ponged = summary["notices"]
                .as_array()
                .into_iter()
                .flatten()
                .any(|n| text(n, "message").starts_with("Connection test successful"));
            if changed && ponged {
                return latency;
            }
        }
    })
    .await;

    match waited {
        Ok(Some(latency)) => println!("{} Connection test successful! Latency: {}ms", "✓".green(), latency),
        Ok(None) => println!("{} No latency reported", "✗".yellow()),
        Err(_) => println!("{} Timeout waiting for pong", "✗".red()),
    }
}

async fn watch(server: &str) {
    let url = format!("ws://{}/proctoring/live", server);

    let (ws_stream, _) = match connect_async(&url).await {
        Ok(connection) => connection,
        Err(e) => {
            println!("{} Cannot connect to live feed: {}", "✗".red(), e);
            return;
        }
    };
    println!("{} Watching {} (press {} to exit)", "✓".green(), url, "Ctrl+C".bold());

    let (_write, mut read) = ws_stream.split();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(view) => print_view_line(&view),
                    Err(e) => println!("{} Unreadable view: {}", "✗".yellow(), e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    println!("{} Live feed closed", "✗".yellow());
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    println!("{} Connection error: {}", "✗".red(), e);
                    break;
                }
            },
        }
    }
}

fn print_view_line(view: &Value) {
    let counts = &view["counts"];
    let updated = text(view, "updatedAt");
    let time = updated.get(11..19).unwrap_or(updated);
    println!(
        "{} {:<12} students {} (active {}, flagged {}, disconnected {}), violations {}",
        format!("[{}]", time).dimmed(),
        colored_status(text(view, "status")),
        counts["total"],
        counts["active"].to_string().green(),
        counts["flagged"].to_string().red(),
        counts["disconnected"].to_string().dimmed(),
        view["violationCount"]
    );
    print_notices(&view["notices"]);
}
