use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MonitorError, Result};

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:5000/proctoring";

pub struct Config {
    pub server: ServerConfig,
    pub proctoring: ProctoringConfig,
}

/// Where the local dashboard API listens
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection and reconciliation settings for the monitor task
#[derive(Debug, Clone)]
pub struct ProctoringConfig {
    /// WebSocket endpoint of the proctoring event server
    pub server_url: String,
    /// Interval between periodic `get_active_students` requests
    pub refresh_interval: Duration,
    /// Delay before the single reconnect attempt after a server-side close
    pub reconnect_delay: Duration,
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
    /// Drop students missing from a snapshot instead of keeping them stale
    pub prune_on_snapshot: bool,
    /// How long an optimistic auto-submit may wait for `student_left_proctoring`
    pub auto_submit_confirm_timeout: Duration,
    /// Exam length assumed when the server does not provide one
    pub default_exam_minutes: u32,
    pub notices: NoticeConfig,
}

#[derive(Debug, Clone)]
pub struct NoticeConfig {
    pub success_ttl: Duration,
    pub error_ttl: Duration,
}

impl Default for ProctoringConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            refresh_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
            prune_on_snapshot: false,
            auto_submit_confirm_timeout: Duration::from_secs(30),
            default_exam_minutes: 120,
            notices: NoticeConfig::default(),
        }
    }
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            success_ttl: Duration::from_secs(5),
            error_ttl: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = ProctoringConfig::default();

        let refresh_secs: u64 = parse_var("PROCTORING_REFRESH_SECS", 10)?;
        if refresh_secs == 0 {
            return Err(MonitorError::invalid_config("PROCTORING_REFRESH_SECS", "0"));
        }

        Ok(Self {
            server: ServerConfig {
                host: env::var("DASHBOARD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("DASHBOARD_PORT", 8090)?,
            },
            proctoring: ProctoringConfig {
                server_url: env::var("PROCTORING_SERVER_URL")
                    .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
                refresh_interval: Duration::from_secs(refresh_secs),
                reconnect_delay: Duration::from_millis(parse_var(
                    "PROCTORING_RECONNECT_DELAY_MS",
                    1000,
                )?),
                connect_timeout: Duration::from_secs(parse_var(
                    "PROCTORING_CONNECT_TIMEOUT_SECS",
                    10,
                )?),
                prune_on_snapshot: parse_var("PROCTORING_PRUNE_ON_SNAPSHOT", false)?,
                auto_submit_confirm_timeout: Duration::from_secs(parse_var(
                    "PROCTORING_AUTO_SUBMIT_CONFIRM_SECS",
                    30,
                )?),
                default_exam_minutes: parse_var(
                    "PROCTORING_DEFAULT_EXAM_MINUTES",
                    defaults.default_exam_minutes,
                )?,
                notices: NoticeConfig {
                    success_ttl: Duration::from_secs(parse_var("NOTICE_SUCCESS_SECS", 5)?),
                    error_ttl: Duration::from_secs(parse_var("NOTICE_ERROR_SECS", 10)?),
                },
            },
        })
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

/// Reads `key`, falling back to `default` when unset; a set but unparsable
/// value is an error rather than a silent default.
fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| MonitorError::invalid_config(key, &raw)),
        _ => Ok(default),
    }
}
