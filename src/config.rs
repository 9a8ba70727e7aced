//! Environment-driven configuration, centralizing env-var reads into one
//! struct for testability instead of scattering them through `main.rs`.

use std::time::Duration;

/// Process-wide gateway configuration, populated from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server_port: u16,
    /// Interval advertised to clients in the Hello frame.
    pub heartbeat_interval: Duration,
    /// Time since last client activity before the connection is destroyed.
    pub pong_wait: Duration,
    /// Write deadline for a single outbound frame.
    pub write_wait: Duration,
    /// How long a Session survives after its last connection disconnects.
    pub session_timeout: Duration,
    /// Max frames retained in a Session's resume buffer.
    pub resume_buffer_size: usize,
    /// Bounded capacity of each connection's outbound send queue.
    pub send_queue_capacity: usize,
    /// Drain manager: time to let clients drain voluntarily.
    pub grace_period: Duration,
    /// Drain manager: absolute deadline before force-closing stragglers.
    pub drain_timeout: Duration,
    /// NATS URL for the distributed pub/sub fabric; `None` runs single-instance
    /// with an in-memory backend.
    pub nats_url: Option<String>,
    pub enable_metrics: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            server_port: env_parse("SERVER_PORT", 8080),
            heartbeat_interval: Duration::from_millis(env_parse("HEARTBEAT_INTERVAL_MS", 41_250)),
            pong_wait: Duration::from_secs(env_parse("PONG_WAIT_SECS", 60)),
            write_wait: Duration::from_secs(env_parse("WRITE_WAIT_SECS", 10)),
            session_timeout: Duration::from_secs(env_parse("SESSION_TIMEOUT_SECS", 120)),
            resume_buffer_size: env_parse("RESUME_BUFFER_SIZE", 100),
            send_queue_capacity: env_parse("SEND_QUEUE_CAPACITY", 256),
            grace_period: Duration::from_secs(env_parse("DRAIN_GRACE_PERIOD_SECS", 30)),
            drain_timeout: Duration::from_secs(env_parse("DRAIN_TIMEOUT_SECS", 60)),
            nats_url: std::env::var("NATS_URL").ok(),
            enable_metrics: matches!(
                std::env::var("ENABLE_METRICS").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
            ),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_port: 8080,
            heartbeat_interval: Duration::from_millis(41_250),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            session_timeout: Duration::from_secs(120),
            resume_buffer_size: 100,
            send_queue_capacity: 256,
            grace_period: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(60),
            nats_url: None,
            enable_metrics: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
