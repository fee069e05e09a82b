use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

/// Listen addresses, read from the environment in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_addr: SocketAddr,
    pub health_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let ws_port: u16 = std::env::var("BACKEND_PORT")
            .unwrap_or_else(|_| "8081".to_string())
            .parse()
            .context("BACKEND_PORT must be a port number")?;
        let health_port: u16 = std::env::var("HEALTH_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("HEALTH_PORT must be a port number")?;

        Ok(Self {
            ws_addr: format!("{host}:{ws_port}").parse()?,
            health_addr: format!("{host}:{health_port}").parse()?,
        })
    }
}

/// Every tunable duration and capacity of a live room, bundled so tests can
/// shrink the windows without touching the protocol logic.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Mailbox depth of the room actor.
    pub mailbox_capacity: usize,
    /// Per-connection outbound queue depth.
    pub outbound_capacity: usize,
    /// Server-initiated ping cadence.
    pub ping_interval: Duration,
    /// A ping left unanswered for this long marks the connection dead.
    pub pong_timeout: Duration,
    /// Grace window before a disconnected student is marked as left.
    pub student_grace: Duration,
    /// Observation window before a missing teacher is logged as stalled.
    pub teacher_grace: Duration,
    /// A pushed question with no answer expires after this long.
    pub reservation_ttl: Duration,
    /// Coalescing window for `stats_update` broadcasts.
    pub stats_window: Duration,
    /// Coalescing window for `waiting_room_update` broadcasts.
    pub waiting_room_window: Duration,
    /// Cadence of the actor's internal grace/expiry sweep.
    pub sweep_interval: Duration,
    /// Deadline on every store call; expiry counts as a transient failure.
    pub store_deadline: Duration,
    /// Backoff schedule for retrying transient store failures.
    pub retry_backoff: [Duration; 3],
    /// After `end_quiz`, writers get this long to flush before hard-close.
    pub drain_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            outbound_capacity: 64,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(15),
            student_grace: Duration::from_secs(30),
            teacher_grace: Duration::from_secs(60),
            reservation_ttl: Duration::from_secs(600),
            stats_window: Duration::from_millis(200),
            waiting_room_window: Duration::from_millis(150),
            sweep_interval: Duration::from_secs(1),
            store_deadline: Duration::from_secs(5),
            retry_backoff: [
                Duration::from_millis(50),
                Duration::from_millis(150),
                Duration::from_millis(400),
            ],
            drain_timeout: Duration::from_secs(2),
        }
    }
}
