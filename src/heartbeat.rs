use std::time::Duration;
use tokio::time::Instant;

/// Ping/pong liveness for one connection. A pong must answer the most
/// recent ping within `pong_timeout`. The connection loop evaluates
/// liveness on the ping cadence, so an unanswered ping is noticed at the
/// next tick; the check is against the ping's own age, never against the
/// tick interval.
pub struct HeartbeatState {
    last_pong: Instant,
    last_ping_sent: Option<Instant>,
    pong_timeout: Duration,
}

impl HeartbeatState {
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            last_pong: Instant::now(),
            last_ping_sent: None,
            pong_timeout,
        }
    }

    pub fn record_pong(&mut self) {
        self.last_pong = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
    }

    /// Dead only when the most recent ping has gone unanswered past the
    /// pong window.
    pub fn is_alive(&self) -> bool {
        match self.last_ping_sent {
            Some(sent) => self.last_pong > sent || sent.elapsed() < self.pong_timeout,
            None => true,
        }
    }
}
