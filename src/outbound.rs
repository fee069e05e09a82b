//! Bounded per-connection outbound queue.
//!
//! The room actor is the single producer; the connection's write half is the
//! single consumer. Pushing never blocks the actor: when the queue is full
//! the oldest droppable frame is evicted, and if nothing can be evicted the
//! connection is closed with `BackpressureFatal`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::model::server_message::{ServerEvent, WsEnvelope};

/// Why a connection is being closed; becomes the WebSocket close reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Session ended normally.
    Normal,
    /// Teacher csrf check failed.
    Unauthorized,
    /// A newer teacher connection replaced this one.
    Superseded,
    /// Heartbeat pong did not arrive in time.
    Timeout,
    /// Outbound queue overflowed on a critical frame.
    Backpressure,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::Unauthorized => "Unauthorized",
            Self::Superseded => "SupersededByNewer",
            Self::Timeout => "Timeout",
            Self::Backpressure => "BackpressureFatal",
        }
    }
}

#[derive(Debug)]
pub enum Delivery {
    Frame(WsEnvelope),
    Closed(CloseReason),
}

struct Frame {
    envelope: WsEnvelope,
    droppable: bool,
}

struct Inner {
    buf: VecDeque<Frame>,
    /// Set once; `deadline` caps how long draining may continue.
    close: Option<(CloseReason, Instant)>,
    dropped: u64,
}

pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    drain_timeout: std::time::Duration,
}

impl OutboundQueue {
    pub fn new(capacity: usize, drain_timeout: std::time::Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                close: None,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
            drain_timeout,
        }
    }

    /// Enqueue a frame, applying the overflow policy. During a graceful
    /// close frames keep flowing until the drain deadline; after a hard
    /// close they are discarded.
    pub fn push(&self, event: ServerEvent, request_id: Option<String>) {
        let droppable = event.is_droppable();
        let envelope = event.into_envelope(request_id);
        {
            let mut inner = self.lock();
            if let Some((_, deadline)) = inner.close {
                if Instant::now() >= deadline {
                    return;
                }
            }
            if inner.buf.len() >= self.capacity {
                if let Some(pos) = inner.buf.iter().position(|f| f.droppable) {
                    inner.buf.remove(pos);
                    inner.dropped += 1;
                } else {
                    inner.close = Some((CloseReason::Backpressure, Instant::now()));
                    inner.buf.clear();
                    self.notify.notify_one();
                    return;
                }
            }
            inner.buf.push_back(Frame { envelope, droppable });
        }
        self.notify.notify_one();
    }

    /// Keep the connection writable until the drain cap elapses, then
    /// deliver the close to the consumer. Late direct responses (e.g. a
    /// `bad_request` for a submission racing the end of the session) still
    /// reach the client inside this window.
    pub fn close_after_drain(&self, reason: CloseReason) {
        let mut inner = self.lock();
        if inner.close.is_none() {
            inner.close = Some((reason, Instant::now() + self.drain_timeout));
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Close immediately, discarding anything still buffered. If a graceful
    /// close is already pending, its reason wins but the deadline collapses
    /// to now.
    pub fn close_now(&self, reason: CloseReason) {
        let mut inner = self.lock();
        let reason = inner.close.map_or(reason, |(earlier, _)| earlier);
        inner.close = Some((reason, Instant::now()));
        inner.buf.clear();
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().close.is_some()
    }

    /// Number of frames evicted by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Wait for the next frame, or for the close once the drain deadline
    /// has passed. Whatever is still buffered at the deadline is dropped
    /// (hard-close).
    pub async fn recv(&self) -> Delivery {
        loop {
            let wait_deadline = {
                let mut inner = self.lock();
                match inner.close {
                    Some((reason, deadline)) => {
                        if Instant::now() >= deadline {
                            inner.buf.clear();
                            return Delivery::Closed(reason);
                        }
                        if let Some(frame) = inner.buf.pop_front() {
                            return Delivery::Frame(frame.envelope);
                        }
                        Some(deadline)
                    }
                    None => {
                        if let Some(frame) = inner.buf.pop_front() {
                            return Delivery::Frame(frame.envelope);
                        }
                        None
                    }
                }
            };
            match wait_deadline {
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("outbound queue mutex poisoned")
    }
}
