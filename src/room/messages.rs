use std::sync::Arc;

use crate::model::client_message::ClientEvent;
use crate::model::server_message::ServerEvent;
use crate::outbound::OutboundQueue;

/// Process-unique connection id.
pub type ConnId = u64;

/// What the actor holds per connection: the identity and the write side.
#[derive(Clone)]
pub struct ConnHandle {
    pub id: ConnId,
    pub queue: Arc<OutboundQueue>,
}

impl ConnHandle {
    pub fn send(&self, event: ServerEvent, request_id: Option<String>) {
        self.queue.push(event, request_id);
    }
}

/// Everything that can land in a room's mailbox. The connection layer posts
/// the first three; the flush variants are self-addressed single-shot timers
/// driving broadcast coalescing.
pub enum RoomEvent {
    Connected {
        conn: ConnHandle,
    },
    Inbound {
        conn_id: ConnId,
        event: ClientEvent,
        request_id: Option<String>,
    },
    Disconnected {
        conn_id: ConnId,
    },
    FlushStats,
    FlushWaitingRoom,
}
