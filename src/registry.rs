//! Process-wide map from room code to live room.
//!
//! The map is the only cross-room shared structure; its lock is taken only
//! for lookup/insert/remove and never held across I/O. Materialisation from
//! the store happens outside the lock, with a double-checked insert so two
//! racing acquirers converge on one room.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::config::RoomConfig;
use crate::model::session::SessionStatus;
use crate::room::{actor::RoomActor, RoomEvent};
use crate::store::{SessionStore, StoreError};

#[derive(Clone)]
pub struct RoomHandle {
    pub events: mpsc::Sender<RoomEvent>,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no session carries this room code")]
    NotFound,
    #[error("session already finished")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RoomRegistry {
    store: Arc<dyn SessionStore>,
    config: RoomConfig,
    rooms: Mutex<HashMap<String, RoomHandle>>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn SessionStore>, config: RoomConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Return the live room for `room_code`, materialising it from storage
    /// on first contact. Finished sessions are refused.
    pub async fn acquire(self: &Arc<Self>, room_code: &str) -> Result<RoomHandle, AcquireError> {
        if let Some(handle) = self.rooms.lock().await.get(room_code) {
            return Ok(handle.clone());
        }

        let deadline = self.config.store_deadline;
        let snapshot = tokio::time::timeout(deadline, self.store.load_session(room_code))
            .await
            .map_err(|_| StoreError::Transient("load_session deadline expired".into()))?
            .map_err(AcquireError::Store)?
            .ok_or(AcquireError::NotFound)?;

        if snapshot.session.status == SessionStatus::Finished {
            return Err(AcquireError::Closed);
        }

        let mut rooms = self.rooms.lock().await;
        // A concurrent acquirer may have won the race while we were loading.
        if let Some(handle) = rooms.get(room_code) {
            return Ok(handle.clone());
        }

        info!("materialising room {room_code}");
        let handle = RoomActor::spawn(
            Arc::clone(self),
            Arc::clone(&self.store),
            self.config.clone(),
            snapshot,
        );
        rooms.insert(room_code.to_string(), handle.clone());
        Ok(handle)
    }

    /// Called by a room actor as it exits.
    pub(crate) async fn remove(&self, room_code: &str) {
        if self.rooms.lock().await.remove(room_code).is_some() {
            info!("room {room_code} removed from registry");
        }
    }

    pub async fn live_rooms(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
