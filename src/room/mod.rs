pub mod actor;
pub mod messages;

pub use actor::RoomActor;
pub use messages::{ConnHandle, ConnId, RoomEvent};
