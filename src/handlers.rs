pub mod http;
pub mod session;

pub use http::{controller_get, map_get, map_list, status};
pub use session::game_ws;

use crate::game::room::{Room, RoomCode};
use crate::models::ServerEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-connection identity, minted at accept time.
pub type HandlerId = Uuid;

/// Outbound channel into one session: rooms hold clones and the session's
/// writer drains it, so per-connection send order is preserved.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// code → room registry shared between sessions and the broker.
pub type SharedRooms = Arc<Mutex<HashMap<RoomCode, Room>>>;
