pub mod relay;
pub mod room;

pub use relay::{relay_grid_size, relay_input, relay_input_batch, relay_tick, RelayError};
pub use room::{JoinOutcome, LeaveOutcome, Member, Room, RoomCode, RoomState};
