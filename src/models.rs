use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel-encoding dialect spoken by a client implementation.
///
/// `Standard` is the canonical form used internally and in the lookup table;
/// clients must identify as one of the concrete dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DialectId {
    #[serde(rename = "rps")]
    Rps,
    #[serde(rename = "bps")]
    Bps,
    #[serde(rename = "psp")]
    Psp,
    #[serde(rename = "standard")]
    Standard,
}

impl DialectId {
    /// Dialects a client may identify as (everything but `standard`).
    pub const CLIENT_DIALECTS: [DialectId; 3] = [DialectId::Rps, DialectId::Bps, DialectId::Psp];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "rps" => Some(DialectId::Rps),
            "bps" => Some(DialectId::Bps),
            "psp" => Some(DialectId::Psp),
            "standard" => Some(DialectId::Standard),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            DialectId::Rps => "rps",
            DialectId::Bps => "bps",
            DialectId::Psp => "psp",
            DialectId::Standard => "standard",
        }
    }
}

impl fmt::Display for DialectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Game mode a room is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameMode {
    #[serde(rename = "pixelcrash")]
    Pixelcrash,
    #[serde(rename = "resourcerace")]
    Resourcerace,
}

impl GameMode {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "pixelcrash" => Some(GameMode::Pixelcrash),
            "resourcerace" => Some(GameMode::Resourcerace),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            GameMode::Pixelcrash => "pixelcrash",
            GameMode::Resourcerace => "resourcerace",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Handshake payload a client must deliver before any other route is routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub username: String,
    pub client: DialectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One authoritative frame produced by the host each simulation tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickFrame {
    pub grid: Vec<u8>,
    #[serde(rename = "teamGrid")]
    pub team_grid: Vec<u8>,
    #[serde(rename = "booleanGrids")]
    pub boolean_grids: Vec<Vec<u8>>,
    pub origin: String,
    pub data: TickData,
}

/// Per-tick metadata riding alongside the grids.
///
/// `team_pixel_amounts` is one dense array per team, indexed by the pixel id
/// in the producing dialect. Translation remaps the indices; entries that
/// translate to nothing stay zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickData {
    pub tick: u64,
    #[serde(rename = "teamPixelAmounts")]
    pub team_pixel_amounts: Vec<Vec<u64>>,
    #[serde(rename = "pixeliteCounts", default, skip_serializing_if = "Option::is_none")]
    pub pixelite_counts: Option<serde_json::Value>,
    #[serde(rename = "cameraShake", default, skip_serializing_if = "Option::is_none")]
    pub camera_shake: Option<serde_json::Value>,
}

/// One client input. Kind 0 is a single-cell input whose sixth element is a
/// pixel id in the sender's dialect (or -1); kind 1 is a header byte followed
/// by a packed grid region in the sender's dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFrame {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<u8>,
    pub data: Vec<i64>,
}

/// Projection of a public room served to lobby browsers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicRoomInfo {
    pub code: String,
    #[serde(rename = "type")]
    pub mode: GameMode,
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub open: bool,
    #[serde(rename = "teamSize")]
    pub team_size: u8,
    #[serde(rename = "allowsSpectators")]
    pub allows_spectators: bool,
}

/// Roster snapshot broadcast on every membership change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamLists {
    #[serde(rename = "teamA")]
    pub team_a: Vec<String>,
    #[serde(rename = "teamB")]
    pub team_b: Vec<String>,
    pub spectators: Vec<String>,
    #[serde(rename = "teamSize")]
    pub team_size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

// Client → server events. The wire form is {"type": "...", "data": ...}.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "clientInfo")]
    ClientInfo(ClientInfo),
    #[serde(rename = "createGame")]
    CreateGame,
    #[serde(rename = "cancelCreateGame")]
    CancelCreateGame,
    #[serde(rename = "getPublicRooms")]
    GetPublicRooms {
        #[serde(rename = "type")]
        mode: GameMode,
        spectating: bool,
    },
    #[serde(rename = "joinGame")]
    JoinGame { code: String, spectating: bool },
    #[serde(rename = "leaveGame")]
    LeaveGame,
    #[serde(rename = "changeTeam")]
    ChangeTeam(u8),
    #[serde(rename = "gameType")]
    GameType(GameMode),
    #[serde(rename = "allowSpectators")]
    AllowSpectators(bool),
    #[serde(rename = "isPublic")]
    IsPublic(bool),
    #[serde(rename = "teamSize")]
    TeamSize(u8),
    #[serde(rename = "kickPlayer")]
    KickPlayer(String),
    #[serde(rename = "movePlayer")]
    MovePlayer {
        username: String,
        team: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username2: Option<String>,
    },
    #[serde(rename = "startGame")]
    StartGame,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "gridSize")]
    GridSize(GridSize),
    #[serde(rename = "tick")]
    Tick(TickFrame),
    #[serde(rename = "input")]
    Input(InputFrame),
    #[serde(rename = "inputBatch")]
    InputBatch(Vec<InputFrame>),
    #[serde(rename = "ping")]
    Ping,
}

// Server → client events. `clientInfoRecieved` keeps its historical spelling:
// it is the wire contract every shipped client matches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "requestClientInfo")]
    RequestClientInfo(serde_json::Value),
    #[serde(rename = "clientInfoRecieved")]
    ClientInfoRecieved,
    #[serde(rename = "gameCode")]
    GameCode(String),
    #[serde(rename = "joinSuccess")]
    JoinSuccess(u8),
    #[serde(rename = "joinFail")]
    JoinFail(String),
    #[serde(rename = "forcedSpectator")]
    ForcedSpectator,
    #[serde(rename = "gameType")]
    GameType(GameMode),
    #[serde(rename = "updateTeamLists")]
    UpdateTeamLists(TeamLists),
    #[serde(rename = "publicRooms")]
    PublicRooms(Vec<PublicRoomInfo>),
    #[serde(rename = "gameStart")]
    GameStart,
    #[serde(rename = "team")]
    Team(u8),
    #[serde(rename = "gameKicked")]
    GameKicked,
    #[serde(rename = "gameEnd")]
    GameEnd,
    #[serde(rename = "tick")]
    Tick(TickFrame),
    #[serde(rename = "inputBatch")]
    InputBatch(Vec<InputFrame>),
    #[serde(rename = "input")]
    Input(InputFrame),
    #[serde(rename = "gridSize")]
    GridSize(GridSize),
    #[serde(rename = "pong")]
    Pong,
}
