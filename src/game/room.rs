use crate::handlers::{EventSender, HandlerId};
use crate::models::{DialectId, GameMode, PublicRoomInfo, ServerEvent, TeamLists};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;

pub const ROOM_CODE_LEN: usize = 8;
pub const ROOM_CODE_ALPHABET: &str = "0123456789abcdef";

/// 8-hex-digit room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let alphabet: Vec<char> = ROOM_CODE_ALPHABET.chars().collect();
        let code: String = (0..ROOM_CODE_LEN)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        RoomCode(code)
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.len() != ROOM_CODE_LEN {
            return None;
        }
        if !value.chars().all(|c| ROOM_CODE_ALPHABET.contains(c)) {
            return None;
        }
        Some(RoomCode(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Open,
    Starting,
    Running,
    Closed,
}

/// One connected member as the room sees it: identity plus the outbound
/// channel into its session.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: HandlerId,
    pub username: String,
    pub dialect: DialectId,
    pub sender: EventSender,
}

impl Member {
    fn send(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Team(u8),
    Spectator,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Removed,
    /// The host left; the caller must destroy the room and drop it from the
    /// registry.
    WasHost,
    NotMember,
}

/// A game room: rosters, settings, and the open → starting → running →
/// closed lifecycle. Mutated only with the room registry lock held, so a
/// host's tick can never interleave with membership changes.
#[derive(Debug)]
pub struct Room {
    pub code: RoomCode,
    pub host: HandlerId,
    pub mode: GameMode,
    pub team_size: u8,
    pub state: RoomState,
    pub allow_spectators: bool,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    members: HashMap<HandlerId, Member>,
    team_a: Vec<HandlerId>,
    team_b: Vec<HandlerId>,
    spectators: Vec<HandlerId>,
    banned: HashSet<String>,
    ready: HashSet<HandlerId>,
}

impl Room {
    /// Create a room with `host` already joined to team A. Emits the code and
    /// the usual join sequence to the host.
    pub fn create(code: RoomCode, host: Member) -> Self {
        let mut room = Room {
            code: code.clone(),
            host: host.id,
            mode: GameMode::Pixelcrash,
            team_size: 1,
            state: RoomState::Open,
            allow_spectators: true,
            public: true,
            created_at: Utc::now(),
            members: HashMap::new(),
            team_a: Vec::new(),
            team_b: Vec::new(),
            spectators: Vec::new(),
            banned: HashSet::new(),
            ready: HashSet::new(),
        };
        host.send(ServerEvent::GameCode(code.as_str().to_string()));
        host.send(ServerEvent::JoinSuccess(0));
        host.send(ServerEvent::GameType(room.mode));
        room.team_a.push(host.id);
        room.members.insert(host.id, host);
        room.broadcast_rosters();
        info!("room {} created", room.code);
        room
    }

    pub fn open(&self) -> bool {
        self.state == RoomState::Open
    }

    pub fn is_member(&self, id: HandlerId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, id: HandlerId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn team_of(&self, id: HandlerId) -> Option<u8> {
        if self.team_a.contains(&id) {
            Some(0)
        } else if self.team_b.contains(&id) {
            Some(1)
        } else {
            None
        }
    }

    pub fn is_spectator(&self, id: HandlerId) -> bool {
        self.spectators.contains(&id)
    }

    fn teams_full(&self) -> bool {
        self.team_a.len() >= self.team_size as usize && self.team_b.len() >= self.team_size as usize
    }

    fn usernames(&self, ids: &[HandlerId]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.members.get(id))
            .map(|m| m.username.clone())
            .collect()
    }

    fn roster_snapshot(&self) -> TeamLists {
        TeamLists {
            team_a: self.usernames(&self.team_a),
            team_b: self.usernames(&self.team_b),
            spectators: self.usernames(&self.spectators),
            team_size: self.team_size,
        }
    }

    fn broadcast_rosters(&self) {
        let snapshot = self.roster_snapshot();
        self.broadcast(ServerEvent::UpdateTeamLists(snapshot));
    }

    pub fn broadcast(&self, event: ServerEvent) {
        for member in self.members.values() {
            member.send(event.clone());
        }
    }

    pub fn join(&mut self, member: Member, spectating: bool) -> JoinOutcome {
        if self.is_member(member.id) {
            return JoinOutcome::Rejected;
        }
        if spectating || self.teams_full() {
            if !self.allow_spectators {
                member.send(ServerEvent::JoinFail(
                    "This game does not allow spectators".to_string(),
                ));
                return JoinOutcome::Rejected;
            }
            if !spectating {
                member.send(ServerEvent::ForcedSpectator);
            }
            member.send(ServerEvent::JoinSuccess(2));
            member.send(ServerEvent::GameType(self.mode));
            if !self.open() && spectating {
                member.send(ServerEvent::GameStart);
            }
            self.spectators.push(member.id);
            self.members.insert(member.id, member);
            self.broadcast_rosters();
            return JoinOutcome::Spectator;
        }
        if self.banned.contains(&member.username) {
            member.send(ServerEvent::JoinFail(
                "You are banned from this game".to_string(),
            ));
            return JoinOutcome::Rejected;
        }
        let team = if self.team_a.len() <= self.team_b.len() {
            0
        } else {
            1
        };
        member.send(ServerEvent::JoinSuccess(team));
        member.send(ServerEvent::GameType(self.mode));
        if team == 0 {
            self.team_a.push(member.id);
        } else {
            self.team_b.push(member.id);
        }
        self.members.insert(member.id, member);
        self.broadcast_rosters();
        JoinOutcome::Team(team)
    }

    /// Move `id` to team `team` at its own request. Only while open, only for
    /// current team members, only into remaining capacity.
    pub fn change_team(&mut self, id: HandlerId, team: u8) {
        if !self.open() || team > 1 {
            return;
        }
        let Some(current) = self.team_of(id) else {
            return;
        };
        if current == team {
            return;
        }
        let target = if team == 0 {
            &mut self.team_a
        } else {
            &mut self.team_b
        };
        if target.len() >= self.team_size as usize {
            return;
        }
        target.push(id);
        if current == 0 {
            self.team_a.retain(|m| *m != id);
        } else {
            self.team_b.retain(|m| *m != id);
        }
        if let Some(member) = self.members.get(&id) {
            member.send(ServerEvent::Team(team));
        }
        self.broadcast_rosters();
    }

    fn id_by_username(&self, username: &str) -> Option<HandlerId> {
        self.members
            .values()
            .find(|m| m.username == username)
            .map(|m| m.id)
    }

    /// Host-driven move: with two usernames on different teams, swap them
    /// atomically; with one, delegate to [`Room::change_team`].
    pub fn move_player(&mut self, username: &str, team: u8, username2: Option<&str>) {
        let first = self.id_by_username(username);
        let second = username2.and_then(|name| self.id_by_username(name));
        if let (Some(a), Some(b)) = (first, second) {
            if let (Some(team_a), Some(team_b)) = (self.team_of(a), self.team_of(b)) {
                if team_a != team_b {
                    self.swap(a, b);
                    return;
                }
            }
        }
        if let Some(id) = first {
            self.change_team(id, team);
        }
    }

    fn swap(&mut self, a: HandlerId, b: HandlerId) {
        if !self.open() {
            return;
        }
        for roster in [&mut self.team_a, &mut self.team_b] {
            for slot in roster.iter_mut() {
                if *slot == a {
                    *slot = b;
                } else if *slot == b {
                    *slot = a;
                }
            }
        }
        for (id, team) in [(a, self.team_of(a)), (b, self.team_of(b))] {
            if let (Some(member), Some(team)) = (self.members.get(&id), team) {
                member.send(ServerEvent::Team(team));
            }
        }
        self.broadcast_rosters();
    }

    /// Host-driven kick. The target gets `gameKicked`, its username joins the
    /// ban list, and its id is returned so the session layer can complete the
    /// leave.
    pub fn kick(&mut self, username: &str) -> Option<HandlerId> {
        let id = self.id_by_username(username)?;
        if id == self.host {
            return None;
        }
        if let Some(member) = self.members.get(&id) {
            member.send(ServerEvent::GameKicked);
        }
        self.banned.insert(username.to_string());
        Some(id)
    }

    pub fn leave(&mut self, id: HandlerId) -> LeaveOutcome {
        if self.members.remove(&id).is_none() {
            return LeaveOutcome::NotMember;
        }
        self.team_a.retain(|m| *m != id);
        self.team_b.retain(|m| *m != id);
        self.spectators.retain(|m| *m != id);
        self.ready.remove(&id);
        if id == self.host {
            return LeaveOutcome::WasHost;
        }
        self.broadcast_rosters();
        LeaveOutcome::Removed
    }

    /// Host-driven start. Requires both teams filled to `team_size` while
    /// open. Moves to `Starting` and arms the readiness barrier.
    pub fn start(&mut self, requester: HandlerId) {
        if requester != self.host || !self.open() {
            return;
        }
        if self.team_a.len() != self.team_size as usize
            || self.team_b.len() != self.team_size as usize
        {
            return;
        }
        self.state = RoomState::Starting;
        self.ready.clear();
        for id in self.team_a.iter().chain(self.team_b.iter()) {
            if let Some(member) = self.members.get(id) {
                member.send(ServerEvent::GameStart);
            }
        }
        info!("room {} starting", self.code);
    }

    /// One `ready` ack from a team member. Once all `2 * team_size` have
    /// acked, the room runs.
    // TODO: time out rooms stuck in Starting when a member never acks ready;
    // today the barrier waits forever.
    pub fn ready(&mut self, id: HandlerId) {
        if self.state != RoomState::Starting || self.team_of(id).is_none() {
            return;
        }
        self.ready.insert(id);
        if self.ready.len() == 2 * self.team_size as usize {
            self.state = RoomState::Running;
            debug!("room {} running", self.code);
        }
    }

    /// Broadcast `gameEnd` to every member and close. The caller removes the
    /// room from the registry; sessions clear their membership when the
    /// `gameEnd` drains through their outbound channel.
    pub fn destroy(&mut self) {
        self.broadcast(ServerEvent::GameEnd);
        self.state = RoomState::Closed;
        self.members.clear();
        self.team_a.clear();
        self.team_b.clear();
        self.spectators.clear();
        self.ready.clear();
        info!("room {} destroyed", self.code);
    }

    pub fn set_mode(&mut self, requester: HandlerId, mode: GameMode) {
        if requester != self.host || !self.open() {
            return;
        }
        self.mode = mode;
        self.broadcast(ServerEvent::GameType(mode));
    }

    pub fn set_team_size(&mut self, requester: HandlerId, size: u8) {
        if requester != self.host || !self.open() || !(1..=3).contains(&size) {
            return;
        }
        self.team_size = size;
        self.broadcast_rosters();
    }

    pub fn set_allow_spectators(&mut self, requester: HandlerId, allow: bool) {
        if requester != self.host || !self.open() {
            return;
        }
        self.allow_spectators = allow;
    }

    pub fn set_public(&mut self, requester: HandlerId, public: bool) {
        if requester != self.host || !self.open() {
            return;
        }
        self.public = public;
    }

    /// Lobby projection, or `None` when this room should not be listed for
    /// the given browsing intent.
    pub fn public_info(&self, spectating: bool) -> Option<PublicRoomInfo> {
        if !self.public || self.state == RoomState::Closed {
            return None;
        }
        let listable = if spectating {
            self.allow_spectators
        } else {
            self.open() && !self.teams_full()
        };
        if !listable {
            return None;
        }
        let host_name = self
            .members
            .get(&self.host)
            .map(|m| m.username.clone())
            .unwrap_or_default();
        Some(PublicRoomInfo {
            code: self.code.as_str().to_string(),
            mode: self.mode,
            host_name,
            open: self.open(),
            team_size: self.team_size,
            allows_spectators: self.allow_spectators,
        })
    }

    /// Whether a `joinGame` for this room may proceed.
    pub fn joinable(&self, spectating: bool) -> bool {
        match self.state {
            RoomState::Open => true,
            RoomState::Starting | RoomState::Running => spectating && self.allow_spectators,
            RoomState::Closed => false,
        }
    }
}
