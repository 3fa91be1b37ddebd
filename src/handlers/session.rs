use crate::broker::Broker;
use crate::game::relay::{self, RelayError};
use crate::game::room::{LeaveOutcome, Member, RoomCode};
use crate::handlers::{EventSender, HandlerId};
use crate::models::{
    ClientEvent, ClientInfo, DialectId, GameMode, GridSize, InputFrame, ServerEvent, TickFrame,
};
use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Idle sockets are pinged at this interval.
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// No inbound frame for this long kills the connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Inbound events per second a connection may sustain after decay.
const FLOOD_LIMIT: u32 = 250;
/// Minimum spacing between `createGame` calls.
const CREATE_GAME_COOLDOWN: Duration = Duration::from_secs(1);
const OUTBOUND_POLL: Duration = Duration::from_millis(10);
const GUARD_INTERVAL: Duration = Duration::from_secs(1);

/// One connected client: handshake state, admission guards, and the routing
/// of its events into rooms. The actor mailbox serializes inbound frames;
/// outbound frames drain from the mpsc channel that rooms hold the sender
/// half of.
pub struct PlayerSession {
    broker: Arc<Broker>,
    id: HandlerId,
    username: String,
    dialect: Option<DialectId>,
    ip: String,
    current_room: Option<RoomCode>,
    last_create_game: Option<Instant>,
    last_inbound: Instant,
    events_this_second: u32,
    tx: EventSender,
    rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl PlayerSession {
    pub fn new(broker: Arc<Broker>, ip: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        PlayerSession {
            broker,
            id: Uuid::new_v4(),
            username: "Unknown".to_string(),
            dialect: None,
            ip,
            current_room: None,
            last_create_game: None,
            last_inbound: Instant::now(),
            events_this_second: 0,
            tx,
            rx: Some(rx),
        }
    }

    fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    fn handshaken(&self) -> bool {
        self.dialect.is_some()
    }

    fn member(&self) -> Option<Member> {
        Some(Member {
            id: self.id,
            username: self.username.clone(),
            dialect: self.dialect?,
            sender: self.tx.clone(),
        })
    }

    /// Current room membership, validated against the registry. A stale code
    /// (room destroyed, or this session kicked) is cleared.
    fn room_membership(&mut self) -> Option<RoomCode> {
        let code = self.current_room.clone()?;
        let rooms = self.broker.rooms.lock().unwrap();
        let member = rooms
            .get(&code)
            .is_some_and(|room| room.is_member(self.id));
        drop(rooms);
        if member {
            Some(code)
        } else {
            self.current_room = None;
            None
        }
    }

    /// Tear this session down. `kicked` additionally tells the client it was
    /// kicked before the socket closes.
    fn destroy(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: &str, kicked: bool) {
        warn!("destroying handler {} ({}): {reason}", self.id, self.ip);
        if kicked {
            if let Ok(text) = serde_json::to_string(&ServerEvent::GameKicked) {
                ctx.text(text);
            }
        }
        ctx.stop();
    }

    fn drain_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(rx) = &mut self.rx {
            while let Ok(event) = rx.try_recv() {
                // a room ending or a kick ends this session's membership;
                // the event drains here in order, so clearing now cannot
                // race an earlier tick
                if matches!(event, ServerEvent::GameEnd | ServerEvent::GameKicked) {
                    self.current_room = None;
                }
                match serde_json::to_string(&event) {
                    Ok(text) => ctx.text(text),
                    Err(e) => warn!("cannot serialize outbound event: {e}"),
                }
            }
        }
    }

    fn run_guards(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.broker.is_active() {
            ctx.stop();
            return;
        }
        self.events_this_second = self.events_this_second.saturating_sub(FLOOD_LIMIT);
        if self.events_this_second > 0 {
            self.destroy(ctx, "websocket spam", false);
            return;
        }
        if self.last_inbound.elapsed() > IDLE_TIMEOUT {
            self.destroy(ctx, "timed out", false);
        }
    }

    // ---- handshake ----

    fn on_client_info(&mut self, payload: serde_json::Value, ctx: &mut ws::WebsocketContext<Self>) {
        let Ok(info) = serde_json::from_value::<ClientInfo>(payload) else {
            self.destroy(ctx, "Invalid connection handshake data", false);
            return;
        };
        if !DialectId::CLIENT_DIALECTS.contains(&info.client) || info.username.is_empty() {
            self.destroy(ctx, "Invalid connection handshake data", false);
            return;
        }
        if let Some(password) = &info.password {
            // verification hook: the ciphertext must decode, but no
            // password is required or checked against anything
            if let Err(e) = self.broker.decrypt_password(password) {
                debug!("handler {} password decode failed: {e}", self.id);
                self.destroy(ctx, "Invalid connection handshake data", true);
                return;
            }
        }
        self.username = info.username;
        self.dialect = Some(info.client);
        self.send(ServerEvent::ClientInfoRecieved);
        debug!(
            "handler {} identified as {} ({})",
            self.id,
            self.username,
            info.client
        );
    }

    // ---- lobby routes ----

    fn on_create_game(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(last) = self.last_create_game {
            if last.elapsed() < CREATE_GAME_COOLDOWN {
                self.destroy(ctx, "game create spam", false);
                return;
            }
        }
        self.last_create_game = Some(Instant::now());
        if self.room_membership().is_some() {
            return;
        }
        let Some(member) = self.member() else {
            return;
        };
        let code = self.broker.create_room(member);
        self.current_room = Some(code);
    }

    fn on_get_public_rooms(&mut self, mode: GameMode, spectating: bool) {
        let rooms = self.broker.rooms.lock().unwrap();
        let listing: Vec<_> = rooms
            .values()
            .filter(|room| room.mode == mode)
            .filter_map(|room| room.public_info(spectating))
            .collect();
        drop(rooms);
        self.send(ServerEvent::PublicRooms(listing));
    }

    fn on_join_game(&mut self, code: String, spectating: bool) {
        if self.room_membership().is_some() {
            return;
        }
        let Some(member) = self.member() else {
            return;
        };
        let Some(code) = RoomCode::parse(&code) else {
            self.send(ServerEvent::JoinFail("Game not found".to_string()));
            return;
        };
        let rooms_handle = Arc::clone(&self.broker.rooms);
        let mut rooms = rooms_handle.lock().unwrap();
        match rooms.get_mut(&code) {
            Some(room) if room.joinable(spectating) => {
                use crate::game::room::JoinOutcome;
                if room.join(member, spectating) != JoinOutcome::Rejected {
                    self.current_room = Some(code.clone());
                }
            }
            _ => self.send(ServerEvent::JoinFail("Game not found".to_string())),
        }
    }

    fn on_leave_game(&mut self) {
        let Some(code) = self.room_membership() else {
            return;
        };
        let mut rooms = self.broker.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(&code) {
            if room.leave(self.id) == LeaveOutcome::WasHost {
                room.destroy();
                rooms.remove(&code);
            }
        }
        drop(rooms);
        self.current_room = None;
    }

    // ---- room routes ----

    fn with_room(&mut self, f: impl FnOnce(&mut crate::game::room::Room, HandlerId)) {
        let Some(code) = self.room_membership() else {
            return;
        };
        let mut rooms = self.broker.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(&code) {
            f(room, self.id);
        }
    }

    fn on_kick_player(&mut self, username: String) {
        self.with_room(|room, requester| {
            if requester != room.host {
                return;
            }
            if let Some(target) = room.kick(&username) {
                room.leave(target);
            }
        });
    }

    fn on_move_player(&mut self, username: String, team: u8, username2: Option<String>) {
        self.with_room(|room, requester| {
            if requester != room.host {
                return;
            }
            room.move_player(&username, team, username2.as_deref());
        });
    }

    // ---- relay routes ----

    fn on_tick(&mut self, frame: TickFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let result = self.relay_in_room(|room, id, converter| {
            relay::relay_tick(room, id, &frame, converter)
        });
        if let Err(RelayError::InvalidTick) = result {
            self.destroy(ctx, "Invalid game tick data", false);
        }
    }

    fn on_grid_size(&mut self, size: GridSize, ctx: &mut ws::WebsocketContext<Self>) {
        let result = self.relay_in_room(|room, id, _| relay::relay_grid_size(room, id, size));
        if let Err(RelayError::InvalidGridSize) = result {
            self.destroy(ctx, "Invalid grid size data", false);
        }
    }

    fn on_input(&mut self, frame: InputFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let result = self.relay_in_room(|room, id, converter| {
            relay::relay_input(room, id, &frame, converter)
        });
        if let Err(RelayError::InvalidInput) = result {
            self.destroy(ctx, "Invalid game input data", false);
        }
    }

    fn on_input_batch(&mut self, frames: Vec<InputFrame>, ctx: &mut ws::WebsocketContext<Self>) {
        let result = self.relay_in_room(|room, id, converter| {
            relay::relay_input_batch(room, id, &frames, converter)
        });
        if let Err(RelayError::InvalidInput) = result {
            self.destroy(ctx, "Invalid game input data", false);
        }
    }

    fn relay_in_room(
        &mut self,
        f: impl FnOnce(
            &crate::game::room::Room,
            HandlerId,
            &crate::pixels::PixelConverter,
        ) -> Result<(), RelayError>,
    ) -> Result<(), RelayError> {
        let Some(code) = self.room_membership() else {
            return Ok(());
        };
        let rooms = self.broker.rooms.lock().unwrap();
        match rooms.get(&code) {
            Some(room) => f(room, self.id, &self.broker.converter),
            None => Ok(()),
        }
    }

    // ---- dispatch ----

    fn route(&mut self, event: ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            ClientEvent::ClientInfo(_) => {} // handshake already done; ignore
            ClientEvent::CreateGame => self.on_create_game(ctx),
            ClientEvent::CancelCreateGame => self.on_leave_game(),
            ClientEvent::GetPublicRooms { mode, spectating } => {
                self.on_get_public_rooms(mode, spectating)
            }
            ClientEvent::JoinGame { code, spectating } => self.on_join_game(code, spectating),
            ClientEvent::LeaveGame => self.on_leave_game(),
            ClientEvent::ChangeTeam(team) => {
                self.with_room(|room, id| room.change_team(id, team))
            }
            ClientEvent::GameType(mode) => self.with_room(|room, id| room.set_mode(id, mode)),
            ClientEvent::AllowSpectators(allow) => {
                self.with_room(|room, id| room.set_allow_spectators(id, allow))
            }
            ClientEvent::IsPublic(public) => {
                self.with_room(|room, id| room.set_public(id, public))
            }
            ClientEvent::TeamSize(size) => {
                self.with_room(|room, id| room.set_team_size(id, size))
            }
            ClientEvent::KickPlayer(username) => self.on_kick_player(username),
            ClientEvent::MovePlayer {
                username,
                team,
                username2,
            } => self.on_move_player(username, team, username2),
            ClientEvent::StartGame => self.with_room(|room, id| room.start(id)),
            ClientEvent::Ready => self.with_room(|room, id| room.ready(id)),
            ClientEvent::GridSize(size) => self.on_grid_size(size, ctx),
            ClientEvent::Tick(frame) => self.on_tick(frame, ctx),
            ClientEvent::Input(frame) => self.on_input(frame, ctx),
            ClientEvent::InputBatch(frames) => self.on_input_batch(frames, ctx),
            ClientEvent::Ping => self.send(ServerEvent::Pong),
        }
    }

    fn on_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        self.events_this_second = self.events_this_second.saturating_add(1);
        self.last_inbound = Instant::now();

        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            if self.handshaken() {
                self.destroy(ctx, "Invalid message data", false);
            }
            return;
        };
        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();

        if !self.handshaken() {
            // only the handshake is routed pre-handshake; everything else
            // is ignored
            if event_type == "clientInfo" {
                let payload = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
                self.on_client_info(payload, ctx);
            }
            return;
        }

        match serde_json::from_value::<ClientEvent>(value) {
            Ok(event) => self.route(event, ctx),
            // a malformed frame blames its sender; for tick and input
            // frames the reason mirrors the relay validation
            Err(_) => match event_type.as_str() {
                "tick" => self.destroy(ctx, "Invalid game tick data", false),
                "input" | "inputBatch" => self.destroy(ctx, "Invalid game input data", false),
                "gridSize" => self.destroy(ctx, "Invalid grid size data", false),
                _ => self.destroy(ctx, "Invalid message data", false),
            },
        }
    }
}

impl Actor for PlayerSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.broker.register_handler(self.id);
        self.send(ServerEvent::RequestClientInfo(self.broker.public_jwk()));

        ctx.run_interval(OUTBOUND_POLL, |act, ctx| act.drain_outbound(ctx));
        ctx.run_interval(GUARD_INTERVAL, |act, ctx| act.run_guards(ctx));
        ctx.run_interval(PING_INTERVAL, |act, ctx| {
            if act.last_inbound.elapsed() >= PING_INTERVAL {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // idempotent teardown: room membership first, then the registry
        self.on_leave_game();
        self.broker.unregister_handler(self.id);
        debug!("handler {} gone", self.id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PlayerSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_inbound = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_inbound = Instant::now();
            }
            Ok(ws::Message::Text(text)) => self.on_text(&text, ctx),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                debug!("handler {} transport error: {e}", self.id);
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// `GET /pixsim-api/game` — the event transport upgrade.
pub async fn game_ws(
    req: HttpRequest,
    stream: web::Payload,
    broker: web::Data<Broker>,
) -> Result<HttpResponse, Error> {
    if !broker.is_active() || broker.is_crashed() {
        return Ok(HttpResponse::ServiceUnavailable().finish());
    }
    let ip = forwarded_ip(&req);
    if !broker.admit(&ip) {
        return Ok(HttpResponse::TooManyRequests().finish());
    }
    let session = PlayerSession::new(broker.clone().into_inner(), ip);
    ws::start(session, &req, stream)
}

/// Forwarded-for header, then socket address, then the `un-ip` placeholder.
fn forwarded_ip(req: &HttpRequest) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "un-ip".to_string())
}
