use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::player::{ConnId, Player, PlayerId, PlayerMap, PlayerState, INVALID_MSG_LIMIT};
use crate::protocol::{self, Message};
use crate::room::{Room, RoomState, MAX_PLAYERS_PER_ROOM};
use crate::server::Outbox;

/// How long a disconnected player's identity (credits, seat) is held for
/// reconnection before being garbage-collected.
pub const RECOVERY_TTL: Duration = Duration::from_secs(300);

const NICKNAME_MIN_LEN: usize = 3;
const NICKNAME_MAX_LEN: usize = 16;

fn valid_nickname(nickname: &str) -> bool {
    (NICKNAME_MIN_LEN..=NICKNAME_MAX_LEN).contains(&nickname.len())
        && nickname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Registry of every player the server knows about, online or awaiting
/// reconnection, plus the fixed room directory.
pub struct Lobby {
    next_player_id: u64,
    /// The arena; rooms and the maps below reference into it by id.
    pub players: PlayerMap,
    pub online: HashMap<ConnId, PlayerId>,
    /// Disconnected but recoverable sessions, keyed by nickname.
    pub recoverable: HashMap<String, PlayerId>,
    pub rooms: Vec<Room>,
    pub max_players: usize,
    dirty: bool,
}

impl Lobby {
    pub fn new(room_count: usize, max_players: usize) -> Self {
        let rooms = (0..room_count).map(Room::new).collect();
        info!("lobby: initialized {} game rooms", room_count);
        Self {
            next_player_id: 0,
            players: PlayerMap::new(),
            online: HashMap::new(),
            recoverable: HashMap::new(),
            rooms,
            max_players,
            dirty: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.online.len() >= self.max_players
    }

    pub fn player_by_conn(&self, conn: ConnId) -> Option<PlayerId> {
        self.online.get(&conn).copied()
    }

    /// Registers a fresh, anonymous player for an accepted socket and asks
    /// it to log in.
    pub fn add_player(&mut self, conn: ConnId, outbox: &Outbox) {
        self.next_player_id += 1;
        let pid = PlayerId(self.next_player_id);
        self.players.insert(pid, Player::new(conn));
        self.online.insert(conn, pid);
        debug!("lobby: player {} added on conn {}", pid, conn);
        outbox.send(conn, protocol::CMD_REQ_NICK, "");
    }

    /// Handles a closed socket. A logged-in player is parked in the
    /// recoverable map; mid-round their seat is kept so they can reclaim
    /// it. Anonymous players are dropped outright.
    pub fn remove_player(&mut self, conn: ConnId, outbox: &Outbox) {
        let Some(pid) = self.online.remove(&conn) else {
            return;
        };
        let (nickname, room_id) = match self.players.get_mut(&pid) {
            Some(player) => {
                player.conn = None;
                (player.nickname.clone(), player.room_id)
            }
            None => return,
        };
        if let Some(rid) = room_id {
            if let Some(room) = self.rooms.get_mut(rid) {
                if room.state == RoomState::Playing {
                    // Keep the seat; the turn timer deals with their turn
                    let payload = room.game_state_payload(&mut self.players);
                    room.broadcast(&self.players, outbox, protocol::CMD_GAME_STATE, &payload);
                } else {
                    room.remove_player(pid, &mut self.players, outbox);
                    if room.player_count() == 0 {
                        room.reset_round(&mut self.players);
                    } else {
                        let payload = room.room_state_payload(&self.players);
                        room.broadcast(&self.players, outbox, protocol::CMD_ROOM_STATE, &payload);
                    }
                }
            }
        }
        if nickname.is_empty() {
            self.players.remove(&pid);
        } else {
            if let Some(player) = self.players.get_mut(&pid) {
                player.state = PlayerState::Disconnected;
            }
            info!("lobby: {} disconnected, session held for recovery", nickname);
            self.recoverable.insert(nickname, pid);
        }
        self.dirty = true;
        debug!("lobby: player removed on conn {}", conn);
    }

    /// Removes a player from everything with no recovery; used once the
    /// invalid-message cap is exceeded.
    fn destroy(&mut self, pid: PlayerId, outbox: &Outbox) {
        let (conn, nickname, room_id) = match self.players.get(&pid) {
            Some(p) => (p.conn, p.nickname.clone(), p.room_id),
            None => return,
        };
        if let Some(rid) = room_id {
            if let Some(room) = self.rooms.get_mut(rid) {
                room.remove_player(pid, &mut self.players, outbox);
                if room.player_count() == 0 {
                    room.reset_round(&mut self.players);
                } else {
                    let payload = room.room_state_payload(&self.players);
                    room.broadcast(&self.players, outbox, protocol::CMD_ROOM_STATE, &payload);
                }
            }
        }
        self.players.remove(&pid);
        self.recoverable.retain(|_, &mut q| q != pid);
        if let Some(conn) = conn {
            self.online.remove(&conn);
            outbox.close(conn);
        }
        warn!("lobby: player {} ({}) destroyed", pid, nickname);
        self.dirty = true;
    }

    fn note_invalid(&mut self, pid: PlayerId, outbox: &Outbox) {
        let (count, conn) = match self.players.get_mut(&pid) {
            Some(player) => {
                player.invalid_msg_count += 1;
                (player.invalid_msg_count, player.conn)
            }
            None => return,
        };
        if count > INVALID_MSG_LIMIT {
            if let Some(conn) = conn {
                outbox.send(conn, protocol::CMD_DISCONNECT, "Too many invalid messages");
            }
            self.destroy(pid, outbox);
        } else if let Some(conn) = conn {
            outbox.send(conn, protocol::CMD_INVALID_MSG, "Invalid message");
        }
    }

    /// Routes one valid frame from a connection: lobby commands here,
    /// everything else to the player's room.
    pub fn handle(&mut self, conn: ConnId, msg: &Message, outbox: &Outbox) {
        let Some(pid) = self.player_by_conn(conn) else {
            return;
        };
        let (has_nickname, state) = match self.players.get(&pid) {
            Some(p) => (!p.nickname.is_empty(), p.state),
            None => return,
        };

        if !has_nickname && msg.command != protocol::CMD_LOGIN {
            warn!("conn {} attempted {} before login", conn, msg.command);
            self.note_invalid(pid, outbox);
            return;
        }

        if msg.command == protocol::CMD_LEAVE_ROOM {
            self.handle_leave_room(pid, outbox);
            return;
        }

        if state == PlayerState::InRoom {
            self.forward_to_room(pid, msg, outbox);
            return;
        }

        match msg.command.as_str() {
            protocol::CMD_LOGIN => self.handle_login(conn, pid, msg, outbox),
            protocol::CMD_JOIN => self.handle_join(pid, msg, outbox),
            _ => {
                warn!("conn {}: unknown lobby command {}", conn, msg.command);
                self.note_invalid(pid, outbox);
            }
        }
    }

    fn forward_to_room(&mut self, pid: PlayerId, msg: &Message, outbox: &Outbox) {
        let room_id = self.players.get(&pid).and_then(|p| p.room_id);
        let Some(rid) = room_id else {
            error!("player {} is marked in-room without a room", pid);
            return;
        };
        let Some(room) = self.rooms.get_mut(rid) else {
            error!("player {} is in unknown room {}", pid, rid);
            return;
        };
        let flow = room.handle(pid, msg, &mut self.players, outbox);
        if flow.dirty {
            self.dirty = true;
        }
        if flow.destroy {
            self.destroy(pid, outbox);
        }
    }

    fn handle_login(&mut self, conn: ConnId, pid: PlayerId, msg: &Message, outbox: &Outbox) {
        let nickname = msg.args.first().cloned().unwrap_or_default();
        if nickname.is_empty() {
            error!("LOGIN without a nickname on conn {}", conn);
            outbox.send(conn, protocol::CMD_NACK_NICK, "Nickname required");
            return;
        }
        let taken = self
            .online
            .values()
            .any(|q| self.players.get(q).is_some_and(|p| p.nickname == nickname));
        if taken {
            info!("conn {}: nickname {} already taken", conn, nickname);
            outbox.send(conn, protocol::CMD_NACK_NICK, "Nickname already taken");
            return;
        }

        // A known disconnected nickname reclaims its old session wholesale
        if let Some(&recovered) = self.recoverable.get(&nickname) {
            self.recoverable.remove(&nickname);
            self.players.remove(&pid);
            self.online.insert(conn, recovered);
            let Some(player) = self.players.get_mut(&recovered) else {
                return;
            };
            player.conn = Some(conn);
            player.invalid_msg_count = 0;
            player.touch();
            player.state = if player.room_id.is_some() {
                PlayerState::InRoom
            } else {
                PlayerState::Lobby
            };
            let room_code = player.room_id.map(|r| r as i64).unwrap_or(-1);
            let reply = format!("{};{};{}", player.nickname, player.credits, room_code);
            info!("conn {}: {} reconnected", conn, player.nickname);
            outbox.send(conn, protocol::CMD_ACK_RECOVER, &reply);
            self.dirty = true;
            return;
        }

        let current = self
            .players
            .get(&pid)
            .map(|p| p.nickname.clone())
            .unwrap_or_default();
        if !current.is_empty() && current != nickname {
            warn!("conn {} tried to change nickname from {}", conn, current);
            self.note_invalid(pid, outbox);
            return;
        }
        if !valid_nickname(&nickname) {
            error!("invalid nickname on conn {} ({})", conn, nickname);
            outbox.send(conn, protocol::CMD_NACK_NICK, "Invalid nickname");
            return;
        }
        if let Some(player) = self.players.get_mut(&pid) {
            player.nickname = nickname;
            info!("conn {} logged in as {}", conn, player.nickname);
            let reply = format!("{};{}", player.nickname, player.credits);
            outbox.send(conn, protocol::CMD_ACK_NICK, &reply);
            self.dirty = true;
        }
    }

    fn handle_join(&mut self, pid: PlayerId, msg: &Message, outbox: &Outbox) {
        let (conn, credits) = match self.players.get(&pid) {
            Some(p) => (p.conn, p.credits),
            None => return,
        };
        let Some(room_id) = msg.args.first().and_then(|a| a.parse::<usize>().ok()) else {
            error!("JOIN with missing or malformed room id");
            if let Some(conn) = conn {
                outbox.send(conn, protocol::CMD_NACK_JOIN, "Missing room ID");
            }
            return;
        };
        let joinable = credits > 0
            && self.rooms.get(room_id).is_some_and(|room| {
                !room.is_full() && room.state == RoomState::WaitingForPlayers
            });
        if !joinable {
            info!("player {} cannot join room {}", pid, room_id);
            if let Some(conn) = conn {
                outbox.send(conn, protocol::CMD_NACK_JOIN, "Cannot join room");
            }
            return;
        }
        let room = &mut self.rooms[room_id];
        room.add_player(pid);
        if let Some(player) = self.players.get_mut(&pid) {
            player.room_id = Some(room_id);
            player.state = PlayerState::InRoom;
        }
        info!("player {} assigned to room {}", pid, room_id);
        if let Some(conn) = conn {
            outbox.send(conn, protocol::CMD_ACK_JOIN, "");
        }
        let payload = room.room_state_payload(&self.players);
        room.broadcast(&self.players, outbox, protocol::CMD_ROOM_STATE, &payload);
        self.dirty = true;
    }

    fn handle_leave_room(&mut self, pid: PlayerId, outbox: &Outbox) {
        let (conn, room_id) = match self.players.get(&pid) {
            Some(p) => (p.conn, p.room_id),
            None => return,
        };
        let Some(rid) = room_id.filter(|&r| r < self.rooms.len()) else {
            error!("player {} left without being in a valid room", pid);
            if let Some(conn) = conn {
                outbox.send(conn, protocol::CMD_NACK_LEAVE, "Not in a valid room");
            }
            return;
        };
        let room = &mut self.rooms[rid];
        room.remove_player(pid, &mut self.players, outbox);
        if let Some(conn) = conn {
            outbox.send(conn, protocol::CMD_ACK_LEAVE, "");
        }
        if room.player_count() == 0 {
            room.reset_round(&mut self.players);
            info!("room {} reset (no players left)", rid);
        } else if room.state == RoomState::WaitingForPlayers {
            let payload = room.room_state_payload(&self.players);
            room.broadcast(&self.players, outbox, protocol::CMD_ROOM_STATE, &payload);
        }
        self.dirty = true;
    }

    /// Per-tick housekeeping: expire stale recoverable sessions, publish a
    /// pending lobby snapshot, and advance every room.
    pub fn update(&mut self, outbox: &Outbox) {
        self.expire_recoverable(outbox);
        if self.dirty {
            let payload = self.lobby_state_payload();
            self.broadcast(outbox, protocol::CMD_LOBBY_INFO, &payload);
            self.dirty = false;
        }
        for room in &mut self.rooms {
            if room.update(&mut self.players, outbox) {
                self.dirty = true;
            }
        }
    }

    fn expire_recoverable(&mut self, outbox: &Outbox) {
        let expired: Vec<(String, PlayerId)> = self
            .recoverable
            .iter()
            .filter(|(_, pid)| {
                self.players
                    .get(*pid)
                    .map_or(true, |p| p.last_activity.elapsed() >= RECOVERY_TTL)
            })
            .map(|(nick, pid)| (nick.clone(), *pid))
            .collect();
        for (nickname, pid) in expired {
            info!("lobby: recovery window expired for {}", nickname);
            self.recoverable.remove(&nickname);
            let room_id = self.players.get(&pid).and_then(|p| p.room_id);
            if let Some(rid) = room_id {
                if let Some(room) = self.rooms.get_mut(rid) {
                    room.remove_player(pid, &mut self.players, outbox);
                    if room.player_count() == 0 {
                        room.reset_round(&mut self.players);
                    }
                }
            }
            self.players.remove(&pid);
            self.dirty = true;
        }
    }

    /// `LBBYINFO` payload: online count, room count, then per-room
    /// occupancy and state code.
    pub fn lobby_state_payload(&self) -> String {
        let mut state = format!("ONLINE;{}:ROOMS;{}:", self.online.len(), self.rooms.len());
        for room in &self.rooms {
            state.push_str(&format!(
                "R{};{}/{};{}:",
                room.id,
                room.player_count(),
                MAX_PLAYERS_PER_ROOM,
                room.state.wire_code()
            ));
        }
        state
    }

    /// Sends to every logged-in player currently sitting in the lobby.
    fn broadcast(&self, outbox: &Outbox, command: &str, args: &str) {
        for pid in self.online.values() {
            let Some(player) = self.players.get(pid) else { continue };
            if player.nickname.is_empty() || player.state != PlayerState::Lobby {
                continue;
            }
            if let Some(conn) = player.conn {
                outbox.send(conn, command, args);
            }
        }
    }
}
