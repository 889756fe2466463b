use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::thread_rng;
use tracing::{debug, info, warn};

use crate::card::{hand_value, render_hand, Card};
use crate::player::{Player, PlayerId, PlayerMap, INVALID_MSG_LIMIT};
use crate::protocol::{self, Message};
use crate::server::Outbox;

pub const MAX_PLAYERS_PER_ROOM: usize = 7;

/// A turn is forfeited after this much inactivity; any HIT restarts it.
const TURN_TIMEOUT: Duration = Duration::from_secs(30);

/// The dealer draws to 17 and stands on every 17, soft included.
const DEALER_STAND_VALUE: u32 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    WaitingForPlayers,
    Betting,
    Playing,
    RoundEnd,
}

impl RoomState {
    /// Numeric code used in the `LBBYINFO` payload.
    pub fn wire_code(self) -> u8 {
        match self {
            RoomState::WaitingForPlayers => 0,
            RoomState::Betting => 1,
            RoomState::Playing => 2,
            RoomState::RoundEnd => 3,
        }
    }
}

/// What the lobby should do after a room handled a message.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoomFlow {
    /// The lobby snapshot went stale.
    pub dirty: bool,
    /// The sender exceeded the invalid-message cap and must be destroyed.
    pub destroy: bool,
}

#[derive(Debug)]
pub struct Room {
    pub id: usize,
    pub state: RoomState,
    /// Seats in join order; capped at `MAX_PLAYERS_PER_ROOM`.
    pub players: Vec<PlayerId>,
    pub dealer_hand: Vec<Card>,
    /// Acting order for the current round; the head holds the turn.
    pub turn_queue: VecDeque<PlayerId>,
    pub turn_started: Instant,
}

impl Room {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: RoomState::WaitingForPlayers,
            players: Vec::new(),
            dealer_hand: Vec::new(),
            turn_queue: VecDeque::new(),
            turn_started: Instant::now(),
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS_PER_ROOM
    }

    /// Puts the room back into WAITING_FOR_PLAYERS and clears every trace
    /// of the previous round.
    pub fn reset_round(&mut self, players: &mut PlayerMap) {
        self.state = RoomState::WaitingForPlayers;
        self.dealer_hand.clear();
        self.turn_queue.clear();
        for pid in &self.players {
            if let Some(player) = players.get_mut(pid) {
                player.reset_round_state();
            }
        }
        info!("room {} reset to default state", self.id);
    }

    pub fn add_player(&mut self, pid: PlayerId) -> bool {
        if self.is_full() {
            warn!("room {} is full", self.id);
            return false;
        }
        self.players.push(pid);
        true
    }

    /// Vacates a seat. A leaver holding the turn is auto-stood first so
    /// the queue keeps moving.
    pub fn remove_player(&mut self, pid: PlayerId, players: &mut PlayerMap, outbox: &Outbox) {
        if !self.players.contains(&pid) {
            return;
        }
        if self.turn_queue.front() == Some(&pid) {
            self.player_stand(pid);
            let payload = self.game_state_payload(players);
            self.broadcast(players, outbox, protocol::CMD_GAME_STATE, &payload);
        } else {
            self.turn_queue.retain(|&q| q != pid);
        }
        self.players.retain(|&q| q != pid);
        if let Some(player) = players.get_mut(&pid) {
            player.room_id = None;
            player.state = crate::player::PlayerState::Lobby;
            player.reset_round_state();
        }
        info!("room {}: player removed", self.id);
    }

    /// Sends one frame to every seated player that is currently reachable.
    pub fn broadcast(&self, players: &PlayerMap, outbox: &Outbox, command: &str, args: &str) {
        for pid in &self.players {
            let Some(player) = players.get(pid) else { continue };
            if player.is_offline() {
                continue;
            }
            if let Some(conn) = player.conn {
                outbox.send(conn, command, args);
            }
        }
    }

    fn all_ready(&self, players: &PlayerMap) -> bool {
        self.players
            .iter()
            .all(|pid| players.get(pid).is_some_and(|p| p.ready))
    }

    fn all_bets_placed(&self, players: &PlayerMap) -> bool {
        self.players
            .iter()
            .all(|pid| players.get(pid).is_some_and(|p| p.placed_bet))
    }

    /// Routes one frame from a seated player through the state machine,
    /// rebroadcasts the room snapshot, and advances the round if the frame
    /// unblocked a transition.
    pub fn handle(
        &mut self,
        pid: PlayerId,
        msg: &Message,
        players: &mut PlayerMap,
        outbox: &Outbox,
    ) -> RoomFlow {
        debug!("room {}: handling {} from player {}", self.id, msg.command, pid);

        // A returning player asks for a snapshot of where the room is
        if msg.command == protocol::CMD_RECONNECT {
            if let Some(conn) = players.get(&pid).and_then(|p| p.conn) {
                if self.state == RoomState::Playing {
                    let payload = self.game_state_payload(players);
                    outbox.send(conn, protocol::CMD_GAME_STATE, &payload);
                } else {
                    let payload = self.room_state_payload(players);
                    outbox.send(conn, protocol::CMD_ROOM_STATE, &payload);
                }
            }
            return RoomFlow::default();
        }

        let mut flow = match self.state {
            RoomState::WaitingForPlayers => self.handle_waiting(pid, msg, players, outbox),
            RoomState::Betting => self.handle_betting(pid, msg, players, outbox),
            RoomState::Playing => self.handle_playing(pid, msg, players, outbox),
            RoomState::RoundEnd => self.handle_round_end(pid, msg, players, outbox),
        };

        if self.state == RoomState::Playing {
            let payload = self.game_state_payload(players);
            self.broadcast(players, outbox, protocol::CMD_GAME_STATE, &payload);
        } else {
            let payload = self.room_state_payload(players);
            self.broadcast(players, outbox, protocol::CMD_ROOM_STATE, &payload);
        }
        flow.dirty |= self.update(players, outbox);
        flow
    }

    fn handle_waiting(
        &mut self,
        pid: PlayerId,
        msg: &Message,
        players: &mut PlayerMap,
        outbox: &Outbox,
    ) -> RoomFlow {
        match msg.command.as_str() {
            protocol::CMD_READY => {
                if let Some(player) = players.get_mut(&pid) {
                    player.ready = true;
                    info!("room {}: {} is ready", self.id, player.nickname);
                    if let Some(conn) = player.conn {
                        outbox.send(conn, protocol::CMD_ACK_READY, "");
                    }
                }
                RoomFlow::default()
            }
            protocol::CMD_NOT_READY => {
                if let Some(player) = players.get_mut(&pid) {
                    player.ready = false;
                    info!("room {}: {} is not ready", self.id, player.nickname);
                    if let Some(conn) = player.conn {
                        outbox.send(conn, protocol::CMD_ACK_NOT_READY, "");
                    }
                }
                RoomFlow::default()
            }
            protocol::CMD_PLAY_AGAIN => self.handle_play_again(pid, players, outbox, false),
            _ => self.reject_command(pid, players, outbox, "Invalid command during WAITING_FOR_PLAYERS"),
        }
    }

    fn handle_betting(
        &mut self,
        pid: PlayerId,
        msg: &Message,
        players: &mut PlayerMap,
        outbox: &Outbox,
    ) -> RoomFlow {
        match msg.command.as_str() {
            protocol::CMD_BET => {
                let amount = msg.args.first().and_then(|a| a.parse::<u32>().ok());
                let Some(player) = players.get_mut(&pid) else {
                    return RoomFlow::default();
                };
                let conn = player.conn;
                match amount {
                    Some(amount)
                        if !player.placed_bet && amount > 0 && amount <= player.credits =>
                    {
                        player.credits -= amount;
                        player.bet_amount = amount;
                        player.placed_bet = true;
                        info!("room {}: {} placed a bet of {}", self.id, player.nickname, amount);
                        if let Some(conn) = conn {
                            outbox.send(conn, protocol::CMD_ACK_BET, &format!(" {amount}"));
                        }
                    }
                    _ => {
                        info!("room {}: {} attempted an invalid bet", self.id, player.nickname);
                        if let Some(conn) = conn {
                            outbox.send(conn, protocol::CMD_NACK_BET, "Invalid bet amount");
                        }
                    }
                }
                RoomFlow::default()
            }
            _ => self.reject_command(pid, players, outbox, "Invalid command during BETTING"),
        }
    }

    fn handle_playing(
        &mut self,
        pid: PlayerId,
        msg: &Message,
        players: &mut PlayerMap,
        outbox: &Outbox,
    ) -> RoomFlow {
        match msg.command.as_str() {
            protocol::CMD_HIT => {
                if self.player_hit(pid, players) {
                    let Some(player) = players.get(&pid) else {
                        return RoomFlow::default();
                    };
                    let value = hand_value(&player.hand);
                    let nickname = player.nickname.clone();
                    let conn = player.conn;
                    if value > 21 {
                        info!("room {}: {} busted", self.id, nickname);
                        self.player_stand(pid);
                        if let Some(conn) = conn {
                            outbox.send(conn, protocol::CMD_BUST, "");
                        }
                    } else if value == 21 {
                        info!("room {}: {} hit 21", self.id, nickname);
                        self.player_stand(pid);
                        if let Some(conn) = conn {
                            outbox.send(conn, protocol::CMD_HIT21, "");
                        }
                    }
                } else if let Some(conn) = players.get(&pid).and_then(|p| p.conn) {
                    outbox.send(conn, protocol::CMD_NACK_HIT, "Cannot hit at this time");
                }
                RoomFlow::default()
            }
            protocol::CMD_STAND => {
                self.player_stand(pid);
                if let Some(conn) = players.get(&pid).and_then(|p| p.conn) {
                    outbox.send(conn, protocol::CMD_ACK_STAND, "");
                }
                RoomFlow::default()
            }
            _ => self.reject_command(pid, players, outbox, "Invalid command during PLAYING"),
        }
    }

    fn handle_round_end(
        &mut self,
        pid: PlayerId,
        msg: &Message,
        players: &mut PlayerMap,
        outbox: &Outbox,
    ) -> RoomFlow {
        match msg.command.as_str() {
            protocol::CMD_PLAY_AGAIN => self.handle_play_again(pid, players, outbox, true),
            _ => self.reject_command(pid, players, outbox, "Invalid command during ROUND_END"),
        }
    }

    /// `PAG_____`: opt in to the next round. Out of ROUND_END this performs
    /// the round reset; in WAITING_FOR_PLAYERS it is just acknowledged.
    /// Broke players cannot continue.
    fn handle_play_again(
        &mut self,
        pid: PlayerId,
        players: &mut PlayerMap,
        outbox: &Outbox,
        reset: bool,
    ) -> RoomFlow {
        let Some(player) = players.get(&pid) else {
            return RoomFlow::default();
        };
        let conn = player.conn;
        let nickname = player.nickname.clone();
        if player.credits == 0 {
            info!("room {}: {} cannot continue without credits", self.id, nickname);
            if let Some(conn) = conn {
                outbox.send(conn, protocol::CMD_NACK_PLAY_AGAIN, "Insufficient credits to continue");
            }
            return RoomFlow::default();
        }
        info!("room {}: {} is preparing for the next round", self.id, nickname);
        if reset {
            self.reset_round(players);
        }
        if let Some(conn) = conn {
            outbox.send(conn, protocol::CMD_ACK_PLAY_AGAIN, &self.id.to_string());
        }
        RoomFlow {
            dirty: reset,
            destroy: false,
        }
    }

    /// Replies `NACK_CMD` and counts the message against the sender's
    /// invalid-message allowance.
    fn reject_command(
        &mut self,
        pid: PlayerId,
        players: &mut PlayerMap,
        outbox: &Outbox,
        reason: &str,
    ) -> RoomFlow {
        let Some(player) = players.get_mut(&pid) else {
            return RoomFlow::default();
        };
        if let Some(conn) = player.conn {
            outbox.send(conn, protocol::CMD_NACK_CMD, reason);
        }
        player.invalid_msg_count += 1;
        if player.invalid_msg_count > INVALID_MSG_LIMIT {
            warn!("room {}: {} exceeded the invalid message limit", self.id, player.nickname);
            if let Some(conn) = player.conn {
                outbox.send(conn, protocol::CMD_DISCONNECT, "Too many invalid messages");
            }
            return RoomFlow {
                dirty: false,
                destroy: true,
            };
        }
        RoomFlow::default()
    }

    /// Drives the round state machine; called after every inbound frame and
    /// once per server tick. Returns true when the lobby snapshot went
    /// stale.
    pub fn update(&mut self, players: &mut PlayerMap, outbox: &Outbox) -> bool {
        match self.state {
            RoomState::WaitingForPlayers => {
                if !self.players.is_empty() && self.all_ready(players) {
                    self.state = RoomState::Betting;
                    info!("room {} transitioning to BETTING", self.id);
                    self.broadcast(players, outbox, protocol::CMD_REQ_BET, "");
                    return true;
                }
            }
            RoomState::Betting => {
                if !self.players.is_empty() && self.all_bets_placed(players) {
                    self.state = RoomState::Playing;
                    info!("room {} transitioning to PLAYING", self.id);
                    self.deal_cards(players);
                    self.turn_started = Instant::now();
                    let payload = self.game_state_payload(players);
                    self.broadcast(players, outbox, protocol::CMD_GAME_STATE, &payload);
                    return true;
                }
            }
            RoomState::Playing => {
                if self.turn_queue.is_empty() {
                    self.state = RoomState::RoundEnd;
                    info!("room {} transitioning to ROUND_END", self.id);
                    self.dealer_play();
                    let payload = self.game_state_payload(players);
                    self.broadcast(players, outbox, protocol::CMD_GAME_STATE, &payload);
                    for pid in self.players.clone() {
                        if let Some(player) = players.get_mut(&pid) {
                            let (credits, delta) = self.settle(player);
                            if let Some(conn) = player.conn {
                                outbox.send(conn, protocol::CMD_ROUND_END, &format!("{credits};{delta}"));
                            }
                        }
                    }
                    return true;
                }
                if self.turn_started.elapsed() >= TURN_TIMEOUT {
                    if let Some(&head) = self.turn_queue.front() {
                        let nickname = players
                            .get(&head)
                            .map(|p| p.nickname.clone())
                            .unwrap_or_default();
                        info!("room {}: {} timed out, auto-standing", self.id, nickname);
                        self.player_stand(head);
                        let payload = self.game_state_payload(players);
                        self.broadcast(players, outbox, protocol::CMD_GAME_STATE, &payload);
                    }
                }
            }
            RoomState::RoundEnd => {
                // Only an empty-of-humans room recycles itself; anyone still
                // online has to opt in with PAG_____
                let all_offline = self
                    .players
                    .iter()
                    .all(|pid| players.get(pid).map_or(true, Player::is_offline));
                if all_offline {
                    self.reset_round(players);
                    return true;
                }
            }
        }
        false
    }

    /// Deals the opening two cards to the dealer and every seat, and builds
    /// the turn queue in seat order.
    fn deal_cards(&mut self, players: &mut PlayerMap) {
        let mut rng = thread_rng();
        self.dealer_hand.clear();
        self.dealer_hand.push(Card::random(&mut rng));
        self.dealer_hand.push(Card::random(&mut rng));
        for pid in &self.players {
            if let Some(player) = players.get_mut(pid) {
                player.hand.clear();
                player.hand.push(Card::random(&mut rng));
                player.hand.push(Card::random(&mut rng));
                self.turn_queue.push_back(*pid);
            }
        }
    }

    /// The house draws to `DEALER_STAND_VALUE` and stands there, soft
    /// hands included.
    fn dealer_play(&mut self) {
        let mut rng = thread_rng();
        while hand_value(&self.dealer_hand) < DEALER_STAND_VALUE {
            self.dealer_hand.push(Card::random(&mut rng));
        }
    }

    /// Adds a card to the turn-holder's hand. Fails when it is not the
    /// player's turn or the hand is already at 21 or above.
    fn player_hit(&mut self, pid: PlayerId, players: &mut PlayerMap) -> bool {
        if self.turn_queue.front() != Some(&pid) {
            return false;
        }
        let Some(player) = players.get_mut(&pid) else {
            return false;
        };
        if hand_value(&player.hand) >= 21 {
            return false;
        }
        player.hand.push(Card::random(&mut thread_rng()));
        self.turn_started = Instant::now();
        true
    }

    /// Ends the player's turn iff they hold it, restarting the timer for
    /// the next seat.
    fn player_stand(&mut self, pid: PlayerId) {
        if self.turn_queue.front() == Some(&pid) {
            self.turn_queue.pop_front();
            self.turn_started = Instant::now();
        }
    }

    /// Settles one player against the dealer. Bets were debited when
    /// placed, so a loss needs no further debit; a push returns the stake
    /// and a win returns twice the stake. A two-card 21 pays 3:2.
    /// Returns the new credit balance and the signed result.
    fn settle(&self, player: &mut Player) -> (u32, i64) {
        let player_value = hand_value(&player.hand);
        let dealer_value = hand_value(&self.dealer_hand);
        let bet = player.bet_amount;
        let delta = if player_value > 21 || (dealer_value <= 21 && dealer_value > player_value) {
            info!("room {}: {} lost the round", self.id, player.nickname);
            -(bet as i64)
        } else if player_value == dealer_value {
            info!("room {}: {} pushed the round", self.id, player.nickname);
            player.credits += bet;
            bet as i64
        } else if player_value == 21 && player.hand.len() == 2 {
            info!("room {}: {} got blackjack", self.id, player.nickname);
            let winnings = bet + bet / 2;
            player.credits += winnings;
            winnings as i64
        } else {
            info!("room {}: {} won the round", self.id, player.nickname);
            let winnings = bet * 2;
            player.credits += winnings;
            winnings as i64
        };
        (player.credits, delta)
    }

    /// `ROMSTAUP` payload: one `P;<nick>;<status>;BET;<bet>:` section per
    /// seat; status 2 = offline, 1 = ready, 0 = otherwise.
    pub fn room_state_payload(&self, players: &PlayerMap) -> String {
        let mut state = String::new();
        for pid in &self.players {
            let Some(player) = players.get(pid) else { continue };
            let status = if player.is_offline() {
                '2'
            } else if player.ready {
                '1'
            } else {
                '0'
            };
            state.push_str(&format!(
                "P;{};{};BET;{}:",
                player.nickname, status, player.bet_amount
            ));
        }
        state
    }

    /// `GAMESTAT` payload: the dealer section followed by one
    /// `P;<nick>;<status>;<cards>:` section per seat; status 2 = offline,
    /// 1 = turn-holder, 0 = otherwise. `has_turn` is synced to the queue
    /// head before rendering.
    pub fn game_state_payload(&self, players: &mut PlayerMap) -> String {
        let head = self.turn_queue.front().copied();
        let mut state = format!("D;{}:", render_hand(&self.dealer_hand));
        for pid in &self.players {
            let Some(player) = players.get_mut(pid) else { continue };
            player.has_turn = head == Some(*pid);
            let status = if player.is_offline() {
                '2'
            } else if player.has_turn {
                '1'
            } else {
                '0'
            };
            state.push_str(&format!(
                "P;{};{};{}:",
                player.nickname,
                status,
                render_hand(&player.hand)
            ));
        }
        state
    }
}
