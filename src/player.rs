use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::card::Card;

/// Starting credits for a freshly logged-in player.
pub const START_CREDITS: u32 = 1000;

/// Inbound silence after which a still-connected player counts as offline
/// and is skipped by room broadcasts.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(9);

/// Invalid messages tolerated at the lobby/room level before the player is
/// destroyed outright.
pub const INVALID_MSG_LIMIT: u32 = 5;

/// Stable identity of a player session. Rooms, turn queues, and the
/// online/recoverable maps all reference players through this key, so a
/// reconnect only has to rebind the transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u64);

/// Identity of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The player arena; every other structure holds `PlayerId`s into it.
pub type PlayerMap = HashMap<PlayerId, Player>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Lobby,
    InRoom,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Player {
    /// Current transport handle; `None` while disconnected, rebound on
    /// reconnect.
    pub conn: Option<ConnId>,
    /// Unique across online and recoverable players; empty until login.
    pub nickname: String,
    pub state: PlayerState,
    pub credits: u32,
    pub room_id: Option<usize>,
    pub last_activity: Instant,
    pub invalid_msg_count: u32,

    // Round-local state, cleared on every round reset
    pub ready: bool,
    pub has_turn: bool,
    pub placed_bet: bool,
    pub bet_amount: u32,
    pub hand: Vec<Card>,
}

impl Player {
    pub fn new(conn: ConnId) -> Self {
        Self {
            conn: Some(conn),
            nickname: String::new(),
            state: PlayerState::Lobby,
            credits: START_CREDITS,
            room_id: None,
            last_activity: Instant::now(),
            invalid_msg_count: 0,
            ready: false,
            has_turn: false,
            placed_bet: false,
            bet_amount: 0,
            hand: Vec::new(),
        }
    }

    /// Refreshes the liveness timestamp; called on any inbound byte.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Offline means the socket is gone or the player has been silent for
    /// longer than the offline window. Distinct from disconnected: an
    /// offline player may still be readable.
    pub fn is_offline(&self) -> bool {
        self.conn.is_none() || self.last_activity.elapsed() >= OFFLINE_AFTER
    }

    /// Clears every per-round flag and the hand.
    pub fn reset_round_state(&mut self) {
        self.ready = false;
        self.has_turn = false;
        self.placed_bet = false;
        self.bet_amount = 0;
        self.hand.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_player_starts_in_lobby_with_default_credits() {
        let player = Player::new(ConnId(1));
        assert_eq!(player.state, PlayerState::Lobby);
        assert_eq!(player.credits, START_CREDITS);
        assert!(player.nickname.is_empty());
        assert!(player.room_id.is_none());
        assert!(!player.is_offline());
    }

    #[test]
    fn reset_round_state_clears_flags_and_hand() {
        let mut player = Player::new(ConnId(1));
        player.ready = true;
        player.has_turn = true;
        player.placed_bet = true;
        player.bet_amount = 50;
        player.hand.push("AH".parse().unwrap());

        player.reset_round_state();

        assert!(!player.ready);
        assert!(!player.has_turn);
        assert!(!player.placed_bet);
        assert_eq!(player.bet_amount, 0);
        assert!(player.hand.is_empty());
    }

    #[test]
    fn disconnected_player_is_offline() {
        let mut player = Player::new(ConnId(1));
        player.conn = None;
        assert!(player.is_offline());
    }

    #[test]
    fn silent_player_is_offline() {
        let mut player = Player::new(ConnId(1));
        player.last_activity = Instant::now() - Duration::from_secs(10);
        assert!(player.is_offline());
    }
}
