use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::lobby::Lobby;
use crate::player::ConnId;
use crate::protocol::{self, Message};

/// Malformed frames tolerated on the transport before the socket is cut.
const INVALID_FRAME_LIMIT: u32 = 3;

/// Inbound silence before the server probes with `PING____`.
const PING_AFTER: Duration = Duration::from_secs(3);

/// Inbound silence before the server gives up on the socket.
const DROP_AFTER: Duration = Duration::from_secs(10);

/// How often the liveness sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3);

struct ClientHandle {
    frames: UnboundedSender<String>,
    shutdown: UnboundedSender<()>,
}

/// Write-side capability handed to the lobby and rooms: send a frame to a
/// connection, or ask its reader task to shut down. Sends to unknown
/// connections are silently dropped.
#[derive(Default)]
pub struct Outbox {
    clients: HashMap<ConnId, ClientHandle>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        conn: ConnId,
        frames: UnboundedSender<String>,
        shutdown: UnboundedSender<()>,
    ) {
        self.clients.insert(conn, ClientHandle { frames, shutdown });
    }

    pub fn unregister(&mut self, conn: ConnId) {
        self.clients.remove(&conn);
    }

    pub fn send(&self, conn: ConnId, command: &str, args: &str) {
        if let Some(client) = self.clients.get(&conn) {
            let frame = protocol::serialize(command, args);
            debug!("send conn {}: {}", conn, frame.trim_end());
            let _ = client.frames.send(frame);
        }
    }

    /// Signals the connection's reader task to wind the socket down; any
    /// frames already queued are still flushed first.
    pub fn close(&self, conn: ConnId) {
        if let Some(client) = self.clients.get(&conn) {
            let _ = client.shutdown.send(());
        }
    }
}

/// The whole world, serialized behind one lock: no two handlers ever
/// mutate the same player or room concurrently.
pub struct ServerState {
    pub lobby: Lobby,
    pub outbox: Outbox,
}

pub type SharedState = Arc<Mutex<ServerState>>;

/// Binds the listener and accepts clients until the task is dropped.
pub async fn start_server(config: Config) -> Result<()> {
    let state: SharedState = Arc::new(Mutex::new(ServerState {
        lobby: Lobby::new(config.rooms as usize, config.max_players as usize),
        outbox: Outbox::new(),
    }));

    let bind_addr = config.bind_address();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("server listening on {}", bind_addr);

    let tick_state = Arc::clone(&state);
    tokio::spawn(async move {
        tick_loop(tick_state).await;
    });

    let mut next_conn_id = 0u64;
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept connection: {}", e);
                continue;
            }
        };
        next_conn_id += 1;
        let conn = ConnId(next_conn_id);
        info!("new client {} on conn {}", addr, conn);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            handle_client(socket, conn, state).await;
        });
    }
}

/// Owns one client socket: splits it, spawns the writer task, and pumps
/// the read side through the lobby until the peer goes away.
async fn handle_client(socket: TcpStream, conn: ConnId, state: SharedState) {
    let (mut reader, mut writer) = socket.into_split();

    let channels = {
        let mut state = state.lock().unwrap();
        if state.lobby.is_full() {
            None
        } else {
            let (frames_tx, frames_rx) = unbounded_channel();
            let (shutdown_tx, shutdown_rx) = unbounded_channel();
            state.outbox.register(conn, frames_tx, shutdown_tx);
            let ServerState { lobby, outbox } = &mut *state;
            lobby.add_player(conn, outbox);
            Some((frames_rx, shutdown_rx))
        }
    };
    let Some((mut frames_rx, mut shutdown_rx)) = channels else {
        info!("rejected conn {}: max players reached", conn);
        let frame = protocol::serialize(protocol::CMD_CON_FAIL, "Max players reached");
        let _ = writer.write_all(frame.as_bytes()).await;
        return;
    };

    // Writer task: drains queued frames onto the socket
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if let Err(e) = writer.write_all(frame.as_bytes()).await {
                warn!("failed to send to conn {}: {}", conn, e);
            }
        }
    });

    let mut buffer = Connection::new();
    let mut scratch = [0u8; 1024];
    loop {
        let n = tokio::select! {
            _ = shutdown_rx.recv() => break,
            read = reader.read(&mut scratch) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("read error on conn {}: {}", conn, e);
                    break;
                }
            },
        };
        let keep = {
            let mut state = state.lock().unwrap();
            process_frames(&mut state, conn, &mut buffer, &scratch[..n])
        };
        if !keep {
            break;
        }
    }

    disconnect_client(&state, conn);
}

/// Feeds raw bytes through the connection buffer and dispatches every
/// complete frame. Returns false when the connection must be dropped.
fn process_frames(
    state: &mut ServerState,
    conn: ConnId,
    buffer: &mut Connection,
    bytes: &[u8],
) -> bool {
    let ServerState { lobby, outbox } = state;
    let Some(pid) = lobby.player_by_conn(conn) else {
        return false;
    };
    if let Some(player) = lobby.players.get_mut(&pid) {
        player.touch();
    }
    if !buffer.append(bytes) {
        return true;
    }
    for raw in buffer.drain() {
        let msg = Message::parse(&raw);
        if !msg.valid {
            warn!("invalid message format on conn {}", conn);
            let Some(player) = lobby.players.get_mut(&pid) else {
                return false;
            };
            player.invalid_msg_count += 1;
            if player.invalid_msg_count >= INVALID_FRAME_LIMIT {
                info!("kicking conn {} (too many invalid messages)", conn);
                return false;
            }
            continue;
        }
        debug!("recv conn {}: {}", conn, msg.command);
        match msg.command.as_str() {
            protocol::CMD_PING => outbox.send(conn, protocol::CMD_PONG, ""),
            // Activity was already refreshed above; nothing else to do
            protocol::CMD_PONG => {}
            _ => lobby.handle(conn, &msg, outbox),
        }
        // The handler may have destroyed the player mid-batch
        if lobby.player_by_conn(conn).is_none() {
            return false;
        }
    }
    true
}

/// Tears one connection down: the writer drains and exits, the reader is
/// signalled, and the lobby parks or drops the player.
fn disconnect_client(state: &SharedState, conn: ConnId) {
    let mut state = state.lock().unwrap();
    state.outbox.close(conn);
    state.outbox.unregister(conn);
    let ServerState { lobby, outbox } = &mut *state;
    lobby.remove_player(conn, outbox);
    info!("client disconnected on conn {}", conn);
}

/// Once-a-second heartbeat of the world: room updates, lobby snapshots,
/// and the liveness sweep.
async fn tick_loop(state: SharedState) {
    let mut tick = interval(Duration::from_secs(1));
    let mut last_sweep = Instant::now();
    loop {
        tick.tick().await;
        let mut state = state.lock().unwrap();
        let ServerState { lobby, outbox } = &mut *state;
        lobby.update(outbox);

        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            last_sweep = Instant::now();
            let mut idle = Vec::new();
            let mut gone = Vec::new();
            for (&conn, pid) in &lobby.online {
                let Some(player) = lobby.players.get(pid) else {
                    continue;
                };
                let silence = player.last_activity.elapsed();
                if silence >= DROP_AFTER {
                    gone.push(conn);
                } else if silence >= PING_AFTER {
                    idle.push(conn);
                }
            }
            for conn in idle {
                outbox.send(conn, protocol::CMD_PING, "");
            }
            for conn in gone {
                info!("client timed out (no heartbeat) on conn {}", conn);
                outbox.close(conn);
                outbox.unregister(conn);
                lobby.remove_player(conn, outbox);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomState;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state(rooms: usize, max_players: usize) -> ServerState {
        ServerState {
            lobby: Lobby::new(rooms, max_players),
            outbox: Outbox::new(),
        }
    }

    /// Registers a connection and admits it to the lobby, mirroring what
    /// `handle_client` does for an accepted socket.
    fn accept(state: &mut ServerState, id: u64) -> (ConnId, UnboundedReceiver<String>) {
        let conn = ConnId(id);
        let (frames_tx, frames_rx) = unbounded_channel();
        let (shutdown_tx, _shutdown_rx) = unbounded_channel();
        state.outbox.register(conn, frames_tx, shutdown_tx);
        let ServerState { lobby, outbox } = state;
        lobby.add_player(conn, outbox);
        (conn, frames_rx)
    }

    fn feed(state: &mut ServerState, conn: ConnId, buffer: &mut Connection, line: &str) -> bool {
        process_frames(state, conn, buffer, line.as_bytes())
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn login_flow_over_the_wire() {
        let mut state = test_state(2, 20);
        let (conn, mut rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();
        assert_eq!(drain(&mut rx), vec!["BJ:REQ_NICK\n"]);

        assert!(feed(&mut state, conn, &mut buffer, "BJ:LOGIN___:ab\n"));
        assert!(drain(&mut rx)
            .iter()
            .any(|f| f == "BJ:NACK_NIC:Invalid nickname\n"));

        assert!(feed(&mut state, conn, &mut buffer, "BJ:LOGIN___:alice\n"));
        assert!(drain(&mut rx)
            .iter()
            .any(|f| f == "BJ:ACK__NIC:alice;1000\n"));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let mut state = test_state(1, 20);
        let (conn, mut rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();
        drain(&mut rx);

        assert!(feed(&mut state, conn, &mut buffer, "BJ:PING____\n"));
        assert_eq!(drain(&mut rx), vec!["BJ:PONG____\n"]);

        // PONG from the client only refreshes activity
        assert!(feed(&mut state, conn, &mut buffer, "BJ:PONG____\n"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn malformed_frames_get_the_connection_dropped() {
        let mut state = test_state(1, 20);
        let (conn, _rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();

        assert!(feed(&mut state, conn, &mut buffer, "garbage\n"));
        assert!(feed(&mut state, conn, &mut buffer, "BJ:TOOLONGCMD:x\n"));
        // Third strike
        assert!(!feed(&mut state, conn, &mut buffer, "BJ:short\n"));
    }

    #[test]
    fn carriage_return_only_frames_are_ignored() {
        let mut state = test_state(1, 20);
        let (conn, _rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();

        assert!(feed(&mut state, conn, &mut buffer, "\r\n"));
        let pid = state.lobby.player_by_conn(conn).unwrap();
        assert_eq!(state.lobby.players[&pid].invalid_msg_count, 0);
    }

    #[test]
    fn partial_frames_wait_for_the_rest() {
        let mut state = test_state(1, 20);
        let (conn, mut rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();
        drain(&mut rx);

        assert!(feed(&mut state, conn, &mut buffer, "BJ:LOGIN_"));
        assert!(drain(&mut rx).is_empty());
        assert!(feed(&mut state, conn, &mut buffer, "__:alice\n"));
        assert!(drain(&mut rx)
            .iter()
            .any(|f| f.starts_with("BJ:ACK__NIC:alice")));
    }

    /// A whole round played over the wire: login, join, ready, bet, stand,
    /// settlement, and the opt-in to the next round.
    #[test]
    fn full_round_over_the_wire() {
        let mut state = test_state(1, 20);
        let (conn, mut rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();

        feed(&mut state, conn, &mut buffer, "BJ:LOGIN___:alice\n");
        feed(&mut state, conn, &mut buffer, "BJ:JOIN____:0\n");
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f == "BJ:ACK__JON\n"));
        assert!(frames.iter().any(|f| f == "BJ:ROMSTAUP:P;alice;0;BET;0:\n"));

        feed(&mut state, conn, &mut buffer, "BJ:RDY_____\n");
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.starts_with("BJ:ACK__RDY")));
        assert!(frames.iter().any(|f| f.starts_with("BJ:REQ_BET_")));
        assert_eq!(state.lobby.rooms[0].state, RoomState::Betting);

        feed(&mut state, conn, &mut buffer, "BJ:BT______:100\n");
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f == "BJ:ACK___BT: 100\n"));
        // All bets in: the deal happened and alice holds the turn
        assert_eq!(state.lobby.rooms[0].state, RoomState::Playing);
        assert!(frames
            .iter()
            .any(|f| f.starts_with("BJ:GAMESTAT:D;") && f.contains("P;alice;1;")));

        feed(&mut state, conn, &mut buffer, "BJ:STAND___\n");
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.starts_with("BJ:ACK_STND")));
        assert!(frames.iter().any(|f| f.starts_with("BJ:ROUNDEND:")));
        assert_eq!(state.lobby.rooms[0].state, RoomState::RoundEnd);

        feed(&mut state, conn, &mut buffer, "BJ:PAG_____\n");
        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.starts_with("BJ:ACK__PAG:0")));
        assert_eq!(state.lobby.rooms[0].state, RoomState::WaitingForPlayers);
    }

    #[test]
    fn hit_out_of_lobby_is_invalid() {
        let mut state = test_state(1, 20);
        let (conn, mut rx) = accept(&mut state, 1);
        let mut buffer = Connection::new();
        feed(&mut state, conn, &mut buffer, "BJ:LOGIN___:alice\n");
        drain(&mut rx);

        feed(&mut state, conn, &mut buffer, "BJ:HIT_____\n");
        assert!(drain(&mut rx).iter().any(|f| f.starts_with("BJ:INV_MESS")));
    }

    #[test]
    fn reconnect_and_snapshot_request() {
        let mut state = test_state(1, 20);
        let (conn1, _rx1) = accept(&mut state, 1);
        let mut buffer1 = Connection::new();
        feed(&mut state, conn1, &mut buffer1, "BJ:LOGIN___:alice\n");
        feed(&mut state, conn1, &mut buffer1, "BJ:JOIN____:0\n");
        state.lobby.rooms[0].state = RoomState::Playing;

        // Socket drops mid-round; the seat survives
        state.outbox.unregister(conn1);
        let ServerState { lobby, outbox } = &mut state;
        lobby.remove_player(conn1, outbox);

        let (conn2, mut rx2) = accept(&mut state, 2);
        let mut buffer2 = Connection::new();
        feed(&mut state, conn2, &mut buffer2, "BJ:LOGIN___:alice\n");
        assert!(drain(&mut rx2)
            .iter()
            .any(|f| f == "BJ:ACK__REC:alice;1000;0\n"));

        feed(&mut state, conn2, &mut buffer2, "BJ:REC__GAM\n");
        assert!(drain(&mut rx2)
            .iter()
            .any(|f| f.starts_with("BJ:GAMESTAT:D;")));
    }
}
