//! Wire protocol codec.
//!
//! Frames are UTF-8 lines of the form `BJ:<COMMAND>[:<ARG1>[:<ARG2>...]]`,
//! terminated by `\n`. Command tokens are exactly eight characters long,
//! right-padded with `_`.

// Client -> server commands
pub const CMD_LOGIN: &str = "LOGIN___";
pub const CMD_JOIN: &str = "JOIN____";
pub const CMD_LEAVE_ROOM: &str = "LVRO____";
pub const CMD_READY: &str = "RDY_____";
pub const CMD_NOT_READY: &str = "NRD_____";
pub const CMD_BET: &str = "BT______";
pub const CMD_HIT: &str = "HIT_____";
pub const CMD_STAND: &str = "STAND___";
pub const CMD_PLAY_AGAIN: &str = "PAG_____";
pub const CMD_RECONNECT: &str = "REC__GAM";
pub const CMD_PING: &str = "PING____";
pub const CMD_PONG: &str = "PONG____";

// Server -> client commands
pub const CMD_REQ_NICK: &str = "REQ_NICK";
pub const CMD_ACK_NICK: &str = "ACK__NIC";
pub const CMD_NACK_NICK: &str = "NACK_NIC";
pub const CMD_ACK_RECOVER: &str = "ACK__REC";
pub const CMD_ACK_JOIN: &str = "ACK__JON";
pub const CMD_NACK_JOIN: &str = "NACK_JON";
pub const CMD_ACK_LEAVE: &str = "ACK_LVRO";
pub const CMD_NACK_LEAVE: &str = "NACKLVRO";
pub const CMD_ACK_READY: &str = "ACK__RDY";
pub const CMD_ACK_NOT_READY: &str = "ACK__NRD";
pub const CMD_LOBBY_INFO: &str = "LBBYINFO";
pub const CMD_ROOM_STATE: &str = "ROMSTAUP";
pub const CMD_REQ_BET: &str = "REQ_BET_";
pub const CMD_ACK_BET: &str = "ACK___BT";
pub const CMD_NACK_BET: &str = "NACK__BT";
pub const CMD_GAME_STATE: &str = "GAMESTAT";
pub const CMD_BUST: &str = "BUST____";
pub const CMD_HIT21: &str = "HIT21___";
pub const CMD_ACK_STAND: &str = "ACK_STND";
pub const CMD_NACK_HIT: &str = "NACK_HIT";
pub const CMD_ROUND_END: &str = "ROUNDEND";
pub const CMD_ACK_PLAY_AGAIN: &str = "ACK__PAG";
pub const CMD_NACK_PLAY_AGAIN: &str = "NACK_PAG";
pub const CMD_NACK_CMD: &str = "NACK_CMD";
pub const CMD_CON_FAIL: &str = "CON_FAIL";
pub const CMD_INVALID_MSG: &str = "INV_MESS";
/// The only command longer than eight characters; server -> client only.
pub const CMD_DISCONNECT: &str = "DISCONNECT";

const HEADER: &str = "BJ";
const COMMAND_LEN: usize = 8;

/// A parsed wire frame: `CMD arg1 arg2 ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub args: Vec<String>,
    pub valid: bool,
}

impl Message {
    fn invalid() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            valid: false,
        }
    }

    /// Parses one raw line (without the trailing newline) into a `Message`.
    ///
    /// A malformed line yields `valid == false` rather than an error; the
    /// caller decides how to count it against the sender.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::invalid();
        }

        let tokens: Vec<&str> = raw.split(':').collect();

        // Header plus command at minimum
        if tokens.len() < 2 || tokens[0] != HEADER || tokens[1].len() != COMMAND_LEN {
            return Self::invalid();
        }

        Self {
            command: tokens[1].to_uppercase(),
            args: tokens[2..].iter().map(|s| s.to_string()).collect(),
            valid: true,
        }
    }
}

/// Builds an outbound frame. `args` is a single pre-joined blob; it is
/// omitted entirely when empty.
pub fn serialize(command: &str, args: &str) -> String {
    let mut frame = format!("{HEADER}:{command}");
    if !args.is_empty() {
        frame.push(':');
        frame.push_str(args);
    }
    frame.push('\n');
    frame
}
