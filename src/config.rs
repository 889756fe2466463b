use clap::Parser;

/// Server settings, taken from the command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "blackjack-server", about = "Multi-room blackjack game server")]
pub struct Config {
    /// IPv4 address to bind
    #[arg(short = 'i', long = "ip", default_value = "0.0.0.0")]
    pub ip: String,

    /// TCP port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 10000)]
    pub port: u16,

    /// Number of game rooms
    #[arg(
        short = 'r',
        long = "rooms",
        default_value_t = 6,
        value_parser = clap::value_parser!(u16).range(1..=20)
    )]
    pub rooms: u16,

    /// Maximum number of connected players
    #[arg(
        short = 'm',
        long = "max-players",
        default_value_t = 20,
        value_parser = clap::value_parser!(u16).range(1..=300)
    )]
    pub max_players: u16,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = Config::try_parse_from(["blackjack-server"]).unwrap();
        assert_eq!(config.ip, "0.0.0.0");
        assert_eq!(config.port, 10000);
        assert_eq!(config.rooms, 6);
        assert_eq!(config.max_players, 20);
        assert_eq!(config.bind_address(), "0.0.0.0:10000");
    }

    #[test]
    fn short_flags_override_defaults() {
        let config = Config::try_parse_from([
            "blackjack-server",
            "-i",
            "127.0.0.1",
            "-p",
            "4000",
            "-r",
            "2",
            "-m",
            "50",
        ])
        .unwrap();
        assert_eq!(config.ip, "127.0.0.1");
        assert_eq!(config.port, 4000);
        assert_eq!(config.rooms, 2);
        assert_eq!(config.max_players, 50);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(Config::try_parse_from(["blackjack-server", "-r", "0"]).is_err());
        assert!(Config::try_parse_from(["blackjack-server", "-r", "21"]).is_err());
        assert!(Config::try_parse_from(["blackjack-server", "-m", "301"]).is_err());
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Config::try_parse_from(["blackjack-server", "--bogus"]).is_err());
    }
}
