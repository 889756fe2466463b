//! Per-socket read buffering.

/// Accumulates raw bytes received on one socket and splits them into
/// newline-terminated frames. Partial lines stay buffered until the rest
/// of the line arrives.
#[derive(Debug, Default)]
pub struct Connection {
    buffer: Vec<u8>,
}

impl Connection {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends received bytes. Returns true iff the buffer now holds at
    /// least one complete line.
    pub fn append(&mut self, data: &[u8]) -> bool {
        self.buffer.extend_from_slice(data);
        self.buffer.contains(&b'\n')
    }

    /// Removes every complete line from the front of the buffer, leaving a
    /// trailing partial line in place. A `\r` before the `\n` is stripped
    /// and empty lines are skipped.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_reports_complete_line() {
        let mut conn = Connection::new();
        assert!(!conn.append(b"BJ:RDY__"));
        assert!(conn.append(b"___\n"));
    }

    #[test]
    fn drain_returns_complete_lines_only() {
        let mut conn = Connection::new();
        conn.append(b"BJ:RDY_____\nBJ:BT______:50\nBJ:HI");
        assert_eq!(conn.drain(), vec!["BJ:RDY_____", "BJ:BT______:50"]);
        // The partial tail stays put until the rest arrives
        assert!(conn.drain().is_empty());
        conn.append(b"T_____\n");
        assert_eq!(conn.drain(), vec!["BJ:HIT_____"]);
    }

    #[test]
    fn drain_strips_carriage_return() {
        let mut conn = Connection::new();
        conn.append(b"BJ:PING____\r\n");
        assert_eq!(conn.drain(), vec!["BJ:PING____"]);
    }

    #[test]
    fn drain_skips_empty_lines() {
        let mut conn = Connection::new();
        conn.append(b"\r\n\nBJ:STAND___\n\n");
        assert_eq!(conn.drain(), vec!["BJ:STAND___"]);
    }
}
