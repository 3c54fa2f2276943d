// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Line-oriented command protocol.
//!
//! A frame is a run of newline-separated commands; each command is a
//! run of tab-separated fields:
//!
//! ```text
//! <deviceId> \t <VERB> [ \t <controlId> \t args... ] \n
//! ```
//!
//! Reply frames use the same shape, prefixed with the responding
//! device's identifier. Parsing is deliberately forgiving: a malformed
//! line yields `None` and never aborts its siblings.

/// Discovery verb, answered regardless of the target device id.
pub const VERB_WHO: &str = "WHO";
/// Connection handshake verb.
pub const VERB_CONNECT: &str = "CONNECT";
/// Request the current state of every registered control.
pub const VERB_STATUS: &str = "STATUS";
/// Request the configuration of every control and alarm.
pub const VERB_CFG: &str = "CFG";
/// Set the device display name.
pub const VERB_NAME: &str = "NAME";
/// Spontaneous popup message push.
pub const VERB_MSSG: &str = "MSSG";

/// One parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    /// Target device id, or [`VERB_WHO`] for the broadcast discovery verb.
    pub target: &'a str,
    /// Command verb.
    pub verb: &'a str,
    /// Remaining fields after the verb.
    pub args: Vec<&'a str>,
}

/// Parse one command line. Returns `None` for empty or malformed lines.
pub fn parse_line(line: &str) -> Option<Command<'_>> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }

    let mut fields = line.split('\t');
    let target = fields.next()?;
    if target == VERB_WHO {
        return Some(Command {
            target,
            verb: VERB_WHO,
            args: fields.collect(),
        });
    }

    let verb = fields.next()?;
    if verb.is_empty() {
        return None;
    }
    Some(Command {
        target,
        verb,
        args: fields.collect(),
    })
}

/// Split a decoded frame into its non-empty command lines.
pub fn frame_lines(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
}

/// Upper bound on a buffered partial line. A peer streaming bytes
/// without ever sending a newline is truncated rather than allowed to
/// grow the buffer without bound.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Reassembles newline-terminated command runs from raw stream chunks.
///
/// TCP reads are arbitrary byte runs: a command line can arrive split
/// across several reads or share a read with its neighbors. `push`
/// yields only whole lines and holds a trailing partial line until the
/// rest of it arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return the longest newline-terminated
    /// prefix now available, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        match self.pending.rfind('\n') {
            Some(end) => {
                let rest = self.pending.split_off(end + 1);
                Some(std::mem::replace(&mut self.pending, rest))
            }
            None => {
                if self.pending.len() > MAX_PENDING_LINE {
                    self.pending.clear();
                }
                None
            }
        }
    }
}

/// Compose one reply line prefixed with the responding device's id.
pub fn reply_line(device_id: &str, fields: &[&str]) -> String {
    let mut out = String::from(device_id);
    for field in fields {
        out.push('\t');
        out.push_str(field);
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_command() {
        let cmd = parse_line("dev01\tTBOX\ttb1\thello").unwrap();
        assert_eq!(cmd.target, "dev01");
        assert_eq!(cmd.verb, "TBOX");
        assert_eq!(cmd.args, vec!["tb1", "hello"]);
    }

    #[test]
    fn test_parse_verb_only() {
        let cmd = parse_line("dev01\tSTATUS").unwrap();
        assert_eq!(cmd.verb, "STATUS");
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn test_parse_who_without_target() {
        let cmd = parse_line("WHO").unwrap();
        assert_eq!(cmd.target, VERB_WHO);
        assert_eq!(cmd.verb, VERB_WHO);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_line("").is_none());
        assert!(parse_line("justone").is_none());
        assert!(parse_line("dev01\t").is_none());
    }

    #[test]
    fn test_parse_strips_carriage_return() {
        let cmd = parse_line("dev01\tCONNECT\r").unwrap();
        assert_eq!(cmd.verb, "CONNECT");
    }

    #[test]
    fn test_frame_lines_skips_empties() {
        let lines: Vec<&str> = frame_lines("a\tB\n\nc\tD\r\n").collect();
        assert_eq!(lines, vec!["a\tB", "c\tD"]);
    }

    #[test]
    fn test_frame_buffer_reassembles_split_line() {
        let mut frames = FrameBuffer::new();
        assert_eq!(frames.push(b"dev01\tCON"), None);
        assert_eq!(frames.push(b"NECT\n"), Some("dev01\tCONNECT\n".to_string()));
    }

    #[test]
    fn test_frame_buffer_holds_partial_tail() {
        let mut frames = FrameBuffer::new();
        assert_eq!(
            frames.push(b"a\tB\nc\tD\ne\tpartial"),
            Some("a\tB\nc\tD\n".to_string())
        );
        assert_eq!(frames.push(b"\n"), Some("e\tpartial\n".to_string()));
        assert_eq!(frames.push(b""), None);
    }

    #[test]
    fn test_frame_buffer_discards_oversize_garbage() {
        let mut frames = FrameBuffer::new();
        let garbage = vec![b'x'; 70 * 1024];
        assert_eq!(frames.push(&garbage), None);
        // The runaway partial line was dropped; framing recovers.
        assert_eq!(frames.push(b"dev01\tSTATUS\n"), Some("dev01\tSTATUS\n".to_string()));
    }

    #[test]
    fn test_reply_line_shape() {
        assert_eq!(
            reply_line("dev01", &["CONNECT", "Gauge", "Kitchen"]),
            "dev01\tCONNECT\tGauge\tKitchen\n"
        );
        assert_eq!(reply_line("dev01", &[]), "dev01\n");
    }
}
