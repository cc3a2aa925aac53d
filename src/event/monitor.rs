//! Redis MONITOR line records
//!
//! A MONITOR reply line looks like:
//!
//! ```text
//! 1339518083.107412 [0 127.0.0.1:60866] "set" "key" "va\"lue"
//! ^ unix time        ^db ^ client       ^ arguments, repr-quoted
//! ```
//!
//! Commands issued from scripts carry `lua` as the client, and unix socket
//! clients show up as `unix:/path`. Arguments use the server's repr
//! escaping: `\\`, `\"`, `\n`, `\r`, `\t`, `\a`, `\b` and `\xHH`. Keys and
//! values may be arbitrary binary, so arguments are kept as raw bytes.

use bytes::Bytes;
use thiserror::Error;

/// Error parsing a MONITOR line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorParseError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("missing or invalid timestamp")]
    InvalidTimestamp,
    #[error("missing or invalid [db client] header")]
    InvalidHeader,
    #[error("unterminated argument at byte {0}")]
    UnterminatedArgument(usize),
    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),
}

/// One parsed MONITOR line
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorRecord {
    /// Server time of the command, in seconds since the epoch
    pub time: f64,
    /// Selected database of the issuing client
    pub database: u32,
    /// Client address, `lua`, or `unix:/path`
    pub source: String,
    /// Command name followed by its arguments, unescaped
    pub args: Vec<Bytes>,
}

impl MonitorRecord {
    /// Parse a single MONITOR line
    pub fn parse(line: &str) -> Result<Self, MonitorParseError> {
        let line = line.trim_end_matches(['\r', '\n']);

        let (time, rest) = line
            .split_once(' ')
            .ok_or(MonitorParseError::InvalidTimestamp)?;
        let time: f64 = time
            .parse()
            .map_err(|_| MonitorParseError::InvalidTimestamp)?;

        let rest = rest
            .strip_prefix('[')
            .ok_or(MonitorParseError::InvalidHeader)?;
        let close = rest.find(']').ok_or(MonitorParseError::InvalidHeader)?;
        let (database, source) = rest[..close]
            .split_once(' ')
            .ok_or(MonitorParseError::InvalidHeader)?;
        let database: u32 = database
            .parse()
            .map_err(|_| MonitorParseError::InvalidHeader)?;

        // Offset of the argument section within `line`, for error positions
        let offset = line.len() - rest.len() + close + 1;
        let args = parse_args(&rest[close + 1..], offset)?;

        Ok(Self {
            time,
            database,
            source: source.to_string(),
            args,
        })
    }

    /// Command name, upper-cased
    pub fn command(&self) -> Option<String> {
        self.arg_str(0).map(|name| name.to_ascii_uppercase())
    }

    /// Argument `index` as text; `None` if absent or not valid UTF-8
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        std::str::from_utf8(self.args.get(index)?).ok()
    }

    /// Render the record back into MONITOR line form
    pub fn format(&self) -> String {
        let mut out = format!("{:.6} [{} {}]", self.time, self.database, self.source);
        for arg in &self.args {
            out.push(' ');
            push_quoted(&mut out, arg);
        }
        out
    }
}

fn parse_args(input: &str, offset: usize) -> Result<Vec<Bytes>, MonitorParseError> {
    let bytes = input.as_bytes();
    let mut args = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' => i += 1,
            b'"' => {
                let start = i;
                let mut arg = Vec::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(MonitorParseError::UnterminatedArgument(offset + start)),
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let (byte, used) = unescape(&bytes[i + 1..])
                                .ok_or(MonitorParseError::InvalidEscape(offset + i))?;
                            arg.push(byte);
                            i += 1 + used;
                        }
                        Some(&b) => {
                            arg.push(b);
                            i += 1;
                        }
                    }
                }
                args.push(Bytes::from(arg));
            }
            _ => {
                // Bare token (older servers do not quote every argument)
                let start = i;
                while i < bytes.len() && bytes[i] != b' ' {
                    i += 1;
                }
                args.push(Bytes::copy_from_slice(&bytes[start..i]));
            }
        }
    }

    Ok(args)
}

/// Decode the escape following a backslash; returns the byte and how many
/// input bytes it consumed.
fn unescape(rest: &[u8]) -> Option<(u8, usize)> {
    match rest.first()? {
        b'\\' => Some((b'\\', 1)),
        b'"' => Some((b'"', 1)),
        b'n' => Some((b'\n', 1)),
        b'r' => Some((b'\r', 1)),
        b't' => Some((b'\t', 1)),
        b'a' => Some((0x07, 1)),
        b'b' => Some((0x08, 1)),
        b'x' => {
            let hex = rest.get(1..3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            u8::from_str_radix(hex, 16).ok().map(|b| (b, 3))
        }
        _ => None,
    }
}

/// Repr-quote `arg`: anything outside printable ASCII becomes `\xHH`
fn push_quoted(out: &mut String, arg: &[u8]) {
    out.push('"');
    for &b in arg {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x07 => out.push_str("\\a"),
            0x08 => out.push_str("\\b"),
            b' '..=b'~' => out.push(b as char),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('"');
}
