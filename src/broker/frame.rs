//! STOMP 1.2 frames
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```
//!
//! Header names and values are escaped (`\\`, `\n`, `\r`, `\c`) in every
//! frame except CONNECT and CONNECTED. A lone EOL between frames is a
//! heart-beat and decodes to `None`.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Frame commands used by the tracking client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Send,
    Message,
    Receipt,
    Error,
}

impl FrameCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameCommand::Connect => "CONNECT",
            FrameCommand::Connected => "CONNECTED",
            FrameCommand::Subscribe => "SUBSCRIBE",
            FrameCommand::Unsubscribe => "UNSUBSCRIBE",
            FrameCommand::Disconnect => "DISCONNECT",
            FrameCommand::Send => "SEND",
            FrameCommand::Message => "MESSAGE",
            FrameCommand::Receipt => "RECEIPT",
            FrameCommand::Error => "ERROR",
        }
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, FrameCommand::Connect | FrameCommand::Connected)
    }
}

impl FromStr for FrameCommand {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" | "STOMP" => Ok(FrameCommand::Connect),
            "CONNECTED" => Ok(FrameCommand::Connected),
            "SUBSCRIBE" => Ok(FrameCommand::Subscribe),
            "UNSUBSCRIBE" => Ok(FrameCommand::Unsubscribe),
            "DISCONNECT" => Ok(FrameCommand::Disconnect),
            "SEND" => Ok(FrameCommand::Send),
            "MESSAGE" => Ok(FrameCommand::Message),
            "RECEIPT" => Ok(FrameCommand::Receipt),
            "ERROR" => Ok(FrameCommand::Error),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for FrameCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in {0:?}")]
    InvalidEscape(String),

    #[error("Invalid content-length: {0:?}")]
    InvalidLength(String),

    #[error("Frame is truncated")]
    Truncated,
}

/// One STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: FrameCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Builder method: append a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builder method: set the body
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`; repeated headers keep the first
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str) -> Self {
        Frame::new(FrameCommand::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", "0,0")
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(FrameCommand::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(FrameCommand::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(FrameCommand::Disconnect)
    }

    /// Serialize, including the trailing NUL
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse the first frame. Heart-beats and empty input yield `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Frame>, FrameError> {
        Ok(Self::decode_next(text)?.map(|(frame, _)| frame))
    }

    /// Parse every frame in `text`, in order
    ///
    /// A broker may pack several frames into one WebSocket message.
    pub fn decode_all(text: &str) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = text;
        while let Some((frame, after)) = Self::decode_next(rest)? {
            frames.push(frame);
            rest = after;
        }
        Ok(frames)
    }

    /// Parse one frame and return it with the text after its NUL
    fn decode_next(text: &str) -> Result<Option<(Frame, &str)>, FrameError> {
        let rest = text.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(None);
        }

        let (command_line, mut rest) = split_line(rest).ok_or(FrameError::Truncated)?;
        let command: FrameCommand = command_line.parse()?;
        let escape = command.escapes_headers();

        let mut frame = Frame::new(command);
        loop {
            let (line, after) = split_line(rest).ok_or(FrameError::Truncated)?;
            rest = after;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escape {
                frame.headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                frame.headers.push((name.to_string(), value.to_string()));
            }
        }

        let (body, after) = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidLength(len.to_string()))?;
                let body = rest.get(..len).ok_or(FrameError::Truncated)?;
                let after = rest[len..].strip_prefix('\0').ok_or(FrameError::Truncated)?;
                (body, after)
            }
            None => {
                let end = rest.find('\0').ok_or(FrameError::Truncated)?;
                (&rest[..end], &rest[end + 1..])
            }
        };
        frame.body = body.to_string();

        Ok(Some((frame, after)))
    }
}

fn split_line(s: &str) -> Option<(&str, &str)> {
    let end = s.find('\n')?;
    let line = &s[..end];
    Some((line.strip_suffix('\r').unwrap_or(line), &s[end + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
