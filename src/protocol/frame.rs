//! STOMP frame model
//!
//! A frame is a command verb, an ordered list of headers and an optional body.
//! Builders for the client-side frames live here so the session never has to
//! spell header names itself.

use super::heartbeat::HeartBeat;
use bytes::Bytes;
use std::fmt;

/// Header names used by the session
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// Protocol version announced in CONNECT
pub const PROTOCOL_VERSION: &str = "1.2";

/// Frame verbs. Matching is case-sensitive on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    pub fn parse(verb: &str) -> Option<Self> {
        let command = match verb {
            "CONNECT" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED headers are never escaped
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol unit
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`. Repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// CONNECT carrying the bearer credential as a header
    pub fn connect(host: &str, heart_beat: HeartBeat, bearer_token: &str) -> Self {
        Frame::new(Command::Connect)
            .header(headers::ACCEPT_VERSION, PROTOCOL_VERSION)
            .header(headers::HOST, host)
            .header(headers::HEART_BEAT, heart_beat.to_header())
            .header(headers::AUTHORIZATION, format!("Bearer {bearer_token}"))
    }

    pub fn subscribe(destination: &str, id: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header(headers::DESTINATION, destination)
            .header(headers::ID, id)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header(headers::ID, id)
    }

    pub fn send(destination: &str, json_body: Bytes) -> Self {
        Frame::new(Command::Send)
            .header(headers::DESTINATION, destination)
            .header(headers::CONTENT_TYPE, "application/json")
            .with_body(json_body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }
}

fn is_secret_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(headers::AUTHORIZATION)
        || name.eq_ignore_ascii_case("passcode")
        || name.eq_ignore_ascii_case("login")
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(key, value)| {
                if is_secret_header(key) {
                    (key.as_str(), "***")
                } else {
                    (key.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("Frame")
            .field("command", &self.command)
            .field("headers", &headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_command_round_trip_names() {
        for command in [
            Command::Connect,
            Command::Connected,
            Command::Subscribe,
            Command::Unsubscribe,
            Command::Send,
            Command::Message,
            Command::Receipt,
            Command::Error,
            Command::Disconnect,
        ] {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
    }

    #[test]
    fn test_command_parse_is_case_sensitive() {
        assert_eq!(Command::parse("send"), None);
        assert_eq!(Command::parse("Connected"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_first_header_wins() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/a")
            .header("destination", "/topic/b");
        assert_eq!(frame.get("destination"), Some("/topic/a"));
        assert_eq!(frame.get("missing"), None);
    }

    #[test]
    fn test_connect_frame_carries_bearer_header() {
        let hb = HeartBeat::new(Duration::from_secs(10), Duration::from_secs(5));
        let frame = Frame::connect("broker.local", hb, "tok-123");

        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.get(headers::AUTHORIZATION), Some("Bearer tok-123"));
        assert_eq!(frame.get(headers::ACCEPT_VERSION), Some("1.2"));
        assert_eq!(frame.get(headers::HEART_BEAT), Some("10000,5000"));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let frame = Frame::connect("h", HeartBeat::disabled(), "super-secret-token");
        let rendered = format!("{frame:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_send_frame_is_json() {
        let frame = Frame::send("/topic/chat", Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(frame.get(headers::CONTENT_TYPE), Some("application/json"));
        assert_eq!(frame.body_text(), "{\"a\":1}");
    }
}
