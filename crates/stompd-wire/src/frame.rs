use stompd_util::ByteString;

/// The fixed STOMP 1.2 command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stomp,
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Begin,
    Commit,
    Abort,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    const ALL: [Command; 15] = [
        Command::Stomp,
        Command::Connect,
        Command::Connected,
        Command::Send,
        Command::Subscribe,
        Command::Unsubscribe,
        Command::Begin,
        Command::Commit,
        Command::Abort,
        Command::Ack,
        Command::Nack,
        Command::Disconnect,
        Command::Message,
        Command::Receipt,
        Command::Error,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Stomp => "STOMP",
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn from_bytes(name: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str().as_bytes() == name)
    }

    /// Only SEND, MESSAGE and ERROR frames may carry a body.
    pub const fn allows_body(self) -> bool {
        matches!(self, Command::Send | Command::Message | Command::Error)
    }

    /// Header octet unescaping is suppressed on both handshake frames when
    /// parsing, per STOMP 1.2.
    pub const fn unescapes_headers_on_parse(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }

    /// On output only CONNECTED emits its headers raw; every other command,
    /// CONNECT included, gets the escape treatment.
    pub const fn escapes_headers_on_serialize(self) -> bool {
        !matches!(self, Command::Connected)
    }
}

/// Ordered header list. Order is preserved as parsed, duplicate keys are
/// legal, and the first occurrence wins on lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBundle {
    entries: Vec<(ByteString, ByteString)>,
}

impl HeaderBundle {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, key: ByteString, value: ByteString) {
        self.entries.push((key, value));
    }

    /// Inserts at the front. The broker prepends its own headers to frames it
    /// forwards so they win first-occurrence lookup over client-supplied
    /// duplicates.
    pub fn prepend(&mut self, key: ByteString, value: ByteString) {
        self.entries.insert(0, (key, value));
    }

    /// First-occurrence lookup.
    pub fn get(&self, key: &[u8]) -> Option<&ByteString> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_bytes() == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ByteString, &ByteString)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn entry(&self, index: usize) -> Option<(&ByteString, &ByteString)> {
        self.entries.get(index).map(|(k, v)| (k, v))
    }
}

/// A parsed STOMP frame: command, ordered headers, optional body.
#[derive(Debug, Clone)]
pub struct Frame {
    command: Command,
    pub headers: HeaderBundle,
    body: Option<ByteString>,
}

impl Frame {
    pub const fn new(command: Command) -> Self {
        Self { command, headers: HeaderBundle::new(), body: None }
    }

    #[inline]
    pub const fn command(&self) -> Command {
        self.command
    }

    pub fn push_header(&mut self, key: impl Into<ByteString>, value: impl Into<ByteString>) {
        self.headers.push(key.into(), value.into());
    }

    pub fn prepend_header(&mut self, key: impl Into<ByteString>, value: impl Into<ByteString>) {
        self.headers.prepend(key.into(), value.into());
    }

    pub fn header(&self, key: &[u8]) -> Option<&ByteString> {
        self.headers.get(key)
    }

    /// Body bytes; empty when no body was ever written.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_ref().map_or(&[], |b| b.as_bytes())
    }

    pub fn set_body(&mut self, body: ByteString) {
        self.body = Some(body);
    }

    /// The body, created on first use. The parser appends into this as body
    /// bytes stream in.
    pub fn body_mut(&mut self) -> &mut ByteString {
        self.body.get_or_insert_with(ByteString::new)
    }

    pub fn into_parts(self) -> (Command, HeaderBundle, Option<ByteString>) {
        (self.command, self.headers, self.body)
    }
}

/// Frames compare by command, ordered header list, and body bytes; a missing
/// body and a zero-length body are the same frame on the wire.
impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.command == other.command
            && self.headers == other.headers
            && self.body_bytes() == other.body_bytes()
    }
}

impl Eq for Frame {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_names_round_trip() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_bytes(cmd.as_str().as_bytes()), Some(cmd));
        }
        assert_eq!(Command::from_bytes(b"FOO"), None);
        assert_eq!(Command::from_bytes(b"send"), None);
        assert_eq!(Command::from_bytes(b""), None);
    }

    #[test]
    fn body_rules() {
        assert!(Command::Send.allows_body());
        assert!(Command::Message.allows_body());
        assert!(Command::Error.allows_body());
        assert!(!Command::Subscribe.allows_body());
        assert!(!Command::Connected.allows_body());
    }

    #[test]
    fn escape_exemptions_differ_by_direction() {
        // Parsing leaves both handshake frames alone; serialization only
        // exempts CONNECTED.
        assert!(!Command::Connect.unescapes_headers_on_parse());
        assert!(!Command::Connected.unescapes_headers_on_parse());
        assert!(Command::Send.unescapes_headers_on_parse());

        assert!(Command::Connect.escapes_headers_on_serialize());
        assert!(!Command::Connected.escapes_headers_on_serialize());
        assert!(Command::Send.escapes_headers_on_serialize());
    }

    #[test]
    fn first_header_occurrence_wins() {
        let mut frame = Frame::new(Command::Send);
        frame.push_header("destination", "/queue/a");
        frame.push_header("destination", "/queue/b");
        assert_eq!(frame.header(b"destination").unwrap(), b"/queue/a".as_slice());
        assert_eq!(frame.headers.len(), 2);

        frame.prepend_header("destination", "/queue/override");
        assert_eq!(
            frame.header(b"destination").unwrap(),
            b"/queue/override".as_slice()
        );
    }

    #[test]
    fn missing_body_equals_empty_body() {
        let a = Frame::new(Command::Send);
        let mut b = Frame::new(Command::Send);
        b.set_body(ByteString::new());
        assert_eq!(a, b);
    }
}
