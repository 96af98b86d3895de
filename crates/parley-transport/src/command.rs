//! Command payload codec.
//!
//! Commands are lines of text: a name followed by `key=value` arguments
//! separated by spaces. Values escape the separator characters with
//! backslash sequences (`\s` space, `\p` pipe, `\\` backslash, plus the
//! usual control-character trio).
//!
//! Only the framing lives here. The connection uses it for the key
//! negotiation commands; applications use it for everything they say to
//! the server.

/// Escape a value for embedding in a command line.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '|' => out.push_str("\\p"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Undo [`escape`]. Returns `None` for a dangling or unknown escape.
#[must_use]
pub fn unescape(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            's' => out.push(' '),
            'p' => out.push('|'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            _ => return None,
        }
    }
    Some(out)
}

/// A parsed or under-construction command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command name (first word)
    pub name: String,
    args: Vec<(String, String)>,
}

impl Command {
    /// Start a command with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append a `key=value` argument.
    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    /// Look up an argument value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encode as a wire payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.name.clone();
        for (key, value) in &self.args {
            out.push(' ');
            out.push_str(key);
            if !value.is_empty() {
                out.push('=');
                out.push_str(&escape(value));
            }
        }
        out.into_bytes()
    }

    /// Parse a wire payload. Returns `None` for non-UTF-8 input, an empty
    /// line, or a bad escape.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let mut words = text.split(' ').filter(|w| !w.is_empty());

        let name = words.next()?.to_string();
        let mut args = Vec::new();
        for word in words {
            match word.split_once('=') {
                Some((key, value)) => args.push((key.to_string(), unescape(value)?)),
                None => args.push((word.to_string(), String::new())),
            }
        }
        Some(Self { name, args })
    }
}
