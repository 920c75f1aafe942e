//! Line protocol codec (C1): tokenizes a byte stream into whitespace
//! separated, optionally quoted and escaped argument vectors, one line per
//! logical frame. Shared by the wire protocol (scheduler and driver
//! sockets) and the scheduler's own config-file grammar.

/// Hard cap on a single line's length. The original keeps frames well
/// under this; it exists to bound memory for a misbehaving peer.
pub const MAX_LINE_LEN: usize = 8192;

/// Result of feeding one byte to the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// No complete line yet.
    Pending,
    /// A full line was parsed; these are its (possibly zero) arguments.
    Complete(Vec<String>),
    /// The line could not be parsed. The parser has already resynchronized
    /// to the next line boundary (or will, on the next EOL byte).
    Error(&'static str),
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    /// Between tokens, skipping whitespace.
    Between,
    /// Inside a bare (unquoted) token.
    Bare,
    /// Inside a quoted token.
    Quoted,
    /// Just saw a backslash inside a quoted token.
    QuotedEscape,
    /// Just saw a backslash inside a bare token.
    BareEscape,
    /// Overflowed the max line length; discard bytes until EOL.
    Overflow,
}

/// Streaming parser for one line at a time. After a `Feed::Complete` or
/// `Feed::Error` is returned, the parser has already reset itself and is
/// ready for the next line.
#[derive(Debug)]
pub struct Parser {
    state: State,
    args: Vec<String>,
    current: String,
    len: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::Between,
            args: Vec::new(),
            current: String::new(),
            len: 0,
        }
    }

    /// Discard all partial state, as if freshly constructed.
    pub fn reset(&mut self) {
        self.state = State::Between;
        self.args.clear();
        self.current.clear();
        self.len = 0;
    }

    fn finish_bare_if_any(&mut self) {
        if !self.current.is_empty() {
            self.args.push(std::mem::take(&mut self.current));
        }
    }

    fn is_eol(b: u8) -> bool {
        b == b'\n' || b == b'\r'
    }

    pub fn feed(&mut self, b: u8) -> Feed {
        self.len += 1;
        if self.len > MAX_LINE_LEN && !matches!(self.state, State::Overflow) {
            self.state = State::Overflow;
        }

        match self.state {
            State::Overflow => {
                if Self::is_eol(b) {
                    self.reset();
                    return Feed::Error("line too long");
                }
                Feed::Pending
            }
            State::Between => {
                if Self::is_eol(b) {
                    let args = std::mem::take(&mut self.args);
                    self.reset();
                    return Feed::Complete(args);
                }
                if b == b' ' || b == b'\t' {
                    return Feed::Pending;
                }
                if b == b'"' {
                    self.state = State::Quoted;
                    return Feed::Pending;
                }
                self.state = State::Bare;
                self.current.push(b as char);
                Feed::Pending
            }
            State::Bare => {
                if Self::is_eol(b) {
                    self.finish_bare_if_any();
                    let args = std::mem::take(&mut self.args);
                    self.reset();
                    return Feed::Complete(args);
                }
                if b == b' ' || b == b'\t' {
                    self.finish_bare_if_any();
                    self.state = State::Between;
                    return Feed::Pending;
                }
                if b == b'\\' {
                    // A bare token may also carry escapes; the next byte is
                    // literal regardless of what it is.
                    self.state = State::BareEscape;
                    return Feed::Pending;
                }
                self.current.push(b as char);
                Feed::Pending
            }
            State::BareEscape => {
                if Self::is_eol(b) {
                    self.reset();
                    return Feed::Error("unterminated quote");
                }
                self.current.push(b as char);
                self.state = State::Bare;
                Feed::Pending
            }
            State::Quoted => {
                if b == b'"' {
                    self.args.push(std::mem::take(&mut self.current));
                    self.state = State::Between;
                    return Feed::Pending;
                }
                if b == b'\\' {
                    self.state = State::QuotedEscape;
                    return Feed::Pending;
                }
                if Self::is_eol(b) {
                    self.reset();
                    return Feed::Error("unterminated quote");
                }
                self.current.push(b as char);
                Feed::Pending
            }
            State::QuotedEscape => {
                if Self::is_eol(b) {
                    self.reset();
                    return Feed::Error("unterminated quote");
                }
                self.current.push(b as char);
                self.state = State::Quoted;
                Feed::Pending
            }
        }
    }
}

/// Escape a token for transmission on the wire: wraps it in double quotes
/// and backslash-escapes any embedded quote or backslash. Mirrors the
/// original's `pconf_encode` helper, used by both the scheduler client's
/// `sendcmd` and the tracked-request layer.
pub fn encode_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Vec<Feed> {
        let mut p = Parser::new();
        input.iter().map(|&b| p.feed(b)).collect()
    }

    #[test]
    fn empty_line_yields_zero_args() {
        let mut p = Parser::new();
        assert_eq!(p.feed(b'\n'), Feed::Complete(vec![]));
    }

    #[test]
    fn bare_tokens_split_on_whitespace() {
        let mut p = Parser::new();
        let mut last = Feed::Pending;
        for &b in b"START shutnow 10\n" {
            last = p.feed(b);
        }
        assert_eq!(
            last,
            Feed::Complete(vec![
                "START".to_string(),
                "shutnow".to_string(),
                "10".to_string()
            ])
        );
    }

    #[test]
    fn quoted_token_with_escapes() {
        let mut p = Parser::new();
        let mut last = Feed::Pending;
        for &b in br#"CANCEL "a \"b\" c"" "#.iter().chain(b"\n".iter()) {
            last = p.feed(b);
        }
        assert_eq!(
            last,
            Feed::Complete(vec!["CANCEL".to_string(), "a \"b\" c".to_string()])
        );
    }

    #[test]
    fn backslash_escapes_literal_byte_regardless() {
        let mut p = Parser::new();
        let mut last = Feed::Pending;
        for &b in br#""\n\\""# .iter().chain(b"\n".iter()) {
            last = p.feed(b);
        }
        // \n -> literal 'n', \\ -> literal '\'
        assert_eq!(last, Feed::Complete(vec!["n\\".to_string()]));
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let results = parse_all(b"\"unterminated\n");
        assert!(results.iter().any(|f| matches!(f, Feed::Error(_))));
    }

    #[test]
    fn overlong_line_is_an_error_and_resyncs() {
        let mut p = Parser::new();
        let mut last = Feed::Pending;
        for _ in 0..(MAX_LINE_LEN + 10) {
            last = p.feed(b'x');
        }
        last = p.feed(b'\n');
        assert_eq!(last, Feed::Error("line too long"));
        // Parser is ready for the next line.
        assert_eq!(p.feed(b'\n'), Feed::Complete(vec![]));
    }

    #[test]
    fn encode_round_trips_through_parser() {
        for raw in ["plain", "has space", "has\"quote", "has\\slash", ""] {
            let encoded = encode_token(raw);
            let mut p = Parser::new();
            let mut last = Feed::Pending;
            for &b in encoded.as_bytes() {
                last = p.feed(b);
            }
            last = p.feed(b'\n');
            match last {
                // A quoted empty string is still one (empty) token, distinct
                // from a line with no tokens at all.
                Feed::Complete(args) => assert_eq!(args, vec![raw.to_string()]),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
