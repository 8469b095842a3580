//! The line-oriented ASCII wire format: lexing, request parsing, and reply
//! formatting.
//!
//! Requests and replies are single LF-terminated lines. Tokens are separated
//! by runs of spaces and tabs; a token may embed double-quoted segments in
//! which `\"` is a literal quote, `\\` a literal backslash, and any other
//! `\x` is `x`. Framing (and the line-length cap) lives in the server; this
//! module only ever sees one complete line.

use crate::error::ProtocolError;
use crate::operation::Operation;

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask whether the described operation is permitted right now.
    Hit(Operation),
}

/// A reply line, one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Decision reply: `OK <isAllowed> <currentCredit> <nextResetSeconds>`.
    Ok {
        /// Whether the operation is permitted.
        is_allowed: bool,
        /// Credit remaining in the bucket (may be a negative sentinel).
        current_credit: i64,
        /// Seconds until the bucket refills.
        next_reset_seconds: i64,
    },
    /// Error reply: `ERR <kind> "<message>"`.
    Err {
        /// Short dashed kind token.
        kind: &'static str,
        /// Human-readable message, quoted on the wire.
        message: String,
    },
}

impl Reply {
    /// Decision reply.
    pub fn ok(is_allowed: bool, current_credit: i64, next_reset_seconds: i64) -> Reply {
        Reply::Ok { is_allowed, current_credit, next_reset_seconds }
    }

    /// Error reply from a protocol error.
    pub fn from_error(err: &ProtocolError) -> Reply {
        Reply::Err { kind: err.kind(), message: err.to_string() }
    }

    /// Serialize to one LF-terminated line.
    pub fn to_line(&self) -> String {
        match self {
            Reply::Ok { is_allowed, current_credit, next_reset_seconds } => {
                format!("OK {} {} {}\n", is_allowed, current_credit, next_reset_seconds)
            }
            Reply::Err { kind, message } => {
                format!("ERR {} {}\n", kind, quote(message))
            }
        }
    }
}

/// Split a line into tokens, decoding quoted segments in place.
///
/// `key="a b"` is one token `key=a b`; a lone `"…"` token is its decoded
/// contents. An unterminated quote is an error.
pub fn tokenize(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        None => return Err(ProtocolError::UnterminatedQuote),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            None => return Err(ProtocolError::UnterminatedQuote),
                            Some(escaped) => current.push(escaped),
                        },
                        Some(other) => current.push(other),
                    }
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parse one line into a request.
///
/// The command verb is case-insensitive. `HIT` arguments must each be
/// `key=value`; a repeated key overwrites the earlier value.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let tokens = tokenize(line)?;
    let Some((verb, args)) = tokens.split_first() else {
        return Err(ProtocolError::EmptyRequest);
    };
    if !verb.eq_ignore_ascii_case("hit") {
        return Err(ProtocolError::UnknownCommand(verb.clone()));
    }
    let mut op = Operation::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(ProtocolError::MalformedArgument(arg.clone()));
        };
        if key.is_empty() {
            return Err(ProtocolError::MalformedArgument(arg.clone()));
        }
        op.set(key, value);
    }
    Ok(Request::Hit(op))
}

/// Wrap a string in double quotes, escaping quotes and backslashes.
pub fn quote(s: &str) -> String {
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

/// Decode one quoted string produced by [`quote`].
pub fn dequote(s: &str) -> Result<String, ProtocolError> {
    let inner = s
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or(ProtocolError::UnterminatedQuote)?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                None => return Err(ProtocolError::UnterminatedQuote),
                Some(escaped) => out.push(escaped),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Serialize an operation back into `HIT` argument form, quoting values that
/// need it. `tokenize` of the result recovers the operation exactly.
pub fn format_operation(op: &Operation) -> String {
    op.iter()
        .map(|(k, v)| format!("{}={}", k, maybe_quote(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn maybe_quote(value: &str) -> String {
    let needs_quotes =
        value.is_empty() || value.contains([' ', '\t', '"', '\\']);
    if needs_quotes {
        quote(value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_barewords() {
        assert_eq!(
            tokenize("HIT method=GET  path=/ping").unwrap(),
            vec!["HIT", "method=GET", "path=/ping"]
        );
    }

    #[test]
    fn tabs_separate_tokens() {
        assert_eq!(tokenize("a\tb \t c").unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn quoted_segment_joins_its_token() {
        assert_eq!(tokenize(r#"key="a b""#).unwrap(), vec!["key=a b"]);
        assert_eq!(tokenize(r#""lone token""#).unwrap(), vec!["lone token"]);
    }

    #[test]
    fn escapes_decode() {
        assert_eq!(tokenize(r#""say \"hi\"""#).unwrap(), vec![r#"say "hi""#]);
        assert_eq!(tokenize(r#""back\\slash""#).unwrap(), vec![r"back\slash"]);
        // Unknown escapes drop the backslash.
        assert_eq!(tokenize(r#""\x""#).unwrap(), vec!["x"]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            tokenize(r#"HIT "quoteme=123"#).unwrap_err(),
            ProtocolError::UnterminatedQuote
        );
        assert_eq!(tokenize(r#""ends in \"#).unwrap_err(), ProtocolError::UnterminatedQuote);
    }

    #[test]
    fn empty_quoted_token_survives() {
        assert_eq!(tokenize(r#"k="""#).unwrap(), vec!["k="]);
    }

    #[test]
    fn hit_parses_into_operation() {
        let Request::Hit(op) = parse_request("HIT method=GET ip=1.2.3.4").unwrap();
        assert_eq!(op.get("method"), Some("GET"));
        assert_eq!(op.get("ip"), Some("1.2.3.4"));
    }

    #[test]
    fn verb_is_case_insensitive() {
        assert!(parse_request("hit a=1").is_ok());
        assert!(parse_request("HiT a=1").is_ok());
    }

    #[test]
    fn repeated_key_overwrites() {
        let Request::Hit(op) = parse_request("HIT a=1 a=2").unwrap();
        assert_eq!(op.get("a"), Some("2"));
        assert_eq!(op.len(), 1);
    }

    #[test]
    fn bare_hit_is_the_empty_operation() {
        let Request::Hit(op) = parse_request("HIT").unwrap();
        assert!(op.is_empty());
    }

    #[test]
    fn argument_without_equals_is_rejected() {
        assert_eq!(
            parse_request("HIT justakey").unwrap_err(),
            ProtocolError::MalformedArgument("justakey".into())
        );
    }

    #[test]
    fn whitespace_only_line_is_an_empty_request() {
        assert_eq!(parse_request("   ").unwrap_err(), ProtocolError::EmptyRequest);
        assert_eq!(parse_request("").unwrap_err(), ProtocolError::EmptyRequest);
    }

    #[test]
    fn unknown_verb_is_reported_verbatim() {
        assert_eq!(
            parse_request("EGGPLANT foo=1").unwrap_err(),
            ProtocolError::UnknownCommand("EGGPLANT".into())
        );
    }

    #[test]
    fn value_may_contain_equals() {
        let Request::Hit(op) = parse_request("HIT q=a=b").unwrap();
        assert_eq!(op.get("q"), Some("a=b"));
    }

    #[test]
    fn ok_reply_grammar() {
        assert_eq!(Reply::ok(true, 100, 60).to_line(), "OK true 100 60\n");
        assert_eq!(Reply::ok(false, 0, 7).to_line(), "OK false 0 7\n");
        assert_eq!(Reply::ok(true, -1, 0).to_line(), "OK true -1 0\n");
    }

    #[test]
    fn err_reply_grammar() {
        let reply = Reply::from_error(&ProtocolError::UnknownCommand("EGGPLANT".into()));
        assert_eq!(
            reply.to_line(),
            "ERR unknown-command \"Unrecognized command: EGGPLANT\"\n"
        );
    }

    #[test]
    fn quote_dequote_round_trip() {
        for s in ["", "plain", "with space", r#"has "quotes""#, r"back\slash", "=&|"] {
            assert_eq!(dequote(&quote(s)).unwrap(), s);
        }
    }

    #[test]
    fn operation_serialization_round_trip() {
        let op: Operation = [
            ("method", "GET"),
            ("path", "/ping pong"),
            ("note", r#"say "hi""#),
            ("empty", ""),
        ]
        .into_iter()
        .collect();
        let line = format!("HIT {}", format_operation(&op));
        let Request::Hit(parsed) = parse_request(&line).unwrap();
        assert_eq!(parsed, op);
    }
}
