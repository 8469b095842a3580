//! Error types for configuration loading and the wire protocol.

/// Boxed error used at the backend seam so implementations stay pluggable.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while building the rule table from a config document.
///
/// All of these are fatal at startup; none occur at request time.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A rule can never match because an earlier rule already matches its
    /// entire operation.
    #[error("unreachable rule [{rule}]: masked by earlier rule [{masked_by}]")]
    UnreachableRule {
        /// Source form of the rejected rule's operation.
        rule: String,
        /// Source form of the rule that masks it.
        masked_by: String,
    },
    /// The document is not valid INI, or a section header is malformed.
    #[error("config parse: {0}")]
    Parse(String),
    /// The config file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-request protocol errors.
///
/// `Display` renders the exact message sent on the wire; [`kind`] yields the
/// dashed token used both in `ERR` replies and in `error.<kind>` metric names.
///
/// [`kind`]: ProtocolError::kind
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The first token is not a known command verb.
    #[error("Unrecognized command: {0}")]
    UnknownCommand(String),
    /// A quoted string ran off the end of the line.
    #[error("Unexpected end of quoted string.")]
    UnterminatedQuote,
    /// An argument is not of the form `key=value`.
    #[error("Unparseable argument: {0}")]
    MalformedArgument(String),
    /// The line held nothing but whitespace.
    #[error("Empty request.")]
    EmptyRequest,
    /// The line exceeded the configured cap before a newline arrived.
    #[error("Line exceeds maximum length.")]
    LineTooLong,
}

impl ProtocolError {
    /// Dashed kind token for the wire and for metric names.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::UnknownCommand(_) => "unknown-command",
            ProtocolError::UnterminatedQuote
            | ProtocolError::MalformedArgument(_)
            | ProtocolError::EmptyRequest => "unknown",
            ProtocolError::LineTooLong => "line-too-long",
        }
    }

    /// Whether the connection must be closed after replying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::LineTooLong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_wire_tokens() {
        assert_eq!(ProtocolError::UnknownCommand("X".into()).kind(), "unknown-command");
        assert_eq!(ProtocolError::UnterminatedQuote.kind(), "unknown");
        assert_eq!(ProtocolError::MalformedArgument("foo".into()).kind(), "unknown");
        assert_eq!(ProtocolError::LineTooLong.kind(), "line-too-long");
    }

    #[test]
    fn display_matches_wire_messages() {
        assert_eq!(
            ProtocolError::UnknownCommand("EGGPLANT".into()).to_string(),
            "Unrecognized command: EGGPLANT"
        );
        assert_eq!(
            ProtocolError::UnterminatedQuote.to_string(),
            "Unexpected end of quoted string."
        );
    }

    #[test]
    fn only_line_too_long_is_fatal() {
        assert!(ProtocolError::LineTooLong.is_fatal());
        assert!(!ProtocolError::UnknownCommand("X".into()).is_fatal());
        assert!(!ProtocolError::UnterminatedQuote.is_fatal());
    }

    #[test]
    fn unreachable_rule_names_both_rules() {
        let err = ConfigError::UnreachableRule {
            rule: "a=1".into(),
            masked_by: "a=*".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("a=1"));
        assert!(msg.contains("a=*"));
    }
}
