use thiserror::Error;

/// A record that could not be turned into a typed command or event.
///
/// These are reported back to the peer as an `error` event; they never
/// close the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty record")]
    EmptyRecord,

    #[error("field '{0}' has no ':' separator")]
    MissingSeparator(String),

    #[error("unescaped ':' in value of field '{0}'")]
    UnescapedColon(String),

    #[error("unescaped line break in field '{0}'")]
    RawLineBreak(String),

    #[error("unknown escape sequence '\\{0}'")]
    UnknownEscape(char),

    #[error("record ends with a lone '\\'")]
    DanglingEscape,

    #[error("empty field name")]
    EmptyKey,

    #[error("duplicate field '{0}'")]
    DuplicateField(String),

    #[error("record must start with 'type', found '{0}'")]
    MissingType(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("'{kind}' is missing required field '{field}'")]
    MissingField { kind: String, field: &'static str },

    #[error("invalid value for '{field}': {value}")]
    InvalidField { field: &'static str, value: String },
}
