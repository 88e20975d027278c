//! Line codec for the `key:value|key:value` wire format.
//!
//! Every record is a single line:
//!
//! ```text
//! type:private_message|from:alice|to:bob|content:hi
//! ```
//!
//! The first pair is always `type`. Reserved characters inside keys and values
//! are backslash-escaped:
//!
//! ```text
//! \   ->  \\
//! |   ->  \|
//! :   ->  \:
//! LF  ->  \n
//! CR  ->  \r
//! ```
//!
//! An unescaped `:` inside a value is a protocol violation rather than a
//! second separator, so a malformed record can never shift field boundaries.

use std::collections::HashSet;

use crate::error::ProtocolError;

/// Key of the mandatory first pair.
pub const TYPE_KEY: &str = "type";

/// One decoded record: its type plus the remaining fields in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: String,
    fields: Vec<(String, String)>,
}

impl Frame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style [`Frame::push`].
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        self.fields.push((key.into(), value.to_string()));
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`Frame::get`] but a missing field is a protocol error naming
    /// this record's type.
    pub fn require(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.get(key).ok_or_else(|| ProtocolError::MissingField {
            kind: self.kind.clone(),
            field: key,
        })
    }

    /// Encode as one wire line (without the trailing newline).
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(16 + self.fields.len() * 16);
        out.push_str(TYPE_KEY);
        out.push(':');
        escape_into(&self.kind, &mut out);
        for (key, value) in &self.fields {
            out.push('|');
            escape_into(key, &mut out);
            out.push(':');
            escape_into(value, &mut out);
        }
        out
    }

    /// Decode one wire line (without the trailing newline).
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        if line.is_empty() {
            return Err(ProtocolError::EmptyRecord);
        }

        let mut pairs = decode_pairs(line)?.into_iter();
        let (first_key, kind) = pairs.next().ok_or(ProtocolError::EmptyRecord)?;
        if first_key != TYPE_KEY {
            return Err(ProtocolError::MissingType(first_key));
        }

        let mut seen = HashSet::new();
        seen.insert(TYPE_KEY.to_string());
        let mut fields = Vec::new();
        for (key, value) in pairs {
            if !seen.insert(key.clone()) {
                return Err(ProtocolError::DuplicateField(key));
            }
            fields.push((key, value));
        }

        Ok(Self { kind, fields })
    }
}

/// Escape a single key or value.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    escape_into(raw, &mut out);
    out
}

fn escape_into(raw: &str, out: &mut String) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            ':' => out.push_str("\\:"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

/// Encode an ordered list of pairs. Used for the record itself and for
/// nested lists carried inside a single field (e.g. history entries).
pub fn encode_pairs(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        escape_into(key, &mut out);
        out.push(':');
        escape_into(value, &mut out);
    }
    out
}

/// Decode an ordered list of pairs. Duplicate keys are allowed here; an empty
/// input is an empty list.
pub fn decode_pairs(input: &str) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut pairs = Vec::new();
    if input.is_empty() {
        return Ok(pairs);
    }

    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let unescaped = match chars.next() {
                    Some('\\') => '\\',
                    Some('|') => '|',
                    Some(':') => ':',
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some(other) => return Err(ProtocolError::UnknownEscape(other)),
                    None => return Err(ProtocolError::DanglingEscape),
                };
                if in_value {
                    value.push(unescaped);
                } else {
                    key.push(unescaped);
                }
            }
            ':' => {
                if in_value {
                    return Err(ProtocolError::UnescapedColon(key));
                }
                in_value = true;
            }
            '|' => {
                pairs.push(finish_pair(&mut key, &mut value, in_value)?);
                in_value = false;
            }
            '\n' | '\r' => return Err(ProtocolError::RawLineBreak(key)),
            c => {
                if in_value {
                    value.push(c);
                } else {
                    key.push(c);
                }
            }
        }
    }

    pairs.push(finish_pair(&mut key, &mut value, in_value)?);
    Ok(pairs)
}

fn finish_pair(
    key: &mut String,
    value: &mut String,
    in_value: bool,
) -> Result<(String, String), ProtocolError> {
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    if !in_value {
        return Err(ProtocolError::MissingSeparator(std::mem::take(key)));
    }
    Ok((std::mem::take(key), std::mem::take(value)))
}

/// Join names for list-valued fields (`users`, `groups`). Names never contain
/// a comma; registration rejects them.
pub fn join_list(items: &[String]) -> String {
    items.join(",")
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
