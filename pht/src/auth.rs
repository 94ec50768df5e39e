//! The `key=...; token=...` credential header.
//!
//! Parsing splits on `;`, then each segment on its first `=`, trimming
//! whitespace around names and values. Segments without `=` are skipped.
//! Missing fields read as empty strings, which never match a configured key.

use std::collections::BTreeMap;

use crate::token::Token;

/// Split a credential header into its `name=value` fields.
#[must_use]
pub fn parse_fields(header: &str) -> BTreeMap<&str, &str> {
    header
        .split(';')
        .filter_map(|segment| segment.split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect()
}

/// A parsed or to-be-sent credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials<'a> {
    /// The shared key. Empty when the header has no `key` field.
    pub key: &'a str,

    /// The session token. Empty when the header has no `token` field.
    pub token: &'a str,
}

impl<'a> Credentials<'a> {
    /// Parse a credential header value.
    #[must_use]
    pub fn parse(header: &'a str) -> Self {
        let fields = parse_fields(header);
        Self {
            key: fields.get("key").copied().unwrap_or_default(),
            token: fields.get("token").copied().unwrap_or_default(),
        }
    }

    /// Whether the key matches `expected`.
    ///
    /// The comparison does not short-circuit on the first differing byte.
    #[must_use]
    pub fn key_matches(&self, expected: &str) -> bool {
        let (a, b) = (self.key.as_bytes(), expected.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// Build the credential sent to the token endpoint.
#[must_use]
pub fn key_header(key: &str) -> String {
    format!("key={key}")
}

/// Build the credential sent to the push, poll and close endpoints.
#[must_use]
pub fn session_header(key: &str, token: &Token) -> String {
    format!("key={key}; token={token}")
}
