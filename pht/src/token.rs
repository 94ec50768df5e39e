//! Session tokens.

use core::{fmt, str::FromStr};
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};

use crate::error::{InvalidToken, TokenError};

/// Number of random bytes in a server-generated token.
const TOKEN_BYTES: usize = 16;

/// An opaque session identifier, issued by the server at handshake.
///
/// Server-generated tokens are 16 bytes from the OS RNG, hex encoded. Tokens
/// received from a server are accepted as any non-empty string of visible
/// ASCII without `;` or `=`, so that they survive the credential header.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(Arc<str>);

impl Token {
    /// Generate a new random token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError`] if the OS RNG is unavailable.
    pub fn generate() -> Result<Self, TokenError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.try_fill_bytes(&mut bytes)?;

        let mut hex = String::with_capacity(TOKEN_BYTES * 2);
        for byte in &bytes {
            use core::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }

        Ok(Self(hex.into()))
    }

    /// The token as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Token {
    type Err = InvalidToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b';' && b != b'=');

        if valid {
            Ok(Self(s.into()))
        } else {
            Err(InvalidToken(s.to_owned()))
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
