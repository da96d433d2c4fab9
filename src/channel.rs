//! Channel naming and the quoting rules used to build NOTIFY/LISTEN commands

use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};

/// Postgres truncates identifiers longer than this
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Hex digest length used for over-long channel names
const DIGEST_HEX_LEN: usize = 40;

/// Map an application channel to the Postgres channel identifier.
///
/// Publisher and listener must agree on this mapping, so long names are
/// hashed instead of being silently truncated by the server.
pub fn channel_identifier(prefix: Option<&str>, channel: &str) -> String {
    let full = match prefix {
        Some(prefix) => format!("{prefix}:{channel}"),
        None => channel.to_string(),
    };

    if full.len() > MAX_IDENTIFIER_LEN {
        let digest = hex::encode(Sha256::digest(full.as_bytes()));
        digest[..DIGEST_HEX_LEN].to_string()
    } else {
        full
    }
}

/// Quote an identifier: `my"chan` becomes `"my""chan"`
pub fn escape_identifier(identifier: &str) -> Result<String> {
    if identifier.is_empty() || identifier.contains('\0') {
        return Err(RelayError::invalid_channel(identifier));
    }
    Ok(format!("\"{}\"", identifier.replace('"', "\"\"")))
}

/// Escape text for use inside a single-quoted literal.
///
/// Assumes `standard_conforming_strings = on`, so only quotes are doubled.
pub fn escape_literal(text: &str) -> Result<String> {
    if text.contains('\0') {
        return Err(RelayError::invalid_payload(
            "payload contains a NUL byte, which Postgres text cannot store",
        ));
    }
    Ok(text.replace('\'', "''"))
}
