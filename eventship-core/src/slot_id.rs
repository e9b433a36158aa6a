//! HSM object identifiers
//!
//! `sota.toml` names PKCS#11 objects with short digit strings such as `"01"`.
//! Every character is one byte holding its digit value, so `"0102"` is the
//! identifier `[1, 0, 2]`. Leading zero bytes are stripped.

use crate::error::{Error, Result};

/// Decode a digit-string identifier into the raw `CKA_ID` bytes.
///
/// Rejects empty input, non-digit characters and identifiers that are all
/// zeros (there is no object id left once leading zeros are stripped).
pub fn decode(id: &str) -> Result<Vec<u8>> {
    if id.is_empty() {
        return Err(invalid(id, "identifier is empty"));
    }

    let mut bytes = Vec::with_capacity(id.len());
    for ch in id.bytes() {
        if !ch.is_ascii_digit() {
            return Err(invalid(id, "only the digits 0-9 are allowed"));
        }
        bytes.push(ch - b'0');
    }

    match bytes.iter().position(|&b| b != 0) {
        Some(start) => Ok(bytes.split_off(start)),
        None => Err(invalid(id, "identifier has no non-zero digit")),
    }
}

fn invalid(id: &str, reason: &'static str) -> Error {
    Error::InvalidIdentifier {
        id: id.to_string(),
        reason,
    }
}
