// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

pub const CLIENT_ID_PREFIX: &str = "tern";

/// Random part of generated client ids, like `tern-zKp31Dq8`.
const RANDOM_CLIENT_ID_LEN: usize = 8;

#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// String bytes are not well-formed UTF-8.
    InvalidUtf8,

    /// String contains the null character U+0000.
    InvalidChar,

    /// String length exceeds 65535 bytes.
    TooManyData,
}

/// Convert `bytes` into an owned UTF-8 string.
///
/// The character data in a UTF-8 Encoded String MUST be well-formed UTF-8
/// as defined by the Unicode specification and restated in RFC 3629
/// [MQTT-1.5.3-1]. A UTF-8 encoded string MUST NOT include an encoding of
/// the null character U+0000 [MQTT-1.5.3-2].
///
/// # Errors
///
/// Returns error if `bytes` is not a valid string.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_e| StringError::InvalidUtf8)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// Check that `s` is a valid string field value.
///
/// # Errors
///
/// Returns error if `s` is too long or contains a null character.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooManyData);
    }
    if s.contains('\u{0}') {
        return Err(StringError::InvalidChar);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// No chars.
    IsEmpty,

    /// Larger than 23 chars.
    TooLong,

    /// Can only contain 0-9a-zA-Z chars, `-` and `_`.
    InvalidChars,
}

/// Maximum client id length the broker accepts [MQTT-3.1.3-5].
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Check that `client_id` conforms to the character set and length the
/// broker accepts.
///
/// # Errors
///
/// Returns error if `client_id` is empty, too long or contains invalid
/// characters.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.is_empty() {
        return Err(ClientIdError::IsEmpty);
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ClientIdError::TooLong);
    }
    if client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(ClientIdError::InvalidChars)
    }
}

/// Generate a random client id.
///
/// A Server MAY allow a Client to supply a ClientId that has a length of
/// zero bytes, however if it does so the Server MUST treat this as a special
/// case and assign a unique ClientId to that Client [MQTT-3.1.3-6].
#[must_use]
pub fn random_client_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_CLIENT_ID_LEN)
        .map(char::from)
        .collect();
    format!("{CLIENT_ID_PREFIX}-{suffix}")
}
