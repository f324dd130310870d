use thiserror::Error;

/// Maximum accepted nickname length, in characters.
pub const NICKNAME_MAX_LEN: usize = 50;

/// Characters that would break URLs or auth filenames if they appeared in an
/// account identifier.
const UNSAFE_CHARS: [char; 5] = ['%', '/', '&', '?', '#'];

/// Why a nickname was rejected.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NicknameError {
    #[error("nickname must not be empty")]
    Empty,
    #[error("nickname must be at most {NICKNAME_MAX_LEN} characters")]
    TooLong,
    #[error("nickname must not contain whitespace")]
    Whitespace,
    #[error("nickname must not contain any of % / & ? #")]
    UnsafeCharacter,
    #[error("nicknames matching `{pattern}` are reserved for discovered accounts")]
    Reserved { pattern: &'static str },
}

/// Validates a user-supplied nickname for a no-email provider account.
///
/// Rejects empty or overlong input, whitespace, URL-unsafe specials, and the
/// `kiro-<digits>` / `ghcp-<digits>` shapes reserved for auto-discovered
/// accounts. The reserved check is case-insensitive on the literal input, so
/// zero-padded forms like `kiro-01` are rejected too.
pub fn validate_nickname(nickname: &str) -> Result<(), NicknameError> {
    if nickname.is_empty() {
        return Err(NicknameError::Empty);
    }
    if nickname.chars().count() > NICKNAME_MAX_LEN {
        return Err(NicknameError::TooLong);
    }
    if nickname.chars().any(char::is_whitespace) {
        return Err(NicknameError::Whitespace);
    }
    if nickname.chars().any(|c| UNSAFE_CHARS.contains(&c)) {
        return Err(NicknameError::UnsafeCharacter);
    }
    if is_reserved(nickname) {
        return Err(NicknameError::Reserved {
            pattern: "(kiro|ghcp)-<digits>",
        });
    }
    Ok(())
}

fn is_reserved(nickname: &str) -> bool {
    let lower = nickname.to_ascii_lowercase();
    for prefix in ["kiro-", "ghcp-"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}
