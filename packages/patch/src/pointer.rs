//! JSON pointer helpers (RFC 6901)

use crate::PatchError;

/// Escape a single reference token (`~` → `~0`, `/` → `~1`)
pub fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Unescape a single reference token
pub fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Append a token to a pointer
pub fn join(pointer: &str, token: &str) -> String {
    format!("{}/{}", pointer, escape(token))
}

/// Split a pointer into unescaped reference tokens.
///
/// The empty pointer addresses the whole document and yields no tokens.
pub fn tokens(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
    Ok(rest.split('/').map(unescape).collect())
}

/// Parse an array index token. `-` is only meaningful for `add` and is
/// handled by the caller.
pub fn parse_index(token: &str, pointer: &str) -> Result<usize, PatchError> {
    if token.len() > 1 && token.starts_with('0') {
        return Err(PatchError::InvalidPointer(pointer.to_string()));
    }
    token
        .parse::<usize>()
        .map_err(|_| PatchError::InvalidPointer(pointer.to_string()))
}
