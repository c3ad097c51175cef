use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Position after the last session returned by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursor {
    pub last_start_unix_ms: i64,
    pub context_id: String,
}

pub fn encode_cursor<T: Serialize>(cursor: &T) -> StoreResult<String> {
    let json = serde_json::to_vec(cursor)
        .map_err(|err| StoreError::backend(format!("failed to serialize cursor: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_cursor<T: for<'de> Deserialize<'de>>(token: &str) -> StoreResult<T> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|err| StoreError::invalid_cursor(format!("invalid base64 cursor: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| StoreError::invalid_cursor(format!("invalid cursor payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_cursor_is_rejected() {
        let err = decode_cursor::<SessionCursor>("%%%").expect_err("not base64");
        assert!(matches!(err, StoreError::InvalidCursor(_)));

        let not_a_cursor = URL_SAFE_NO_PAD.encode(b"[1,2,3]");
        let err = decode_cursor::<SessionCursor>(&not_a_cursor).expect_err("wrong shape");
        assert!(err.to_string().contains("invalid cursor payload"));
    }
}
