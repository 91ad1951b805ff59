use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::{DateTime, Utc};

use crate::error::ApiError;

/// Opaque pagination cursor wrapping a message's `created_at` in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor(i64);

impl PageCursor {
    pub fn from_created_at(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_micros())
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn encode(&self) -> String {
        B64.encode(format!("t{}", self.0))
    }

    pub fn decode(raw: &str) -> Result<Self, ApiError> {
        let invalid = || ApiError::validation("invalid page cursor");
        let bytes = B64.decode(raw).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let micros = text
            .strip_prefix('t')
            .and_then(|n| n.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        Ok(Self(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_opaque_and_reversible() {
        let cursor = PageCursor(1_700_000_000_123_456);
        let encoded = cursor.encode();
        assert!(!encoded.contains("1700"));
        assert_eq!(PageCursor::decode(&encoded).unwrap(), cursor);
    }

    #[test]
    fn garbage_cursor_is_a_validation_error() {
        assert!(matches!(PageCursor::decode("!!!"), Err(ApiError::Validation(_))));
        assert!(matches!(
            PageCursor::decode(&B64.encode("x12")),
            Err(ApiError::Validation(_))
        ));
    }
}
