use std::fmt;

use anyhow::Context;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::db::TokenRecord;
use crate::error::AppError;

/// Random bytes behind every issued token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Returns `byte_len` bytes from the OS entropy source, hex-encoded.
pub fn generate(byte_len: usize) -> anyhow::Result<String> {
    let mut buf = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut buf)
        .context("entropy source unavailable")?;
    Ok(hex::encode(buf))
}

/// SHA-256 of the raw token, hex-encoded. This is the only persisted form.
pub fn hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// A freshly created token. `raw` leaves the process exactly once.
pub struct IssuedToken {
    pub raw: String,
    pub record: TokenRecord,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("raw", &"<redacted>")
            .field("record", &self.record)
            .finish()
    }
}

/// Checks a looked-up single-use token, mapping a miss to `missing`.
pub fn ensure_redeemable(
    record: Option<TokenRecord>,
    missing: AppError,
    now: OffsetDateTime,
) -> Result<TokenRecord, AppError> {
    let record = record.ok_or(missing)?;
    if record.is_consumed() {
        return Err(AppError::TokenAlreadyUsed);
    }
    if record.is_expired_at(now) {
        return Err(AppError::TokenExpired);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use time::Duration;
    use uuid::Uuid;

    #[test]
    fn generated_tokens_are_hex_and_unique() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let raw = generate(TOKEN_BYTES).expect("entropy");
            assert_eq!(raw.len(), TOKEN_BYTES * 2);
            assert!(raw.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(raw), "duplicate token generated");
        }
    }

    #[test]
    fn hash_is_deterministic_and_fixed_length() {
        let raw = generate(TOKEN_BYTES).unwrap();
        assert_eq!(hash(&raw), hash(&raw));
        assert_eq!(hash(&raw).len(), 64);
        assert_ne!(hash(&raw), hash("something else"));
        assert_eq!(
            hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn issued_token_debug_hides_raw() {
        let now = OffsetDateTime::now_utc();
        let issued = IssuedToken {
            raw: "super-secret-raw".into(),
            record: TokenRecord {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                token_hash: hash("super-secret-raw"),
                expires_at: now,
                consumed_at: None,
                created_at: now,
            },
        };
        assert!(!format!("{issued:?}").contains("super-secret-raw"));
    }

    #[test]
    fn redeemable_taxonomy() {
        let now = OffsetDateTime::now_utc();
        let fresh = TokenRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: "h".into(),
            expires_at: now + Duration::hours(1),
            consumed_at: None,
            created_at: now,
        };
        assert!(matches!(
            ensure_redeemable(None, AppError::InvalidResetToken, now),
            Err(AppError::InvalidResetToken)
        ));
        let used = TokenRecord {
            consumed_at: Some(now),
            ..fresh.clone()
        };
        assert!(matches!(
            ensure_redeemable(Some(used), AppError::InvalidResetToken, now),
            Err(AppError::TokenAlreadyUsed)
        ));
        let expired = TokenRecord {
            expires_at: now - Duration::minutes(1),
            ..fresh.clone()
        };
        assert!(matches!(
            ensure_redeemable(Some(expired), AppError::InvalidResetToken, now),
            Err(AppError::TokenExpired)
        ));
        assert!(ensure_redeemable(Some(fresh), AppError::InvalidResetToken, now).is_ok());
    }
}
