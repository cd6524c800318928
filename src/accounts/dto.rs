use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::User;
use crate::error::AppError;

pub const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::Validation("invalid email".into()));
    }
    Ok(email)
}

fn check_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Request body for registration.
#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validated(mut self) -> Result<Self, AppError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(AppError::Validation("name is required".into()));
        }
        self.email = normalize_email(&self.email)?;
        check_password(&self.password)?;
        Ok(self)
    }
}

/// Request body for login.
#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validated(mut self) -> Result<Self, AppError> {
        self.email = normalize_email(&self.email)?;
        Ok(self)
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

impl PasswordResetRequest {
    pub fn validated(self) -> Result<Self, AppError> {
        Ok(Self {
            email: normalize_email(&self.email)?,
        })
    }
}

#[derive(Deserialize)]
pub struct NewPasswordRequest {
    pub password: String,
}

impl NewPasswordRequest {
    pub fn validated(self) -> Result<Self, AppError> {
        check_password(&self.password)?;
        Ok(self)
    }
}

/// `email` is only read when the caller is not authenticated.
#[derive(Debug, Default, Deserialize)]
pub struct VerificationRequest {
    pub email: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deletion_scheduled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email_verified: u.is_email_verified(),
            name: u.name,
            email: u.email,
            deletion_scheduled_at: u.deletion_scheduled_at,
            created_at: u.created_at,
        }
    }
}

/// Returned after registration and login. `token` is shown only here.
#[derive(Serialize)]
pub struct SessionResponse {
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: PublicUser,
}

impl fmt::Debug for SessionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionResponse")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct DeletionScheduledResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub message: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_and_lowercased() {
        let req = RegisterRequest {
            name: "  Ann ".into(),
            email: " Ann@Example.COM ".into(),
            password: "long-enough".into(),
        }
        .validated()
        .unwrap();
        assert_eq!(req.email, "ann@example.com");
        assert_eq!(req.name, "Ann");
    }

    #[test]
    fn rejects_bad_input() {
        let bad_email = RegisterRequest {
            name: "A".into(),
            email: "not-an-email".into(),
            password: "long-enough".into(),
        };
        assert!(matches!(bad_email.validated(), Err(AppError::Validation(_))));

        let short = NewPasswordRequest {
            password: "short".into(),
        };
        assert!(matches!(short.validated(), Err(AppError::Validation(_))));

        let nameless = RegisterRequest {
            name: "   ".into(),
            email: "a@example.com".into(),
            password: "long-enough".into(),
        };
        assert!(nameless.validated().is_err());
    }

    #[test]
    fn public_user_uses_rfc3339() {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            name: "Ann".into(),
            email: "ann@example.com".into(),
            password_hash: "$argon2id$secret".into(),
            email_verified_at: Some(now),
            deletion_scheduled_at: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(PublicUser::from(user)).unwrap();
        assert_eq!(json["email_verified"], true);
        assert!(json["created_at"].as_str().unwrap().contains('T'));
        assert!(json["deletion_scheduled_at"].is_null());
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn session_response_debug_hides_token() {
        let now = OffsetDateTime::now_utc();
        let res = SessionResponse {
            token: "f00dfeedcafe".into(),
            expires_at: now,
            user: PublicUser {
                id: Uuid::new_v4(),
                name: "Ann".into(),
                email: "ann@example.com".into(),
                email_verified: false,
                deletion_scheduled_at: None,
                created_at: now,
            },
        };
        let out = format!("{res:?}");
        assert!(!out.contains("f00dfeedcafe"));
        assert!(out.contains("ann@example.com"));
    }
}
