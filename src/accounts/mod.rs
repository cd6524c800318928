use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::state::AppState;

pub mod account;
pub mod dto;
pub mod email_verification;
pub mod extractors;
pub mod handlers;
pub mod password;
pub mod password_reset;
pub mod session;
pub mod tokens;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", post(handlers::register))
        .route(
            "/users/me",
            get(handlers::get_me).delete(handlers::schedule_deletion),
        )
        .route("/sessions", post(handlers::login))
        .route("/sessions/current", delete(handlers::logout))
        .route("/password-resets", post(handlers::request_password_reset))
        .route(
            "/password-resets/:token",
            put(handlers::execute_password_reset),
        )
        .route("/email-verifications", post(handlers::send_verification))
        .route("/email-verifications/:token", put(handlers::verify_email))
}
