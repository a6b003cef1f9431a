//! Cookie-session authentication: a shared-secret token stored in the
//! settings tree (`["auth", "token"]`) and echoed back as a plain cookie.
//! Authentication is disabled entirely when no token is configured — the
//! default console/dev posture.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;

use super::AppState;

pub const SESSION_COOKIE: &str = "nftrackd_session";

pub async fn require_session(State(state): State<AppState>, jar: CookieJar, req: Request, next: Next) -> Result<Response, StatusCode> {
    let configured = state.settings.get(&["auth", "token"]).await;
    let Some(serde_json::Value::String(expected)) = configured else {
        return Ok(next.run(req).await);
    };

    match jar.get(SESSION_COOKIE) {
        Some(cookie) if cookie.value() == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
