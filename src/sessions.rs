use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts, RequestPartsExt};
use axum_extra::{headers::Cookie, TypedHeader};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{AppError, AppResult};
use crate::routes::AppState;

pub const SESSION_COOKIE: &str = "session_token";

/// Turns a request credential into a user id.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> AppResult<Uuid>;
}

/// Resolves the session cookie against `users.username`.
pub struct PgSessions {
    db: Db,
}

impl PgSessions {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionResolver for PgSessions {
    async fn resolve(&self, token: &str) -> AppResult<Uuid> {
        let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE username = $1")
            .bind(token)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        id.ok_or(AppError::Unauthenticated)
    }
}

/// Authenticated caller, resolved from the session cookie under the store
/// timeout.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(cookies) = parts
            .extract::<TypedHeader<Cookie>>()
            .await
            .map_err(|_| AppError::Unauthenticated)?;
        let token = cookies
            .get(SESSION_COOKIE)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AppError::Unauthenticated)?;
        let user_id = state.service.bounded(state.sessions.resolve(token)).await?;
        Ok(CurrentUser(user_id))
    }
}
