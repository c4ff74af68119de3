use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::organizations::MemberRole;

const SESSION_COOKIE: &str = "auth_token";

#[derive(Deserialize)]
struct Claims {
    sub: i32,
    org: i32,
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Caller identity: user, organization and membership role from the session token.
/// Unknown role strings yield `role: None` and fail every role gate.
#[derive(Debug)]
pub struct AuthUser {
    pub user_id: i32,
    pub organization_id: i32,
    pub role: Option<MemberRole>,
}

impl AuthUser {
    fn require(&self, allowed: impl Fn(MemberRole) -> bool) -> AppResult<()> {
        match self.role {
            Some(role) if allowed(role) => Ok(()),
            _ => Err(AppError::Forbidden),
        }
    }

    pub fn require_admin(&self) -> AppResult<()> {
        self.require(|role| role.is_admin())
    }

    pub fn require_supervisor(&self) -> AppResult<()> {
        self.require(|role| role == MemberRole::Supervisor || role.is_admin())
    }

    /// Anyone above plain membership may work the review queue.
    pub fn require_moderator(&self) -> AppResult<()> {
        self.require(|role| role != MemberRole::Member)
    }
}

/// Bearer header first, then the session cookie.
fn session_token(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    parts
        .headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(SESSION_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
            })
        })
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token =
            session_token(parts).ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let key = DecodingKey::from_secret(crate::config::JWT_SECRET.as_bytes());
        let claims = decode::<Claims>(&token, &key, &Validation::default())
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?
            .claims;
        Ok(AuthUser {
            user_id: claims.sub,
            organization_id: claims.org,
            role: MemberRole::parse(&claims.role),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn signed(role: &str) -> String {
        std::env::set_var("JWT_SECRET", "secret");
        let claims = serde_json::json!({"sub": 7, "org": 3, "role": role, "exp": 9999999999u64});
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap()
    }

    async fn extract(request: Request<()>) -> Result<AuthUser, (StatusCode, String)> {
        let mut parts = request.into_parts().0;
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn bearer_token_carries_organization_and_role() {
        let request = Request::builder()
            .header("Authorization", format!("Bearer {}", signed("moderator")))
            .body(())
            .unwrap();
        let user = extract(request).await.unwrap();
        assert_eq!(user.user_id, 7);
        assert_eq!(user.organization_id, 3);
        assert_eq!(user.role, Some(MemberRole::Moderator));
        assert!(user.require_moderator().is_ok());
        assert!(user.require_supervisor().is_err());
        assert!(user.require_admin().is_err());
    }

    #[tokio::test]
    async fn session_cookie_is_accepted() {
        let request = Request::builder()
            .header("Cookie", format!("theme=dark; auth_token={}", signed("owner")))
            .body(())
            .unwrap();
        let user = extract(request).await.unwrap();
        assert!(user.require_admin().is_ok());
        assert!(user.require_supervisor().is_ok());
    }

    #[tokio::test]
    async fn unknown_roles_pass_no_gate() {
        let request = Request::builder()
            .header("Authorization", format!("Bearer {}", signed("janitor")))
            .body(())
            .unwrap();
        let user = extract(request).await.unwrap();
        assert_eq!(user.role, None);
        assert!(user.require_moderator().is_err());
    }

    #[tokio::test]
    async fn invalid_or_missing_tokens_are_rejected() {
        std::env::set_var("JWT_SECRET", "secret");
        let garbled = Request::builder()
            .header("Authorization", "Bearer invalid")
            .body(())
            .unwrap();
        assert_eq!(extract(garbled).await.unwrap_err().0, StatusCode::UNAUTHORIZED);

        let anonymous = Request::builder().body(()).unwrap();
        assert_eq!(extract(anonymous).await.unwrap_err().0, StatusCode::UNAUTHORIZED);
    }
}
