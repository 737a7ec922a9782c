//! Bearer JWT authentication
//!
//! Every billing route runs on behalf of one tenant; the token's `sub`
//! claim is that tenant's owner id. The extractor rejects before the
//! handler runs, so handlers always see a validated `AuthUser`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant owner id.
    pub sub: String,
    pub exp: usize,
}

/// The authenticated tenant for this request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub owner_id: Uuid,
}

pub fn verify_token(token: &str, secret: &str) -> Result<AuthUser, ApiError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    let data =
        decode::<Claims>(token, &key, &validation).map_err(|_| ApiError::InvalidToken)?;
    let owner_id = Uuid::parse_str(&data.claims.sub).map_err(|_| ApiError::InvalidToken)?;
    Ok(AuthUser { owner_id })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::MissingAuth)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::MissingAuth)?;
        verify_token(token, &state.config.jwt_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};

    fn token_for(owner_id: Uuid, secret: &str, expires_in: Duration) -> String {
        let claims = Claims {
            sub: owner_id.to_string(),
            exp: (OffsetDateTime::now_utc() + expires_in).unix_timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_the_tenant() {
        let owner_id = Uuid::new_v4();
        let token = token_for(owner_id, "secret", Duration::hours(1));

        let user = verify_token(&token, "secret").unwrap();
        assert_eq!(user.owner_id, owner_id);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = token_for(Uuid::new_v4(), "secret", Duration::hours(1));
        assert!(matches!(
            verify_token(&token, "other"),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = token_for(Uuid::new_v4(), "secret", Duration::hours(-1));
        assert!(matches!(
            verify_token(&token, "secret"),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            exp: (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            verify_token(&token, "secret"),
            Err(ApiError::InvalidToken)
        ));
    }
}
