mod token;
pub mod users;

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;

pub use token::Claims;

/// A resolved user. Fixed for the lifetime of a connection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication required")]
    Required,
    #[error("invalid credential")]
    Invalid,
    #[error("identity lookup failed: {0}")]
    Store(#[from] sqlx::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Required => "auth_required",
            AuthError::Invalid => "auth_invalid",
            AuthError::Store(_) => "server_error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::Required | AuthError::Invalid => StatusCode::UNAUTHORIZED,
            AuthError::Store(ref err) => {
                tracing::error!(error = %err, "identity lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}

/// Validates bearer credentials and resolves them to an [`Identity`].
#[derive(Clone)]
pub struct IdentityVerifier {
    secret: Arc<[u8]>,
    db_pool: SqlitePool,
}

impl IdentityVerifier {
    pub fn new(secret: impl AsRef<[u8]>, db_pool: SqlitePool) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
            db_pool,
        }
    }

    /// Checks an optional credential. Absent is `Required`; a bad token or a
    /// token for a user the store no longer knows is `Invalid`.
    pub async fn verify(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Required)?;

        let claims = token::decode(&self.secret, token).map_err(|err| {
            tracing::debug!(error = %err, "token rejected");
            AuthError::Invalid
        })?;

        users::find(&self.db_pool, &claims.id)
            .await?
            .ok_or(AuthError::Invalid)
    }
}

/// `?token=` on routes that accept the credential in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Pulls a bearer credential from `Authorization: Bearer ...`, falling back to
/// the decoded `token` query parameter for clients that cannot set handshake
/// headers.
pub fn credential(headers: &HeaderMap, query: TokenQuery) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .or(query.token)
}

/// Extractor for identity-gated REST routes.
pub struct AuthUser(pub Identity);

impl<S> FromRequestParts<S> for AuthUser
where
    IdentityVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = IdentityVerifier::from_ref(state);
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        let credential = credential(&parts.headers, query);
        verifier.verify(credential.as_deref()).await.map(AuthUser)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::db;

    fn query(uri: &str) -> TokenQuery {
        Query::try_from_uri(&uri.parse().unwrap()).map(|Query(q)| q).unwrap()
    }

    #[test]
    fn credential_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(credential(&headers, query("/ws?token=xyz")).as_deref(), Some("abc"));
        assert_eq!(credential(&HeaderMap::new(), query("/ws?a=1&token=xyz")).as_deref(), Some("xyz"));
        assert_eq!(credential(&HeaderMap::new(), query("/ws?a=1")), None);
        assert_eq!(credential(&HeaderMap::new(), query("/ws")), None);
    }

    #[test]
    fn query_credential_is_percent_decoded() {
        assert_eq!(credential(&HeaderMap::new(), query("/ws?token=a%2Eb%2Ec")).as_deref(), Some("a.b.c"));
        assert_eq!(credential(&HeaderMap::new(), query("/ws?token=a+b")).as_deref(), Some("a b"));
    }

    #[tokio::test]
    async fn verify_distinguishes_missing_and_invalid() {
        let (db_pool, _dir) = db::test_pool().await;
        let alice = Identity {
            id: "u1".to_owned(),
            username: "alice".to_owned(),
            email: "alice@example.com".to_owned(),
        };
        users::insert(&db_pool, &alice).await.unwrap();
        let verifier = IdentityVerifier::new(b"secret", db_pool);

        assert!(matches!(verifier.verify(None).await, Err(AuthError::Required)));
        assert!(matches!(verifier.verify(Some("  ")).await, Err(AuthError::Required)));
        assert!(matches!(verifier.verify(Some("garbage")).await, Err(AuthError::Invalid)));

        let good = token::encode_for_test(b"secret", "u1", 3600);
        assert_eq!(verifier.verify(Some(&good)).await.unwrap(), alice);

        let wrong_key = token::encode_for_test(b"other", "u1", 3600);
        assert!(matches!(verifier.verify(Some(&wrong_key)).await, Err(AuthError::Invalid)));

        let expired = token::encode_for_test(b"secret", "u1", -3600);
        assert!(matches!(verifier.verify(Some(&expired)).await, Err(AuthError::Invalid)));

        let ghost = token::encode_for_test(b"secret", "nobody", 3600);
        assert!(matches!(verifier.verify(Some(&ghost)).await, Err(AuthError::Invalid)));
    }
}
