use crate::server::ServerError;
use axum::{
    extract::{FromRef, FromRequestParts, OptionalFromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;
use trill_common::model::{Id, auth::AuthToken, user::UserMarker};
use trill_db::client::DbClient;

type AuthorizationHeader = TypedHeader<Authorization<Bearer>>;

/// The user a request was made by.
///
/// As `Option<AuthenticatedUser>` a request without an `Authorization` header
/// is anonymous; a header that is present must still be valid.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct AuthenticatedUser {
    id: Id<UserMarker>,
}

impl AuthenticatedUser {
    #[must_use]
    pub fn user_id(self) -> Id<UserMarker> {
        self.id
    }

    /// Rejects acting on any account but the caller's own.
    pub fn ensure_is(self, user_id: Id<UserMarker>) -> Result<(), ServerError> {
        if self.id == user_id {
            Ok(())
        } else {
            Err(ServerError::ForeignAccount(user_id))
        }
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    Arc<DbClient>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let request_token: AuthToken = <AuthorizationHeader as FromRequestParts<S>>::from_request_parts(parts, state)
            .await
            .map_err(ServerError::InvalidAuthorizationHeader)?
            .token()
            .parse()?;

        let token_hash = request_token.hash()?;

        let Some(authentication) = Arc::<DbClient>::from_ref(state)
            .fetch_auth(&token_hash)
            .await?
        else {
            debug!(user_id = %request_token.user_id(), "No token with this hash on record");
            return Err(ServerError::InvalidToken);
        };

        let id = authentication
            .verify(&request_token, OffsetDateTime::now_utc())
            .map_err(|rejection| {
                debug!(%rejection, "Rejected auth token");
                ServerError::InvalidToken
            })?;

        Ok(Self { id })
    }
}

impl<S> OptionalFromRequestParts<S> for AuthenticatedUser
where
    Arc<DbClient>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        if !parts.headers.contains_key(AUTHORIZATION) {
            return Ok(None);
        }

        <Self as FromRequestParts<S>>::from_request_parts(parts, state)
            .await
            .map(Some)
    }
}
