use axum::{
    Router,
    extract::{
        FromRef, Request,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use axum_extra::typed_header::TypedHeaderRejection;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use trill_common::model::{
    Id, ValidationErrors, ValidationIssue,
    auth::{AuthTokenDecodeError, AuthTokenHashError},
    comment::CommentMarker,
    post::PostMarker,
    relation::SelfFollowError,
    user::{UserHandle, UserMarker},
};
use trill_db::client::{DbClient, DbError};

mod auth;
mod json;
mod query;
mod routes;

pub type ServerRouter = Router<ServerState>;

#[derive(Clone, Debug, FromRef)]
pub struct ServerState {
    pub db_client: Arc<DbClient>,
}

pub fn routes() -> ServerRouter {
    routes::routes().fallback(fallback)
}

pub async fn fallback(request: Request) -> ServerError {
    ServerError::UnknownRoute(request.into_parts().0.uri)
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred.";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unknown route requested: {0}")]
    UnknownRoute(Uri),
    #[error("Path rejected: {0}")]
    PathRejection(#[from] PathRejection),
    #[error("Query string rejected: {0}")]
    QueryRejection(#[from] QueryRejection),
    #[error("Incoming JSON rejected: {0}")]
    JsonRejection(#[from] JsonRejection),
    #[error("JSON response could not be serialized: {0}")]
    JsonResponse(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("Authorization header was missing or invalid: {0}")]
    InvalidAuthorizationHeader(TypedHeaderRejection),
    #[error("The provided auth token could not be decoded: {0}")]
    InvalidAuthToken(#[from] AuthTokenDecodeError),
    #[error("The auth token could not be hashed: {0}")]
    AuthTokenHash(#[from] AuthTokenHashError),
    #[error("Provided token was invalid")]
    InvalidToken,
    #[error("You can only change your own account")]
    ForeignAccount(Id<UserMarker>),
    #[error(transparent)]
    SelfFollow(#[from] SelfFollowError),
    #[error("Comment {parent} does not belong to post {post}")]
    ReplyToOtherPost {
        parent: Id<CommentMarker>,
        post: Id<PostMarker>,
    },
    #[error("Username is already taken")]
    HandleTaken(UserHandle),
    #[error("Username was already set to {0}")]
    HandleAlreadySet(UserHandle),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("Post with id {0} was not found.")]
    PostByIdNotFound(Id<PostMarker>),
    #[error("User with id {0} was not found.")]
    UserByIdNotFound(Id<UserMarker>),
    #[error("Comment with id {0} was not found.")]
    CommentByIdNotFound(Id<CommentMarker>),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::UnknownRoute(_)
            | ServerError::PathRejection(_)
            | ServerError::PostByIdNotFound(_)
            | ServerError::UserByIdNotFound(_)
            | ServerError::CommentByIdNotFound(_)
            | ServerError::Database(DbError::MissingReference(_)) => StatusCode::NOT_FOUND,
            ServerError::InvalidAuthorizationHeader(rejection) if rejection.is_missing() => {
                StatusCode::UNAUTHORIZED
            }
            ServerError::InvalidToken => StatusCode::UNAUTHORIZED,
            ServerError::ForeignAccount(_) => StatusCode::FORBIDDEN,
            ServerError::HandleTaken(_) | ServerError::HandleAlreadySet(_) => StatusCode::CONFLICT,
            ServerError::QueryRejection(_)
            | ServerError::JsonRejection(_)
            | ServerError::Validation(_)
            | ServerError::InvalidAuthorizationHeader(_)
            | ServerError::InvalidAuthToken(_)
            | ServerError::SelfFollow(_)
            | ServerError::ReplyToOtherPost { .. } => StatusCode::BAD_REQUEST,
            ServerError::JsonResponse(_)
            | ServerError::Database(_)
            | ServerError::AuthTokenHash(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn issues(&self) -> Option<&[ValidationIssue]> {
        match self {
            ServerError::Validation(errors) => Some(errors.issues()),
            _ => None,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
struct ErrorResponse<'a> {
    status: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    issues: Option<&'a [ValidationIssue]>,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = if status.is_server_error() {
            error!(error = %self, %status, "Replying with error");
            UNEXPECTED_ERROR_MESSAGE.to_owned()
        } else {
            debug!(error = %self, %status, "Replying with error");
            self.to_string()
        };

        let error_response = ErrorResponse {
            status: status.as_u16(),
            message,
            issues: self.issues(),
        };
        json::reply(status, &error_response)
    }
}
