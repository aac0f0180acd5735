//! JSON request and response bodies.
//!
//! Rejected request bodies and unserializable responses both turn into a
//! [`ServerError`], so clients only ever see the error body shape.

use crate::server::ServerError;
use axum::{
    Json as AxumJson,
    extract::FromRequest,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use headers::ContentType;
use serde::Serialize;

#[derive(FromRequest, Debug, Clone, Copy, Default)]
#[from_request(via(AxumJson), rejection(ServerError))]
pub struct Json<T>(pub T);

/// A JSON body answered with `201 Created`.
#[derive(Debug, Clone, Copy)]
pub struct Created<T>(pub T);

/// Answers with `body` as JSON under `status`.
pub fn reply<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, TypedHeader(ContentType::json()), bytes).into_response(),
        Err(err) => ServerError::JsonResponse(err).into_response(),
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        reply(StatusCode::OK, &self.0)
    }
}

impl<T: Serialize> IntoResponse for Created<T> {
    fn into_response(self) -> Response {
        reply(StatusCode::CREATED, &self.0)
    }
}
