pub mod auth;
pub mod comment;
pub mod post;
pub mod relation;
pub mod user;

use crate::{
    model::{
        auth::{InvalidAuthTokenHashError, InvalidTokenLifetimeError},
        user::InvalidUserHandleError,
    },
    snowflake::Snowflake,
};
use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt::{Display, Formatter},
    marker::PhantomData,
};
use thiserror::Error;

/// Raised when a row read back from the store violates a model invariant.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Error)]
pub enum ModelValidationError {
    #[error(transparent)]
    UserHandle(#[from] InvalidUserHandleError),
    #[error(transparent)]
    TokenLifetime(#[from] InvalidTokenLifetimeError),
    #[error(transparent)]
    TokenHash(#[from] InvalidAuthTokenHashError),
    #[error("A stored count was negative: {0}")]
    NegativeCount(i64),
}

#[derive_where(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<Marker>(Snowflake, #[serde(skip)] PhantomData<Marker>);

impl<Marker> Id<Marker> {
    #[must_use]
    pub fn new(snowflake: Snowflake) -> Self {
        Self(snowflake, PhantomData)
    }

    #[must_use]
    pub fn snowflake(self) -> Snowflake {
        self.0
    }

    /// The representation used for `BIGINT` columns.
    #[must_use]
    pub fn to_db(self) -> i64 {
        self.0.get().cast_signed()
    }

    #[must_use]
    pub fn from_db(value: i64) -> Self {
        value.cast_unsigned().into()
    }
}

impl<Marker> Display for Id<Marker> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<Marker> From<Snowflake> for Id<Marker> {
    fn from(value: Snowflake) -> Self {
        Self::new(value)
    }
}

impl<Marker> From<u64> for Id<Marker> {
    fn from(value: u64) -> Self {
        Id::new(Snowflake::new(value))
    }
}

impl<Marker> From<Id<Marker>> for u64 {
    fn from(value: Id<Marker>) -> Self {
        value.snowflake().get()
    }
}

/// One problem with one field of a request.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct ValidationIssue {
    pub field: Cow<'static, str>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<Cow<'static, str>>, message: impl Display) -> Self {
        Self {
            field: field.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, Error)]
#[error("Invalid request data")]
pub struct ValidationErrors {
    issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Records the error of `result` under `field` and hands back the value, if any.
    pub fn check<T, E: Display>(
        &mut self,
        field: &'static str,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(ValidationIssue::new(field, err));
                None
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    #[must_use]
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    #[must_use]
    pub fn into_issues(self) -> Vec<ValidationIssue> {
        self.issues
    }
}

impl From<ValidationIssue> for ValidationErrors {
    fn from(value: ValidationIssue) -> Self {
        Self {
            issues: vec![value],
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("Content cannot be empty")]
pub struct EmptyContentError;

/// Text body of a post or comment. Never blank.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize)]
#[serde(transparent)]
pub struct Content(String);

impl Content {
    pub fn new(content: String) -> Result<Self, EmptyContentError> {
        if content.trim().is_empty() {
            Err(EmptyContentError)
        } else {
            Ok(Self(content))
        }
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}
