use crate::model::Id;
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{Error, Unexpected},
};
use std::fmt::{Display, Formatter};
use thiserror::Error;
use time::OffsetDateTime;

pub const USER_HANDLE_MIN_LEN: usize = 3;
pub const USER_HANDLE_MAX_LEN: usize = 20;

pub const DISPLAY_NAME_MIN_LEN: usize = 3;
pub const DISPLAY_NAME_MAX_LEN: usize = 50;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct UserMarker;

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Id<UserMarker>,
    pub name: Option<String>,
    pub handle: Option<UserHandle>,
    pub image: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The slice of a user that gets embedded into posts, comments and lists.
#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Id<UserMarker>,
    pub name: Option<String>,
    pub handle: Option<UserHandle>,
    pub image: Option<String>,
}

/// A user as seen by a particular viewer.
#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListEntry {
    #[serde(flatten)]
    pub user: UserSummary,
    pub is_following: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCounts {
    pub followers: u64,
    pub following: u64,
    pub posts: u64,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: User,
    pub counts: UserCounts,
    pub is_following: bool,
}

/// Who a user is according to an external identity provider.
#[derive(Clone, Eq, PartialEq, Debug, Default, Hash)]
pub struct ExternalIdentity {
    pub provider: String,
    pub subject: String,
    pub name: Option<String>,
    pub image: Option<String>,
}

impl From<User> for UserSummary {
    fn from(value: User) -> Self {
        Self {
            id: value.id,
            name: value.name,
            handle: value.handle,
            image: value.image,
        }
    }
}

/// A claimed username: 3-20 characters out of `a-z`, `0-9` and `_`.
///
/// Input is trimmed and lowercased before it is checked, so handles compare
/// case-insensitively by construction.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize)]
#[serde(transparent)]
pub struct UserHandle(String);

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error(
    "Username must be 3-20 characters and contain only letters, numbers, or underscores: {0:?}"
)]
pub struct InvalidUserHandleError(String);

impl UserHandle {
    pub fn new(handle: &str) -> Result<Self, InvalidUserHandleError> {
        let normalized = handle.trim().to_lowercase();
        let length = normalized.chars().count();

        let valid_chars = normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if valid_chars && (USER_HANDLE_MIN_LEN..=USER_HANDLE_MAX_LEN).contains(&length) {
            Ok(UserHandle(normalized))
        } else {
            Err(InvalidUserHandleError(handle.to_owned()))
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

impl Display for UserHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserHandle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        UserHandle::new(&inner)
            .map_err(|err| Error::invalid_value(Unexpected::Str(&err.0), &"UserHandle"))
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("Name must be between 3 and 50 characters long")]
pub struct InvalidDisplayNameError;

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize)]
#[serde(transparent)]
pub struct DisplayName(String);

impl DisplayName {
    pub fn new(name: &str) -> Result<Self, InvalidDisplayNameError> {
        let trimmed = name.trim();
        let length = trimmed.chars().count();

        if (DISPLAY_NAME_MIN_LEN..=DISPLAY_NAME_MAX_LEN).contains(&length) {
            Ok(Self(trimmed.to_owned()))
        } else {
            Err(InvalidDisplayNameError)
        }
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }
}
