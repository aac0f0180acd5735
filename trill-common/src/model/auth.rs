//! Bearer tokens.
//!
//! A token reads `<user id>.<secret>.<salt>`, with secret and salt in
//! unpadded URL-safe base64. Only the argon2 hash of secret and salt is
//! stored.

use crate::model::{Id, user::UserMarker};
use argon2::{Argon2, Params};
use base64::{DecodeError, Engine, display::Base64Display, prelude::BASE64_URL_SAFE_NO_PAD};
use std::{
    fmt::{Debug, Display, Formatter},
    num::ParseIntError,
    str::FromStr,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

pub const TOKEN_SECRET_LEN: usize = 24;
pub const TOKEN_SALT_LEN: usize = 16;
pub const TOKEN_HASH_LEN: usize = Params::DEFAULT_OUTPUT_LEN;

const SEPARATOR: char = '.';

#[derive(Clone, Eq, PartialEq, Debug, Error)]
#[error("Hashing auth token failed: {0}")]
pub struct AuthTokenHashError(argon2::Error);

/// The encoded parts of a token after the user id.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum TokenPart {
    Secret,
    Salt,
}

impl Display for TokenPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TokenPart::Secret => "secret",
            TokenPart::Salt => "salt",
        })
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum AuthTokenDecodeError {
    #[error("Expected 3 parts separated by '.', got {0}")]
    PartCount(usize),
    #[error("Invalid user id: {0}")]
    InvalidUserId(ParseIntError),
    #[error("The {part} is not valid base64: {source}")]
    Base64 { part: TokenPart, source: DecodeError },
    #[error("The {part} must be {expected} bytes, got {actual}")]
    Length {
        part: TokenPart,
        expected: usize,
        actual: usize,
    },
}

fn decode_part<const N: usize>(
    part: TokenPart,
    encoded: &str,
) -> Result<[u8; N], AuthTokenDecodeError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|source| AuthTokenDecodeError::Base64 { part, source })?;
    let actual = bytes.len();

    bytes.try_into().map_err(|_| AuthTokenDecodeError::Length {
        part,
        expected: N,
        actual,
    })
}

/// A bearer token as handed to a client. Never persisted; see
/// [`AuthTokenHash`].
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct AuthToken {
    user_id: Id<UserMarker>,
    secret: [u8; TOKEN_SECRET_LEN],
    salt: [u8; TOKEN_SALT_LEN],
}

impl AuthToken {
    /// A fresh random token for `user_id`.
    #[must_use]
    pub fn issue(user_id: Id<UserMarker>) -> Self {
        Self {
            user_id,
            secret: rand::random(),
            salt: rand::random(),
        }
    }

    /// The user the token claims to belong to. Only trust it after
    /// [`Authentication::verify`].
    #[must_use]
    pub fn user_id(&self) -> Id<UserMarker> {
        self.user_id
    }

    #[must_use]
    pub fn to_bearer(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.user_id,
            Base64Display::new(&self.secret, &BASE64_URL_SAFE_NO_PAD),
            Base64Display::new(&self.salt, &BASE64_URL_SAFE_NO_PAD),
        )
    }

    pub fn hash(&self) -> Result<AuthTokenHash, AuthTokenHashError> {
        let mut hash = Box::new([0; TOKEN_HASH_LEN]);
        Argon2::default()
            .hash_password_into(&self.secret, &self.salt, hash.as_mut_slice())
            .map_err(AuthTokenHashError)?;

        Ok(AuthTokenHash(hash))
    }
}

impl FromStr for AuthToken {
    type Err = AuthTokenDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [user_id, secret, salt] = parts[..] else {
            return Err(AuthTokenDecodeError::PartCount(parts.len()));
        };

        Ok(Self {
            user_id: user_id
                .parse::<u64>()
                .map_err(AuthTokenDecodeError::InvalidUserId)?
                .into(),
            secret: decode_part(TokenPart::Secret, secret)?,
            salt: decode_part(TokenPart::Salt, salt)?,
        })
    }
}

impl Debug for AuthToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// What the store keeps of a token.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct AuthTokenHash(Box<[u8; TOKEN_HASH_LEN]>);

impl AuthTokenHash {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Debug for AuthTokenHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AuthTokenHash").finish_non_exhaustive()
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("The auth token hash had an invalid length of {0} bytes")]
pub struct InvalidAuthTokenHashError(usize);

impl TryFrom<Vec<u8>> for AuthTokenHash {
    type Error = InvalidAuthTokenHashError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let length = value.len();
        let hash = value
            .into_boxed_slice()
            .try_into()
            .map_err(|_| InvalidAuthTokenHashError(length))?;
        Ok(Self(hash))
    }
}

/// How long a token stays valid after it was issued.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, Default, Hash)]
pub struct TokenLifetime(Duration);

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("Token lifetime must be positive, got {0}")]
pub struct InvalidTokenLifetimeError(Duration);

impl TokenLifetime {
    #[must_use]
    pub fn new(duration: Duration) -> Option<Self> {
        duration.is_positive().then_some(Self(duration))
    }

    #[must_use]
    pub fn get(self) -> Duration {
        self.0
    }
}

impl TryFrom<Duration> for TokenLifetime {
    type Error = InvalidTokenLifetimeError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTokenLifetimeError(value))
    }
}

/// Why a token whose hash is on record is still refused.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Error)]
pub enum TokenRejection {
    #[error("Token of user {owner} was presented as user {claimed}")]
    ForeignUser {
        owner: Id<UserMarker>,
        claimed: Id<UserMarker>,
    },
    #[error("Token expired at {0}")]
    Expired(OffsetDateTime),
}

/// A stored token: its hash, its owner and how long it lives.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Authentication {
    pub user: Id<UserMarker>,
    pub token_hash: AuthTokenHash,
    pub created_at: OffsetDateTime,
    pub lifetime: Option<TokenLifetime>,
}

impl Authentication {
    /// `None` for tokens that never expire.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.lifetime.map(|lifetime| self.created_at + lifetime.get())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_some_and(|expires_at| expires_at < now)
    }

    /// Accepts `token` for the owner of this authentication, unless it
    /// names somebody else or has expired by `now`.
    pub fn verify(
        &self,
        token: &AuthToken,
        now: OffsetDateTime,
    ) -> Result<Id<UserMarker>, TokenRejection> {
        if token.user_id != self.user {
            return Err(TokenRejection::ForeignUser {
                owner: self.user,
                claimed: token.user_id,
            });
        }

        match self.expires_at() {
            Some(expires_at) if expires_at < now => Err(TokenRejection::Expired(expires_at)),
            _ => Ok(self.user),
        }
    }
}
