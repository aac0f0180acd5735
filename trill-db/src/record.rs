use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use trill_common::model::{
    Id, ModelValidationError,
    auth::Authentication,
    comment::Comment,
    post::{Post, PostCounts, PostView, RepostView},
    user::{User, UserCounts, UserHandle, UserListEntry, UserProfile, UserSummary},
};

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct UserRecord {
    pub user_snowflake: i64,
    pub name: Option<String>,
    pub handle: Option<String>,
    pub image: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, FromRow)]
pub(crate) struct UserSummaryRecord {
    pub user_snowflake: i64,
    pub name: Option<String>,
    pub handle: Option<String>,
    pub image: Option<String>,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, FromRow)]
pub(crate) struct UserListRecord {
    #[sqlx(flatten)]
    pub user: UserSummaryRecord,
    pub is_following: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct UserProfileRecord {
    #[sqlx(flatten)]
    pub user: UserRecord,
    pub follower_count: i64,
    pub following_count: i64,
    pub post_count: i64,
    pub is_following: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct PostRecord {
    pub post_snowflake: i64,
    pub user_snowflake: i64,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct PostViewRecord {
    pub post_snowflake: i64,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub author_snowflake: i64,
    pub author_name: Option<String>,
    pub author_handle: Option<String>,
    pub author_image: Option<String>,
    pub like_count: i64,
    pub comment_count: i64,
    pub repost_count: i64,
    pub liked_by_viewer: bool,
    pub reposted_by_viewer: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct RepostViewRecord {
    pub repost_snowflake: i64,
    pub repost_created_at: OffsetDateTime,
    pub reposter_snowflake: i64,
    pub reposter_name: Option<String>,
    pub reposter_handle: Option<String>,
    pub reposter_image: Option<String>,
    #[sqlx(flatten)]
    pub post: PostViewRecord,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct CommentRecord {
    pub comment_snowflake: i64,
    pub post_snowflake: i64,
    pub parent_snowflake: Option<i64>,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub author_snowflake: i64,
    pub author_name: Option<String>,
    pub author_handle: Option<String>,
    pub author_image: Option<String>,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, FromRow)]
pub(crate) struct AuthenticationRecord {
    pub user_snowflake: i64,
    pub token_hash: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub expires_after_seconds: Option<i64>,
}

fn handle(handle: Option<String>) -> Result<Option<UserHandle>, ModelValidationError> {
    Ok(handle.as_deref().map(UserHandle::new).transpose()?)
}

fn count(value: i64) -> Result<u64, ModelValidationError> {
    u64::try_from(value).map_err(|_| ModelValidationError::NegativeCount(value))
}

fn summary(
    user_snowflake: i64,
    name: Option<String>,
    user_handle: Option<String>,
    image: Option<String>,
) -> Result<UserSummary, ModelValidationError> {
    Ok(UserSummary {
        id: Id::from_db(user_snowflake),
        name,
        handle: handle(user_handle)?,
        image,
    })
}

impl TryFrom<UserRecord> for User {
    type Error = ModelValidationError;

    fn try_from(value: UserRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Id::from_db(value.user_snowflake),
            name: value.name,
            handle: handle(value.handle)?,
            image: value.image,
            created_at: value.created_at,
        })
    }
}

impl TryFrom<UserSummaryRecord> for UserSummary {
    type Error = ModelValidationError;

    fn try_from(value: UserSummaryRecord) -> Result<Self, Self::Error> {
        summary(value.user_snowflake, value.name, value.handle, value.image)
    }
}

impl TryFrom<UserListRecord> for UserListEntry {
    type Error = ModelValidationError;

    fn try_from(value: UserListRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            user: value.user.try_into()?,
            is_following: value.is_following,
        })
    }
}

impl TryFrom<UserProfileRecord> for UserProfile {
    type Error = ModelValidationError;

    fn try_from(value: UserProfileRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            user: value.user.try_into()?,
            counts: UserCounts {
                followers: count(value.follower_count)?,
                following: count(value.following_count)?,
                posts: count(value.post_count)?,
            },
            is_following: value.is_following,
        })
    }
}

impl From<PostRecord> for Post {
    fn from(value: PostRecord) -> Self {
        Self {
            id: Id::from_db(value.post_snowflake),
            author_id: Id::from_db(value.user_snowflake),
            content: value.content,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl TryFrom<PostViewRecord> for PostView {
    type Error = ModelValidationError;

    fn try_from(value: PostViewRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Id::from_db(value.post_snowflake),
            author: summary(
                value.author_snowflake,
                value.author_name,
                value.author_handle,
                value.author_image,
            )?,
            content: value.content,
            created_at: value.created_at,
            counts: PostCounts {
                likes: count(value.like_count)?,
                comments: count(value.comment_count)?,
                reposts: count(value.repost_count)?,
            },
            liked_by_viewer: value.liked_by_viewer,
            reposted_by_viewer: value.reposted_by_viewer,
        })
    }
}

impl TryFrom<RepostViewRecord> for RepostView {
    type Error = ModelValidationError;

    fn try_from(value: RepostViewRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Id::from_db(value.repost_snowflake),
            reposted_by: summary(
                value.reposter_snowflake,
                value.reposter_name,
                value.reposter_handle,
                value.reposter_image,
            )?,
            created_at: value.repost_created_at,
            post: value.post.try_into()?,
        })
    }
}

impl TryFrom<CommentRecord> for Comment {
    type Error = ModelValidationError;

    fn try_from(value: CommentRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Id::from_db(value.comment_snowflake),
            post_id: Id::from_db(value.post_snowflake),
            author: summary(
                value.author_snowflake,
                value.author_name,
                value.author_handle,
                value.author_image,
            )?,
            parent_id: value.parent_snowflake.map(Id::from_db),
            content: value.content,
            created_at: value.created_at,
        })
    }
}

impl TryFrom<AuthenticationRecord> for Authentication {
    type Error = ModelValidationError;

    fn try_from(value: AuthenticationRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            user: Id::from_db(value.user_snowflake),
            token_hash: value.token_hash.try_into()?,
            created_at: value.created_at,
            lifetime: value
                .expires_after_seconds
                .map(|seconds| Duration::seconds(seconds).try_into())
                .transpose()?,
        })
    }
}
