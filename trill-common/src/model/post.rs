use crate::model::{
    Content, Id,
    user::{UserMarker, UserSummary},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct PostMarker;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct RepostMarker;

/// A post as stored, without anything derived from other tables.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Id<PostMarker>,
    pub author_id: Id<UserMarker>,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct CreatePost {
    pub author: Id<UserMarker>,
    pub content: Content,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCounts {
    pub likes: u64,
    pub comments: u64,
    pub reposts: u64,
}

/// A post annotated for one viewer.
///
/// `liked_by_viewer` and `reposted_by_viewer` are always relative to the
/// viewer the post was loaded for, and `false` for anonymous viewers.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub id: Id<PostMarker>,
    pub author: UserSummary,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub counts: PostCounts,
    pub liked_by_viewer: bool,
    pub reposted_by_viewer: bool,
}

/// A repost of a post, annotated for one viewer. The post is embedded, not copied.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepostView {
    pub id: Id<RepostMarker>,
    pub reposted_by: UserSummary,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub post: PostView,
}
