use crate::server::{
    Result, ServerError, ServerRouter,
    auth::AuthenticatedUser,
    json::{Created, Json},
    query::Query,
    routes::{FeedQuery, ToggleResponse},
};
use axum::{extract::State, routing::get};
use axum_extra::routing::{RouterExt, TypedPath};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use trill_common::{
    model::{
        Content, Id, ValidationErrors,
        comment::{Comment, CommentMarker, CommentThread, CreateComment},
        post::{CreatePost, Post, PostMarker, PostView},
        user::UserMarker,
    },
    timeline::{SourceSet, TimelinePage, assemble},
};
use trill_db::client::DbClient;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .route("/api/posts", get(get_feed).post(create_post))
        .typed_get(get_post)
        .typed_get(get_comments)
        .typed_post(create_comment)
        .typed_post(toggle_like)
        .typed_post(toggle_repost)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HomeFeedQuery {
    #[serde(flatten)]
    feed: FeedQuery,
    following_ids: Option<String>,
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
#[error("Invalid user id {0:?}")]
struct InvalidIdError(String);

/// Parses a comma separated id list. Blank entries are skipped.
fn parse_id_list(raw: &str) -> Result<Vec<Id<UserMarker>>, InvalidIdError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map(Id::from)
                .map_err(|_| InvalidIdError(part.to_owned()))
        })
        .collect()
}

async fn get_feed(
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
    Query(query): Query<HomeFeedQuery>,
) -> Result<Json<TimelinePage>> {
    let viewer = viewer.map(AuthenticatedUser::user_id);

    let mut errors = ValidationErrors::new();
    let request = query.feed.validate(viewer.is_some(), &mut errors);
    let narrow_to = query
        .following_ids
        .as_deref()
        .map(parse_id_list)
        .and_then(|ids| errors.check("followingIds", ids));
    let Some(request) = request.filter(|_| errors.is_empty()) else {
        return Err(errors.into());
    };

    let followed = db.fetch_followed_ids(viewer).await?;
    let sources = SourceSet::for_viewer(viewer, followed, narrow_to.as_deref());

    let candidates = db.fetch_feed_candidates(&sources, viewer, &request).await?;
    let page = assemble(candidates, &request);
    debug!(
        viewer = ?viewer,
        items = page.items.len(),
        total = page.pagination.total_items,
        "Assembled home timeline"
    );

    Ok(Json(page))
}

#[derive(Deserialize)]
struct CreatePostBody {
    content: String,
}

async fn create_post(
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
    Json(body): Json<CreatePostBody>,
) -> Result<Created<Post>> {
    let mut errors = ValidationErrors::new();
    let Some(content) = errors.check("content", Content::new(body.content)) else {
        return Err(errors.into());
    };

    let post = db
        .create_post(&CreatePost {
            author: user.user_id(),
            content,
        })
        .await?;

    Ok(Created(post))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/posts/{id}", rejection(ServerError))]
struct PostPath {
    id: Id<PostMarker>,
}

async fn get_post(
    PostPath { id }: PostPath,
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
) -> Result<Json<PostView>> {
    let post = db
        .fetch_post_view(id, viewer.map(AuthenticatedUser::user_id))
        .await?
        .ok_or(ServerError::PostByIdNotFound(id))?;

    Ok(Json(post))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/posts/{id}/comments", rejection(ServerError))]
struct CommentsPath {
    id: Id<PostMarker>,
}

async fn get_comments(
    CommentsPath { id }: CommentsPath,
    State(db): State<Arc<DbClient>>,
) -> Result<Json<Vec<CommentThread>>> {
    if !db.post_exists(id).await? {
        return Err(ServerError::PostByIdNotFound(id));
    }

    let threads = db.fetch_comment_threads(id).await?;

    Ok(Json(threads))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCommentBody {
    content: String,
    parent_id: Option<Id<CommentMarker>>,
}

async fn create_comment(
    CommentsPath { id }: CommentsPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
    Json(body): Json<CreateCommentBody>,
) -> Result<Created<Comment>> {
    let mut errors = ValidationErrors::new();
    let Some(content) = errors.check("content", Content::new(body.content)) else {
        return Err(errors.into());
    };

    if !db.post_exists(id).await? {
        return Err(ServerError::PostByIdNotFound(id));
    }

    if let Some(parent) = body.parent_id {
        let parent_post = db
            .fetch_comment_post(parent)
            .await?
            .ok_or(ServerError::CommentByIdNotFound(parent))?;

        if parent_post != id {
            return Err(ServerError::ReplyToOtherPost { parent, post: id });
        }
    }

    let comment = db
        .create_comment(&CreateComment {
            post: id,
            author: user.user_id(),
            parent: body.parent_id,
            content,
        })
        .await?;

    Ok(Created(comment))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/posts/{id}/like", rejection(ServerError))]
struct LikePath {
    id: Id<PostMarker>,
}

async fn toggle_like(
    LikePath { id }: LikePath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<Json<ToggleResponse>> {
    if !db.post_exists(id).await? {
        return Err(ServerError::PostByIdNotFound(id));
    }

    let toggled = db.toggle_like(user.user_id(), id).await?;

    Ok(Json(ToggleResponse::new(toggled, "Post liked.", "Post unliked.")))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/posts/{id}/repost", rejection(ServerError))]
struct RepostPath {
    id: Id<PostMarker>,
}

async fn toggle_repost(
    RepostPath { id }: RepostPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<Json<ToggleResponse>> {
    if !db.post_exists(id).await? {
        return Err(ServerError::PostByIdNotFound(id));
    }

    let toggled = db.toggle_repost(user.user_id(), id).await?;

    Ok(Json(ToggleResponse::new(
        toggled,
        "Post reposted.",
        "Repost removed.",
    )))
}
