use crate::server::{
    Result, ServerError, ServerRouter,
    auth::AuthenticatedUser,
    json::Json,
    query::Query,
    routes::{FeedQuery, ToggleResponse},
};
use axum::{extract::State, routing::get};
use axum_extra::routing::{RouterExt, TypedPath};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use trill_common::{
    model::{
        Id, ValidationErrors,
        relation::Relation,
        user::{DisplayName, User, UserHandle, UserListEntry, UserMarker, UserProfile},
    },
    timeline::{SourceSet, TimelinePage, assemble},
};
use trill_db::client::{DbClient, HandleClaim};

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .route("/api/following", get(get_own_following))
        .route("/api/users/search", get(search_users))
        .typed_get(get_user)
        .typed_patch(update_user)
        .typed_get(get_user_posts)
        .typed_get(get_followers)
        .typed_get(get_following)
        .typed_post(toggle_follow)
        .typed_post(claim_username)
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
struct FollowedId {
    following_id: Id<UserMarker>,
}

async fn get_own_following(
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<FollowedId>>> {
    let followed = db.fetch_followed_ids(Some(user.user_id())).await?;

    Ok(Json(
        followed
            .into_iter()
            .map(|following_id| FollowedId { following_id })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

async fn search_users(
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
    Query(SearchQuery { q }): Query<SearchQuery>,
) -> Result<Json<Vec<UserListEntry>>> {
    let search = q.as_deref().map(str::trim).unwrap_or_default();
    if search.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let users = db
        .search_users(search, viewer.map(AuthenticatedUser::user_id))
        .await?;

    Ok(Json(users))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/users/{id}", rejection(ServerError))]
struct UserPath {
    id: Id<UserMarker>,
}

async fn get_user(
    UserPath { id }: UserPath,
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
) -> Result<Json<UserProfile>> {
    let profile = db
        .fetch_user_profile(id, viewer.map(AuthenticatedUser::user_id))
        .await?
        .ok_or(ServerError::UserByIdNotFound(id))?;

    Ok(Json(profile))
}

#[derive(Deserialize)]
struct UpdateUserBody {
    name: String,
}

async fn update_user(
    UserPath { id }: UserPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
    Json(body): Json<UpdateUserBody>,
) -> Result<Json<User>> {
    user.ensure_is(id)?;

    let mut errors = ValidationErrors::new();
    let Some(name) = errors.check("name", DisplayName::new(&body.name)) else {
        return Err(errors.into());
    };

    let user = db
        .update_user_name(id, &name)
        .await?
        .ok_or(ServerError::UserByIdNotFound(id))?;

    Ok(Json(user))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/users/{id}/posts", rejection(ServerError))]
struct UserPostsPath {
    id: Id<UserMarker>,
}

async fn get_user_posts(
    UserPostsPath { id }: UserPostsPath,
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<TimelinePage>> {
    let viewer = viewer.map(AuthenticatedUser::user_id);

    let mut errors = ValidationErrors::new();
    let Some(request) = query.validate(viewer.is_some(), &mut errors) else {
        return Err(errors.into());
    };

    if !db.user_exists(id).await? {
        return Err(ServerError::UserByIdNotFound(id));
    }

    let candidates = db
        .fetch_feed_candidates(&SourceSet::single(id), viewer, &request)
        .await?;

    Ok(Json(assemble(candidates, &request)))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/users/{id}/followers", rejection(ServerError))]
struct FollowersPath {
    id: Id<UserMarker>,
}

async fn get_followers(
    FollowersPath { id }: FollowersPath,
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
) -> Result<Json<Vec<UserListEntry>>> {
    if !db.user_exists(id).await? {
        return Err(ServerError::UserByIdNotFound(id));
    }

    let followers = db
        .fetch_followers(id, viewer.map(AuthenticatedUser::user_id))
        .await?;

    Ok(Json(followers))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/users/{id}/following", rejection(ServerError))]
struct FollowingPath {
    id: Id<UserMarker>,
}

async fn get_following(
    FollowingPath { id }: FollowingPath,
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
) -> Result<Json<Vec<UserListEntry>>> {
    if !db.user_exists(id).await? {
        return Err(ServerError::UserByIdNotFound(id));
    }

    let following = db
        .fetch_following(id, viewer.map(AuthenticatedUser::user_id))
        .await?;

    Ok(Json(following))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/users/{id}/follow", rejection(ServerError))]
struct FollowPath {
    id: Id<UserMarker>,
}

async fn toggle_follow(
    FollowPath { id }: FollowPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<Json<ToggleResponse>> {
    let relation = Relation::new(user.user_id(), id)?;

    if !db.user_exists(id).await? {
        return Err(ServerError::UserByIdNotFound(id));
    }

    let toggled = db.toggle_follow(relation).await?;

    Ok(Json(ToggleResponse::new(
        toggled,
        "User followed successfully.",
        "User unfollowed successfully.",
    )))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/api/users/{id}/username", rejection(ServerError))]
struct UsernamePath {
    id: Id<UserMarker>,
}

#[derive(Deserialize)]
struct UsernameBody {
    username: String,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Serialize)]
struct ClaimedUsername {
    id: Id<UserMarker>,
    username: UserHandle,
}

async fn claim_username(
    UsernamePath { id }: UsernamePath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
    Json(body): Json<UsernameBody>,
) -> Result<Json<ClaimedUsername>> {
    user.ensure_is(id)?;

    let mut errors = ValidationErrors::new();
    let Some(handle) = errors.check("username", UserHandle::new(&body.username)) else {
        return Err(errors.into());
    };

    match db.claim_handle(id, &handle).await? {
        HandleClaim::Claimed(_) => {
            info!(user_id = %id, handle = handle.get(), "Claimed username");
        }
        HandleClaim::Unchanged(_) => {}
        HandleClaim::AlreadySet(existing) => return Err(ServerError::HandleAlreadySet(existing)),
        HandleClaim::Taken => return Err(ServerError::HandleTaken(handle)),
        HandleClaim::UserNotFound => return Err(ServerError::UserByIdNotFound(id)),
    }

    Ok(Json(ClaimedUsername {
        id,
        username: handle,
    }))
}

#[cfg(test)]
mod tests {
    use crate::server::tests::send;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;

    #[tokio::test]
    async fn blank_search_returns_nobody() {
        for uri in ["/api/users/search", "/api/users/search?q=%20%20"] {
            let request = Request::get(uri).body(Body::empty()).unwrap();
            let (status, body) = send(request).await;

            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body, json!([]), "{uri}");
        }
    }

    #[tokio::test]
    async fn following_needs_a_signed_in_user() {
        let request = Request::get("/api/following").body(Body::empty()).unwrap();
        let (status, _) = send(request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_numeric_user_ids_are_not_found() {
        let request = Request::get("/api/users/ada/followers")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
    }
}
