use crate::record::{
    AuthenticationRecord, CommentRecord, PostRecord, PostViewRecord, RepostViewRecord,
    UserListRecord, UserProfileRecord, UserRecord,
};
use sqlx::{
    PgPool, Postgres,
    migrate::MigrateError,
    postgres::{PgPoolOptions, PgQueryResult},
    query, query_as, query_scalar,
};
use std::{
    collections::BTreeSet,
    fmt::{Debug, Formatter},
    sync::{Mutex, PoisonError},
};
use thiserror::Error;
use tracing::{debug, info};
use trill_common::{
    model::{
        Id, ModelValidationError,
        auth::{AuthTokenHash, Authentication, TokenLifetime},
        comment::{Comment, CommentMarker, CommentThread, CreateComment, fold_threads},
        post::{CreatePost, Post, PostMarker, PostView, RepostMarker, RepostView},
        relation::{Relation, Toggled},
        user::{
            DisplayName, ExternalIdentity, User, UserHandle, UserListEntry, UserMarker,
            UserProfile,
        },
    },
    snowflake::{NodeId, SnowflakeError, SnowflakeGenerator},
    timeline::{FeedCandidates, FeedRequest, FeedSort, SortKey, SortOrder, SourceSet},
};

pub type Result<T, E = DbError> = std::result::Result<T, E>;

pub const USER_SEARCH_LIMIT: i64 = 10;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("An object in the database was invalid: {0}")]
    Data(#[from] ModelValidationError),
    #[error("Could not generate an id: {0}")]
    Snowflake(#[from] SnowflakeError),
    #[error("A referenced row does not exist: {0}")]
    MissingReference(sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] MigrateError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    /// Turns foreign key violations into [`DbError::MissingReference`].
    fn on_write(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                DbError::MissingReference(err)
            }
            _ => DbError::Sqlx(err),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// What became of a username claim.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum HandleClaim {
    Claimed(User),
    /// The user already owned exactly this handle.
    Unchanged(User),
    /// The user already claimed a different handle.
    AlreadySet(UserHandle),
    /// Somebody else owns the handle.
    Taken,
    UserNotFound,
}

/// A unique join row that toggles between present and absent.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
enum Edge {
    Like {
        user: Id<UserMarker>,
        post: Id<PostMarker>,
    },
    Repost {
        user: Id<UserMarker>,
        post: Id<PostMarker>,
    },
    Follow(Relation),
}

pub struct DbClient {
    pool: PgPool,
    snowflake_generator: Mutex<SnowflakeGenerator>,
}

impl Debug for DbClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

const POST_VIEW_COLUMNS: &str = "
    posts.post_snowflake,
    posts.content,
    posts.created_at,
    authors.user_snowflake AS author_snowflake,
    authors.name AS author_name,
    authors.handle AS author_handle,
    authors.image AS author_image,
    (SELECT COUNT(*) FROM posts.likes l WHERE l.post_snowflake = posts.post_snowflake)
        AS like_count,
    (SELECT COUNT(*) FROM posts.comments c WHERE c.post_snowflake = posts.post_snowflake)
        AS comment_count,
    (SELECT COUNT(*) FROM posts.reposts r WHERE r.post_snowflake = posts.post_snowflake)
        AS repost_count,
    EXISTS (
        SELECT 1 FROM posts.likes l
        WHERE l.post_snowflake = posts.post_snowflake AND l.user_snowflake = $1
    ) AS liked_by_viewer,
    EXISTS (
        SELECT 1 FROM posts.reposts r
        WHERE r.post_snowflake = posts.post_snowflake AND r.user_snowflake = $1
    ) AS reposted_by_viewer
";

const USER_LIST_COLUMNS: &str = "
    users.user_snowflake,
    users.name,
    users.handle,
    users.image,
    EXISTS (
        SELECT 1 FROM users.follows v
        WHERE v.followee_snowflake = users.user_snowflake AND v.follower_snowflake = $2
    ) AS is_following
";

/// `ORDER BY` for timeline candidates. Must agree with [`FeedSort::compare`].
fn feed_order(sort: FeedSort) -> &'static str {
    match (sort.key, sort.order) {
        (SortKey::CreatedAt, SortOrder::Desc) => "effective_at DESC, item_snowflake DESC",
        (SortKey::CreatedAt, SortOrder::Asc) => "effective_at ASC, item_snowflake DESC",
        (SortKey::Likes, SortOrder::Desc) => {
            "like_count DESC, effective_at DESC, item_snowflake DESC"
        }
        (SortKey::Likes, SortOrder::Asc) => "like_count ASC, effective_at DESC, item_snowflake DESC",
    }
}

/// Case-insensitive substring pattern for `ILIKE`, with wildcards escaped.
fn contains_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn db_ids<Marker>(ids: &BTreeSet<Id<Marker>>) -> Vec<i64> {
    ids.iter().copied().map(Id::to_db).collect()
}

impl DbClient {
    #[must_use]
    pub fn new(pool: PgPool, node_id: NodeId) -> Self {
        Self {
            pool,
            snowflake_generator: Mutex::new(SnowflakeGenerator::new(node_id)),
        }
    }

    pub async fn connect(url: &str, max_connections: u32, node_id: NodeId) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self::new(pool, node_id))
    }

    /// A client that only opens connections once a query needs one.
    pub fn connect_lazy(url: &str, node_id: NodeId) -> Result<Self> {
        let pool = PgPoolOptions::new().connect_lazy(url)?;
        Ok(Self::new(pool, node_id))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn next_id<Marker>(&self) -> Result<Id<Marker>> {
        let snowflake = self
            .snowflake_generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate()?;

        Ok(snowflake.into())
    }

    pub async fn fetch_user(&self, user_id: Id<UserMarker>) -> Result<Option<User>> {
        let record = query_as::<_, UserRecord>(
            "
            SELECT
                users.user_snowflake,
                users.name,
                users.handle,
                users.image,
                users.created_at
            FROM
                users.users
            WHERE
                users.user_snowflake = $1
            ",
        )
        .bind(user_id.to_db())
        .fetch_optional(&self.pool)
        .await?;

        let user = record.map(User::try_from).transpose()?;
        Ok(user)
    }

    pub async fn user_exists(&self, user_id: Id<UserMarker>) -> Result<bool> {
        let exists = query_scalar::<Postgres, bool>(
            "SELECT EXISTS (SELECT 1 FROM users.users WHERE user_snowflake = $1)",
        )
        .bind(user_id.to_db())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Resolves an external identity to a user, creating the user on first sight.
    pub async fn upsert_identity(&self, identity: &ExternalIdentity) -> Result<User> {
        loop {
            let existing = query_as::<_, UserRecord>(
                "
                SELECT
                    users.user_snowflake,
                    users.name,
                    users.handle,
                    users.image,
                    users.created_at
                FROM
                    users.accounts
                    JOIN users.users ON users.user_snowflake = accounts.user_snowflake
                WHERE
                    accounts.provider = $1 AND accounts.subject = $2
                ",
            )
            .bind(&identity.provider)
            .bind(&identity.subject)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(record) = existing {
                return Ok(record.try_into()?);
            }

            let user_id = self.next_id::<UserMarker>()?;
            let mut transaction = self.pool.begin().await?;

            let record = query_as::<_, UserRecord>(
                "
                INSERT INTO users.users (user_snowflake, name, image)
                VALUES ($1, $2, $3)
                RETURNING user_snowflake, name, handle, image, created_at
                ",
            )
            .bind(user_id.to_db())
            .bind(&identity.name)
            .bind(&identity.image)
            .fetch_one(&mut *transaction)
            .await?;

            let linked = query(
                "
                INSERT INTO users.accounts (provider, subject, user_snowflake)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(&identity.provider)
            .bind(&identity.subject)
            .bind(user_id.to_db())
            .execute(&mut *transaction)
            .await;

            match linked {
                Ok(_) => {
                    transaction.commit().await?;
                    info!(%user_id, provider = %identity.provider, "Created user on first sign in");
                    return Ok(record.try_into()?);
                }
                // A concurrent first sign in of the same identity won; use its user.
                Err(err) if is_unique_violation(&err) => {
                    transaction.rollback().await?;
                    debug!(provider = %identity.provider, "Identity was linked concurrently");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn fetch_user_profile(
        &self,
        user_id: Id<UserMarker>,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<Option<UserProfile>> {
        let record = query_as::<_, UserProfileRecord>(
            "
            SELECT
                users.user_snowflake,
                users.name,
                users.handle,
                users.image,
                users.created_at,
                (SELECT COUNT(*) FROM users.follows f WHERE f.followee_snowflake = $1)
                    AS follower_count,
                (SELECT COUNT(*) FROM users.follows f WHERE f.follower_snowflake = $1)
                    AS following_count,
                (SELECT COUNT(*) FROM posts.posts p WHERE p.user_snowflake = $1)
                    AS post_count,
                EXISTS (
                    SELECT 1 FROM users.follows f
                    WHERE f.followee_snowflake = $1 AND f.follower_snowflake = $2
                ) AS is_following
            FROM
                users.users
            WHERE
                users.user_snowflake = $1
            ",
        )
        .bind(user_id.to_db())
        .bind(viewer.map(Id::to_db))
        .fetch_optional(&self.pool)
        .await?;

        let profile = record.map(UserProfile::try_from).transpose()?;
        Ok(profile)
    }

    pub async fn update_user_name(
        &self,
        user_id: Id<UserMarker>,
        name: &DisplayName,
    ) -> Result<Option<User>> {
        let record = query_as::<_, UserRecord>(
            "
            UPDATE users.users
            SET name = $2
            WHERE user_snowflake = $1
            RETURNING user_snowflake, name, handle, image, created_at
            ",
        )
        .bind(user_id.to_db())
        .bind(name.get())
        .fetch_optional(&self.pool)
        .await?;

        let user = record.map(User::try_from).transpose()?;
        Ok(user)
    }

    /// Claims `handle` for a user that has none yet.
    ///
    /// Uniqueness is enforced by the case-insensitive index on handles, so two
    /// users racing for the same handle cannot both win.
    pub async fn claim_handle(
        &self,
        user_id: Id<UserMarker>,
        handle: &UserHandle,
    ) -> Result<HandleClaim> {
        let claimed = query_as::<_, UserRecord>(
            "
            UPDATE users.users
            SET handle = $2
            WHERE user_snowflake = $1 AND handle IS NULL
            RETURNING user_snowflake, name, handle, image, created_at
            ",
        )
        .bind(user_id.to_db())
        .bind(handle.get())
        .fetch_optional(&self.pool)
        .await;

        match claimed {
            Ok(Some(record)) => return Ok(HandleClaim::Claimed(record.try_into()?)),
            Ok(None) => {}
            Err(err) if is_unique_violation(&err) => return Ok(HandleClaim::Taken),
            Err(err) => return Err(err.into()),
        }

        let claim = match self.fetch_user(user_id).await? {
            None => HandleClaim::UserNotFound,
            Some(user) => match &user.handle {
                Some(existing) if existing == handle => HandleClaim::Unchanged(user),
                Some(existing) => HandleClaim::AlreadySet(existing.clone()),
                None => HandleClaim::Taken,
            },
        };
        Ok(claim)
    }

    /// Name and handle search, case-insensitive, never returning the viewer.
    pub async fn search_users(
        &self,
        search: &str,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<Vec<UserListEntry>> {
        let sql = format!(
            "
            SELECT {USER_LIST_COLUMNS}
            FROM
                users.users
            WHERE
                (users.name ILIKE $1 OR users.handle ILIKE $1)
                AND ($2::BIGINT IS NULL OR users.user_snowflake <> $2)
            ORDER BY users.handle NULLS LAST, users.user_snowflake
            LIMIT $3
            "
        );

        let records = query_as::<_, UserListRecord>(&sql)
            .bind(contains_pattern(search))
            .bind(viewer.map(Id::to_db))
            .bind(USER_SEARCH_LIMIT)
            .fetch_all(&self.pool)
            .await?;

        let users = records
            .into_iter()
            .map(UserListEntry::try_from)
            .collect::<Result<_, _>>()?;
        Ok(users)
    }

    pub async fn fetch_followers(
        &self,
        user_id: Id<UserMarker>,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<Vec<UserListEntry>> {
        let sql = format!(
            "
            SELECT {USER_LIST_COLUMNS}
            FROM
                users.follows
                JOIN users.users ON users.user_snowflake = follows.follower_snowflake
            WHERE
                follows.followee_snowflake = $1
            ORDER BY follows.created_at DESC, users.user_snowflake DESC
            "
        );

        self.fetch_user_list(&sql, user_id, viewer).await
    }

    pub async fn fetch_following(
        &self,
        user_id: Id<UserMarker>,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<Vec<UserListEntry>> {
        let sql = format!(
            "
            SELECT {USER_LIST_COLUMNS}
            FROM
                users.follows
                JOIN users.users ON users.user_snowflake = follows.followee_snowflake
            WHERE
                follows.follower_snowflake = $1
            ORDER BY follows.created_at DESC, users.user_snowflake DESC
            "
        );

        self.fetch_user_list(&sql, user_id, viewer).await
    }

    async fn fetch_user_list(
        &self,
        sql: &str,
        user_id: Id<UserMarker>,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<Vec<UserListEntry>> {
        let records = query_as::<_, UserListRecord>(sql)
            .bind(user_id.to_db())
            .bind(viewer.map(Id::to_db))
            .fetch_all(&self.pool)
            .await?;

        let users = records
            .into_iter()
            .map(UserListEntry::try_from)
            .collect::<Result<_, _>>()?;
        Ok(users)
    }

    /// The users `viewer` follows. Anonymous viewers follow nobody.
    pub async fn fetch_followed_ids(
        &self,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<BTreeSet<Id<UserMarker>>> {
        let Some(viewer) = viewer else {
            return Ok(BTreeSet::new());
        };

        let ids = query_scalar::<_, i64>(
            "
            SELECT follows.followee_snowflake
            FROM users.follows
            WHERE follows.follower_snowflake = $1
            ",
        )
        .bind(viewer.to_db())
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(Id::from_db).collect())
    }

    pub async fn fetch_auth(&self, token_hash: &AuthTokenHash) -> Result<Option<Authentication>> {
        let record = query_as::<_, AuthenticationRecord>(
            "
            SELECT
                authentications.user_snowflake,
                authentications.token_hash,
                authentications.created_at,
                authentications.expires_after_seconds
            FROM
                users.authentications
            WHERE
                authentications.token_hash = $1
            ",
        )
        .bind(token_hash.as_bytes())
        .fetch_optional(&self.pool)
        .await?;

        let authentication = record.map(Authentication::try_from).transpose()?;
        Ok(authentication)
    }

    pub async fn create_auth(
        &self,
        user_id: Id<UserMarker>,
        token_hash: &AuthTokenHash,
        lifetime: Option<TokenLifetime>,
    ) -> Result<()> {
        query(
            "
            INSERT INTO users.authentications (token_hash, user_snowflake, expires_after_seconds)
            VALUES ($1, $2, $3)
            ",
        )
        .bind(token_hash.as_bytes())
        .bind(user_id.to_db())
        .bind(lifetime.map(|lifetime| lifetime.get().whole_seconds()))
        .execute(&self.pool)
        .await
        .map_err(DbError::on_write)?;

        Ok(())
    }

    pub async fn post_exists(&self, post_id: Id<PostMarker>) -> Result<bool> {
        let exists = query_scalar::<Postgres, bool>(
            "SELECT EXISTS (SELECT 1 FROM posts.posts WHERE post_snowflake = $1)",
        )
        .bind(post_id.to_db())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    pub async fn create_post(&self, post: &CreatePost) -> Result<Post> {
        let post_id = self.next_id::<PostMarker>()?;

        let record = query_as::<_, PostRecord>(
            "
            INSERT INTO posts.posts (post_snowflake, user_snowflake, content)
            VALUES ($1, $2, $3)
            RETURNING post_snowflake, user_snowflake, content, created_at, updated_at
            ",
        )
        .bind(post_id.to_db())
        .bind(post.author.to_db())
        .bind(post.content.get())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::on_write)?;

        Ok(record.into())
    }

    /// A single post for `viewer`. Posts whose author is gone are not found.
    pub async fn fetch_post_view(
        &self,
        post_id: Id<PostMarker>,
        viewer: Option<Id<UserMarker>>,
    ) -> Result<Option<PostView>> {
        let sql = format!(
            "
            SELECT {POST_VIEW_COLUMNS}
            FROM
                posts.posts
                JOIN users.users authors ON authors.user_snowflake = posts.user_snowflake
            WHERE
                posts.post_snowflake = $2
            "
        );

        let record = query_as::<_, PostViewRecord>(&sql)
            .bind(viewer.map(Id::to_db))
            .bind(post_id.to_db())
            .fetch_optional(&self.pool)
            .await?;

        let post = record.map(PostView::try_from).transpose()?;
        Ok(post)
    }

    /// Loads the timeline candidates of `sources` for `viewer`.
    ///
    /// Both sources are counted first; a page past the end loads no rows.
    /// Otherwise each source is read in timeline order and cut off after
    /// [`PageRequest::window`](trill_common::timeline::PageRequest::window)
    /// rows; likes, comments and reposts are counted and the viewer's own
    /// like and repost looked up in the same statement, one per source.
    pub async fn fetch_feed_candidates(
        &self,
        sources: &SourceSet,
        viewer: Option<Id<UserMarker>>,
        request: &FeedRequest,
    ) -> Result<FeedCandidates> {
        let authors = sources.authors().map(db_ids);
        let repost_authors = authors.as_deref().filter(|_| sources.includes_reposts());

        let post_total = self.count_feed_posts(authors.as_deref()).await?;
        let repost_total = match repost_authors {
            Some(repost_authors) => self.count_feed_reposts(repost_authors).await?,
            None => 0,
        };
        let total = post_total + repost_total;

        if request.page.is_past_end(total) {
            debug!(total, page = request.page.page(), "Timeline page is past the end");
            return Ok(FeedCandidates {
                total,
                ..FeedCandidates::default()
            });
        }

        let window = i64::try_from(request.page.window()).unwrap_or(i64::MAX);
        let order = feed_order(request.sort);

        let post_sql = format!(
            "
            SELECT
                {POST_VIEW_COLUMNS},
                posts.created_at AS effective_at,
                posts.post_snowflake AS item_snowflake
            FROM
                posts.posts
                JOIN users.users authors ON authors.user_snowflake = posts.user_snowflake
            WHERE
                $2::BIGINT[] IS NULL OR posts.user_snowflake = ANY($2)
            ORDER BY {order}
            LIMIT $3
            "
        );

        let posts: Vec<PostView> = query_as::<_, PostViewRecord>(&post_sql)
            .bind(viewer.map(Id::to_db))
            .bind(authors.as_deref())
            .bind(window)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PostView::try_from)
            .collect::<Result<_, _>>()?;

        let Some(repost_authors) = repost_authors.filter(|_| repost_total > 0) else {
            return Ok(FeedCandidates {
                posts,
                reposts: Vec::new(),
                total,
            });
        };

        let repost_sql = format!(
            "
            SELECT
                {POST_VIEW_COLUMNS},
                reposts.repost_snowflake,
                reposts.created_at AS repost_created_at,
                reposters.user_snowflake AS reposter_snowflake,
                reposters.name AS reposter_name,
                reposters.handle AS reposter_handle,
                reposters.image AS reposter_image,
                reposts.created_at AS effective_at,
                reposts.repost_snowflake AS item_snowflake
            FROM
                posts.reposts
                JOIN posts.posts ON posts.post_snowflake = reposts.post_snowflake
                JOIN users.users authors ON authors.user_snowflake = posts.user_snowflake
                JOIN users.users reposters ON reposters.user_snowflake = reposts.user_snowflake
            WHERE
                reposts.user_snowflake = ANY($2)
            ORDER BY {order}
            LIMIT $3
            "
        );

        let reposts: Vec<RepostView> = query_as::<_, RepostViewRecord>(&repost_sql)
            .bind(viewer.map(Id::to_db))
            .bind(repost_authors)
            .bind(window)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(RepostView::try_from)
            .collect::<Result<_, _>>()?;

        Ok(FeedCandidates {
            posts,
            reposts,
            total,
        })
    }

    async fn count_feed_posts(&self, authors: Option<&[i64]>) -> Result<u64> {
        let count = query_scalar::<_, i64>(
            "
            SELECT COUNT(*)
            FROM
                posts.posts
                JOIN users.users authors ON authors.user_snowflake = posts.user_snowflake
            WHERE
                $1::BIGINT[] IS NULL OR posts.user_snowflake = ANY($1)
            ",
        )
        .bind(authors)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).map_err(|_| ModelValidationError::NegativeCount(count))?)
    }

    async fn count_feed_reposts(&self, authors: &[i64]) -> Result<u64> {
        let count = query_scalar::<_, i64>(
            "
            SELECT COUNT(*)
            FROM
                posts.reposts
                JOIN posts.posts ON posts.post_snowflake = reposts.post_snowflake
                JOIN users.users authors ON authors.user_snowflake = posts.user_snowflake
            WHERE
                reposts.user_snowflake = ANY($1)
            ",
        )
        .bind(authors)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).map_err(|_| ModelValidationError::NegativeCount(count))?)
    }

    pub async fn toggle_like(
        &self,
        user: Id<UserMarker>,
        post: Id<PostMarker>,
    ) -> Result<Toggled> {
        self.toggle(Edge::Like { user, post }).await
    }

    pub async fn toggle_repost(
        &self,
        user: Id<UserMarker>,
        post: Id<PostMarker>,
    ) -> Result<Toggled> {
        self.toggle(Edge::Repost { user, post }).await
    }

    pub async fn toggle_follow(&self, relation: Relation) -> Result<Toggled> {
        self.toggle(Edge::Follow(relation)).await
    }

    /// Flips an edge between present and absent.
    ///
    /// The edge is looked up first and then removed or inserted. Losing a
    /// race against a concurrent toggle is not an error: a delete that finds
    /// nothing leaves the edge absent, and an insert that collides leaves it
    /// present. Two overlapping toggles therefore flip the edge once.
    async fn toggle(&self, edge: Edge) -> Result<Toggled> {
        if self.edge_exists(edge).await? {
            let removed = self.remove_edge(edge).await?;
            if removed.rows_affected() == 0 {
                debug!(?edge, "Edge was removed concurrently; leaving it absent");
            } else {
                debug!(?edge, "Toggled edge off");
            }
            return Ok(Toggled::Absent);
        }

        let inserted = self.insert_edge(edge).await?;
        if inserted.rows_affected() == 0 {
            debug!(?edge, "Edge was inserted concurrently; leaving it present");
        } else {
            debug!(?edge, "Toggled edge on");
        }

        Ok(Toggled::Present)
    }

    async fn edge_exists(&self, edge: Edge) -> Result<bool> {
        let statement = match edge {
            Edge::Like { user, post } => query_scalar::<Postgres, bool>(
                "
                SELECT EXISTS (
                    SELECT 1 FROM posts.likes WHERE user_snowflake = $1 AND post_snowflake = $2
                )
                ",
            )
            .bind(user.to_db())
            .bind(post.to_db()),
            Edge::Repost { user, post } => query_scalar::<Postgres, bool>(
                "
                SELECT EXISTS (
                    SELECT 1 FROM posts.reposts WHERE user_snowflake = $1 AND post_snowflake = $2
                )
                ",
            )
            .bind(user.to_db())
            .bind(post.to_db()),
            Edge::Follow(relation) => query_scalar::<Postgres, bool>(
                "
                SELECT EXISTS (
                    SELECT 1 FROM users.follows
                    WHERE follower_snowflake = $1 AND followee_snowflake = $2
                )
                ",
            )
            .bind(relation.follower().to_db())
            .bind(relation.followee().to_db()),
        };

        Ok(statement.fetch_one(&self.pool).await?)
    }

    async fn remove_edge(&self, edge: Edge) -> Result<PgQueryResult> {
        let statement = match edge {
            Edge::Like { user, post } => query::<Postgres>(
                "DELETE FROM posts.likes WHERE user_snowflake = $1 AND post_snowflake = $2",
            )
            .bind(user.to_db())
            .bind(post.to_db()),
            Edge::Repost { user, post } => query::<Postgres>(
                "DELETE FROM posts.reposts WHERE user_snowflake = $1 AND post_snowflake = $2",
            )
            .bind(user.to_db())
            .bind(post.to_db()),
            Edge::Follow(relation) => query::<Postgres>(
                "
                DELETE FROM users.follows
                WHERE follower_snowflake = $1 AND followee_snowflake = $2
                ",
            )
            .bind(relation.follower().to_db())
            .bind(relation.followee().to_db()),
        };

        Ok(statement.execute(&self.pool).await?)
    }

    async fn insert_edge(&self, edge: Edge) -> Result<PgQueryResult> {
        let statement = match edge {
            Edge::Like { user, post } => query::<Postgres>(
                "
                INSERT INTO posts.likes (user_snowflake, post_snowflake)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(user.to_db())
            .bind(post.to_db()),
            Edge::Repost { user, post } => query::<Postgres>(
                "
                INSERT INTO posts.reposts (user_snowflake, post_snowflake, repost_snowflake)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(user.to_db())
            .bind(post.to_db())
            .bind(self.next_id::<RepostMarker>()?.to_db()),
            Edge::Follow(relation) => query::<Postgres>(
                "
                INSERT INTO users.follows (follower_snowflake, followee_snowflake)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(relation.follower().to_db())
            .bind(relation.followee().to_db()),
        };

        statement
            .execute(&self.pool)
            .await
            .map_err(DbError::on_write)
    }

    /// The post a comment belongs to, if the comment exists.
    pub async fn fetch_comment_post(
        &self,
        comment_id: Id<CommentMarker>,
    ) -> Result<Option<Id<PostMarker>>> {
        let post = query_scalar::<_, i64>(
            "SELECT post_snowflake FROM posts.comments WHERE comment_snowflake = $1",
        )
        .bind(comment_id.to_db())
        .fetch_optional(&self.pool)
        .await?;

        Ok(post.map(Id::from_db))
    }

    /// Top-level comments of a post, each with its direct replies.
    pub async fn fetch_comment_threads(
        &self,
        post_id: Id<PostMarker>,
    ) -> Result<Vec<CommentThread>> {
        let records = query_as::<_, CommentRecord>(
            "
            SELECT
                comments.comment_snowflake,
                comments.post_snowflake,
                comments.parent_snowflake,
                comments.content,
                comments.created_at,
                authors.user_snowflake AS author_snowflake,
                authors.name AS author_name,
                authors.handle AS author_handle,
                authors.image AS author_image
            FROM
                posts.comments
                JOIN users.users authors ON authors.user_snowflake = comments.user_snowflake
            WHERE
                comments.post_snowflake = $1
                AND (
                    comments.parent_snowflake IS NULL
                    OR comments.parent_snowflake IN (
                        SELECT top.comment_snowflake
                        FROM posts.comments top
                        WHERE top.post_snowflake = $1 AND top.parent_snowflake IS NULL
                    )
                )
            ",
        )
        .bind(post_id.to_db())
        .fetch_all(&self.pool)
        .await?;

        let comments = records
            .into_iter()
            .map(Comment::try_from)
            .collect::<Result<_, _>>()?;
        Ok(fold_threads(comments))
    }

    pub async fn create_comment(
        &self,
        comment: &CreateComment,
    ) -> Result<Comment> {
        let comment_id = self.next_id::<CommentMarker>()?;

        let record = query_as::<_, CommentRecord>(
            "
            WITH inserted AS (
                INSERT INTO posts.comments
                    (comment_snowflake, post_snowflake, user_snowflake, parent_snowflake, content)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
            )
            SELECT
                inserted.comment_snowflake,
                inserted.post_snowflake,
                inserted.parent_snowflake,
                inserted.content,
                inserted.created_at,
                authors.user_snowflake AS author_snowflake,
                authors.name AS author_name,
                authors.handle AS author_handle,
                authors.image AS author_image
            FROM
                inserted
                JOIN users.users authors ON authors.user_snowflake = inserted.user_snowflake
            ",
        )
        .bind(comment_id.to_db())
        .bind(comment.post.to_db())
        .bind(comment.author.to_db())
        .bind(comment.parent.map(Id::to_db))
        .bind(comment.content.get())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::on_write)?;

        Ok(record.try_into()?)
    }
}
