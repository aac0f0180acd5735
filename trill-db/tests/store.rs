//! Store tests against a real Postgres. Each test gets a fresh database with
//! the crate's migrations applied.
//!
//! Run with `DATABASE_URL` set and `cargo test -- --ignored`.

use sqlx::PgPool;
use std::time::Duration;
use trill_common::{
    model::{
        Content, Id,
        comment::CreateComment,
        post::{CreatePost, Post},
        relation::{Relation, Toggled},
        user::{ExternalIdentity, User, UserHandle},
    },
    snowflake::NodeId,
    timeline::{
        FeedRequest, FeedSort, PageRequest, SortKey, SortOrder, SourceSet, TimelineItem, assemble,
    },
};
use trill_db::client::{DbClient, DbError, HandleClaim};

fn client(pool: PgPool) -> DbClient {
    DbClient::new(pool, NodeId::new(1).unwrap())
}

async fn user(db: &DbClient, name: &str) -> User {
    db.upsert_identity(&ExternalIdentity {
        provider: "test".to_owned(),
        subject: name.to_owned(),
        name: Some(name.to_owned()),
        image: None,
    })
    .await
    .unwrap()
}

async fn post(db: &DbClient, author: &User, content: &str) -> Post {
    db.create_post(&CreatePost {
        author: author.id,
        content: Content::new(content.to_owned()).unwrap(),
    })
    .await
    .unwrap()
}

async fn follow(db: &DbClient, follower: &User, followee: &User) {
    let toggled = db
        .toggle_follow(Relation::new(follower.id, followee.id).unwrap())
        .await
        .unwrap();
    assert_eq!(toggled, Toggled::Present);
}

fn request(page: i64, size: i64, key: SortKey) -> FeedRequest {
    FeedRequest {
        page: PageRequest::new(Some(page), Some(size)).unwrap(),
        sort: FeedSort {
            key,
            order: SortOrder::Desc,
        },
    }
}

async fn home_feed(
    db: &DbClient,
    viewer: &User,
    request: &FeedRequest,
) -> trill_common::timeline::TimelinePage {
    let followed = db.fetch_followed_ids(Some(viewer.id)).await.unwrap();
    let sources = SourceSet::for_viewer(Some(viewer.id), followed, None);
    let candidates = db
        .fetch_feed_candidates(&sources, Some(viewer.id), request)
        .await
        .unwrap();
    assemble(candidates, request)
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn identities_map_to_one_user(pool: PgPool) {
    let db = client(pool);

    let first = user(&db, "ada").await;
    let again = user(&db, "ada").await;

    assert_eq!(first.id, again.id);
    assert!(db.user_exists(first.id).await.unwrap());
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn toggles_alternate(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let post = post(&db, &ada, "hello").await;

    let states = [
        db.toggle_like(ada.id, post.id).await.unwrap(),
        db.toggle_like(ada.id, post.id).await.unwrap(),
        db.toggle_like(ada.id, post.id).await.unwrap(),
    ];

    assert_eq!(states, [Toggled::Present, Toggled::Absent, Toggled::Present]);
    let view = db.fetch_post_view(post.id, Some(ada.id)).await.unwrap().unwrap();
    assert!(view.liked_by_viewer);
    assert_eq!(view.counts.likes, 1);
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn concurrent_toggles_never_fail(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let post = post(&db, &ada, "hello").await;

    let (first, second) = tokio::join!(
        db.toggle_repost(ada.id, post.id),
        db.toggle_repost(ada.id, post.id)
    );
    first.unwrap();
    second.unwrap();

    let view = db.fetch_post_view(post.id, Some(ada.id)).await.unwrap().unwrap();
    assert!(view.counts.reposts <= 1);
    assert_eq!(view.reposted_by_viewer, view.counts.reposts == 1);
}

async fn lock_waiters(pool: &PgPool) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "
        SELECT COUNT(*) FROM pg_stat_activity
        WHERE datname = current_database() AND wait_event_type = 'Lock'
        ",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn overlapping_toggles_of_a_present_like_remove_it_once(pool: PgPool) {
    let db = client(pool.clone());
    let ada = user(&db, "ada").await;
    let post = post(&db, &ada, "hello").await;
    assert_eq!(db.toggle_like(ada.id, post.id).await.unwrap(), Toggled::Present);

    // Both toggles see the like, then queue up behind this lock to delete it.
    let mut lock = pool.begin().await.unwrap();
    sqlx::query(
        "
        SELECT 1 FROM posts.likes
        WHERE user_snowflake = $1 AND post_snowflake = $2
        FOR UPDATE
        ",
    )
    .bind(ada.id.to_db())
    .bind(post.id.to_db())
    .execute(&mut *lock)
    .await
    .unwrap();

    let release = async {
        for _ in 0..1000 {
            if lock_waiters(&pool).await >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        lock.commit().await.unwrap();
    };

    let (first, second, ()) = tokio::join!(
        db.toggle_like(ada.id, post.id),
        db.toggle_like(ada.id, post.id),
        release
    );

    assert_eq!(first.unwrap(), Toggled::Absent);
    assert_eq!(second.unwrap(), Toggled::Absent);
    let view = db.fetch_post_view(post.id, Some(ada.id)).await.unwrap().unwrap();
    assert!(!view.liked_by_viewer);
    assert_eq!(view.counts.likes, 0);
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn concurrent_toggles_of_a_present_like_end_consistent(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let post = post(&db, &ada, "hello").await;

    for _ in 0..20 {
        if !db.fetch_post_view(post.id, Some(ada.id)).await.unwrap().unwrap().liked_by_viewer {
            db.toggle_like(ada.id, post.id).await.unwrap();
        }

        let (first, second) = tokio::join!(
            db.toggle_like(ada.id, post.id),
            db.toggle_like(ada.id, post.id)
        );
        let results = [first.unwrap(), second.unwrap()];

        // Either both removed it, or one removed it and the other put it back.
        assert!(results.contains(&Toggled::Absent), "{results:?}");
        let view = db.fetch_post_view(post.id, Some(ada.id)).await.unwrap().unwrap();
        assert_eq!(view.liked_by_viewer, results.contains(&Toggled::Present));
        assert_eq!(view.counts.likes, u64::from(view.liked_by_viewer));
    }
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn toggling_a_missing_post_is_a_missing_reference(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;

    let result = db.toggle_like(ada.id, Id::from(12_345_u64)).await;

    assert!(matches!(result, Err(DbError::MissingReference(_))));
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn own_posts_are_in_the_home_feed(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let stranger = user(&db, "stranger").await;
    let own = post(&db, &ada, "mine").await;
    post(&db, &stranger, "not followed").await;

    let page = home_feed(&db, &ada, &request(1, 20, SortKey::CreatedAt)).await;

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].post().id, own.id);
    assert_eq!(page.pagination.total_items, 1);
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn followed_posts_and_reposts_merge(pool: PgPool) {
    let db = client(pool);
    let viewer = user(&db, "viewer").await;
    let a = user(&db, "a").await;
    let b = user(&db, "b").await;
    let c = user(&db, "c").await;
    follow(&db, &viewer, &a).await;
    follow(&db, &viewer, &b).await;

    let original = post(&db, &c, "by c").await;
    post(&db, &a, "first by a").await;
    db.toggle_repost(b.id, original.id).await.unwrap();
    let latest = post(&db, &a, "second by a").await;

    let page = home_feed(&db, &viewer, &request(1, 2, SortKey::CreatedAt)).await;

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].post().id, latest.id);
    let TimelineItem::Repost(repost) = &page.items[1] else {
        panic!("expected a repost, got {:?}", page.items[1]);
    };
    assert_eq!(repost.reposted_by.id, b.id);
    assert_eq!(repost.post.id, original.id);
    assert_eq!(page.pagination.total_items, 3);
    assert!(page.pagination.has_more);

    let second = home_feed(&db, &viewer, &request(2, 2, SortKey::CreatedAt)).await;
    assert_eq!(second.items.len(), 1);
    assert!(!second.pagination.has_more);
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn pages_past_the_end_load_no_rows(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let grace = user(&db, "grace").await;
    follow(&db, &ada, &grace).await;
    for i in 0..30 {
        post(&db, &ada, &format!("post {i}")).await;
    }
    let shared = post(&db, &grace, "shared").await;
    db.toggle_repost(grace.id, shared.id).await.unwrap();

    let past_the_end = request(1_000_000, 100, SortKey::Likes);
    let candidates = db
        .fetch_feed_candidates(&SourceSet::Everyone, None, &past_the_end)
        .await
        .unwrap();
    assert!(candidates.posts.is_empty());
    assert!(candidates.reposts.is_empty());
    assert_eq!(candidates.total, 31);

    let page = assemble(candidates, &past_the_end);
    assert!(page.items.is_empty());
    assert!(!page.pagination.has_more);
    assert_eq!(page.pagination.total_items, 31);

    let home = home_feed(&db, &ada, &request(5, 10, SortKey::CreatedAt)).await;
    assert!(home.items.is_empty());
    assert_eq!(home.pagination.total_items, 32);

    let last = home_feed(&db, &ada, &request(4, 8, SortKey::CreatedAt)).await;
    assert_eq!(last.items.len(), 8);
    assert!(!last.pagination.has_more);
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn anonymous_feed_sorts_by_likes(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let fans = [user(&db, "one").await, user(&db, "two").await];

    let quiet = post(&db, &ada, "quiet").await;
    let popular = post(&db, &ada, "popular").await;
    let newer_quiet = post(&db, &ada, "newer quiet").await;
    for fan in &fans {
        db.toggle_like(fan.id, popular.id).await.unwrap();
    }
    db.toggle_repost(fans[0].id, quiet.id).await.unwrap();

    let request = request(1, 20, SortKey::Likes);
    let candidates = db
        .fetch_feed_candidates(&SourceSet::Everyone, None, &request)
        .await
        .unwrap();
    let page = assemble(candidates, &request);

    let ids: Vec<_> = page.items.iter().map(|item| item.post().id).collect();
    assert_eq!(ids, [popular.id, newer_quiet.id, quiet.id]);
    assert!(
        page.items
            .iter()
            .all(|item| matches!(item, TimelineItem::Post(_)))
    );
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn viewer_flags_belong_to_the_viewer(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let grace = user(&db, "grace").await;
    follow(&db, &grace, &ada).await;
    let post = post(&db, &ada, "hello").await;
    db.toggle_like(grace.id, post.id).await.unwrap();

    let request = request(1, 20, SortKey::CreatedAt);
    let as_ada = home_feed(&db, &ada, &request).await;
    let as_grace = home_feed(&db, &grace, &request).await;

    assert!(!as_ada.items[0].post().liked_by_viewer);
    assert!(as_grace.items[0].post().liked_by_viewer);
    assert_eq!(as_ada.items[0].post().counts.likes, 1);

    let followers_for_ada = db.fetch_followers(ada.id, Some(ada.id)).await.unwrap();
    assert_eq!(followers_for_ada.len(), 1);
    assert!(!followers_for_ada[0].is_following);

    let followed_for_grace = db.fetch_following(grace.id, Some(grace.id)).await.unwrap();
    assert!(followed_for_grace[0].is_following);
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn handles_are_claimed_once(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let grace = user(&db, "grace").await;
    let handle = UserHandle::new("Ada_L").unwrap();

    assert!(matches!(
        db.claim_handle(ada.id, &handle).await.unwrap(),
        HandleClaim::Claimed(_)
    ));
    assert!(matches!(
        db.claim_handle(ada.id, &handle).await.unwrap(),
        HandleClaim::Unchanged(_)
    ));
    assert!(matches!(
        db.claim_handle(ada.id, &UserHandle::new("other").unwrap())
            .await
            .unwrap(),
        HandleClaim::AlreadySet(_)
    ));
    assert_eq!(
        db.claim_handle(grace.id, &handle).await.unwrap(),
        HandleClaim::Taken
    );

    let found = db.search_users("ADA", Some(grace.id)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].user.id, ada.id);
    assert!(db.search_users("ada", Some(ada.id)).await.unwrap().is_empty());
}

#[sqlx::test]
#[ignore = "needs a Postgres database"]
async fn comment_threads_show_one_level(pool: PgPool) {
    let db = client(pool);
    let ada = user(&db, "ada").await;
    let post = post(&db, &ada, "hello").await;

    let comment = |parent, content: &str| CreateComment {
        post: post.id,
        author: ada.id,
        parent,
        content: Content::new(content.to_owned()).unwrap(),
    };

    let top = db.create_comment(&comment(None, "top")).await.unwrap();
    let reply = db.create_comment(&comment(Some(top.id), "reply")).await.unwrap();
    db.create_comment(&comment(Some(reply.id), "nested"))
        .await
        .unwrap();

    assert_eq!(db.fetch_comment_post(reply.id).await.unwrap(), Some(post.id));

    let threads = db.fetch_comment_threads(post.id).await.unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].comment.id, top.id);
    assert_eq!(threads[0].replies.len(), 1);
    assert_eq!(threads[0].replies[0].id, reply.id);

    let view = db.fetch_post_view(post.id, None).await.unwrap().unwrap();
    assert_eq!(view.counts.comments, 3);
}
