//! Fills an empty database with a small, believable social graph and prints
//! a bearer token for every user it created.

use rand::{Rng, seq::IndexedRandom};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trill_common::{
    model::{
        Content, EmptyContentError, Id,
        auth::{AuthToken, AuthTokenHashError},
        comment::CreateComment,
        post::{CreatePost, PostMarker},
        relation::{Relation, SelfFollowError},
        user::{ExternalIdentity, InvalidUserHandleError, User, UserHandle, UserMarker},
    },
    snowflake::NodeId,
};
use trill_db::client::{DbClient, DbError, HandleClaim};

const USERS: [(&str, &str); 6] = [
    ("Ada Lovelace", "ada"),
    ("Grace Hopper", "grace"),
    ("Alan Turing", "alan"),
    ("Katherine Johnson", "katherine"),
    ("Edsger Dijkstra", "edsger"),
    ("Barbara Liskov", "barbara"),
];

const POSTS: [&str; 12] = [
    "Shipped a new release today.",
    "Coffee first, then the compiler errors.",
    "Anyone else reading about snowflake ids tonight?",
    "Hot take: tabs are fine.",
    "Wrote a parser by hand and regretted nothing.",
    "The best code is the code you delete.",
    "Benchmarks lie, profiles don't.",
    "Spent the afternoon chasing an off-by-one.",
    "Finally understood lifetimes.",
    "Premature optimization strikes again.",
    "Rubber duck debugging works every time.",
    "Reading old papers is underrated.",
];

const COMMENTS: [&str; 6] = [
    "Totally agree!",
    "Interesting, tell me more.",
    "This made my day.",
    "Not sure about that one.",
    "Bookmarking this.",
    "Ha, been there.",
];

const POSTS_PER_USER: usize = 3;
const FOLLOWS_PER_USER: usize = 3;
const LIKES_PER_USER: usize = 5;
const COMMENT_COUNT: usize = 10;

#[derive(Debug, Error)]
enum SeedError {
    #[error("Error parsing .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Error parsing environment: {0}")]
    Envy(#[from] envy::Error),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    AuthTokenHash(#[from] AuthTokenHashError),
    #[error(transparent)]
    UserHandle(#[from] InvalidUserHandleError),
    #[error(transparent)]
    Content(#[from] EmptyContentError),
    #[error(transparent)]
    SelfFollow(#[from] SelfFollowError),
    #[error("Handle {0:?} belongs to somebody else")]
    HandleTaken(&'static str),
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
struct Env {
    database_url: String,
    #[serde(default)]
    snowflake_node_id: NodeId,
}

fn install_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seed=info,trill_db=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn get_env() -> Result<Env, SeedError> {
    if let Err(e) = dotenvy::dotenv() {
        if e.not_found() {
            debug!("No .dotenv file found");
        } else {
            return Err(e.into());
        }
    }

    Ok(envy::from_env()?)
}

async fn create_user(db: &DbClient, name: &str, handle: &'static str) -> Result<User, SeedError> {
    let identity = ExternalIdentity {
        provider: "seed".to_owned(),
        subject: handle.to_owned(),
        name: Some(name.to_owned()),
        image: None,
    };
    let user = db.upsert_identity(&identity).await?;

    match db.claim_handle(user.id, &UserHandle::new(handle)?).await? {
        HandleClaim::Claimed(user) | HandleClaim::Unchanged(user) => Ok(user),
        HandleClaim::AlreadySet(_) | HandleClaim::Taken | HandleClaim::UserNotFound => {
            Err(SeedError::HandleTaken(handle))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), SeedError> {
    install_tracing();
    let env = get_env()?;

    let db = DbClient::connect(&env.database_url, 2, env.snowflake_node_id).await?;
    db.migrate().await?;

    let mut rng = rand::rng();

    let mut users: Vec<Id<UserMarker>> = Vec::with_capacity(USERS.len());
    for (name, handle) in USERS {
        let user = create_user(&db, name, handle).await?;

        let token = AuthToken::issue(user.id);
        db.create_auth(user.id, &token.hash()?, None).await?;
        println!("{handle}\t{}", token.to_bearer());

        users.push(user.id);
    }
    info!(count = users.len(), "Created users");

    let mut posts: Vec<(Id<PostMarker>, Id<UserMarker>)> = Vec::new();
    for &author in &users {
        for content in POSTS.choose_multiple(&mut rng, POSTS_PER_USER) {
            let post = db
                .create_post(&CreatePost {
                    author,
                    content: Content::new((*content).to_owned())?,
                })
                .await?;
            posts.push((post.id, author));
        }
    }
    info!(count = posts.len(), "Created posts");

    for &follower in &users {
        let others: Vec<_> = users.iter().copied().filter(|&u| u != follower).collect();
        for &followee in others.choose_multiple(&mut rng, FOLLOWS_PER_USER) {
            db.toggle_follow(Relation::new(follower, followee)?).await?;
        }
    }

    for &user in &users {
        let others: Vec<_> = posts.iter().filter(|(_, author)| *author != user).collect();
        for &&(post, _) in others.choose_multiple(&mut rng, LIKES_PER_USER) {
            db.toggle_like(user, post).await?;
        }
        if let Some(&&(post, _)) = others.choose(&mut rng) {
            db.toggle_repost(user, post).await?;
        }
    }
    info!("Created follows, likes and reposts");

    for _ in 0..COMMENT_COUNT {
        let (Some(&(post, _)), Some(&author), Some(&replier)) = (
            posts.choose(&mut rng),
            users.choose(&mut rng),
            users.choose(&mut rng),
        ) else {
            break;
        };

        let comment = db
            .create_comment(&CreateComment {
                post,
                author,
                parent: None,
                content: Content::new(COMMENTS[rng.random_range(0..COMMENTS.len())].to_owned())?,
            })
            .await?;

        if rng.random_bool(0.5) {
            db.create_comment(&CreateComment {
                post,
                author: replier,
                parent: Some(comment.id),
                content: Content::new(COMMENTS[rng.random_range(0..COMMENTS.len())].to_owned())?,
            })
            .await?;
        }
    }
    info!("Created comments");

    Ok(())
}
