pub mod client;
mod record;

pub use sqlx;
