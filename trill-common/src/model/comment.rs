use crate::model::{
    Content, Id,
    post::PostMarker,
    user::{UserMarker, UserSummary},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct CommentMarker;

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Id<CommentMarker>,
    pub post_id: Id<PostMarker>,
    pub author: UserSummary,
    pub parent_id: Option<Id<CommentMarker>>,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct CommentThread {
    #[serde(flatten)]
    pub comment: Comment,
    pub replies: Vec<Comment>,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct CreateComment {
    pub post: Id<PostMarker>,
    pub author: Id<UserMarker>,
    pub parent: Option<Id<CommentMarker>>,
    pub content: Content,
}

/// Folds the comments of one post into top-level threads.
///
/// Threads and their replies are ordered oldest first. Only direct replies to
/// a top-level comment are kept; replies to replies are accepted on write but
/// never shown.
#[must_use]
pub fn fold_threads(mut comments: Vec<Comment>) -> Vec<CommentThread> {
    comments.sort_by_key(|comment| (comment.created_at, comment.id));

    let (top_level, replies): (Vec<_>, Vec<_>) = comments
        .into_iter()
        .partition(|comment| comment.parent_id.is_none());

    let mut replies_by_parent: HashMap<Id<CommentMarker>, Vec<Comment>> = HashMap::new();
    for reply in replies {
        if let Some(parent) = reply.parent_id {
            replies_by_parent.entry(parent).or_default().push(reply);
        }
    }

    top_level
        .into_iter()
        .map(|comment| CommentThread {
            replies: replies_by_parent.remove(&comment.id).unwrap_or_default(),
            comment,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::model::{
        Id,
        comment::{Comment, CommentMarker, fold_threads},
        user::UserSummary,
    };
    use time::{Duration, OffsetDateTime, macros::datetime};

    const START: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    fn comment(id: u64, parent: Option<u64>, minutes: i64) -> Comment {
        Comment {
            id: id.into(),
            post_id: 1.into(),
            author: UserSummary::default(),
            parent_id: parent.map(Id::<CommentMarker>::from),
            content: format!("comment {id}"),
            created_at: START + Duration::minutes(minutes),
        }
    }

    fn ids(comments: &[Comment]) -> Vec<u64> {
        comments.iter().map(|comment| comment.id.into()).collect()
    }

    #[test]
    fn replies_attach_to_their_top_level_comment() {
        let threads = fold_threads(vec![
            comment(13, Some(10), 3),
            comment(11, None, 1),
            comment(10, None, 0),
            comment(12, Some(10), 2),
            comment(14, Some(11), 4),
        ]);

        let top_level: Vec<u64> = threads.iter().map(|t| t.comment.id.into()).collect();
        assert_eq!(top_level, [10, 11]);
        assert_eq!(ids(&threads[0].replies), [12, 13]);
        assert_eq!(ids(&threads[1].replies), [14]);
    }

    #[test]
    fn nested_replies_are_not_shown() {
        let threads = fold_threads(vec![
            comment(10, None, 0),
            comment(11, Some(10), 1),
            comment(12, Some(11), 2),
        ]);

        assert_eq!(threads.len(), 1);
        assert_eq!(ids(&threads[0].replies), [11]);
    }

    #[test]
    fn simultaneous_comments_keep_id_order() {
        let threads = fold_threads(vec![comment(21, None, 0), comment(20, None, 0)]);
        let top_level: Vec<u64> = threads.iter().map(|t| t.comment.id.into()).collect();
        assert_eq!(top_level, [20, 21]);
    }
}
