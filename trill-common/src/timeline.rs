//! Timeline assembly.
//!
//! A timeline merges two kinds of records, posts and reposts, into one list
//! with a single total order, and cuts a page out of it. The store fetches
//! the candidates of each kind already sorted by [`FeedSort`] and limited to
//! [`PageRequest::window`] rows, which is enough to reproduce any page of the
//! merged order.
//!
//! Viewer-relative state (`liked_by_viewer`, `reposted_by_viewer`) is computed
//! by the store for the requesting viewer only; nothing here mixes viewers.

use crate::model::{
    Id, ValidationErrors, ValidationIssue,
    post::{PostView, RepostView},
    user::UserMarker,
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeSet};
use time::OffsetDateTime;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    /// The effective timestamp of an item.
    CreatedAt,
    /// The like count of the (original) post.
    Likes,
}

impl SortKey {
    /// Anonymous viewers get the popular feed unless they ask otherwise.
    /// Unknown keys fall back to [`SortKey::CreatedAt`].
    #[must_use]
    pub fn parse(raw: Option<&str>, viewer_authenticated: bool) -> Self {
        match raw {
            None | Some("") if viewer_authenticated => SortKey::CreatedAt,
            None | Some("") => SortKey::Likes,
            Some("likes") => SortKey::Likes,
            Some(_) => SortKey::CreatedAt,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// The total order of a timeline.
///
/// Items compare by the key in the requested order, then newest effective
/// timestamp first, then highest identifier first. Identifiers are unique
/// across posts and reposts, so no two items ever compare equal.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct FeedSort {
    pub key: SortKey,
    pub order: SortOrder,
}

impl FeedSort {
    #[must_use]
    pub fn compare(self, a: &TimelineItem, b: &TimelineItem) -> Ordering {
        let primary = match self.key {
            SortKey::CreatedAt => a.effective_at().cmp(&b.effective_at()),
            SortKey::Likes => a.like_count().cmp(&b.like_count()),
        };

        self.order
            .apply(primary)
            .then_with(|| b.effective_at().cmp(&a.effective_at()))
            .then_with(|| b.item_id().cmp(&a.item_id()))
    }
}

/// A validated, 1-based page request.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct PageRequest {
    page: u32,
    size: u32,
}

impl PageRequest {
    /// Missing values take their defaults; out of range values are reported,
    /// never clamped.
    pub fn new(page: Option<i64>, size: Option<i64>) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let page = match page {
            None => Some(1),
            Some(page) => u32::try_from(page).ok().filter(|page| *page >= 1).or_else(|| {
                errors.push(ValidationIssue::new("page", "Page must be at least 1"));
                None
            }),
        };

        let size = match size {
            None => Some(DEFAULT_PAGE_SIZE),
            Some(size) => u32::try_from(size)
                .ok()
                .filter(|size| (1..=MAX_PAGE_SIZE).contains(size))
                .or_else(|| {
                    errors.push(ValidationIssue::new(
                        "limit",
                        format!("Limit must be between 1 and {MAX_PAGE_SIZE}"),
                    ));
                    None
                }),
        };

        match (page, size) {
            (Some(page), Some(size)) if errors.is_empty() => Ok(Self { page, size }),
            _ => Err(errors),
        }
    }

    #[must_use]
    pub fn page(self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn size(self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.size)
    }

    /// How many rows of each source are needed to cut this page.
    #[must_use]
    pub fn window(self) -> u64 {
        self.offset() + u64::from(self.size)
    }

    /// Whether this page starts after the last of `total` items.
    #[must_use]
    pub fn is_past_end(self, total: u64) -> bool {
        self.offset() >= total
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct FeedRequest {
    pub page: PageRequest,
    pub sort: FeedSort,
}

/// The authors whose posts and reposts may show up in a timeline.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum SourceSet {
    /// No restriction. Only posts are candidates, never reposts.
    Everyone,
    Authors(BTreeSet<Id<UserMarker>>),
}

impl SourceSet {
    /// The source set of a home timeline.
    ///
    /// Anonymous viewers see everyone. Signed in viewers see the users they
    /// follow and themselves; `narrow_to` can restrict that further but never
    /// adds anybody.
    #[must_use]
    pub fn for_viewer(
        viewer: Option<Id<UserMarker>>,
        followed: impl IntoIterator<Item = Id<UserMarker>>,
        narrow_to: Option<&[Id<UserMarker>]>,
    ) -> Self {
        let Some(viewer) = viewer else {
            return SourceSet::Everyone;
        };

        let mut authors: BTreeSet<_> = followed.into_iter().collect();
        if let Some(narrow_to) = narrow_to {
            authors.retain(|author| narrow_to.contains(author));
        }
        authors.insert(viewer);

        SourceSet::Authors(authors)
    }

    #[must_use]
    pub fn single(author: Id<UserMarker>) -> Self {
        SourceSet::Authors(BTreeSet::from([author]))
    }

    #[must_use]
    pub fn authors(&self) -> Option<&BTreeSet<Id<UserMarker>>> {
        match self {
            SourceSet::Everyone => None,
            SourceSet::Authors(authors) => Some(authors),
        }
    }

    #[must_use]
    pub fn includes_reposts(&self) -> bool {
        matches!(self, SourceSet::Authors(_))
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TimelineItem {
    Post(PostView),
    Repost(RepostView),
}

impl TimelineItem {
    /// The post's creation time for posts, the repost's for reposts.
    #[must_use]
    pub fn effective_at(&self) -> OffsetDateTime {
        match self {
            TimelineItem::Post(post) => post.created_at,
            TimelineItem::Repost(repost) => repost.created_at,
        }
    }

    #[must_use]
    pub fn like_count(&self) -> u64 {
        self.post().counts.likes
    }

    #[must_use]
    pub fn item_id(&self) -> u64 {
        match self {
            TimelineItem::Post(post) => post.id.into(),
            TimelineItem::Repost(repost) => repost.id.into(),
        }
    }

    #[must_use]
    pub fn post(&self) -> &PostView {
        match self {
            TimelineItem::Post(post) => post,
            TimelineItem::Repost(repost) => &repost.post,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_more: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct TimelinePage {
    pub items: Vec<TimelineItem>,
    pub pagination: Pagination,
}

/// What the store found for a timeline.
///
/// `posts` and `reposts` hold at least the first [`PageRequest::window`] rows
/// of each source in [`FeedSort`] order (or all of them, if there are fewer).
/// For a page past the end both are empty. `total` counts every candidate of
/// both sources.
#[derive(Clone, Eq, PartialEq, Debug, Default, Hash)]
pub struct FeedCandidates {
    pub posts: Vec<PostView>,
    pub reposts: Vec<RepostView>,
    pub total: u64,
}

/// Merges, sorts and paginates the candidates of one timeline request.
///
/// A page past the end is empty with `has_more == false`.
#[must_use]
pub fn assemble(candidates: FeedCandidates, request: &FeedRequest) -> TimelinePage {
    let FeedCandidates {
        posts,
        reposts,
        total,
    } = candidates;

    let mut items: Vec<TimelineItem> = posts
        .into_iter()
        .map(TimelineItem::Post)
        .chain(reposts.into_iter().map(TimelineItem::Repost))
        .collect();
    items.sort_by(|a, b| request.sort.compare(a, b));

    let offset = usize::try_from(request.page.offset()).unwrap_or(usize::MAX);
    let items: Vec<_> = items
        .into_iter()
        .skip(offset)
        .take(request.page.size() as usize)
        .collect();

    let returned = items.len() as u64;
    let pagination = Pagination {
        current_page: request.page.page(),
        page_size: request.page.size(),
        total_items: total,
        total_pages: total.div_ceil(u64::from(request.page.size())),
        has_more: request.page.offset() + returned < total,
    };

    TimelinePage { items, pagination }
}
