use crate::server::{ServerRouter, json::Json};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use trill_common::{
    model::{ValidationErrors, ValidationIssue, relation::Toggled},
    timeline::{FeedRequest, FeedSort, PageRequest, SortKey, SortOrder},
};

mod posts;
mod users;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .route("/health", get(health))
        .merge(posts::routes())
        .merge(users::routes())
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// Paging and sorting parameters shared by every timeline.
///
/// Numbers arrive as strings so that a malformed value is reported as a
/// field issue like any other validation failure.
#[derive(Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    page: Option<String>,
    limit: Option<String>,
    sort_by: Option<String>,
    order: Option<String>,
}

impl FeedQuery {
    pub fn validate(
        &self,
        viewer_authenticated: bool,
        errors: &mut ValidationErrors,
    ) -> Option<FeedRequest> {
        let page = parse_number("page", self.page.as_deref(), errors);
        let limit = parse_number("limit", self.limit.as_deref(), errors);

        let page = match PageRequest::new(page?, limit?) {
            Ok(page) => page,
            Err(page_errors) => {
                for issue in page_errors.into_issues() {
                    errors.push(issue);
                }
                return None;
            }
        };

        Some(FeedRequest {
            page,
            sort: FeedSort {
                key: SortKey::parse(self.sort_by.as_deref(), viewer_authenticated),
                order: SortOrder::parse(self.order.as_deref()),
            },
        })
    }
}

/// `Some(None)` for an absent value, `None` after recording an issue.
fn parse_number(
    field: &'static str,
    raw: Option<&str>,
    errors: &mut ValidationErrors,
) -> Option<Option<i64>> {
    match raw.map(str::trim) {
        None | Some("") => Some(None),
        Some(raw) => match raw.parse() {
            Ok(number) => Some(Some(number)),
            Err(_) => {
                errors.push(ValidationIssue::new(
                    field,
                    format!("Expected a whole number, got {raw:?}"),
                ));
                None
            }
        },
    }
}

/// The outcome of a toggle as reported to clients.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Serialize)]
pub struct ToggleResponse {
    message: &'static str,
    active: bool,
}

impl ToggleResponse {
    #[must_use]
    pub fn new(toggled: Toggled, on: &'static str, off: &'static str) -> Self {
        Self {
            message: if toggled.is_present() { on } else { off },
            active: toggled.is_present(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::server::{
        routes::{FeedQuery, ToggleResponse},
        tests::send,
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use trill_common::{
        model::{ValidationErrors, relation::Toggled},
        timeline::{SortKey, SortOrder},
    };

    fn query(page: &str, limit: &str, sort_by: Option<&str>) -> FeedQuery {
        FeedQuery {
            page: Some(page.to_owned()),
            limit: Some(limit.to_owned()),
            sort_by: sort_by.map(str::to_owned),
            order: None,
        }
    }

    #[test]
    fn feed_query_defaults() {
        let mut errors = ValidationErrors::new();

        let anonymous = FeedQuery::default().validate(false, &mut errors).unwrap();
        assert_eq!(anonymous.page.page(), 1);
        assert_eq!(anonymous.page.size(), 20);
        assert_eq!(anonymous.sort.key, SortKey::Likes);
        assert_eq!(anonymous.sort.order, SortOrder::Desc);

        let signed_in = FeedQuery::default().validate(true, &mut errors).unwrap();
        assert_eq!(signed_in.sort.key, SortKey::CreatedAt);

        assert!(errors.is_empty());
    }

    #[test]
    fn feed_query_reports_every_bad_field() {
        let mut errors = ValidationErrors::new();
        assert!(query("x", "y", None).validate(true, &mut errors).is_none());
        assert_eq!(errors.issues().len(), 2);

        let mut errors = ValidationErrors::new();
        assert!(query("2", "101", None).validate(true, &mut errors).is_none());
        assert_eq!(errors.issues()[0].field, "limit");

        let mut errors = ValidationErrors::new();
        let request = query(" 3 ", "5", Some("bogus"))
            .validate(false, &mut errors)
            .unwrap();
        assert_eq!(request.page.offset(), 10);
        assert_eq!(request.sort.key, SortKey::CreatedAt);
    }

    #[test]
    fn toggle_messages() {
        let on = ToggleResponse::new(Toggled::Present, "liked", "unliked");
        assert_eq!((on.message, on.active), ("liked", true));

        let off = ToggleResponse::new(Toggled::Absent, "liked", "unliked");
        assert_eq!((off.message, off.active), ("unliked", false));
    }

    #[tokio::test]
    async fn health_needs_no_database() {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
