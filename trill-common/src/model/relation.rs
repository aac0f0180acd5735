use crate::model::{Id, user::UserMarker};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("You cannot follow yourself")]
pub struct SelfFollowError;

/// A directed follow edge. Never points back at its own follower.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    follower: Id<UserMarker>,
    followee: Id<UserMarker>,
}

impl Relation {
    pub fn new(
        follower: Id<UserMarker>,
        followee: Id<UserMarker>,
    ) -> Result<Self, SelfFollowError> {
        if follower == followee {
            Err(SelfFollowError)
        } else {
            Ok(Self { follower, followee })
        }
    }

    #[must_use]
    pub fn follower(self) -> Id<UserMarker> {
        self.follower
    }

    #[must_use]
    pub fn followee(self) -> Id<UserMarker> {
        self.followee
    }
}

/// The state a toggle left its join row in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Toggled {
    Present,
    Absent,
}

impl Toggled {
    #[must_use]
    pub fn is_present(self) -> bool {
        self == Toggled::Present
    }
}

#[cfg(test)]
mod tests {
    use crate::model::relation::{Relation, SelfFollowError};

    #[test]
    fn self_follow_is_rejected() {
        assert_eq!(Relation::new(5.into(), 5.into()), Err(SelfFollowError));

        let relation = Relation::new(5.into(), 6.into()).unwrap();
        assert_eq!(u64::from(relation.follower()), 5);
        assert_eq!(u64::from(relation.followee()), 6);
    }
}
