use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IdentityId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Ended => write!(f, "ENDED"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "ENDED" => Ok(Self::Ended),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// A war-room session and its current membership.
///
/// `end_time` and `duration_seconds` are both `None` while the session is
/// active and both `Some` once it has ended. `member_count` mirrors
/// `members.len()` and is maintained by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub status: SessionStatus,
    pub creator_id: IdentityId,
    pub members: BTreeSet<IdentityId>,
    pub member_count: u32,
}

impl Session {
    /// A fresh, unpersisted session with no members.
    pub fn open(
        code: impl Into<String>,
        title: impl Into<String>,
        description: Option<String>,
        creator_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            code: code.into(),
            title: title.into(),
            description,
            start_time: now,
            end_time: None,
            duration_seconds: None,
            status: SessionStatus::Active,
            creator_id,
            members: BTreeSet::new(),
            member_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_member(&self, identity: &IdentityId) -> bool {
        self.members.contains(identity)
    }

    /// Elapsed whole seconds while active, the frozen duration once ended.
    pub fn current_duration(&self, now: DateTime<Utc>) -> i64 {
        match self.status {
            SessionStatus::Active => elapsed_seconds(self.start_time, now),
            SessionStatus::Ended => self.duration_seconds.unwrap_or(0),
        }
    }

    /// Freeze the session at `now`. Returns the frozen duration.
    pub fn end(&mut self, now: DateTime<Utc>) -> i64 {
        let duration = elapsed_seconds(self.start_time, now);
        self.status = SessionStatus::Ended;
        self.end_time = Some(now);
        self.duration_seconds = Some(duration);
        duration
    }
}

fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}
