use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AlertId, SessionId};
use crate::incident::IncidentRecord;
use crate::session::{Session, SessionStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Joined,
    Left,
}

/// Events pushed to every connected observer. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BroadcastEvent {
    #[serde(rename = "session-created", rename_all = "camelCase")]
    SessionCreated {
        id: SessionId,
        code: String,
        title: String,
        start_time: DateTime<Utc>,
        member_count: u32,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        incident_id: Option<String>,
    },

    #[serde(rename = "membership-changed", rename_all = "camelCase")]
    MembershipChanged {
        session_id: SessionId,
        member_count: u32,
        action: MembershipAction,
        identity: String,
    },

    #[serde(rename = "duration-tick", rename_all = "camelCase")]
    DurationTick { session_id: SessionId, seconds: i64 },

    #[serde(rename = "session-resolved", rename_all = "camelCase")]
    SessionResolved {
        session_id: SessionId,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    },

    #[serde(rename = "alert-raised", rename_all = "camelCase")]
    AlertRaised {
        id: AlertId,
        packet_id: String,
        incident_id: String,
        severity: String,
        score: Option<f64>,
        model_version: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl BroadcastEvent {
    pub fn session_created(session: &Session, incident_id: Option<&str>) -> Self {
        Self::SessionCreated {
            id: session.id.clone(),
            code: session.code.clone(),
            title: session.title.clone(),
            start_time: session.start_time,
            member_count: session.member_count,
            status: session.status,
            incident_id: incident_id.map(str::to_owned),
        }
    }

    pub fn membership(session: &Session, action: MembershipAction, identity: &str) -> Self {
        Self::MembershipChanged {
            session_id: session.id.clone(),
            member_count: session.member_count,
            action,
            identity: identity.to_owned(),
        }
    }

    /// Only meaningful for an ended session; falls back to zero otherwise.
    pub fn resolved(session: &Session) -> Self {
        Self::SessionResolved {
            session_id: session.id.clone(),
            ended_at: session.end_time.unwrap_or(session.start_time),
            duration_seconds: session.duration_seconds.unwrap_or(0),
        }
    }

    pub fn alert_raised(record: &IncidentRecord) -> Self {
        Self::AlertRaised {
            id: record.id.clone(),
            packet_id: record.packet_id.clone(),
            incident_id: record.incident_id.clone(),
            severity: record.severity.clone(),
            score: record.score,
            model_version: record.model_version.clone(),
            timestamp: record.timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session-created",
            Self::MembershipChanged { .. } => "membership-changed",
            Self::DurationTick { .. } => "duration-tick",
            Self::SessionResolved { .. } => "session-resolved",
            Self::AlertRaised { .. } => "alert-raised",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdentityId;

    fn session() -> Session {
        let mut s = Session::open("abc123", "Incident Bravo", None, IdentityId::new(), Utc::now());
        s.member_count = 1;
        s
    }

    #[test]
    fn session_created_wire_shape() {
        let s = session();
        let json = serde_json::to_value(BroadcastEvent::session_created(&s, Some("INC-7"))).unwrap();
        assert_eq!(json["type"], "session-created");
        assert_eq!(json["id"], s.id.as_str());
        assert_eq!(json["code"], "abc123");
        assert_eq!(json["title"], "Incident Bravo");
        assert_eq!(json["memberCount"], 1);
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["incidentId"], "INC-7");
        assert!(json["startTime"].is_string());
    }

    #[test]
    fn session_created_omits_missing_incident() {
        let json = serde_json::to_value(BroadcastEvent::session_created(&session(), None)).unwrap();
        assert!(json.get("incidentId").is_none());
    }

    #[test]
    fn membership_wire_shape() {
        let s = session();
        let event = BroadcastEvent::membership(&s, MembershipAction::Left, "a@b.c");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "membership-changed");
        assert_eq!(json["sessionId"], s.id.as_str());
        assert_eq!(json["memberCount"], 1);
        assert_eq!(json["action"], "left");
        assert_eq!(json["identity"], "a@b.c");
    }

    #[test]
    fn tick_and_resolved_wire_shape() {
        let mut s = session();
        let tick = BroadcastEvent::DurationTick { session_id: s.id.clone(), seconds: 30 };
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["type"], "duration-tick");
        assert_eq!(json["seconds"], 30);

        s.end(s.start_time + chrono::Duration::seconds(90));
        let json = serde_json::to_value(BroadcastEvent::resolved(&s)).unwrap();
        assert_eq!(json["type"], "session-resolved");
        assert_eq!(json["durationSeconds"], 90);
        assert!(json["endedAt"].is_string());
    }

    #[test]
    fn event_type_matches_tag() {
        let s = session();
        let event = BroadcastEvent::membership(&s, MembershipAction::Joined, "x@y.z");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
    }
}
