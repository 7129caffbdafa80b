use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AlertId, SessionId};

/// An alert raised against an incident, optionally correlated to the war
/// room opened to handle it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    pub id: AlertId,
    pub packet_id: String,
    pub incident_id: String,
    pub severity: String,
    pub score: Option<f64>,
    pub model_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<SessionId>,
}

impl IncidentRecord {
    pub fn new(
        packet_id: impl Into<String>,
        incident_id: impl Into<String>,
        severity: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            packet_id: packet_id.into(),
            incident_id: incident_id.into(),
            severity: severity.into(),
            score: None,
            model_version: None,
            timestamp,
            session_id: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }
}
